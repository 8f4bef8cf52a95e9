//! The sACN receiver engine.
//!
//! One task owns the shared port-5568 socket, decodes every datagram,
//! tracks per-universe liveness and dispatches callbacks. Network Data Loss
//! (E1.31 §6.7.1) is detected both ways: a Stream_Terminated option bit and
//! a 2500 ms inactivity timeout, the latter driven by the read deadline of
//! the receive loop itself.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::packet::{SacnPacket, SacnPacketType};
use crate::socket;
use crate::util::universe_to_multicast;
use crate::{DISCOVERY_UNIVERSE, MAX_PACKET_SIZE, NETWORK_DATA_LOSS_TIMEOUT};

/// How a packet reached this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketMode {
    Unicast,
    Multicast,
    Broadcast,
}

impl fmt::Display for PacketMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unicast => write!(f, "unicast"),
            Self::Multicast => write!(f, "multicast"),
            Self::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// Delivery information handed to packet callbacks alongside the packet.
#[derive(Debug, Clone, Copy)]
pub struct PacketInfo {
    /// Source address of the datagram.
    pub source: SocketAddr,
    /// How the datagram was addressed.
    pub mode: PacketMode,
}

type PacketCallback = Arc<dyn Fn(SacnPacket, PacketInfo) + Send + Sync>;
type TerminationCallback = Arc<dyn Fn(u16) + Send + Sync>;

struct LastSeen {
    at: Instant,
    packet: SacnPacket,
}

/// An sACN receiver.
///
/// ```no_run
/// # use std::net::Ipv4Addr;
/// # #[tokio::main] async fn main() -> sacn::Result<()> {
/// let receiver = sacn::Receiver::new(Ipv4Addr::UNSPECIFIED)?;
/// receiver.register_packet_callback(sacn::SacnPacketType::Data, |packet, info| {
///     println!("{:?} via {}", packet.packet_type(), info.mode);
/// });
/// receiver.join_universe(1)?;
/// receiver.start()?;
/// # Ok(()) }
/// ```
pub struct Receiver {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    socket: UdpSocket,
    /// Local interface address used for multicast membership.
    interface: Ipv4Addr,
    stop: Notify,

    joined: Mutex<HashSet<u16>>,
    last_seen: Mutex<HashMap<u16, LastSeen>>,
    terminated: Mutex<HashMap<u16, bool>>,

    callbacks: Mutex<HashMap<SacnPacketType, PacketCallback>>,
    termination_callback: Mutex<Option<TerminationCallback>>,
}

impl Receiver {
    /// Create a receiver bound to `0.0.0.0:5568`.
    ///
    /// `interface` is the IPv4 address of the local network interface that
    /// multicast groups are joined on; `Ipv4Addr::UNSPECIFIED` lets the OS
    /// choose. The port is opened with address and port reuse so several
    /// receivers can coexist on one host.
    pub fn new(interface: Ipv4Addr) -> Result<Self> {
        let socket = socket::create_receiver_socket()?;

        Ok(Self {
            inner: Arc::new(Inner {
                socket,
                interface,
                stop: Notify::new(),
                joined: Mutex::new(HashSet::new()),
                last_seen: Mutex::new(HashMap::new()),
                terminated: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(HashMap::new()),
                termination_callback: Mutex::new(None),
            }),
            handle: Mutex::new(None),
        })
    }

    /// Start the receive loop on the current tokio runtime.
    ///
    /// Must be called from within a runtime.
    pub fn start(&self) -> Result<()> {
        let fd = AsyncFd::new(self.inner.socket.try_clone()?)?;
        let inner = Arc::clone(&self.inner);
        *self.handle.lock() = Some(tokio::spawn(async move { inner.recv_loop(fd).await }));
        Ok(())
    }

    /// Signal the receive loop to exit. The loop finishes its current
    /// wakeup and stops; no further callbacks are dispatched after that.
    pub fn stop(&self) {
        self.inner.stop.notify_one();
    }

    /// Signal the receive loop and wait for it to finish.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Start listening for packets sent on `universe` by joining its
    /// multicast group. Valid numbers are 1 to 63999 and the reserved
    /// discovery universe 64214 (E1.31 §9.1.1). Joining twice is a no-op.
    pub fn join_universe(&self, universe: u16) -> Result<()> {
        self.inner.join_universe(universe)
    }

    /// Stop listening for packets sent on `universe` by leaving its
    /// multicast group.
    pub fn leave_universe(&self, universe: u16) -> Result<()> {
        let mut joined = self.inner.joined.lock();
        let group = multicast_group(universe);
        socket::leave_multicast(&self.inner.socket, group, self.inner.interface)?;
        joined.remove(&universe);
        Ok(())
    }

    /// Register a callback for one packet family, replacing any previous
    /// callback for that family.
    ///
    /// Each invocation runs on its own spawned task: callbacks execute
    /// concurrently with the receive loop and with each other, and packets
    /// of one universe may reach a slow callback out of order. Serialize
    /// inside the callback if ordering matters.
    pub fn register_packet_callback(
        &self,
        packet_type: SacnPacketType,
        callback: impl Fn(SacnPacket, PacketInfo) + Send + Sync + 'static,
    ) {
        self.inner
            .callbacks
            .lock()
            .insert(packet_type, Arc::new(callback));
    }

    /// The most recent packet seen for a universe (keyed by data universe
    /// or sync address), if any has arrived since the receiver started.
    pub fn last_packet(&self, universe: u16) -> Option<SacnPacket> {
        self.inner
            .last_seen
            .lock()
            .get(&universe)
            .map(|seen| seen.packet.clone())
    }

    /// Register the callback invoked when a universe enters Network Data
    /// Loss, replacing any previous one. Fires at most once per loss edge:
    /// a universe that resumes transmitting re-arms the notification.
    ///
    /// Runs on its own spawned task, concurrently with the receive loop.
    pub fn register_termination_callback(&self, callback: impl Fn(u16) + Send + Sync + 'static) {
        *self.inner.termination_callback.lock() = Some(Arc::new(callback));
    }
}

impl Inner {
    fn join_universe(&self, universe: u16) -> Result<()> {
        if universe == 0 || (universe > 63999 && universe != DISCOVERY_UNIVERSE) {
            return Err(Error::InvalidUniverse(universe));
        }

        let mut joined = self.joined.lock();
        if joined.contains(&universe) {
            return Ok(());
        }
        socket::join_multicast(&self.socket, multicast_group(universe), self.interface)?;
        joined.insert(universe);
        Ok(())
    }

    async fn recv_loop(&self, socket: AsyncFd<UdpSocket>) {
        let mut buf = [0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                () = self.stop.notified() => break,
                readiness = tokio::time::timeout(NETWORK_DATA_LOSS_TIMEOUT, socket.readable()) => {
                    let mut guard = match readiness {
                        // Read deadline elapsed: run the liveness sweep.
                        Err(_) => {
                            self.check_timeouts();
                            continue;
                        }
                        Ok(Err(e)) => {
                            warn!("receive loop aborting: {e}");
                            break;
                        }
                        Ok(Ok(guard)) => guard,
                    };

                    match guard.try_io(|fd| socket::recv_with_destination(fd.get_ref(), &mut buf)) {
                        Err(_would_block) => continue,
                        Ok(Err(e)) => debug!("recv failed: {e}"),
                        Ok(Ok((len, source, destination))) => {
                            self.handle_datagram(&buf[..len], source, destination);
                        }
                    }
                }
            }
        }
    }

    fn handle_datagram(&self, buf: &[u8], source: SocketAddr, destination: Option<Ipv4Addr>) {
        let packet = match SacnPacket::decode(buf) {
            Ok(packet) => packet,
            // Malformed traffic never aborts the receiver.
            Err(e) => {
                debug!(%source, "dropping undecodable datagram: {e}");
                return;
            }
        };

        // Only the limited broadcast (255.255.255.255) counts as broadcast;
        // a directed subnet broadcast classifies as unicast.
        let mode = match destination {
            Some(ip) if ip == Ipv4Addr::BROADCAST => PacketMode::Broadcast,
            Some(ip) if ip.is_multicast() => PacketMode::Multicast,
            _ => PacketMode::Unicast,
        };

        self.handle_packet(packet, PacketInfo { source, mode });
    }

    fn handle_packet(&self, packet: SacnPacket, info: PacketInfo) {
        self.check_timeouts();
        let packet_type = packet.packet_type();

        match &packet {
            SacnPacket::Data(data) => {
                let universe = data.universe;
                self.store_last_packet(universe, packet.clone());

                if data.is_stream_terminated() {
                    self.terminate_universe(universe);
                    return;
                }

                // A data packet commanding synchronization implies traffic
                // on the sync universe; join it if it is not tracked yet.
                if data.sync_address > 0 && !self.terminated.lock().contains_key(&data.sync_address)
                {
                    if let Err(e) = self.join_universe(data.sync_address) {
                        warn!(
                            sync_address = data.sync_address,
                            "could not join sync universe: {e}"
                        );
                    }
                }
            }
            SacnPacket::Sync(sync) => self.store_last_packet(sync.sync_address, packet.clone()),
            SacnPacket::Discovery(_) => {}
        }

        let callback = self.callbacks.lock().get(&packet_type).cloned();
        if let Some(callback) = callback {
            tokio::spawn(async move { callback(packet, info) });
        }
    }

    fn store_last_packet(&self, universe: u16, packet: SacnPacket) {
        self.last_seen.lock().insert(
            universe,
            LastSeen {
                at: Instant::now(),
                packet,
            },
        );
        self.terminated.lock().insert(universe, false);
    }

    fn check_timeouts(&self) {
        let now = Instant::now();
        let expired: Vec<u16> = self
            .last_seen
            .lock()
            .iter()
            .filter(|(_, seen)| now.duration_since(seen.at) > NETWORK_DATA_LOSS_TIMEOUT)
            .map(|(universe, _)| *universe)
            .collect();

        for universe in expired {
            self.terminate_universe(universe);
        }
    }

    /// At most one notification per loss edge; the flag re-arms when the
    /// universe receives again.
    fn terminate_universe(&self, universe: u16) {
        let Some(callback) = self.termination_callback.lock().clone() else {
            return;
        };

        let mut terminated = self.terminated.lock();
        if !terminated.get(&universe).copied().unwrap_or(false) {
            terminated.insert(universe, true);
            tokio::spawn(async move { callback(universe) });
        }
    }
}

fn multicast_group(universe: u16) -> Ipv4Addr {
    match universe_to_multicast(universe) {
        SocketAddr::V4(addr) => *addr.ip(),
        SocketAddr::V6(_) => unreachable!("universe groups are IPv4"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_rejects_out_of_range_universes() {
        let _guard = crate::socket::PORT_LOCK.lock();
        let receiver = Receiver::new(Ipv4Addr::UNSPECIFIED).unwrap();

        assert!(matches!(
            receiver.join_universe(0),
            Err(Error::InvalidUniverse(0))
        ));
        assert!(matches!(
            receiver.join_universe(64000),
            Err(Error::InvalidUniverse(64000))
        ));
        assert!(matches!(
            receiver.join_universe(64213),
            Err(Error::InvalidUniverse(64213))
        ));
    }

    #[test]
    fn packet_mode_classification() {
        // Mirrors the classification in handle_datagram.
        let classify = |destination: Option<Ipv4Addr>| match destination {
            Some(ip) if ip == Ipv4Addr::BROADCAST => PacketMode::Broadcast,
            Some(ip) if ip.is_multicast() => PacketMode::Multicast,
            _ => PacketMode::Unicast,
        };

        assert_eq!(
            classify(Some(Ipv4Addr::new(255, 255, 255, 255))),
            PacketMode::Broadcast
        );
        assert_eq!(
            classify(Some(Ipv4Addr::new(239, 255, 0, 1))),
            PacketMode::Multicast
        );
        assert_eq!(
            classify(Some(Ipv4Addr::new(192, 168, 1, 20))),
            PacketMode::Unicast
        );
        assert_eq!(classify(None), PacketMode::Unicast);
    }
}
