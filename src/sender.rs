//! The sACN sender engine.
//!
//! A [`Sender`] owns one UDP socket and a map of universe records. Each
//! started universe gets a bounded channel and a dedicated send task that
//! stamps sender-wide defaults (CID, source name) and the universe's
//! wrapping sequence counter onto every outbound packet. A separate task
//! multicasts Universe Discovery pages every 10 seconds. Stopping a
//! universe triggers the graceful-termination convention of E1.31 §6.7.1:
//! three trailing packets with the Stream_Terminated option set.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::{Error, Result};
use crate::packet::{name_to_field, DataPacket, DiscoveryPacket, SacnPacket};
use crate::socket;
use crate::types::ComponentId;
use crate::util::universe_to_multicast;
use crate::{DISCOVERY_UNIVERSE, SACN_PORT, UNIVERSE_DISCOVERY_INTERVAL};

/// Per-universe channel capacity. The protocol refresh rate tops out at
/// 44 Hz, so a short queue gives enough slack.
const CHANNEL_CAPACITY: usize = 3;

const DEFAULT_SOURCE_NAME: &str = "sacn-rs";

/// Universes per discovery page (E1.31 §8).
const UNIVERSES_PER_PAGE: usize = 512;

/// Optional sender-wide settings applied to every packet that does not
/// carry its own.
#[derive(Debug, Clone, Default)]
pub struct SenderOptions {
    /// Component identifier stamped on outbound packets. Generated
    /// (UUID v7) when absent.
    pub cid: Option<ComponentId>,
    /// Source name stamped on outbound packets, at most 64 bytes.
    /// Defaults to `"sacn-rs"`.
    pub source_name: Option<String>,
}

/// State for one universe the sender is handling.
struct UniverseState {
    number: u16,
    enabled: AtomicBool,
    sequence: AtomicU8,
    multicast: AtomicBool,
    destinations: RwLock<Vec<SocketAddr>>,
    tx: mpsc::Sender<SacnPacket>,
    stop: Arc<Notify>,
}

/// An sACN sender.
///
/// ```no_run
/// # use sacn::{DataPacket, Sender, SenderOptions};
/// # #[tokio::main] async fn main() -> sacn::Result<()> {
/// let sender = Sender::new("192.168.1.100".parse().unwrap(), SenderOptions::default()).await?;
/// let tx = sender.start_universe(1)?;
/// sender.set_multicast(1, true)?;
///
/// let mut packet = DataPacket::new();
/// packet.set_data(&[255, 0, 128]);
/// tx.send(packet.into()).await.unwrap();
/// # sender.close().await;
/// # Ok(()) }
/// ```
pub struct Sender {
    inner: Arc<SenderInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct SenderInner {
    socket: UdpSocket,
    universes: DashMap<u16, Arc<UniverseState>>,
    discovery_stop: Notify,

    // Defaults for packets that do not set their own.
    cid: [u8; 16],
    source_name: [u8; 64],
}

impl Sender {
    /// Create a sender bound to `local_ip` on an ephemeral port and start
    /// its discovery task.
    ///
    /// A concrete `local_ip` is mandatory when any universe will use
    /// multicast, since the OS routes multicast egress by interface.
    pub async fn new(local_ip: Ipv4Addr, options: SenderOptions) -> Result<Self> {
        let source_name = options
            .source_name
            .unwrap_or_else(|| DEFAULT_SOURCE_NAME.to_owned());
        let source_name_len = source_name.len();
        let source_name = name_to_field(&source_name)
            .map_err(|_| Error::SourceNameTooLong(source_name_len))?;

        let cid = options.cid.unwrap_or_default();

        let socket = UdpSocket::from_std(socket::create_sender_socket(local_ip)?)?;

        let inner = Arc::new(SenderInner {
            socket,
            universes: DashMap::new(),
            discovery_stop: Notify::new(),
            cid: *cid.as_bytes(),
            source_name,
        });

        let discovery = tokio::spawn(discovery_loop(Arc::clone(&inner)));

        Ok(Self {
            inner,
            tasks: Mutex::new(vec![discovery]),
        })
    }

    /// The sender's component identifier.
    pub fn cid(&self) -> ComponentId {
        ComponentId::from_bytes(self.inner.cid)
    }

    /// The sender's default source name.
    pub fn source_name(&self) -> String {
        crate::packet::name_from_field(&self.inner.source_name)
    }

    /// Initialise a universe and return the channel to write packets into.
    ///
    /// Universe numbers range from 1 to 63999 (E1.31 §6.2.7). One send
    /// task per universe drains the channel; [`Sender::send`] is the
    /// call-style alternative to writing the channel directly.
    ///
    /// Must be called from within the tokio runtime.
    pub fn start_universe(&self, universe: u16) -> Result<mpsc::Sender<SacnPacket>> {
        if self.is_enabled(universe) {
            return Err(Error::UniverseAlreadyStarted(universe));
        }
        if universe < 1 || universe >= 64000 {
            return Err(Error::InvalidUniverse(universe));
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let stop = Arc::new(Notify::new());
        let state = Arc::new(UniverseState {
            number: universe,
            enabled: AtomicBool::new(true),
            sequence: AtomicU8::new(0),
            multicast: AtomicBool::new(false),
            destinations: RwLock::new(Vec::new()),
            tx: tx.clone(),
            stop: Arc::clone(&stop),
        });

        match self.inner.universes.entry(universe) {
            Entry::Occupied(_) => return Err(Error::UniverseAlreadyStarted(universe)),
            Entry::Vacant(vacant) => {
                vacant.insert(state);
            }
        }

        let task = tokio::spawn(universe_loop(Arc::clone(&self.inner), universe, rx, stop));
        self.tasks.lock().push(task);

        Ok(tx)
    }

    /// Stop sending on a universe.
    ///
    /// The universe's task drains any queued packets, emits three
    /// Stream_Terminated packets and removes the universe. Channel handles
    /// obtained from [`Sender::start_universe`] fail afterwards.
    pub fn stop_universe(&self, universe: u16) -> Result<()> {
        let state = self
            .inner
            .universes
            .get(&universe)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(Error::UniverseNotStarted(universe))?;
        state.stop.notify_one();
        Ok(())
    }

    /// Queue one packet for a universe. Blocks while the universe's
    /// channel is full.
    pub async fn send(&self, universe: u16, packet: impl Into<SacnPacket>) -> Result<()> {
        let tx = self
            .inner
            .universes
            .get(&universe)
            .map(|entry| entry.value().tx.clone())
            .ok_or(Error::UniverseNotStarted(universe))?;

        tx.send(packet.into())
            .await
            .map_err(|_| Error::ChannelClosed(universe))
    }

    /// All currently enabled universes, ascending.
    pub fn universes(&self) -> Vec<u16> {
        self.inner.universes_snapshot()
    }

    /// Whether the universe is currently enabled.
    pub fn is_enabled(&self, universe: u16) -> bool {
        self.inner
            .universes
            .get(&universe)
            .is_some_and(|entry| entry.value().enabled.load(Ordering::Relaxed))
    }

    /// Whether multicast egress is on for the universe.
    pub fn is_multicast(&self, universe: u16) -> Result<bool> {
        self.inner
            .universes
            .get(&universe)
            .map(|entry| entry.value().multicast.load(Ordering::Relaxed))
            .ok_or(Error::UniverseNotStarted(universe))
    }

    /// Turn multicast egress on or off for the universe.
    pub fn set_multicast(&self, universe: u16, multicast: bool) -> Result<()> {
        self.inner
            .universes
            .get(&universe)
            .map(|entry| entry.value().multicast.store(multicast, Ordering::Relaxed))
            .ok_or(Error::UniverseNotStarted(universe))
    }

    /// The unicast destinations configured for the universe.
    pub fn destinations(&self, universe: u16) -> Result<Vec<SocketAddr>> {
        self.inner
            .universes
            .get(&universe)
            .map(|entry| entry.value().destinations.read().clone())
            .ok_or(Error::UniverseNotStarted(universe))
    }

    /// Add one unicast destination (port 5568) for the universe.
    pub fn add_destination(&self, universe: u16, destination: Ipv4Addr) -> Result<()> {
        self.inner
            .universes
            .get(&universe)
            .map(|entry| {
                entry
                    .value()
                    .destinations
                    .write()
                    .push(SocketAddr::V4(SocketAddrV4::new(destination, SACN_PORT)));
            })
            .ok_or(Error::UniverseNotStarted(universe))
    }

    /// Replace the universe's unicast destination list (port 5568).
    pub fn set_destinations(&self, universe: u16, destinations: &[Ipv4Addr]) -> Result<()> {
        let addrs: Vec<SocketAddr> = destinations
            .iter()
            .map(|ip| SocketAddr::V4(SocketAddrV4::new(*ip, SACN_PORT)))
            .collect();

        self.inner
            .universes
            .get(&universe)
            .map(|entry| *entry.value().destinations.write() = addrs)
            .ok_or(Error::UniverseNotStarted(universe))
    }

    /// Stop every universe (with the termination handshake), stop the
    /// discovery task and wait for all tasks to finish. The socket closes
    /// only after the last task has returned.
    pub async fn close(&self) {
        for entry in self.inner.universes.iter() {
            if entry.value().enabled.load(Ordering::Relaxed) {
                entry.value().stop.notify_one();
            }
        }
        self.inner.discovery_stop.notify_one();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl SenderInner {
    fn universes_snapshot(&self) -> Vec<u16> {
        let mut list: Vec<u16> = self
            .universes
            .iter()
            .filter(|entry| entry.value().enabled.load(Ordering::Relaxed))
            .map(|entry| *entry.key())
            .collect();
        list.sort_unstable();
        list
    }

    /// Stamp sender defaults and the next sequence number, then transmit.
    async fn dispatch(&self, universe: u16, mut packet: SacnPacket) {
        let Some(state) = self
            .universes
            .get(&universe)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };
        let sequence = state.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        match &mut packet {
            SacnPacket::Data(data) => {
                if data.root.cid[0] == 0 {
                    data.root.cid = self.cid;
                }
                data.universe = universe;
                data.sequence = sequence;
                if data.source_name().is_empty() {
                    data.source_name = self.source_name;
                }
            }
            SacnPacket::Sync(sync) => {
                if sync.root.cid[0] == 0 {
                    sync.root.cid = self.cid;
                }
                sync.sync_address = universe;
                sync.sequence = sequence;
            }
            // Discovery packets are the discovery task's job, but a
            // user-queued one is still filled in and sent.
            SacnPacket::Discovery(discovery) => {
                if discovery.root.cid[0] == 0 {
                    discovery.root.cid = self.cid;
                }
                if discovery.source_name().is_empty() {
                    discovery.source_name = self.source_name;
                }
            }
        }

        self.send_packet(&state, &packet).await;
    }

    /// Marshal once, then write the same bytes to every egress path.
    /// Per-write failures are logged and skipped.
    async fn send_packet(&self, state: &UniverseState, packet: &SacnPacket) {
        let bytes = packet.encode();

        if state.multicast.load(Ordering::Relaxed) {
            let group = universe_to_multicast(state.number);
            if let Err(e) = self.socket.send_to(&bytes, group).await {
                warn!(universe = state.number, "multicast send failed: {e}");
            }
        }

        let destinations = state.destinations.read().clone();
        for destination in destinations {
            if let Err(e) = self.socket.send_to(&bytes, destination).await {
                warn!(universe = state.number, %destination, "unicast send failed: {e}");
            }
        }
    }

    /// Termination handshake: three Stream_Terminated packets continuing
    /// the universe's sequence, then drop the record.
    async fn finish_universe(&self, universe: u16) {
        let Some(state) = self
            .universes
            .get(&universe)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };
        state.enabled.store(false, Ordering::Relaxed);

        for _ in 0..3 {
            let sequence = state.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

            let mut packet = DataPacket::new();
            packet.root.cid = self.cid;
            packet.source_name = self.source_name;
            packet.universe = universe;
            packet.sequence = sequence;
            packet.set_stream_terminated(true);

            self.send_packet(&state, &SacnPacket::Data(packet)).await;
        }

        self.universes.remove(&universe);
    }

    async fn send_discovery_pages(&self) {
        let universes = self.universes_snapshot();
        let pages = universes.len() / UNIVERSES_PER_PAGE;

        for page in 0..=pages {
            let mut packet = DiscoveryPacket::new();
            packet.page = page as u8;
            packet.last = pages as u8;
            packet.root.cid = self.cid;
            packet.source_name = self.source_name;

            let start = page * UNIVERSES_PER_PAGE;
            let end = ((page + 1) * UNIVERSES_PER_PAGE).min(universes.len());
            packet.set_universes(&universes[start..end]).ok();

            let bytes = SacnPacket::Discovery(packet).encode();
            let group = universe_to_multicast(DISCOVERY_UNIVERSE);
            if let Err(e) = self.socket.send_to(&bytes, group).await {
                warn!("discovery send failed: {e}");
            }
        }
    }
}

/// One universe's send task: drain the channel, then run the termination
/// handshake when the channel closes or the universe is stopped.
async fn universe_loop(
    inner: Arc<SenderInner>,
    universe: u16,
    mut rx: mpsc::Receiver<SacnPacket>,
    stop: Arc<Notify>,
) {
    loop {
        tokio::select! {
            () = stop.notified() => {
                // Refuse new sends, but drain what is already queued.
                rx.close();
                while let Some(packet) = rx.recv().await {
                    inner.dispatch(universe, packet).await;
                }
                break;
            }
            received = rx.recv() => match received {
                Some(packet) => inner.dispatch(universe, packet).await,
                None => break,
            },
        }
    }

    inner.finish_universe(universe).await;
}

/// Periodic Universe Discovery transmission (E1.31 §4.3). The first page
/// set goes out one full interval after the sender starts.
async fn discovery_loop(inner: Arc<SenderInner>) {
    let start = tokio::time::Instant::now() + UNIVERSE_DISCOVERY_INTERVAL;
    let mut timer = tokio::time::interval_at(start, UNIVERSE_DISCOVERY_INTERVAL);

    loop {
        tokio::select! {
            () = inner.discovery_stop.notified() => return,
            _ = timer.tick() => inner.send_discovery_pages().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_universe_validates_input() {
        let sender = Sender::new(Ipv4Addr::LOCALHOST, SenderOptions::default())
            .await
            .unwrap();

        assert!(matches!(
            sender.start_universe(0),
            Err(Error::InvalidUniverse(0))
        ));
        assert!(matches!(
            sender.start_universe(64000),
            Err(Error::InvalidUniverse(64000))
        ));

        sender.start_universe(5).unwrap();
        assert!(matches!(
            sender.start_universe(5),
            Err(Error::UniverseAlreadyStarted(5))
        ));

        sender.close().await;
    }

    #[tokio::test]
    async fn source_name_length_is_enforced() {
        let options = SenderOptions {
            cid: None,
            source_name: Some("x".repeat(65)),
        };
        assert!(matches!(
            Sender::new(Ipv4Addr::LOCALHOST, options).await,
            Err(Error::SourceNameTooLong(65))
        ));
    }

    #[tokio::test]
    async fn accessors_track_universe_configuration() {
        let sender = Sender::new(Ipv4Addr::LOCALHOST, SenderOptions::default())
            .await
            .unwrap();

        assert!(matches!(
            sender.is_multicast(9),
            Err(Error::UniverseNotStarted(9))
        ));

        sender.start_universe(9).unwrap();
        assert!(sender.is_enabled(9));
        assert!(!sender.is_multicast(9).unwrap());

        sender.set_multicast(9, true).unwrap();
        assert!(sender.is_multicast(9).unwrap());

        sender.add_destination(9, Ipv4Addr::new(10, 0, 0, 7)).unwrap();
        sender
            .set_destinations(9, &[Ipv4Addr::new(10, 0, 0, 8), Ipv4Addr::new(10, 0, 0, 9)])
            .unwrap();
        let destinations = sender.destinations(9).unwrap();
        assert_eq!(destinations.len(), 2);
        assert!(destinations.iter().all(|d| d.port() == SACN_PORT));

        assert_eq!(sender.universes(), vec![9]);

        sender.close().await;
        assert!(!sender.is_enabled(9));
        assert!(sender.universes().is_empty());
    }
}
