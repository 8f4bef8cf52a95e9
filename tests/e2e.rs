//! End-to-end scenarios over localhost UDP.
//!
//! Port 5568 is fixed by the protocol, so every test that binds it holds a
//! shared lock and gives sockets a moment to close before releasing it.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::timeout;

use sacn::{
    DataPacket, PacketMode, Receiver, SacnPacket, SacnPacketType, Sender, SenderOptions,
    SACN_PORT,
};

static PORT_LOCK: Mutex<()> = Mutex::new(());

/// A plain socket on the sACN port with address/port reuse, so a receiver
/// under test shutting down concurrently cannot make the bind fail.
fn bind_sacn_port() -> UdpSocket {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap();
    socket.set_reuse_address(true).unwrap();
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    socket.set_reuse_port(true).unwrap();

    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, SACN_PORT).into();
    socket.bind(&addr.into()).unwrap();
    socket.set_nonblocking(true).unwrap();
    socket.into()
}

fn data_packet(universe: u16, slots: &[u8]) -> DataPacket {
    let mut packet = DataPacket::new();
    packet.root.cid = [0xAB; 16];
    packet.set_source_name("e2e test rig").unwrap();
    packet.universe = universe;
    packet.set_data(slots);
    packet
}

/// Scenario: a universe goes silent. The termination callback fires exactly
/// once per loss edge.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn receiver_detects_network_data_loss_on_timeout() {
    let guard = PORT_LOCK.lock();

    let receiver = Receiver::new(Ipv4Addr::UNSPECIFIED).unwrap();

    let (data_tx, mut data_rx) = tokio::sync::mpsc::unbounded_channel();
    receiver.register_packet_callback(SacnPacketType::Data, move |packet, info| {
        data_tx.send((packet, info)).ok();
    });

    let terminations = Arc::new(AtomicUsize::new(0));
    let (term_tx, mut term_rx) = tokio::sync::mpsc::unbounded_channel();
    let counter = Arc::clone(&terminations);
    receiver.register_termination_callback(move |universe| {
        counter.fetch_add(1, Ordering::SeqCst);
        term_tx.send(universe).ok();
    });

    receiver.start().unwrap();

    let injector = UdpSocket::bind("127.0.0.1:0").unwrap();
    let encoded = data_packet(1, &[1, 2, 3]).encode();
    injector
        .send_to(&encoded, ("127.0.0.1", SACN_PORT))
        .unwrap();

    // The packet reaches the data callback, classified as unicast.
    let (packet, info) = timeout(Duration::from_secs(2), data_rx.recv())
        .await
        .expect("data callback not invoked")
        .unwrap();
    match packet {
        SacnPacket::Data(data) => {
            assert_eq!(data.universe, 1);
            assert_eq!(data.get_data(), &[1, 2, 3]);
        }
        other => panic!("wrong family: {other:?}"),
    }
    assert_eq!(info.mode, PacketMode::Unicast);
    assert_eq!(info.source.ip(), injector.local_addr().unwrap().ip());
    assert_eq!(receiver.last_packet(1).map(|p| p.packet_type()), Some(SacnPacketType::Data));

    // Silence. NDL hits after 2500 ms.
    let universe = timeout(Duration::from_millis(3500), term_rx.recv())
        .await
        .expect("termination callback not invoked")
        .unwrap();
    assert_eq!(universe, 1);
    assert_eq!(terminations.load(Ordering::SeqCst), 1);

    // Staying silent must not re-fire the notification.
    tokio::time::sleep(Duration::from_millis(3000)).await;
    assert_eq!(terminations.load(Ordering::SeqCst), 1);

    receiver.shutdown().await;
    drop(receiver);
    drop(guard);
}

/// Scenario: the source announces termination with the Stream_Terminated
/// option bit. The data callback never sees the terminator, and a new
/// packet re-arms the loss edge.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn receiver_detects_stream_terminated_bit() {
    let guard = PORT_LOCK.lock();

    let receiver = Receiver::new(Ipv4Addr::UNSPECIFIED).unwrap();

    let data_packets = Arc::new(AtomicUsize::new(0));
    let data_counter = Arc::clone(&data_packets);
    receiver.register_packet_callback(SacnPacketType::Data, move |_, _| {
        data_counter.fetch_add(1, Ordering::SeqCst);
    });

    let (term_tx, mut term_rx) = tokio::sync::mpsc::unbounded_channel();
    receiver.register_termination_callback(move |universe| {
        term_tx.send(universe).ok();
    });

    receiver.start().unwrap();

    let injector = UdpSocket::bind("127.0.0.1:0").unwrap();
    let target = ("127.0.0.1", SACN_PORT);

    injector
        .send_to(&data_packet(7, &[10, 20]).encode(), target)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut terminator = data_packet(7, &[]);
    terminator.set_stream_terminated(true);
    injector.send_to(&terminator.encode(), target).unwrap();

    // Termination is immediate, no 2500 ms wait.
    let universe = timeout(Duration::from_secs(2), term_rx.recv())
        .await
        .expect("termination callback not invoked")
        .unwrap();
    assert_eq!(universe, 7);

    // The terminator itself is not delivered to the data callback.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(data_packets.load(Ordering::SeqCst), 1);

    // New data re-arms the edge and flows to the callback again.
    injector
        .send_to(&data_packet(7, &[30]).encode(), target)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(data_packets.load(Ordering::SeqCst), 2);
    assert!(term_rx.try_recv().is_err());

    receiver.shutdown().await;
    drop(receiver);
    drop(guard);
}

/// Scenario: stopping a universe produces exactly the user packet plus
/// three Stream_Terminated packets, sequence numbers strictly increasing.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sender_emits_three_terminators_on_stop() {
    let guard = PORT_LOCK.lock();

    let observer = tokio::net::UdpSocket::from_std(bind_sacn_port()).unwrap();

    let options = SenderOptions {
        cid: None,
        source_name: Some("termination test".into()),
    };
    let sender = Sender::new(Ipv4Addr::LOCALHOST, options).await.unwrap();

    sender.start_universe(5).unwrap();
    sender.add_destination(5, Ipv4Addr::LOCALHOST).unwrap();

    let mut user_packet = DataPacket::new();
    user_packet.set_data(&[0xFF; 16]);
    sender.send(5, user_packet).await.unwrap();

    sender.stop_universe(5).unwrap();

    let mut datagrams = Vec::new();
    let mut buf = [0u8; 1144];
    for _ in 0..4 {
        let (len, _) = timeout(Duration::from_secs(3), observer.recv_from(&mut buf))
            .await
            .expect("expected 4 datagrams on the wire")
            .unwrap();
        match SacnPacket::decode(&buf[..len]).unwrap() {
            SacnPacket::Data(data) => datagrams.push(data),
            other => panic!("wrong family: {other:?}"),
        }
    }

    // Nothing beyond the handshake.
    assert!(
        timeout(Duration::from_millis(500), observer.recv_from(&mut buf))
            .await
            .is_err()
    );

    assert!(!datagrams[0].is_stream_terminated());
    assert_eq!(datagrams[0].universe, 5);
    assert_eq!(datagrams[0].get_data(), &[0xFF; 16]);
    assert_eq!(datagrams[0].source_name(), "termination test");
    assert_eq!(datagrams[0].root.cid, *sender.cid().as_bytes());

    for terminator in &datagrams[1..] {
        assert!(terminator.is_stream_terminated());
        assert_eq!(terminator.universe, 5);
    }

    let sequences: Vec<u8> = datagrams.iter().map(|d| d.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);

    // The universe record is gone once its task has exited.
    assert!(!sender.is_enabled(5));
    assert!(sender.universes().is_empty());

    sender.close().await;
    drop(observer);
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(guard);
}

/// Scenario: closing the sender runs the termination handshake for every
/// universe and leaves no task behind.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sender_close_stops_every_universe() {
    let guard = PORT_LOCK.lock();

    let observer = tokio::net::UdpSocket::from_std(bind_sacn_port()).unwrap();

    let sender = Sender::new(Ipv4Addr::LOCALHOST, SenderOptions::default())
        .await
        .unwrap();
    for universe in [3, 4] {
        sender.start_universe(universe).unwrap();
        sender.add_destination(universe, Ipv4Addr::LOCALHOST).unwrap();
    }

    sender.close().await;
    assert!(sender.universes().is_empty());

    // Three terminators per universe, nothing else.
    let mut by_universe = std::collections::HashMap::new();
    let mut buf = [0u8; 1144];
    for _ in 0..6 {
        let (len, _) = timeout(Duration::from_secs(3), observer.recv_from(&mut buf))
            .await
            .expect("expected 6 terminator datagrams")
            .unwrap();
        match SacnPacket::decode(&buf[..len]).unwrap() {
            SacnPacket::Data(data) => {
                assert!(data.is_stream_terminated());
                *by_universe.entry(data.universe).or_insert(0u32) += 1;
            }
            other => panic!("wrong family: {other:?}"),
        }
    }
    assert_eq!(by_universe.get(&3), Some(&3));
    assert_eq!(by_universe.get(&4), Some(&3));

    drop(observer);
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(guard);
}
