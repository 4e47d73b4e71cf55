// Copyright (c) 2023 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use super::*;
use crate::config::RelayConfig;
use crate::iface::PeerStats;
use crate::manager::RelayManager;
use crate::metrics::{MemoryMetrics, MetricsSink};
use crate::packet::errors::PacketError;
use crate::packet::{Processed, TrailerTransform, MESSAGE_PROXY_SZ};
use crate::uplink::TurnTransport;
use chrono::Utc;
use rand_core::OsRng;
use std::net::SocketAddrV4;
use std::sync::atomic::AtomicUsize;
use std::sync::Barrier;
use std::time::Instant;

/// Tunnel interface stand-in that records every endpoint update.
#[derive(Default)]
struct FakeIface {
    updates: Mutex<Vec<PeerEndpoint>>,
    peers: Mutex<Vec<PeerStats>>,
    fail_updates: AtomicBool,
}

impl WgIface for FakeIface {
    fn name(&self) -> &str {
        "wg-test"
    }

    fn update_peer_endpoint(&self, peer: &PeerEndpoint) -> Result<(), Error> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Error::Iface("update rejected".to_owned()));
        }
        self.updates.lock().push(peer.clone());
        Ok(())
    }

    fn get_peers(&self) -> Result<Vec<PeerStats>, Error> {
        Ok(self.peers.lock().clone())
    }
}

struct TestBed {
    device_key: x25519::PublicKey,
    iface: Arc<FakeIface>,
    sink: Arc<MemoryMetrics>,
    /// Plays the tunnel software listening on loopback
    wg: UdpSocket,
    /// Plays the remote peer
    remote: UdpSocket,
    manager: RelayManager,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn random_key() -> x25519::PublicKey {
    x25519::PublicKey::from(&x25519::StaticSecret::random_from_rng(OsRng))
}

fn loopback_socket() -> UdpSocket {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    sock
}

/// Refuses to frame anything on the way out; decodes like [`TrailerTransform`].
struct RejectingTransform;

impl PacketTransform for RejectingTransform {
    fn process_before_sending(
        &self,
        _buf: &mut [u8],
        _n: usize,
        _local: &x25519::PublicKey,
        _remote: &x25519::PublicKey,
    ) -> Result<Processed, PacketError> {
        Err(PacketError::DestinationBufferTooSmall)
    }

    fn extract_info(&self, buf: &[u8], n: usize) -> Result<Processed, PacketError> {
        TrailerTransform.extract_info(buf, n)
    }
}

/// TURN allocation whose first `failures` writes fail.
struct FlakyTurn {
    socket: UdpSocket,
    failures: AtomicUsize,
}

impl TurnTransport for FlakyTurn {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> std::io::Result<usize> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| f.checked_sub(1))
            .is_ok();
        if failing {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "allocation expired",
            ));
        }
        self.socket.send_to(buf, addr)
    }
}

impl TestBed {
    fn new(local_cidr: &str, proxy_port: u16) -> TestBed {
        TestBed::with_transform(local_cidr, proxy_port, Arc::new(TrailerTransform))
    }

    fn with_transform(
        local_cidr: &str,
        proxy_port: u16,
        transform: Arc<dyn PacketTransform>,
    ) -> TestBed {
        init_tracing();
        let wg = loopback_socket();
        let settings = Settings {
            listen_port: 0,
            proxy_port,
            wg_listen_port: wg.local_addr().unwrap().port(),
            local_cidr: local_cidr.to_owned(),
            ..Settings::default()
        };
        let device_key = random_key();
        let iface = Arc::new(FakeIface::default());
        let sink = Arc::new(MemoryMetrics::new());
        let manager = RelayManager::new(
            settings,
            device_key,
            iface.clone(),
            transform,
            sink.clone(),
        )
        .unwrap();

        TestBed {
            device_key,
            iface,
            sink,
            wg,
            remote: loopback_socket(),
            manager,
        }
    }

    fn peer_config(&self, key: x25519::PublicKey) -> RelayConfig {
        RelayConfig::new(key, self.remote.local_addr().unwrap())
    }

    fn uplink_port(&self) -> u16 {
        self.manager.context().uplink.local_addr().unwrap().port()
    }

    fn recv_remote(&self) -> (Vec<u8>, SocketAddr) {
        let mut buf = vec![0u8; MAX_UDP_SIZE];
        let (n, from) = self.remote.recv_from(&mut buf).unwrap();
        buf.truncate(n);
        (buf, from)
    }
}

fn wait_for<F: Fn() -> bool>(f: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn assert_nothing_more(sock: &UdpSocket) {
    sock.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    let mut buf = [0u8; 2048];
    let err = sock.recv_from(&mut buf).unwrap_err();
    assert!(is_tick(&err), "unexpected datagram or error: {:?}", err);
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
}

#[test]
fn relays_one_datagram_to_remote() {
    let bed = TestBed::new("127.11.0.0/24", 41_801);
    let peer = random_key();

    let relay = bed.manager.add_peer(bed.peer_config(peer), ["server-a"]).unwrap();
    let local = relay.local_addr().unwrap();
    assert_eq!(local, SocketAddr::from(([127, 11, 0, 1], 41_801)));

    // The tunnel was told the peer lives at the relay socket
    let updates = bed.iface.updates.lock().clone();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].public_key, peer);
    assert_eq!(updates[0].endpoint, local);

    bed.wg.send_to(&[0x42; 100], local).unwrap();

    let (datagram, from) = bed.recv_remote();
    assert_eq!(datagram.len(), 100 + MESSAGE_PROXY_SZ);
    assert_eq!(from.port(), bed.uplink_port());
    let info = TrailerTransform.extract_info(&datagram, datagram.len()).unwrap();
    assert_eq!(info.len, 100);
    assert_eq!(info.src, PeerHash::from_key(&bed.device_key));
    assert_eq!(info.dst, PeerHash::from_key(&peer));
    assert_eq!(&datagram[..100], &[0x42; 100][..]);
    assert_nothing_more(&bed.remote);

    wait_for(|| bed.sink.get_metric("server-a", &peer).traffic_sent == 100);
}

#[test]
fn preserves_datagram_order() {
    let bed = TestBed::new("127.12.0.0/24", 41_802);
    let peer = random_key();
    let relay = bed.manager.add_peer(bed.peer_config(peer), ["server-a"]).unwrap();
    let local = relay.local_addr().unwrap();

    const N: u32 = 64;
    for seq in 0..N {
        bed.wg.send_to(&seq.to_le_bytes(), local).unwrap();
    }
    for seq in 0..N {
        let (datagram, _) = bed.recv_remote();
        let info = TrailerTransform.extract_info(&datagram, datagram.len()).unwrap();
        assert_eq!(info.len, 4);
        let got = u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
        assert_eq!(got, seq);
    }
    assert_nothing_more(&bed.remote);
    wait_for(|| bed.sink.get_metric("server-a", &peer).traffic_sent == 4 * N as u64);
}

#[test]
fn inbound_datagrams_reach_the_tunnel() {
    let bed = TestBed::new("127.13.0.0/24", 41_803);
    let peer = random_key();
    let relay = bed.manager.add_peer(bed.peer_config(peer), ["server-a"]).unwrap();
    let local = relay.local_addr().unwrap();

    let mut buf = vec![0u8; 64 + MESSAGE_PROXY_SZ];
    buf[..64].copy_from_slice(&[7u8; 64]);
    let framed = TrailerTransform
        .process_before_sending(&mut buf, 64, &peer, &bed.device_key)
        .unwrap();
    let uplink = SocketAddr::from(([127, 0, 0, 1], bed.uplink_port()));
    bed.remote.send_to(&buf[..framed.len], uplink).unwrap();

    let mut got = [0u8; 2048];
    let (n, from) = bed.wg.recv_from(&mut got).unwrap();
    assert_eq!(from, local);
    assert_eq!(&got[..n], &[7u8; 64][..]);
    // Counted without the trailer, like outbound traffic
    wait_for(|| bed.sink.get_metric("server-a", &peer).traffic_received == 64);

    // Addressed to some other device: dropped
    let other = random_key();
    let framed = TrailerTransform
        .process_before_sending(&mut buf, 64, &peer, &other)
        .unwrap();
    bed.remote.send_to(&buf[..framed.len], uplink).unwrap();
    assert_nothing_more(&bed.wg);
}

#[test]
fn plain_mode_forwards_untouched() {
    let bed = TestBed::new("127.14.0.0/24", 41_804);
    let peer = random_key();
    let mut config = bed.peer_config(peer);
    config.relay_enabled = false;
    let relay = bed.manager.add_peer(config, ["server-a"]).unwrap();

    bed.wg.send_to(&[9u8; 100], relay.local_addr().unwrap()).unwrap();
    let (datagram, _) = bed.recv_remote();
    assert_eq!(datagram, vec![9u8; 100]);

    thread::sleep(Duration::from_millis(100));
    assert_eq!(bed.sink.get_metric("server-a", &peer).traffic_sent, 0);
}

#[test]
fn turn_mode_writes_through_the_transport() {
    let bed = TestBed::new("127.15.0.0/24", 41_805);
    let peer = random_key();
    let turn = Arc::new(loopback_socket());
    let turn_addr = turn.local_addr().unwrap();
    let config = bed
        .peer_config(peer)
        .with_turn(turn, bed.remote.local_addr().unwrap());
    let relay = bed.manager.add_peer(config, ["server-a"]).unwrap();

    bed.wg.send_to(&[1u8; 100], relay.local_addr().unwrap()).unwrap();
    let (datagram, from) = bed.recv_remote();
    assert_eq!(from, turn_addr);
    assert_eq!(datagram.len(), 100 + MESSAGE_PROXY_SZ);
}

#[test]
fn reset_replaces_the_loop() {
    let bed = TestBed::new("127.16.0.0/24", 41_806);
    let peer = random_key();
    let old = bed.manager.add_peer(bed.peer_config(peer), ["server-a"]).unwrap();
    let local = old.local_addr().unwrap();

    let new = old.reset().unwrap();
    assert!(!old.is_running());
    assert!(old.local_conn().is_none());
    assert!(new.is_running());
    assert_eq!(new.local_addr(), Some(local));

    let conn = bed.manager.registry().get_by_key(&peer).unwrap();
    assert!(Arc::ptr_eq(conn.relay.as_ref().unwrap(), &new));
    let by_hash = bed
        .manager
        .registry()
        .get_by_hash(&PeerHash::from_key(&peer))
        .unwrap();
    assert!(Arc::ptr_eq(by_hash.relay.as_ref().unwrap(), &new));
    assert_eq!(bed.iface.updates.lock().len(), 2);

    bed.wg.send_to(&[3u8; 10], local).unwrap();
    let (datagram, _) = bed.recv_remote();
    assert_eq!(&datagram[..10], &[3u8; 10][..]);
    assert_nothing_more(&bed.remote);
}

#[test]
fn reset_follows_endpoint_changes() {
    let bed = TestBed::new("127.17.0.0/24", 41_807);
    let peer = random_key();
    bed.manager.add_peer(bed.peer_config(peer), ["server-a"]).unwrap();

    let moved = loopback_socket();
    let relay = bed
        .manager
        .update_peer_endpoint(&peer, moved.local_addr().unwrap())
        .unwrap();

    bed.wg.send_to(&[5u8; 20], relay.local_addr().unwrap()).unwrap();
    let mut buf = [0u8; 2048];
    let (n, _) = moved.recv_from(&mut buf).unwrap();
    assert_eq!(n, 20 + MESSAGE_PROXY_SZ);
    assert_nothing_more(&bed.remote);
}

#[test]
fn reset_of_removed_peer_leaves_nothing_behind() {
    let bed = TestBed::new("127.18.0.0/24", 41_808);
    let peer = random_key();
    let relay = bed.manager.add_peer(bed.peer_config(peer), ["server-a"]).unwrap();
    let local = relay.local_addr().unwrap();
    let other = bed.manager.add_peer(bed.peer_config(random_key()), ["server-a"]).unwrap();

    // Removed from under the endpoint, as a concurrent control-plane event would
    bed.manager.registry().remove(&peer);
    let before = bed.manager.registry().len();

    assert!(matches!(relay.reset(), Err(Error::PeerNotFound(_))));
    assert!(!relay.is_running());
    assert_eq!(bed.manager.registry().len(), before);
    assert!(other.is_running());

    // The local socket was released: a plain bind on the same address succeeds
    UdpSocket::bind(local).unwrap();
}

#[test]
fn failed_interface_update_starts_nothing() {
    let bed = TestBed::new("127.19.0.0/24", 41_809);
    bed.iface.fail_updates.store(true, Ordering::SeqCst);

    let err = bed
        .manager
        .add_peer(bed.peer_config(random_key()), ["server-a"])
        .unwrap_err();
    assert!(matches!(err, Error::Iface(_)));
    assert!(bed.manager.registry().is_empty());
    UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::new(127, 19, 0, 1), 41_809)).unwrap();
}

#[test]
fn second_peer_gets_the_next_address() {
    let bed = TestBed::new("127.20.0.0/24", 41_810);
    let a = bed.manager.add_peer(bed.peer_config(random_key()), ["s"]).unwrap();
    let b = bed.manager.add_peer(bed.peer_config(random_key()), ["s"]).unwrap();
    assert_eq!(a.local_addr().unwrap().ip(), Ipv4Addr::new(127, 20, 0, 1));
    assert_eq!(b.local_addr().unwrap().ip(), Ipv4Addr::new(127, 20, 0, 2));
}

#[test]
fn proxy_peer_returns_once_closed() {
    let bed = TestBed::new("127.21.0.0/24", 41_811);
    let relay = bed.manager.add_peer(bed.peer_config(random_key()), ["s"]).unwrap();

    let waiter = {
        let relay = Arc::clone(&relay);
        thread::spawn(move || relay.proxy_peer())
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());

    relay.close();
    relay.close();
    waiter.join().unwrap();
    assert!(!relay.is_running());
    assert!(matches!(relay.start(), Err(Error::Lifecycle(_))));
}

#[test]
fn remove_peer_stops_relay_and_clears_metrics() {
    let bed = TestBed::new("127.22.0.0/24", 41_812);
    let peer = random_key();
    let relay = bed.manager.add_peer(bed.peer_config(peer), ["server-a"]).unwrap();

    bed.wg.send_to(&[0u8; 30], relay.local_addr().unwrap()).unwrap();
    bed.recv_remote();
    wait_for(|| bed.sink.get_metric("server-a", &peer).traffic_sent == 30);

    bed.manager.remove_peer(&peer).unwrap();
    assert!(!relay.is_running());
    assert!(bed.manager.registry().get_by_key(&peer).is_none());
    assert_eq!(bed.sink.get_metric("server-a", &peer).traffic_sent, 0);
    assert!(matches!(bed.manager.remove_peer(&peer), Err(Error::PeerNotFound(_))));
}

#[test]
fn delete_all_peers_and_status() {
    let bed = TestBed::new("127.23.0.0/24", 41_813);
    let peer = random_key();
    let relay = bed.manager.add_peer(bed.peer_config(peer), ["s"]).unwrap();

    assert!(!bed.manager.peer_connection_status(&peer));
    bed.iface.peers.lock().push(PeerStats {
        public_key: peer,
        last_handshake: Some(Utc::now()),
        rx_bytes: 1,
        tx_bytes: 0,
    });
    assert!(bed.manager.peer_connection_status(&peer));

    bed.manager.delete_all_peers();
    assert!(bed.manager.registry().is_empty());
    assert!(!relay.is_running());
}

#[test]
fn concurrent_resets_leave_one_loop() {
    let bed = TestBed::new("127.24.0.0/24", 41_814);
    let peer = random_key();
    let first = bed.manager.add_peer(bed.peer_config(peer), ["s"]).unwrap();
    let local = first.local_addr().unwrap();

    let barrier = Barrier::new(2);
    let relays: Vec<Arc<RelayEndpoint>> = thread::scope(|s| {
        let resets: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    bed.manager.reset_peer(&peer).unwrap()
                })
            })
            .collect();
        resets.into_iter().map(|r| r.join().unwrap()).collect()
    });

    assert!(!first.is_running());
    assert_eq!(relays.iter().filter(|r| r.is_running()).count(), 1);
    let conn = bed.manager.registry().get_by_key(&peer).unwrap();
    let published = conn.relay.unwrap();
    assert!(published.is_running());
    assert_eq!(published.local_addr(), Some(local));

    bed.wg.send_to(&[8u8; 40], local).unwrap();
    let (datagram, _) = bed.recv_remote();
    assert_eq!(&datagram[..40], &[8u8; 40][..]);
    assert_nothing_more(&bed.remote);
}

#[test]
fn concurrent_adds_of_one_peer_leave_one_loop() {
    let bed = TestBed::new("127.25.0.0/24", 41_815);
    let peer = random_key();

    let barrier = Barrier::new(2);
    let relays: Vec<Arc<RelayEndpoint>> = thread::scope(|s| {
        let adds: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    bed.manager.add_peer(bed.peer_config(peer), ["s"]).unwrap()
                })
            })
            .collect();
        adds.into_iter().map(|a| a.join().unwrap()).collect()
    });

    assert_eq!(relays.iter().filter(|r| r.is_running()).count(), 1);
    assert_eq!(bed.manager.registry().len(), 1);
    let published = bed.manager.registry().get_by_key(&peer).unwrap().relay.unwrap();
    assert!(published.is_running());
    assert_eq!(
        published.local_addr().unwrap().ip(),
        Ipv4Addr::new(127, 25, 0, 1)
    );
}

#[test]
fn held_local_address_is_not_shared() {
    let bed = TestBed::new("127.26.0.0/24", 41_816);
    let held = bed.manager.add_peer(bed.peer_config(random_key()), ["s"]).unwrap();
    let local = held.local_addr().unwrap();

    let mut config = bed.peer_config(random_key());
    config.local_ip = Ipv4Addr::new(127, 26, 0, 1);
    let intruder = RelayEndpoint::new(config, Arc::clone(bed.manager.context()));
    assert!(matches!(intruder.start(), Err(Error::Bind(_))));
    assert!(!intruder.is_running());
    assert!(intruder.local_conn().is_none());

    assert!(held.is_running());
    assert_eq!(held.local_addr(), Some(local));
    assert_eq!(bed.iface.updates.lock().len(), 1);
}

#[test]
fn failed_transform_forwards_the_raw_datagram() {
    let bed = TestBed::with_transform("127.27.0.0/24", 41_817, Arc::new(RejectingTransform));
    let peer = random_key();
    let relay = bed.manager.add_peer(bed.peer_config(peer), ["s"]).unwrap();

    bed.wg.send_to(&[0x5a; 100], relay.local_addr().unwrap()).unwrap();
    let (datagram, _) = bed.recv_remote();
    assert_eq!(datagram, vec![0x5a; 100]);
    assert!(relay.is_running());
}

#[test]
fn failed_remote_write_drops_only_that_datagram() {
    let bed = TestBed::new("127.28.0.0/24", 41_818);
    let peer = random_key();
    let turn = Arc::new(FlakyTurn {
        socket: loopback_socket(),
        failures: AtomicUsize::new(1),
    });
    let config = bed
        .peer_config(peer)
        .with_turn(turn.clone(), bed.remote.local_addr().unwrap());
    let relay = bed.manager.add_peer(config, ["s"]).unwrap();
    let local = relay.local_addr().unwrap();

    bed.wg.send_to(&[1u8; 50], local).unwrap();
    bed.wg.send_to(&[2u8; 50], local).unwrap();

    let (datagram, from) = bed.recv_remote();
    assert_eq!(from, turn.socket.local_addr().unwrap());
    assert_eq!(datagram.len(), 50 + MESSAGE_PROXY_SZ);
    assert_eq!(&datagram[..50], &[2u8; 50][..]);
    assert_nothing_more(&bed.remote);
    assert!(relay.is_running());
    assert_eq!(turn.failures.load(Ordering::SeqCst), 0);
}
