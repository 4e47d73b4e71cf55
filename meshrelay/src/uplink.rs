// Copyright (c) 2023 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The one externally reachable UDP listener shared by every relay endpoint.
//!
//! Outbound, every endpoint writes through [`SharedUplink::send_to`]
//! concurrently; a UDP socket already serializes whole datagrams so no extra
//! locking happens here. Inbound, a single thread reads datagrams and hands
//! them to a [`Demux`], which routes each one to the local socket of the peer
//! named in its trailer.

use crate::metrics::MetricsQueue;
use crate::packet::{PacketTransform, PeerHash};
use crate::registry::PeerConnRegistry;
use crate::relay::{is_tick, CancelToken, Done, DoneGuard, Error, MAX_UDP_SIZE, TICK};
use crate::x25519;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::thread;

/// A TURN allocation, or anything else able to carry relayed datagrams.
/// Shared by reference; its lifetime follows the TURN session.
pub trait TurnTransport: Send + Sync {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

impl TurnTransport for UdpSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr)
    }
}

/// Routes inbound relayed datagrams to the relay endpoint they belong to.
pub struct Demux {
    registry: Arc<PeerConnRegistry>,
    transform: Arc<dyn PacketTransform>,
    metrics: MetricsQueue,
    device_hash: PeerHash,
}

impl Demux {
    pub fn new(
        registry: Arc<PeerConnRegistry>,
        transform: Arc<dyn PacketTransform>,
        metrics: MetricsQueue,
        device_key: &x25519::PublicKey,
    ) -> Demux {
        Demux {
            registry,
            transform,
            metrics,
            device_hash: PeerHash::from_key(device_key),
        }
    }

    /// Delivers `buf[..n]` to the matching local socket. Returns false when
    /// the datagram was dropped.
    pub fn dispatch(&self, buf: &[u8], n: usize) -> bool {
        let info = match self.transform.extract_info(buf, n) {
            Ok(info) => info,
            Err(e) => {
                tracing::trace!(message = "Error: Not a relayed datagram", error = %e);
                return false;
            }
        };

        if info.dst != self.device_hash {
            tracing::debug!(message = "Error: Datagram for another device", dst = %info.dst);
            return false;
        }

        let conn = match self.registry.get_by_hash(&info.src) {
            Some(conn) => conn,
            None => {
                tracing::debug!(message = "Error: Datagram from unknown peer", src = %info.src);
                return false;
            }
        };

        let local = match conn.local_conn() {
            Some(local) => local,
            None => {
                tracing::debug!(message = "Error: Peer has no active relay", src = %info.src);
                return false;
            }
        };

        if let Err(e) = local.send(&buf[..info.len]) {
            tracing::debug!(message = "Error: Failed to write to local relay socket", src = %info.src, error = ?e);
            return false;
        }
        if conn.config.relay_enabled {
            self.metrics.record_received(*conn.public_key(), info.len);
        }
        true
    }
}

pub struct SharedUplink {
    socket: Arc<UdpSocket>,
    cancel: CancelToken,
    done: Mutex<Option<Arc<Done>>>,
}

impl SharedUplink {
    /// Binds the listener on all IPv4 addresses. Port 0 picks a free port.
    pub fn bind(port: u16) -> Result<SharedUplink, Error> {
        let udp_sock4 = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(Error::Socket)?;
        udp_sock4.set_reuse_address(true)?;
        udp_sock4
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
            .map_err(|e| Error::Bind(format!("uplink port {}: {}", port, e)))?;

        let socket: UdpSocket = udp_sock4.into();
        socket.set_read_timeout(Some(TICK))?;

        Ok(SharedUplink {
            socket: Arc::new(socket),
            cancel: CancelToken::default(),
            done: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, addr)
    }

    /// Starts the inbound thread. Calling it again while running is a no-op.
    pub fn start(&self, demux: Demux) -> Result<(), Error> {
        let mut slot = self.done.lock();
        if slot.is_some() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Lifecycle("uplink already closed".to_owned()));
        }

        let done = Arc::new(Done::default());
        let guard = DoneGuard::new(Arc::clone(&done));
        let socket = Arc::clone(&self.socket);
        let cancel = self.cancel.clone();
        thread::Builder::new()
            .name("relay-uplink".to_owned())
            .spawn(move || {
                let _guard = guard;
                from_remote(&socket, &cancel, &demux)
            })?;
        *slot = Some(done);
        Ok(())
    }

    /// Stops the inbound thread and waits for it. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        let done = self.done.lock().take();
        if let Some(done) = done {
            done.wait();
        }
    }
}

impl Drop for SharedUplink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn from_remote(socket: &UdpSocket, cancel: &CancelToken, demux: &Demux) {
    let mut buf = vec![0u8; MAX_UDP_SIZE];
    while !cancel.is_cancelled() {
        let n = match socket.recv_from(&mut buf) {
            Ok((n, _)) => n,
            Err(e) if is_tick(&e) => continue,
            Err(e) => {
                // ICMP errors from earlier sends surface here; the listener stays up
                tracing::debug!(message = "Error: Uplink read failed", error = ?e);
                continue;
            }
        };
        demux.dispatch(&buf, n);
    }
}
