// Copyright (c) 2023 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

pub mod allocator;
pub mod status;

#[cfg(test)]
mod integration_tests;

use crate::config::{RelayConfig, Settings};
use crate::iface::{PeerEndpoint, WgIface};
use crate::metrics::MetricsQueue;
use crate::packet::{PacketTransform, PeerHash};
use crate::registry::PeerConnRegistry;
use crate::uplink::SharedUplink;
use crate::x25519;
use parking_lot::{Condvar, Mutex};
use socket2::{Domain, Protocol, SockRef, Type};
use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Largest datagram read from a local relay socket
pub const MAX_DATAGRAM_SIZE: usize = 65000;
pub const MAX_UDP_SIZE: usize = (1 << 16) - 1;
/// Room left after a datagram for the packet transform to grow it
const SEND_HEADROOM: usize = 128;
/// Read timeout on relay sockets; bounds how long a loop takes to notice cancellation
pub const TICK: Duration = Duration::from_millis(250);
/// Consecutive refused reads tolerated before a loop is declared dead
const MAX_REFUSED_READS: usize = 5;
const BIND_ATTEMPTS: usize = 5;
const BIND_RETRY: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    IoError(#[from] io::Error),
    #[error("{0}")]
    Socket(io::Error),
    #[error("{0}")]
    Bind(String),
    #[error("{0}")]
    Connect(String),
    #[error("Error: Destination port should be set")]
    ZeroPort,
    #[error("Error: Invalid CIDR {0}")]
    InvalidCidr(String),
    #[error("Error: No free address left in {0}")]
    AddressExhausted(String),
    #[error("Error: Peer not found {0}")]
    PeerNotFound(String),
    #[error("Error: Peer has no endpoint {0}")]
    NoEndpoint(String),
    #[error("tunnel interface: {0}")]
    Iface(String),
    #[error("API socket error: {0}")]
    ApiSocket(io::Error),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Lifecycle(String),
}

/// Cancellation handle of one lifecycle scope. Cancelling is idempotent.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Returns true if this call is the one that cancelled the scope.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Completion signal of a worker thread.
#[derive(Default)]
pub(crate) struct Done {
    finished: Mutex<bool>,
    cv: Condvar,
}

impl Done {
    pub(crate) fn wait(&self) {
        let mut finished = self.finished.lock();
        while !*finished {
            self.cv.wait(&mut finished);
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        *self.finished.lock()
    }
}

/// Marks a [`Done`] finished when the worker exits, unwinding included.
pub(crate) struct DoneGuard(Arc<Done>);

impl DoneGuard {
    pub(crate) fn new(done: Arc<Done>) -> DoneGuard {
        DoneGuard(done)
    }
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        *self.0.finished.lock() = true;
        self.0.cv.notify_all();
    }
}

/// Read timeouts are the loop's ticker, not errors.
pub(crate) fn is_tick(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Collaborators shared by every relay endpoint.
pub struct RelayContext {
    pub device_key: x25519::PublicKey,
    pub settings: Settings,
    pub registry: Weak<PeerConnRegistry>,
    pub uplink: Arc<SharedUplink>,
    pub iface: Arc<dyn WgIface>,
    pub transform: Arc<dyn PacketTransform>,
    pub metrics: MetricsQueue,
}

struct Worker {
    conn: Arc<UdpSocket>,
    done: Arc<Done>,
    thread: ThreadId,
}

/// Stands in for one remote peer on loopback. The tunnel interface is told
/// the peer lives at this endpoint's local socket; everything written there
/// is forwarded to the peer through the shared uplink or a TURN transport.
pub struct RelayEndpoint {
    config: RelayConfig,
    ctx: Arc<RelayContext>,
    cancel: CancelToken,
    worker: Mutex<Option<Worker>>,
}

impl std::fmt::Debug for RelayEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEndpoint")
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl RelayEndpoint {
    /// Creates an endpoint with a fresh lifecycle scope. Nothing is bound yet.
    pub fn new(config: RelayConfig, ctx: Arc<RelayContext>) -> RelayEndpoint {
        RelayEndpoint {
            config,
            ctx,
            cancel: CancelToken::default(),
            worker: Mutex::new(None),
        }
    }

    pub fn public_key(&self) -> &x25519::PublicKey {
        &self.config.peer_public_key
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn local_conn(&self) -> Option<Arc<UdpSocket>> {
        self.worker.lock().as_ref().map(|w| Arc::clone(&w.conn))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.worker
            .lock()
            .as_ref()
            .and_then(|w| w.conn.local_addr().ok())
    }

    /// True while the forwarding loop runs.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map_or(false, |w| !w.done.is_finished())
    }

    /// Binds the local socket, points the tunnel interface at it and starts
    /// forwarding. No loop is started if any step fails.
    pub fn start(&self) -> Result<(), Error> {
        let mut worker = self.worker.lock();
        if worker.is_some() || self.cancel.is_cancelled() {
            return Err(Error::Lifecycle(format!(
                "relay for {} was already started",
                self.peer_label()
            )));
        }
        let remote = self
            .config
            .remote_addr
            .ok_or_else(|| Error::NoEndpoint(self.peer_label()))?;
        if self.config.using_turn && self.config.turn_transport.is_none() {
            return Err(Error::Config(format!(
                "{} uses TURN but has no TURN transport",
                self.peer_label()
            )));
        }

        let conn = Arc::new(self.bind_local_conn()?);
        self.update_endpoint(&conn)?;

        let done = Arc::new(Done::default());
        let guard = DoneGuard::new(Arc::clone(&done));
        let hash = PeerHash::from_key(&self.config.peer_public_key);
        let handle = {
            let conn = Arc::clone(&conn);
            let cancel = self.cancel.clone();
            let config = self.config.clone();
            let ctx = Arc::clone(&self.ctx);
            thread::Builder::new()
                .name(format!("relay-{}", &hash.to_string()[..8]))
                .spawn(move || {
                    let _guard = guard;
                    to_remote(&ctx, &config, conn, &cancel, remote)
                })?
        };

        *worker = Some(Worker {
            conn,
            done,
            thread: handle.thread().id(),
        });
        tracing::info!(peer = %self.peer_label(), remote = %remote, "Info: Relay started");
        Ok(())
    }

    /// Blocks until this endpoint's forwarding loop has terminated.
    pub fn proxy_peer(&self) {
        let done = self.worker.lock().as_ref().map(|w| Arc::clone(&w.done));
        if let Some(done) = done {
            done.wait();
        }
    }

    /// Stops the loop, releases the local socket and starts a replacement
    /// endpoint from the peer's latest registered configuration. The
    /// replacement is published to the registry and returned.
    ///
    /// Resets of one peer are serialized: a reset racing another one also
    /// closes the replacement the other published, so only the last
    /// replacement keeps forwarding.
    pub fn reset(&self) -> Result<Arc<RelayEndpoint>, Error> {
        tracing::info!(peer = %self.peer_label(), "Info: Resetting relay");
        let registry = match self.ctx.registry.upgrade() {
            Some(registry) => registry,
            None => {
                self.close();
                return Err(Error::PeerNotFound(self.peer_label()));
            }
        };
        let lifecycle = registry.lifecycle_lock(&self.config.peer_public_key);
        let _transition = lifecycle.lock();

        self.close();
        let current = registry
            .get_by_key(&self.config.peer_public_key)
            .and_then(|conn| conn.relay);
        if let Some(current) = current {
            if !std::ptr::eq(Arc::as_ptr(&current), self) {
                current.close();
            }
        }

        let config = self.pull_latest_config(&registry)?;
        if config.peer_endpoint.is_none() {
            return Err(Error::NoEndpoint(self.peer_label()));
        }

        let relay = Arc::new(RelayEndpoint::new(config, Arc::clone(&self.ctx)));
        if let Err(e) = relay.start() {
            tracing::error!(peer = %self.peer_label(), error = ?e, "Error: Failed to reset relay");
            return Err(e);
        }
        if !registry.replace_relay(&relay) {
            // Removed while the replacement was starting
            relay.close();
            return Err(Error::PeerNotFound(self.peer_label()));
        }
        registry.notify_dump();
        Ok(relay)
    }

    /// Cancels the lifecycle scope, unblocks and waits for the loop, and
    /// releases the local socket. Idempotent.
    pub fn close(&self) {
        let first = self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(Worker { conn, done, thread }) = worker {
            // Wakes a loop blocked in recv
            let _ = SockRef::from(conn.as_ref()).shutdown(Shutdown::Both);
            drop(conn);
            if thread::current().id() != thread {
                done.wait();
            }
        }
        if first {
            tracing::debug!(peer = %self.peer_label(), "Info: Relay closed");
        }
    }

    fn peer_label(&self) -> String {
        crate::serialization::key_to_base64(&self.config.peer_public_key)
    }

    fn pull_latest_config(&self, registry: &PeerConnRegistry) -> Result<RelayConfig, Error> {
        let peer = registry
            .get_by_key(&self.config.peer_public_key)
            .ok_or_else(|| Error::PeerNotFound(self.peer_label()))?;
        // The registry holds the latest endpoint and TURN transport
        Ok(peer.config)
    }

    /// Local socket on `local_ip:proxy_port`, connected to the tunnel's listener.
    /// The address is exclusive: a bind fails while another endpoint holds it.
    fn bind_local_conn(&self) -> Result<UdpSocket, Error> {
        let local = SocketAddrV4::new(self.config.local_ip, self.ctx.settings.proxy_port);
        let wg = SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.ctx.settings.wg_listen_port);

        let sock = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(Error::Socket)?;
        let mut attempt = 1;
        loop {
            match sock.bind(&local.into()) {
                Ok(()) => break,
                // A closed endpoint's socket may still be held by an in-flight inbound write
                Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                    attempt += 1;
                    thread::sleep(BIND_RETRY);
                }
                Err(e) => return Err(Error::Bind(format!("{}: {}", local, e))),
            }
        }
        sock.connect(&wg.into())
            .map_err(|e| Error::Connect(format!("{} -> {}: {}", local, wg, e)))?;

        let conn: UdpSocket = sock.into();
        conn.set_read_timeout(Some(TICK))?;
        Ok(conn)
    }

    /// Points the tunnel interface's endpoint for this peer at `conn`.
    fn update_endpoint(&self, conn: &UdpSocket) -> Result<(), Error> {
        let peer = PeerEndpoint {
            public_key: self.config.peer_public_key,
            endpoint: conn.local_addr()?,
            persistent_keepalive: self.config.persistent_keepalive,
            allowed_ips: self.config.allowed_ips.clone(),
        };
        tracing::debug!(peer = %self.peer_label(), endpoint = %peer.endpoint, "Info: Updating peer endpoint");
        self.ctx.iface.update_peer_endpoint(&peer)
    }
}

impl Drop for RelayEndpoint {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Forwarding loop: local socket to the remote peer.
fn to_remote(
    ctx: &RelayContext,
    config: &RelayConfig,
    conn: Arc<UdpSocket>,
    cancel: &CancelToken,
    remote: SocketAddr,
) {
    let peer = config.peer_public_key;
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + SEND_HEADROOM];
    let mut refused = 0;

    loop {
        if cancel.is_cancelled() {
            return;
        }
        let n = match conn.recv(&mut buf[..MAX_DATAGRAM_SIZE]) {
            Ok(n) => {
                refused = 0;
                n
            }
            Err(e) if is_tick(&e) => continue,
            // The tunnel's listener was briefly absent; an ICMP error came back
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused && refused < MAX_REFUSED_READS => {
                refused += 1;
                tracing::debug!(peer = %PeerHash::from_key(&peer), error = ?e, "Error: Local read refused");
                continue;
            }
            Err(e) => {
                tracing::error!(peer = %PeerHash::from_key(&peer), error = ?e, "Error: Failed to read from local relay socket");
                return;
            }
        };
        // A shutdown socket reads as empty
        if cancel.is_cancelled() {
            return;
        }

        if config.relay_enabled {
            ctx.metrics.record_sent(peer, n);
        }

        let mut len = n;
        if config.relay_enabled || config.using_turn {
            match ctx
                .transform
                .process_before_sending(&mut buf, n, &ctx.device_key, &peer)
            {
                Ok(processed) => {
                    len = processed.len;
                    tracing::trace!(
                        local = ?conn.local_addr().ok(),
                        remote = %remote,
                        src = %processed.src,
                        dst = %processed.dst,
                        "Relaying to remote"
                    );
                }
                Err(e) => {
                    tracing::debug!(peer = %PeerHash::from_key(&peer), error = %e, "Error: Failed to process packet before sending");
                }
            }
        }

        let sent = match (&config.turn_transport, config.using_turn) {
            (Some(turn), true) => turn.send_to(&buf[..len], remote),
            _ => ctx.uplink.send_to(&buf[..len], remote),
        };
        if let Err(e) = sent {
            tracing::debug!(peer = %PeerHash::from_key(&peer), remote = %remote, error = ?e, "Error: Failed to send to remote");
        }
    }
}
