// Copyright (c) 2023 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The single source of truth for the relay state of every peer.
//!
//! Entries are reachable by public key and by [`PeerHash`]. Both indices live
//! behind one lock and are only ever changed together. The lock is never held
//! while calling into a [`RelayEndpoint`], so tearing down a forwarding loop
//! can not deadlock against a registry update.
//!
//! Lifecycle transitions of one peer (start, reset, replace) are serialized by
//! a separate per-peer lock, see [`PeerConnRegistry::lifecycle_lock`].

use crate::config::RelayConfig;
use crate::packet::PeerHash;
use crate::persist::DumpSignal;
use crate::relay::RelayEndpoint;
use crate::x25519;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

/// Relay state of one peer.
#[derive(Clone)]
pub struct Conn {
    pub config: RelayConfig,
    /// Lifecycle handle of the running endpoint, used to reset or stop it
    pub relay: Option<Arc<RelayEndpoint>>,
    /// Address of the endpoint's local socket, as pushed to the tunnel interface
    pub local_addr: Option<SocketAddr>,
    /// Servers whose traffic counters this peer contributes to
    pub servers: BTreeSet<String>,
}

impl Conn {
    pub fn new<I, S>(config: RelayConfig, servers: I) -> Conn
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Conn {
            config,
            relay: None,
            local_addr: None,
            servers: servers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn public_key(&self) -> &x25519::PublicKey {
        &self.config.peer_public_key
    }

    /// The local socket of the running endpoint, if any.
    pub fn local_conn(&self) -> Option<Arc<UdpSocket>> {
        self.relay.as_ref().and_then(|r| r.local_conn())
    }
}

#[derive(Default)]
struct Peers {
    by_key: HashMap<x25519::PublicKey, Conn>,
    by_hash: HashMap<PeerHash, x25519::PublicKey>,
}

#[derive(Default)]
pub struct PeerConnRegistry {
    peers: Mutex<Peers>,
    lifecycle: Mutex<HashMap<x25519::PublicKey, Arc<Mutex<()>>>>,
    dump: DumpSignal,
}

impl PeerConnRegistry {
    pub fn new() -> PeerConnRegistry {
        Default::default()
    }

    pub fn get_by_key(&self, key: &x25519::PublicKey) -> Option<Conn> {
        self.peers.lock().by_key.get(key).cloned()
    }

    /// Lookup used by inbound demultiplexing, where only the hash is on the wire.
    pub fn get_by_hash(&self, hash: &PeerHash) -> Option<Conn> {
        let peers = self.peers.lock();
        peers
            .by_hash
            .get(hash)
            .and_then(|key| peers.by_key.get(key))
            .cloned()
    }

    /// Inserts or replaces the entry of `conn`'s peer in both indices.
    pub fn save(&self, conn: Conn) {
        let key = *conn.public_key();
        let mut peers = self.peers.lock();
        peers.by_hash.insert(PeerHash::from_key(&key), key);
        peers.by_key.insert(key, conn);
    }

    /// Publishes a freshly started endpoint for a peer that is still registered.
    /// Returns false, changing nothing, if the peer is gone.
    pub fn replace_relay(&self, relay: &Arc<RelayEndpoint>) -> bool {
        let key = *relay.public_key();
        let local_addr = relay.local_addr();
        let mut peers = self.peers.lock();
        match peers.by_key.get_mut(&key) {
            Some(conn) => {
                conn.config = relay.config().clone();
                conn.local_addr = local_addr;
                conn.relay = Some(Arc::clone(relay));
                peers.by_hash.insert(PeerHash::from_key(&key), key);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, key: &x25519::PublicKey) -> Option<Conn> {
        let removed = {
            let mut peers = self.peers.lock();
            peers.by_hash.remove(&PeerHash::from_key(key));
            peers.by_key.remove(key)
        };
        self.prune_lifecycle_lock(key);
        removed
    }

    /// Empties the registry, returning what it held.
    pub fn drain(&self) -> Vec<Conn> {
        let drained: Vec<Conn> = {
            let mut peers = self.peers.lock();
            peers.by_hash.clear();
            peers.by_key.drain().map(|(_, conn)| conn).collect()
        };
        for conn in drained.iter() {
            self.prune_lifecycle_lock(conn.public_key());
        }
        drained
    }

    /// The lock every lifecycle transition of `key`'s relay endpoint holds
    /// from closing the old loop until the replacement is published. At most
    /// one forwarding loop per peer exists while it is held.
    pub fn lifecycle_lock(&self, key: &x25519::PublicKey) -> Arc<Mutex<()>> {
        Arc::clone(self.lifecycle.lock().entry(*key).or_default())
    }

    // Only dropped once nobody holds or waits on it
    fn prune_lifecycle_lock(&self, key: &x25519::PublicKey) {
        let mut locks = self.lifecycle.lock();
        if locks.get(key).map_or(false, |l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    pub fn peers(&self) -> Vec<Conn> {
        self.peers.lock().by_key.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Asks the persistence task to flush. Never blocks.
    pub fn notify_dump(&self) {
        self.dump.notify()
    }

    pub fn dump_signal(&self) -> &DumpSignal {
        &self.dump
    }
}
