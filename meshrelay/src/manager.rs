// Copyright (c) 2023 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Control-plane entry point: turns peer configuration changes into relay
//! endpoint lifecycle transitions.

use crate::config::{RelayConfig, Settings};
use crate::iface::WgIface;
use crate::metrics::{MetricsQueue, MetricsSink};
use crate::packet::PacketTransform;
use crate::persist::spawn_dumper;
use crate::registry::{Conn, PeerConnRegistry};
use crate::relay::allocator::AddressAllocator;
use crate::relay::status::peer_connection_status;
use crate::relay::{Error, RelayContext, RelayEndpoint};
use crate::serialization::key_to_base64;
use crate::uplink::{Demux, SharedUplink};
use crate::x25519;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

pub struct RelayManager {
    registry: Arc<PeerConnRegistry>,
    ctx: Arc<RelayContext>,
    allocator: AddressAllocator,
    sink: Arc<dyn MetricsSink>,
    metrics_worker: Mutex<Option<JoinHandle<()>>>,
}

impl RelayManager {
    /// Binds the shared uplink and starts the inbound, metrics and (when
    /// `settings.dump_path` is set) persistence threads.
    pub fn new(
        settings: Settings,
        device_key: x25519::PublicKey,
        iface: Arc<dyn WgIface>,
        transform: Arc<dyn PacketTransform>,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<RelayManager, Error> {
        let registry = Arc::new(PeerConnRegistry::new());
        let uplink = Arc::new(SharedUplink::bind(settings.listen_port)?);
        let (metrics, metrics_worker) = MetricsQueue::spawn(Arc::clone(&registry), Arc::clone(&sink))?;

        uplink.start(Demux::new(
            Arc::clone(&registry),
            Arc::clone(&transform),
            metrics.clone(),
            &device_key,
        ))?;

        if let Some(path) = settings.dump_path.clone() {
            spawn_dumper(&registry, path)?;
        }

        let allocator = AddressAllocator::new(settings.proxy_port);
        let ctx = Arc::new(RelayContext {
            device_key,
            settings,
            registry: Arc::downgrade(&registry),
            uplink,
            iface,
            transform,
            metrics,
        });

        tracing::info!(
            iface = ctx.iface.name(),
            uplink = ?ctx.uplink.local_addr().ok(),
            "Info: Relay manager started"
        );
        Ok(RelayManager {
            registry,
            ctx,
            allocator,
            sink,
            metrics_worker: Mutex::new(Some(metrics_worker)),
        })
    }

    pub fn registry(&self) -> &Arc<PeerConnRegistry> {
        &self.registry
    }

    pub fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }

    /// Allocates a loopback address for the peer, starts its relay endpoint
    /// and registers it. A peer that is already registered gets the new
    /// configuration and is reset instead.
    pub fn add_peer<I, S>(&self, mut config: RelayConfig, servers: I) -> Result<Arc<RelayEndpoint>, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = config.peer_public_key;
        let lifecycle = self.registry.lifecycle_lock(&key);
        let transition = lifecycle.lock();
        if let Some(mut conn) = self.registry.get_by_key(&key) {
            config.local_ip = conn.config.local_ip;
            conn.config = config;
            conn.servers.extend(servers.into_iter().map(Into::into));
            self.registry.save(conn);
            // The reset takes the lifecycle lock itself
            drop(transition);
            return self.reset_peer(&key);
        }

        config.local_ip = self
            .allocator
            .get_free_ip(&self.ctx.settings.local_cidr, self.ctx.settings.wg_listen_port)?;

        let relay = Arc::new(RelayEndpoint::new(config.clone(), Arc::clone(&self.ctx)));
        relay.start()?;

        let mut conn = Conn::new(config, servers);
        conn.local_addr = relay.local_addr();
        conn.relay = Some(Arc::clone(&relay));
        self.registry.save(conn);
        drop(transition);
        self.registry.notify_dump();

        tracing::info!(peer = %key_to_base64(&key), local = ?relay.local_addr(), "Info: Peer added");
        Ok(relay)
    }

    /// Records a new real endpoint for the peer and rebuilds its relay.
    pub fn update_peer_endpoint(
        &self,
        key: &x25519::PublicKey,
        endpoint: SocketAddr,
    ) -> Result<Arc<RelayEndpoint>, Error> {
        let mut conn = self
            .registry
            .get_by_key(key)
            .ok_or_else(|| Error::PeerNotFound(key_to_base64(key)))?;
        conn.config.peer_endpoint = Some(endpoint);
        if !conn.config.using_turn {
            conn.config.remote_addr = Some(endpoint);
        }
        self.registry.save(conn);
        self.reset_peer(key)
    }

    pub fn reset_peer(&self, key: &x25519::PublicKey) -> Result<Arc<RelayEndpoint>, Error> {
        let conn = self
            .registry
            .get_by_key(key)
            .ok_or_else(|| Error::PeerNotFound(key_to_base64(key)))?;
        let relay = match conn.relay {
            Some(relay) => relay,
            // Never started, or its start failed: reset from the registered config
            None => Arc::new(RelayEndpoint::new(conn.config, Arc::clone(&self.ctx))),
        };
        relay.reset()
    }

    pub fn remove_peer(&self, key: &x25519::PublicKey) -> Result<(), Error> {
        let conn = self
            .registry
            .remove(key)
            .ok_or_else(|| Error::PeerNotFound(key_to_base64(key)))?;
        if let Some(relay) = conn.relay {
            relay.close();
        }
        self.forget_metrics(key);
        self.registry.notify_dump();
        tracing::info!(peer = %key_to_base64(key), "Info: Peer removed");
        Ok(())
    }

    /// Tears down every relay, as when relaying is disabled altogether.
    pub fn delete_all_peers(&self) {
        let peers = self.registry.drain();
        for conn in peers.iter() {
            if let Some(relay) = conn.relay.as_ref() {
                relay.close();
            }
            self.forget_metrics(conn.public_key());
        }
        self.registry.notify_dump();
        tracing::info!(count = peers.len(), "Info: All peers removed");
    }

    // Cleared behind any update still queued for the peer
    fn forget_metrics(&self, key: &x25519::PublicKey) {
        if !self.ctx.metrics.forget(*key) {
            self.sink.remove_peer(key);
        }
    }

    pub fn peer_connection_status(&self, key: &x25519::PublicKey) -> bool {
        peer_connection_status(self.ctx.iface.as_ref(), key)
    }

    /// Stops every relay and background thread. Idempotent.
    pub fn shutdown(&self) {
        self.delete_all_peers();
        self.ctx.uplink.close();
        let worker = self.metrics_worker.lock().take();
        if let Some(worker) = worker {
            self.ctx.metrics.stop();
            let _ = worker.join();
        }
    }
}

impl Drop for RelayManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
