// Copyright (c) 2023 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Per-peer, per-server traffic counters.
//!
//! Forwarding loops never touch the counters directly. They queue a
//! [`MetricEvent`] with [`MetricsQueue::record_sent`] or
//! [`MetricsQueue::record_received`] and a single worker thread applies the
//! read-modify-write against the [`MetricsSink`] for every server the peer is
//! registered under.

use crate::registry::PeerConnRegistry;
use crate::x25519;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Number of pending updates before new ones are dropped
pub const METRICS_QUEUE_DEPTH: usize = 4096;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Metric {
    pub traffic_sent: u64,
    pub traffic_received: u64,
}

pub trait MetricsSink: Send + Sync {
    fn get_metric(&self, server: &str, peer: &x25519::PublicKey) -> Metric;
    fn update_metric(&self, server: &str, peer: &x25519::PublicKey, metric: Metric);
    /// Drops every counter of `peer`, on all servers.
    fn remove_peer(&self, peer: &x25519::PublicKey);
}

/// Counters kept in process memory.
#[derive(Default)]
pub struct MemoryMetrics {
    metrics: Mutex<HashMap<(String, x25519::PublicKey), Metric>>,
}

impl MemoryMetrics {
    pub fn new() -> MemoryMetrics {
        Default::default()
    }
}

impl MetricsSink for MemoryMetrics {
    fn get_metric(&self, server: &str, peer: &x25519::PublicKey) -> Metric {
        self.metrics
            .lock()
            .get(&(server.to_owned(), *peer))
            .copied()
            .unwrap_or_default()
    }

    fn update_metric(&self, server: &str, peer: &x25519::PublicKey, metric: Metric) {
        self.metrics.lock().insert((server.to_owned(), *peer), metric);
    }

    fn remove_peer(&self, peer: &x25519::PublicKey) {
        self.metrics.lock().retain(|(_, p), _| p != peer);
    }
}

#[derive(Debug, Clone)]
pub enum MetricEvent {
    Sent(x25519::PublicKey, usize),
    Received(x25519::PublicKey, usize),
    /// Clears the peer's counters, acknowledged once done
    Forget(x25519::PublicKey, Sender<()>),
    Stop,
}

/// Sending half of the metrics queue. Cheap to clone, never blocks.
#[derive(Clone)]
pub struct MetricsQueue {
    tx: Sender<MetricEvent>,
}

impl MetricsQueue {
    /// Starts the worker that drains the queue into `sink`.
    pub fn spawn(
        registry: Arc<PeerConnRegistry>,
        sink: Arc<dyn MetricsSink>,
    ) -> std::io::Result<(MetricsQueue, JoinHandle<()>)> {
        let (tx, rx) = bounded(METRICS_QUEUE_DEPTH);
        let worker = thread::Builder::new()
            .name("relay-metrics".to_owned())
            .spawn(move || metrics_worker(rx, &registry, sink.as_ref()))?;
        Ok((MetricsQueue { tx }, worker))
    }

    pub fn record_sent(&self, peer: x25519::PublicKey, n: usize) {
        self.push(MetricEvent::Sent(peer, n))
    }

    pub fn record_received(&self, peer: x25519::PublicKey, n: usize) {
        self.push(MetricEvent::Received(peer, n))
    }

    /// Asks the worker to exit once the updates queued so far are applied.
    /// Clears `peer`'s counters after every update already queued for it.
    /// Blocks until the worker has done so; returns false if the worker is gone.
    pub fn forget(&self, peer: x25519::PublicKey) -> bool {
        let (ack_tx, ack_rx) = bounded(1);
        if self.tx.send(MetricEvent::Forget(peer, ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv().is_ok()
    }

    pub fn stop(&self) {
        let _ = self.tx.send(MetricEvent::Stop);
    }

    fn push(&self, event: MetricEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::trace!("Error: Metrics queue full, update dropped"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

fn metrics_worker(rx: Receiver<MetricEvent>, registry: &PeerConnRegistry, sink: &dyn MetricsSink) {
    for event in rx.iter() {
        let (peer, sent, received) = match event {
            MetricEvent::Sent(peer, n) => (peer, n as u64, 0),
            MetricEvent::Received(peer, n) => (peer, 0, n as u64),
            MetricEvent::Forget(peer, ack) => {
                sink.remove_peer(&peer);
                let _ = ack.send(());
                continue;
            }
            MetricEvent::Stop => return,
        };
        // Peers removed since the datagram was read simply have no servers left
        let servers = match registry.get_by_key(&peer) {
            Some(conn) => conn.servers,
            None => continue,
        };
        for server in servers.iter() {
            let mut metric = sink.get_metric(server, &peer);
            metric.traffic_sent = metric.traffic_sent.saturating_add(sent);
            metric.traffic_received = metric.traffic_received.saturating_add(received);
            sink.update_metric(server, &peer, metric);
        }
    }
}
