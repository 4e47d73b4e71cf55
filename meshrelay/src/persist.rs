// Copyright (c) 2023 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Flushing relay state to disk.

use crate::registry::{Conn, PeerConnRegistry};
use crate::serialization::key_to_base64;
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Non-blocking "state changed" notification. Bursts of notifications
/// collapse into one pending flush.
pub struct DumpSignal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for DumpSignal {
    fn default() -> Self {
        let (tx, rx) = bounded(1);
        DumpSignal { tx, rx }
    }
}

impl DumpSignal {
    pub fn notify(&self) {
        // Full means a flush is already pending
        let _ = self.tx.try_send(());
    }

    pub fn receiver(&self) -> Receiver<()> {
        self.rx.clone()
    }
}

#[derive(Debug, Serialize)]
struct PeerRecord {
    public_key: String,
    peer_endpoint: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    relay_enabled: bool,
    using_turn: bool,
    servers: Vec<String>,
}

impl From<&Conn> for PeerRecord {
    fn from(conn: &Conn) -> Self {
        PeerRecord {
            public_key: key_to_base64(&conn.config.peer_public_key),
            peer_endpoint: conn.config.peer_endpoint,
            remote_addr: conn.config.remote_addr,
            local_addr: conn.local_addr,
            relay_enabled: conn.config.relay_enabled,
            using_turn: conn.config.using_turn,
            servers: conn.servers.iter().cloned().collect(),
        }
    }
}

/// Writes the current registry contents to `path` as JSON.
pub fn dump(registry: &PeerConnRegistry, path: &Path) -> std::io::Result<()> {
    let mut records: Vec<PeerRecord> = registry.peers().iter().map(PeerRecord::from).collect();
    records.sort_by(|a, b| a.public_key.cmp(&b.public_key));

    let json = serde_json::to_vec_pretty(&records)?;
    let tmp = temp_path(path);
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(&json)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// Starts the thread that flushes the registry to `path` on every signal.
/// It exits once the registry, and with it the signal, is dropped.
// Next to `path`, never equal to it
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

pub fn spawn_dumper(registry: &Arc<PeerConnRegistry>, path: PathBuf) -> std::io::Result<JoinHandle<()>> {
    let signal = registry.dump_signal().receiver();
    let registry = Arc::downgrade(registry);
    thread::Builder::new()
        .name("relay-dump".to_owned())
        .spawn(move || {
            while signal.recv().is_ok() {
                let registry = match registry.upgrade() {
                    Some(r) => r,
                    None => return,
                };
                if let Err(e) = dump(&registry, &path) {
                    tracing::error!(message = "Error: Failed to flush peer state", path = %path.display(), error = ?e);
                }
            }
        })
}
