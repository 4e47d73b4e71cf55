// Copyright (c) 2023 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use crate::iface::{PeerStats, WgIface};
use crate::x25519;
use chrono::{DateTime, Duration, Utc};

/// A handshake older than this means the tunnel is down
pub const HANDSHAKE_RECENCY_SECS: i64 = 180;

/// Whether the tunnel to `peer` is up, according to the interface's own
/// statistics. Any failure to read them counts as "not connected".
pub fn peer_connection_status(iface: &dyn WgIface, peer: &x25519::PublicKey) -> bool {
    peer_connection_status_at(iface, peer, Utc::now())
}

pub fn peer_connection_status_at(
    iface: &dyn WgIface,
    peer: &x25519::PublicKey,
    now: DateTime<Utc>,
) -> bool {
    let peers = match iface.get_peers() {
        Ok(peers) => peers,
        Err(e) => {
            tracing::debug!(iface = iface.name(), error = ?e, "Error: Failed to read interface peers");
            return false;
        }
    };
    peers
        .iter()
        .find(|stats| stats.public_key == *peer)
        .map_or(false, |stats| is_connected(stats, now))
}

pub fn is_connected(stats: &PeerStats, now: DateTime<Utc>) -> bool {
    let recent = match stats.last_handshake {
        Some(t) => t > now - Duration::seconds(HANDSHAKE_RECENCY_SECS),
        None => false,
    };
    recent && stats.rx_bytes.saturating_add(stats.tx_bytes) > 0
}
