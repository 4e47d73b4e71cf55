// Copyright (c) 2023 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Control surface of the tunnel interface whose peers are being relayed.

pub mod uapi;

use crate::relay::Error;
use crate::x25519;
use chrono::{DateTime, Utc};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowedIP {
    pub addr: IpAddr,
    pub cidr: u8,
}

impl FromStr for AllowedIP {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ip: Vec<&str> = s.split('/').collect();
        if ip.len() != 2 {
            return Err("Error: Invalid IP format".to_owned());
        }

        let (addr, cidr) = (ip[0].parse::<IpAddr>(), ip[1].parse::<u8>());
        match (addr, cidr) {
            (Ok(addr @ IpAddr::V4(_)), Ok(cidr)) if cidr <= 32 => Ok(AllowedIP { addr, cidr }),
            (Ok(addr @ IpAddr::V6(_)), Ok(cidr)) if cidr <= 128 => Ok(AllowedIP { addr, cidr }),
            _ => Err("Error: Invalid IP format".to_owned()),
        }
    }
}

/// The endpoint record pushed to the tunnel interface for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub public_key: x25519::PublicKey,
    pub endpoint: SocketAddr,
    pub persistent_keepalive: Option<u16>,
    pub allowed_ips: Vec<AllowedIP>,
}

/// Per-peer statistics as reported by the tunnel interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStats {
    pub public_key: x25519::PublicKey,
    pub last_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl PeerStats {
    pub fn new(public_key: x25519::PublicKey) -> PeerStats {
        PeerStats {
            public_key,
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
        }
    }
}

pub trait WgIface: Send + Sync {
    /// Logical name of the interface, e.g. `wg0`
    fn name(&self) -> &str;

    /// Points the interface's notion of `peer.public_key` at `peer.endpoint`.
    fn update_peer_endpoint(&self, peer: &PeerEndpoint) -> Result<(), Error>;

    fn get_peers(&self) -> Result<Vec<PeerStats>, Error>;
}
