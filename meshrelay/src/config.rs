// Copyright (c) 2023 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use crate::iface::AllowedIP;
use crate::relay::Error;
use crate::uplink::TurnTransport;
use crate::x25519;
use serde::Deserialize;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Port the shared uplink listens on
pub const DEFAULT_LISTEN_PORT: u16 = 51722;
/// Source port of every per-peer local relay socket
pub const DEFAULT_PROXY_PORT: u16 = 51723;
pub const DEFAULT_WG_LISTEN_PORT: u16 = 51821;
pub const DEFAULT_LOCAL_CIDR: &str = "127.0.0.0/8";
pub const DEFAULT_INTERFACE_NAME: &str = "netmaker";

/// Process wide relay settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Name of the tunnel interface whose peers are being relayed
    pub interface_name: String,
    pub listen_port: u16,
    pub proxy_port: u16,
    /// Port the tunnel software listens on, on loopback
    pub wg_listen_port: u16,
    /// Block the per-peer loopback addresses are taken from
    pub local_cidr: String,
    /// Where peer state is flushed to; no flushing when unset
    pub dump_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            interface_name: DEFAULT_INTERFACE_NAME.to_owned(),
            listen_port: DEFAULT_LISTEN_PORT,
            proxy_port: DEFAULT_PROXY_PORT,
            wg_listen_port: DEFAULT_WG_LISTEN_PORT,
            local_cidr: DEFAULT_LOCAL_CIDR.to_owned(),
            dump_path: None,
        }
    }
}

impl Settings {
    pub fn from_json(s: &str) -> Result<Settings, Error> {
        let settings: Settings =
            serde_json::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Settings, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Settings::from_json(&contents)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.proxy_port == 0 || self.wg_listen_port == 0 {
            return Err(Error::ZeroPort);
        }
        if self.interface_name.is_empty() {
            return Err(Error::Config("interface_name must be set".to_owned()));
        }
        Ok(())
    }
}

/// Everything a relay endpoint needs to know about its peer.
#[derive(Clone)]
pub struct RelayConfig {
    pub peer_public_key: x25519::PublicKey,
    /// The peer's real address, before relaying
    pub peer_endpoint: Option<SocketAddr>,
    /// Where relayed datagrams are written: the peer's address or a TURN relay address
    pub remote_addr: Option<SocketAddr>,
    /// Loopback address the local relay socket binds to
    pub local_ip: Ipv4Addr,
    pub relay_enabled: bool,
    pub using_turn: bool,
    pub turn_transport: Option<Arc<dyn TurnTransport>>,
    pub persistent_keepalive: Option<u16>,
    pub allowed_ips: Vec<AllowedIP>,
}

impl RelayConfig {
    pub fn new(peer_public_key: x25519::PublicKey, peer_endpoint: SocketAddr) -> RelayConfig {
        RelayConfig {
            peer_public_key,
            peer_endpoint: Some(peer_endpoint),
            remote_addr: Some(peer_endpoint),
            local_ip: Ipv4Addr::LOCALHOST,
            relay_enabled: true,
            using_turn: false,
            turn_transport: None,
            persistent_keepalive: None,
            allowed_ips: vec![],
        }
    }

    /// Route this peer through a TURN allocation reachable at `relay_addr`.
    pub fn with_turn(mut self, transport: Arc<dyn TurnTransport>, relay_addr: SocketAddr) -> Self {
        self.using_turn = true;
        self.turn_transport = Some(transport);
        self.remote_addr = Some(relay_addr);
        self
    }
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("peer_public_key", &self.peer_public_key)
            .field("peer_endpoint", &self.peer_endpoint)
            .field("remote_addr", &self.remote_addr)
            .field("local_ip", &self.local_ip)
            .field("relay_enabled", &self.relay_enabled)
            .field("using_turn", &self.using_turn)
            .field("persistent_keepalive", &self.persistent_keepalive)
            .field("allowed_ips", &self.allowed_ips)
            .finish()
    }
}
