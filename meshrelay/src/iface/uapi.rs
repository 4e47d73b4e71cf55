// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Client side of the WireGuard cross-platform userspace API.
//!
//! Each request opens a fresh stream connection to
//! `/var/run/wireguard/{name}.sock`, sends either `get=1` or `set=1` followed
//! by `key=value` lines and an empty line, and reads `key=value` lines back
//! until the closing `errno=` line.

use super::{PeerEndpoint, PeerStats, WgIface};
use crate::relay::Error;
use crate::serialization::KeyBytes;
use crate::x25519;
use chrono::DateTime;
use hex::encode as encode_hex;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

const SOCK_DIR: &str = "/var/run/wireguard/";

pub struct UapiIface {
    name: String,
    path: PathBuf,
}

impl UapiIface {
    pub fn new(name: &str) -> UapiIface {
        UapiIface::with_socket_path(name, format!("{}{}.sock", SOCK_DIR, name))
    }

    pub fn with_socket_path<P: AsRef<Path>>(name: &str, path: P) -> UapiIface {
        UapiIface {
            name: name.to_owned(),
            path: path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<UnixStream, Error> {
        UnixStream::connect(&self.path).map_err(Error::ApiSocket)
    }

    /// Sends `request` and returns every response line before the `errno=` line.
    fn roundtrip(&self, request: &str) -> Result<Vec<String>, Error> {
        let api_conn = self.connect()?;
        {
            let mut writerbufferdevice = BufWriter::new(&api_conn);
            writerbufferdevice
                .write_all(request.as_bytes())
                .map_err(Error::ApiSocket)?;
            writerbufferdevice.flush().map_err(Error::ApiSocket)?;
        }

        let mut readerbufferdevice = BufReader::new(&api_conn);
        let mut lines = vec![];
        let mut line = String::new();
        loop {
            line.clear();
            if readerbufferdevice.read_line(&mut line).map_err(Error::ApiSocket)? == 0 {
                return Err(Error::Iface(format!(
                    "{}: connection closed before errno",
                    self.name
                )));
            }
            let line = line.trim_end();
            if let Some(errno) = line.strip_prefix("errno=") {
                return match errno.parse::<i32>() {
                    Ok(0) => Ok(lines),
                    Ok(errno) => Err(Error::Iface(format!(
                        "{}: {}",
                        self.name,
                        std::io::Error::from_raw_os_error(errno)
                    ))),
                    Err(_) => Err(Error::Iface(format!("{}: bad errno {}", self.name, errno))),
                };
            }
            if !line.is_empty() {
                lines.push(line.to_owned());
            }
        }
    }
}

impl WgIface for UapiIface {
    fn name(&self) -> &str {
        &self.name
    }

    fn update_peer_endpoint(&self, peer: &PeerEndpoint) -> Result<(), Error> {
        let mut cmd = String::from("set=1\n");
        cmd.push_str(&format!("public_key={}\n", encode_hex(peer.public_key.as_bytes())));
        // Never create a peer here, only repoint an existing one
        cmd.push_str("update_only=true\n");
        cmd.push_str(&format!("endpoint={}\n", peer.endpoint));
        if let Some(keepalive) = peer.persistent_keepalive {
            cmd.push_str(&format!("persistent_keepalive_interval={}\n", keepalive));
        }
        cmd.push('\n');

        self.roundtrip(&cmd).map(|_| ())
    }

    fn get_peers(&self) -> Result<Vec<PeerStats>, Error> {
        let lines = self.roundtrip("get=1\n\n")?;
        parse_peers(&lines)
    }
}

fn parse_peers(lines: &[String]) -> Result<Vec<PeerStats>, Error> {
    let mut peers: Vec<PeerStats> = vec![];
    let mut handshake_sec = 0i64;
    let mut handshake_nsec = 0u32;

    let finish = |peer: &mut PeerStats, sec: i64, nsec: u32| {
        if sec != 0 || nsec != 0 {
            peer.last_handshake = DateTime::from_timestamp(sec, nsec);
        }
    };

    for line in lines {
        let (option, value) = match line.split_once('=') {
            Some(kv) => kv,
            None => return Err(Error::Iface(format!("malformed line: {}", line))),
        };
        let bad = || Error::Iface(format!("bad value for {}: {}", option, value));
        match option {
            "public_key" => {
                if let Some(last) = peers.last_mut() {
                    finish(last, handshake_sec, handshake_nsec);
                }
                handshake_sec = 0;
                handshake_nsec = 0;
                let key = value.parse::<KeyBytes>().map_err(|_| bad())?;
                peers.push(PeerStats::new(x25519::PublicKey::from(key.0)));
            }
            "last_handshake_time_sec" => {
                handshake_sec = value.parse().map_err(|_| bad())?;
            }
            "last_handshake_time_nsec" => {
                handshake_nsec = value.parse().map_err(|_| bad())?;
            }
            "rx_bytes" => {
                if let Some(peer) = peers.last_mut() {
                    peer.rx_bytes = value.parse().map_err(|_| bad())?;
                }
            }
            "tx_bytes" => {
                if let Some(peer) = peers.last_mut() {
                    peer.tx_bytes = value.parse().map_err(|_| bad())?;
                }
            }
            // Device level settings and peer fields the relay does not use
            _ => {}
        }
    }
    if let Some(last) = peers.last_mut() {
        finish(last, handshake_sec, handshake_nsec);
    }

    Ok(peers)
}
