// Copyright (c) 2023 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Picks the loopback address a new peer's relay socket will live on.

use super::Error;
use ip_network::Ipv4Network;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::process::Command;

pub struct AddressAllocator {
    /// Port every relay socket binds; an address is free when this port is free on it
    src_port: u16,
    /// Loopback addresses other than 127.0.0.1 must be added as aliases first (macOS)
    requires_alias: bool,
}

impl AddressAllocator {
    pub fn new(src_port: u16) -> AddressAllocator {
        AddressAllocator {
            src_port,
            requires_alias: cfg!(target_os = "macos"),
        }
    }

    pub fn with_alias_registration(mut self, requires_alias: bool) -> AddressAllocator {
        self.requires_alias = requires_alias;
        self
    }

    /// Returns the first address of `cidr` from which a UDP socket on
    /// `src_port` can reach `127.0.0.1:dst_port`.
    pub fn get_free_ip(&self, cidr: &str, dst_port: u16) -> Result<Ipv4Addr, Error> {
        if dst_port == 0 {
            return Err(Error::ZeroPort);
        }
        let network = parse_cidr(cidr)?;
        let mut candidate = first_address(&network);

        loop {
            if self.requires_alias {
                add_loopback_alias(candidate);
            }

            match probe(candidate, self.src_port, dst_port) {
                Ok(()) => return Ok(candidate),
                Err(e) if is_address_unavailable(&e) => {
                    tracing::trace!(address = %candidate, error = ?e, "Address taken");
                    candidate = next_address(&network, candidate)?;
                }
                Err(e) => return Err(Error::Socket(e)),
            }
        }
    }
}

fn parse_cidr(cidr: &str) -> Result<Ipv4Network, Error> {
    let invalid = || Error::InvalidCidr(cidr.to_owned());
    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let addr = addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
    let prefix = prefix.parse::<u8>().map_err(|_| invalid())?;
    Ipv4Network::new_truncate(addr, prefix).map_err(|_| invalid())
}

// /31 and /32 have no network or broadcast address to skip
fn has_host_range(network: &Ipv4Network) -> bool {
    network.netmask() <= 30
}

fn first_address(network: &Ipv4Network) -> Ipv4Addr {
    let base = u32::from(network.network_address());
    if has_host_range(network) {
        Ipv4Addr::from(base + 1)
    } else {
        Ipv4Addr::from(base)
    }
}

fn next_address(network: &Ipv4Network, current: Ipv4Addr) -> Result<Ipv4Addr, Error> {
    let mut last = u32::from(network.broadcast_address());
    if has_host_range(network) {
        last -= 1;
    }
    let current = u32::from(current);
    if current >= last {
        return Err(Error::AddressExhausted(network.to_string()));
    }
    Ok(Ipv4Addr::from(current + 1))
}

fn probe(addr: Ipv4Addr, src_port: u16, dst_port: u16) -> io::Result<()> {
    let conn = UdpSocket::bind(SocketAddrV4::new(addr, src_port))?;
    conn.connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, dst_port))
}

fn is_address_unavailable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable
    )
}

fn add_loopback_alias(addr: Ipv4Addr) {
    let status = Command::new("ifconfig")
        .args(["lo0", "alias", &addr.to_string(), "255.255.255.255"])
        .status();
    match status {
        Ok(s) if s.success() => {}
        Ok(s) => tracing::debug!(address = %addr, status = %s, "Error: Failed to add loopback alias"),
        Err(e) => tracing::debug!(address = %addr, error = ?e, "Error: Failed to add loopback alias"),
    }
}
