// Copyright (c) 2023 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Local relay layer for WireGuard peers that can not reach each other directly.
//!
//! Every relayed peer gets a [`relay::RelayEndpoint`]: a UDP socket on its own
//! loopback address that the tunnel interface is told is the peer's endpoint.
//! Whatever the tunnel writes there is tagged with the sender and receiver
//! [`packet::PeerHash`] and sent on through one [`uplink::SharedUplink`] (or a
//! TURN transport); inbound datagrams are routed back by that tag.
//! [`manager::RelayManager`] wires the pieces together.
pub mod config;
pub mod iface;
pub mod manager;
pub mod metrics;
pub mod packet;
pub mod persist;
pub mod registry;
pub mod relay;
pub mod serialization;
pub mod uplink;

// Re-export of the x25519 types
pub mod x25519 {
    pub use x25519_dalek::{PublicKey, StaticSecret};
}
