// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Framing of relayed datagrams.
//!
//! Every datagram that leaves through the relay carries a short trailer naming
//! the sending and the receiving peer, so a single shared listener can tell
//! which local relay socket an inbound datagram belongs to without looking
//! inside the (encrypted) tunnel payload.

pub mod errors;

use crate::packet::errors::PacketError;
use crate::serialization::key_to_base64;
use crate::x25519;
use blake2::{Blake2s256, Digest};
use std::fmt;

type MessageType = u32;
const MESSAGE_PROXY_TYPE: MessageType = 5;

pub const PEER_HASH_SZ: usize = 16;
/// type (4) + sender hash + receiver hash
pub const MESSAGE_PROXY_SZ: usize = 4 + 2 * PEER_HASH_SZ;

const SENDER_OFF: usize = 4;
const RECEIVER_OFF: usize = SENDER_OFF + PEER_HASH_SZ;

/// Compact identifier of a peer public key, small enough to travel on every datagram.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHash([u8; PEER_HASH_SZ]);

impl PeerHash {
    pub fn from_key(key: &x25519::PublicKey) -> PeerHash {
        let digest = Blake2s256::digest(key_to_base64(key).as_bytes());
        let mut hash = [0u8; PEER_HASH_SZ];
        hash.copy_from_slice(&digest[..PEER_HASH_SZ]);
        PeerHash(hash)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_HASH_SZ] {
        &self.0
    }
}

impl From<[u8; PEER_HASH_SZ]> for PeerHash {
    fn from(bytes: [u8; PEER_HASH_SZ]) -> Self {
        PeerHash(bytes)
    }
}

impl fmt::Display for PeerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerHash({})", self)
    }
}

/// Outcome of running a datagram through a [`PacketTransform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Processed {
    /// Length of the datagram in the buffer after the transform
    pub len: usize,
    pub src: PeerHash,
    pub dst: PeerHash,
}

/// Encoding applied to relayed datagrams. `process_before_sending` runs on the
/// way out of a relay endpoint and `extract_info` reverses it on the shared
/// uplink.
pub trait PacketTransform: Send + Sync {
    /// Re-encodes `buf[..n]` in place. `buf` may be longer than `n`; the
    /// extra room is available for the encoding.
    fn process_before_sending(
        &self,
        buf: &mut [u8],
        n: usize,
        local: &x25519::PublicKey,
        remote: &x25519::PublicKey,
    ) -> Result<Processed, PacketError>;

    /// Decodes `buf[..n]`; the returned length is that of the original datagram.
    fn extract_info(&self, buf: &[u8], n: usize) -> Result<Processed, PacketError>;
}

/// Appends `[type][sender hash][receiver hash]` to every datagram.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrailerTransform;

impl PacketTransform for TrailerTransform {
    fn process_before_sending(
        &self,
        buf: &mut [u8],
        n: usize,
        local: &x25519::PublicKey,
        remote: &x25519::PublicKey,
    ) -> Result<Processed, PacketError> {
        if n > buf.len() {
            return Err(PacketError::IncorrectPacketLength);
        }
        if buf.len() - n < MESSAGE_PROXY_SZ {
            return Err(PacketError::DestinationBufferTooSmall);
        }

        let src = PeerHash::from_key(local);
        let dst = PeerHash::from_key(remote);
        let trailer = &mut buf[n..n + MESSAGE_PROXY_SZ];
        trailer[..SENDER_OFF].copy_from_slice(&MESSAGE_PROXY_TYPE.to_le_bytes());
        trailer[SENDER_OFF..RECEIVER_OFF].copy_from_slice(src.as_bytes());
        trailer[RECEIVER_OFF..].copy_from_slice(dst.as_bytes());

        Ok(Processed {
            len: n + MESSAGE_PROXY_SZ,
            src,
            dst,
        })
    }

    fn extract_info(&self, buf: &[u8], n: usize) -> Result<Processed, PacketError> {
        if n > buf.len() || n < MESSAGE_PROXY_SZ {
            return Err(PacketError::IncorrectPacketLength);
        }
        let len = n - MESSAGE_PROXY_SZ;
        let trailer = &buf[len..n];

        let packet_type = u32::from_le_bytes(
            trailer[..SENDER_OFF]
                .try_into()
                .map_err(|_| PacketError::IncorrectPacketLength)?,
        );
        if packet_type != MESSAGE_PROXY_TYPE {
            return Err(PacketError::WrongPacketType);
        }

        let mut src = [0u8; PEER_HASH_SZ];
        let mut dst = [0u8; PEER_HASH_SZ];
        src.copy_from_slice(&trailer[SENDER_OFF..RECEIVER_OFF]);
        dst.copy_from_slice(&trailer[RECEIVER_OFF..]);

        Ok(Processed {
            len,
            src: src.into(),
            dst: dst.into(),
        })
    }
}
