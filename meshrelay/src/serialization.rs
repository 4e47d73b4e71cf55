// Copyright (c) 2023 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use crate::x25519;

/// Raw 32 byte key as read from configuration or from the UAPI socket.
#[derive(Debug)]
pub(crate) struct KeyBytes(pub [u8; 32]);

impl std::str::FromStr for KeyBytes {
    type Err = &'static str;

    // From Hex or base64 to KeyBytes ~ [u8; 32]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut internal = [0u8; 32];

        match s.len() {
            64 => {
                hex::decode_to_slice(s, &mut internal)
                    .map_err(|_| "Error: Illegal character in key")?;
            }
            43 | 44 => {
                let decoded_key =
                    base64::decode(s).map_err(|_| "Error: Illegal character in key")?;
                if decoded_key.len() != internal.len() {
                    return Err("Error: Illegal key size");
                }
                internal[..].copy_from_slice(&decoded_key);
            }
            _ => return Err("Error: Illegal key size"),
        }

        Ok(KeyBytes(internal))
    }
}

/// Parses a peer public key given either as hex (UAPI) or base64 (wg-quick style).
pub fn parse_public_key(s: &str) -> Result<x25519::PublicKey, &'static str> {
    s.parse::<KeyBytes>().map(|k| x25519::PublicKey::from(k.0))
}

/// The canonical text form of a peer key, used for hashing and for log fields.
pub fn key_to_base64(key: &x25519::PublicKey) -> String {
    base64::encode(key.as_bytes())
}
