// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    DestinationBufferTooSmall,
    IncorrectPacketLength,
    WrongPacketType,
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PacketError::DestinationBufferTooSmall => "destination buffer too small",
            PacketError::IncorrectPacketLength => "incorrect packet length",
            PacketError::WrongPacketType => "wrong packet type",
        };
        f.write_str(s)
    }
}

impl std::error::Error for PacketError {}
