// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ADB wire records.
//!
//! Every packet starts with a 24-byte little-endian header followed by
//! exactly `data_length` payload bytes:
//!
//! ```text
//! offset  size  field
//!      0     4  command
//!      4     4  arg0
//!      8     4  arg1
//!     12     4  data_length
//!     16     4  data_check   (byte sum of the payload)
//!     20     4  magic        (command ^ 0xFFFF_FFFF)
//! ```

/// Header size on the wire.
pub const MESSAGE_SIZE: usize = 24;

pub const A_SYNC: u32 = 0x434e_5953;
pub const A_CNXN: u32 = 0x4e58_4e43;
pub const A_OPEN: u32 = 0x4e45_504f;
pub const A_OKAY: u32 = 0x5941_4b4f;
pub const A_CLSE: u32 = 0x4553_4c43;
pub const A_WRTE: u32 = 0x4554_5257;
pub const A_AUTH: u32 = 0x4854_5541;

/// 24-byte packet header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Amessage {
    pub command: u32,
    pub arg0: u32,
    pub arg1: u32,
    pub data_length: u32,
    pub data_check: u32,
    pub magic: u32,
}

impl Amessage {
    /// Header for `command` with the magic self-check filled in.
    pub fn new(command: u32, arg0: u32, arg1: u32) -> Amessage {
        Amessage {
            command,
            arg0,
            arg1,
            data_length: 0,
            data_check: 0,
            magic: command ^ 0xffff_ffff,
        }
    }

    pub fn magic_ok(&self) -> bool {
        self.magic == self.command ^ 0xffff_ffff
    }

    pub fn decode(buf: &[u8; MESSAGE_SIZE]) -> Amessage {
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Amessage {
            command: word(0),
            arg0: word(4),
            arg1: word(8),
            data_length: word(12),
            data_check: word(16),
            magic: word(20),
        }
    }

    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut out = [0u8; MESSAGE_SIZE];
        out[0..4].copy_from_slice(&self.command.to_le_bytes());
        out[4..8].copy_from_slice(&self.arg0.to_le_bytes());
        out[8..12].copy_from_slice(&self.arg1.to_le_bytes());
        out[12..16].copy_from_slice(&self.data_length.to_le_bytes());
        out[16..20].copy_from_slice(&self.data_check.to_le_bytes());
        out[20..24].copy_from_slice(&self.magic.to_le_bytes());
        out
    }
}

/// Header plus its fully reassembled payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Apacket {
    pub mesg: Amessage,
    pub data: Vec<u8>,
}

impl Apacket {
    /// Build a packet around `data`, fixing up length and checksum.
    pub fn with_data(mut mesg: Amessage, data: Vec<u8>) -> Apacket {
        mesg.data_length = data.len() as u32;
        mesg.data_check = checksum(&data);
        Apacket { mesg, data }
    }

    /// Total wire size.
    pub fn size(&self) -> usize {
        MESSAGE_SIZE + self.data.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.mesg.encode());
        out.extend_from_slice(&self.data);
    }
}

/// Legacy ADB checksum: the byte sum of the payload.
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().map(|&b| u32::from(b)).sum()
}
