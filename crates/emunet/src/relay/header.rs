// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay wire framing.
//!
//! Every record starts with a fixed 47-byte header:
//!
//! ```text
//! offset  size  field
//!      0     4  magic "WIFR"
//!      4     1  version (currently 1)
//!      5     2  frame type (0 = data, 1 = ack)
//!      7     6  transmitter MAC
//!     13     2  data_offset   (start of payload, >= HEADER_SIZE)
//!     15     4  full_length   (header + payload)
//!     19     8  cookie
//!     27     4  flags
//!     31     4  channel
//!     35     4  num_rates
//!     39     8  rate table, 4 x { idx: i8, count: u8 }
//! ```
//!
//! Multi-byte fields are little-endian. The parser is best-effort: a
//! corrupted header costs exactly `HEADER_SIZE` bytes of the stream and
//! the frame behind it, never the connection.

/// Leading magic of every relay record.
pub const MAGIC: [u8; 4] = *b"WIFR";
/// Wire format version this build speaks.
pub const VERSION: u8 = 1;
/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 47;
/// Entries in the fixed-size rate table.
pub const MAX_RATES: usize = 4;

/// Record kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Ack,
}

impl FrameType {
    fn from_wire(raw: u16) -> FrameType {
        match raw {
            1 => FrameType::Ack,
            _ => FrameType::Data,
        }
    }

    fn to_wire(self) -> u16 {
        match self {
            FrameType::Data => 0,
            FrameType::Ack => 1,
        }
    }
}

/// One hwsim-style TX rate descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rate {
    pub idx: i8,
    pub count: u8,
}

/// Decoded relay record header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardHeader {
    pub frame_type: FrameType,
    pub transmitter: [u8; 6],
    pub data_offset: u16,
    pub full_length: u32,
    pub cookie: u64,
    pub flags: u32,
    pub channel: u32,
    pub num_rates: u32,
    pub rates: [Rate; MAX_RATES],
}

impl Default for ForwardHeader {
    fn default() -> ForwardHeader {
        ForwardHeader {
            frame_type: FrameType::Data,
            transmitter: [0; 6],
            data_offset: HEADER_SIZE as u16,
            full_length: HEADER_SIZE as u32,
            cookie: 0,
            flags: 0,
            channel: 0,
            num_rates: 0,
            rates: [Rate::default(); MAX_RATES],
        }
    }
}

/// Why a header failed to decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderError {
    BadMagic,
    BadVersion(u8),
}

impl ForwardHeader {
    /// Decode the header at the start of `buf` (`buf.len() >= HEADER_SIZE`).
    pub fn parse(buf: &[u8]) -> Result<ForwardHeader, HeaderError> {
        debug_assert!(buf.len() >= HEADER_SIZE);
        if buf[0..4] != MAGIC {
            return Err(HeaderError::BadMagic);
        }
        if buf[4] != VERSION {
            return Err(HeaderError::BadVersion(buf[4]));
        }
        let mut transmitter = [0u8; 6];
        transmitter.copy_from_slice(&buf[7..13]);
        let mut rates = [Rate::default(); MAX_RATES];
        for (i, rate) in rates.iter_mut().enumerate() {
            rate.idx = buf[39 + 2 * i] as i8;
            rate.count = buf[40 + 2 * i];
        }
        Ok(ForwardHeader {
            frame_type: FrameType::from_wire(read_u16(&buf[5..7])),
            transmitter,
            data_offset: read_u16(&buf[13..15]),
            full_length: read_u32(&buf[15..19]),
            cookie: read_u64(&buf[19..27]),
            flags: read_u32(&buf[27..31]),
            channel: read_u32(&buf[31..35]),
            num_rates: read_u32(&buf[35..39]),
            rates,
        })
    }

    /// Append the encoded header to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&self.frame_type.to_wire().to_le_bytes());
        out.extend_from_slice(&self.transmitter);
        out.extend_from_slice(&self.data_offset.to_le_bytes());
        out.extend_from_slice(&self.full_length.to_le_bytes());
        out.extend_from_slice(&self.cookie.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.channel.to_le_bytes());
        out.extend_from_slice(&self.num_rates.to_le_bytes());
        for rate in &self.rates {
            out.push(rate.idx as u8);
            out.push(rate.count);
        }
    }

    /// Payload bytes this record claims to carry.
    pub fn payload_len(&self) -> usize {
        (self.full_length as usize).saturating_sub(self.data_offset as usize)
    }
}

/// Encode a complete record: `header` with `data_offset`/`full_length`
/// recomputed for `payload`.
pub fn encode_frame(header: &ForwardHeader, payload: &[u8]) -> Vec<u8> {
    let mut fixed = header.clone();
    fixed.data_offset = HEADER_SIZE as u16;
    fixed.full_length = (HEADER_SIZE + payload.len()) as u32;
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    fixed.encode_into(&mut out);
    out.extend_from_slice(payload);
    out
}

/// Scan `buf` for complete records and hand each payload to `deliver`,
/// which returns how many payload bytes it consumed. Returns the number
/// of bytes of `buf` that may be discarded.
///
/// Recovery and backpressure rules:
/// - bad magic, bad version, or an out-of-bounds `data_offset` skips
///   exactly `HEADER_SIZE` bytes (the frame behind the bad header is lost
///   and re-parsed as headers);
/// - an incomplete record stops the scan until more bytes arrive;
/// - a delivery consuming less than the payload stops the scan with that
///   record still pending.
pub fn parse_frames<F>(buf: &[u8], mut deliver: F) -> usize
where
    F: FnMut(&ForwardHeader, &[u8]) -> usize,
{
    let mut pos = 0;
    while buf.len() - pos >= HEADER_SIZE {
        let header = match ForwardHeader::parse(&buf[pos..]) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("relay: bad header ({:?}), skipping {} bytes", e, HEADER_SIZE);
                pos += HEADER_SIZE;
                continue;
            }
        };
        let data_offset = header.data_offset as usize;
        let full_length = header.full_length as usize;
        if data_offset < HEADER_SIZE || data_offset > full_length {
            log::warn!(
                "relay: inconsistent lengths (offset {}, full {}), skipping {} bytes",
                data_offset,
                full_length,
                HEADER_SIZE
            );
            pos += HEADER_SIZE;
            continue;
        }
        if buf.len() - pos < full_length {
            break;
        }
        let payload_len = full_length - data_offset;
        if payload_len > 0 {
            let payload = &buf[pos + data_offset..pos + full_length];
            let consumed = deliver(&header, payload);
            if consumed < payload_len {
                break;
            }
            pos += full_length;
        } else {
            // Ack-only record: nothing to deliver.
            pos += data_offset;
        }
    }
    pos
}

fn read_u16(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[0], buf[1]])
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn read_u64(buf: &[u8]) -> u64 {
    u64::from_le_bytes([
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ])
}
