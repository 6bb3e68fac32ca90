// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Opaque save/load byte stream.
//!
//! Fixed-width integers are big-endian; variable-length data is stored as
//! a `u32` length prefix followed by the raw bytes. State machines expose
//! `on_save(&mut Stream)` / `on_load(&mut Stream)` pairs built from these
//! primitives; the container embedding this crate decides where the bytes
//! ultimately live.

use std::io;

/// Append-or-consume byte stream with a read cursor.
#[derive(Default)]
pub struct Stream {
    buf: Vec<u8>,
    pos: usize,
}

impl Stream {
    pub fn new() -> Stream {
        Stream::default()
    }

    /// Wrap previously saved bytes for loading.
    pub fn from_bytes(buf: Vec<u8>) -> Stream {
        Stream { buf, pos: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    // ------------------------------------------------------------------
    // Writers
    // ------------------------------------------------------------------

    pub fn put_byte(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_be32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_be64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Raw bytes, no length prefix.
    pub fn write(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Length-prefixed bytes.
    pub fn put_blob(&mut self, data: &[u8]) {
        self.put_be32(data.len() as u32);
        self.write(data);
    }

    // ------------------------------------------------------------------
    // Readers
    // ------------------------------------------------------------------

    pub fn get_byte(&mut self) -> io::Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    pub fn get_be32(&mut self) -> io::Result<u32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    pub fn get_be64(&mut self) -> io::Result<u64> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    pub fn read_exact(&mut self, out: &mut [u8]) -> io::Result<()> {
        if self.buf.len() - self.pos < out.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "snapshot stream exhausted",
            ));
        }
        out.copy_from_slice(&self.buf[self.pos..self.pos + out.len()]);
        self.pos += out.len();
        Ok(())
    }

    pub fn get_blob(&mut self) -> io::Result<Vec<u8>> {
        let len = self.get_be32()? as usize;
        if self.buf.len() - self.pos < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "snapshot blob truncated",
            ));
        }
        let out = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_primitives() {
        let mut s = Stream::new();
        s.put_byte(0x7f);
        s.put_be32(0xdead_beef);
        s.put_be64(0x0123_4567_89ab_cdef);
        s.put_blob(b"blob");
        s.write(b"raw");

        let mut s = Stream::from_bytes(s.into_bytes());
        assert_eq!(s.get_byte().unwrap(), 0x7f);
        assert_eq!(s.get_be32().unwrap(), 0xdead_beef);
        assert_eq!(s.get_be64().unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(s.get_blob().unwrap(), b"blob");
        let mut raw = [0u8; 3];
        s.read_exact(&mut raw).unwrap();
        assert_eq!(&raw, b"raw");
    }

    #[test]
    fn test_big_endian_layout() {
        let mut s = Stream::new();
        s.put_be32(0x0102_0304);
        assert_eq!(s.as_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_underrun_is_unexpected_eof() {
        let mut s = Stream::from_bytes(vec![0, 0]);
        let err = s.get_be32().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_truncated_blob_is_unexpected_eof() {
        let mut s = Stream::new();
        s.put_be32(100);
        s.write(b"short");
        let mut s = Stream::from_bytes(s.into_bytes());
        assert_eq!(s.get_blob().unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }
}
