// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-capacity byte ring between producers and a single drain.
//!
//! Two cursors chase each other around the buffer: `queue_pos` (producer)
//! and `send_pos` (drain). One byte of slack distinguishes full from
//! empty, so a ring built over `capacity` bytes stores at most
//! `capacity - 1`. The ring itself is not synchronized;
//! [`ForwardPeer`](crate::relay::ForwardPeer) wraps it in a mutex.

/// Byte ring with one-byte slack. Usable capacity is `capacity() - 1`.
pub struct ByteRing {
    buf: Box<[u8]>,
    queue_pos: usize,
    send_pos: usize,
}

impl ByteRing {
    pub fn new(capacity: usize) -> ByteRing {
        assert!(capacity >= 2, "ring needs room for at least one byte");
        ByteRing {
            buf: vec![0u8; capacity].into_boxed_slice(),
            queue_pos: 0,
            send_pos: 0,
        }
    }

    /// Raw buffer size, one more than the usable capacity.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes queued and not yet consumed.
    pub fn len(&self) -> usize {
        (self.queue_pos + self.buf.len() - self.send_pos) % self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue_pos == self.send_pos
    }

    /// Free space available to `push`.
    pub fn available(&self) -> usize {
        self.buf.len() - 1 - self.len()
    }

    /// Append as much of `data` as fits; returns the number accepted.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.available());
        let data = &data[..take];
        let first = take.min(self.buf.len() - self.queue_pos);
        self.buf[self.queue_pos..self.queue_pos + first].copy_from_slice(&data[..first]);
        if first < take {
            self.buf[..take - first].copy_from_slice(&data[first..]);
        }
        self.queue_pos = (self.queue_pos + take) % self.buf.len();
        take
    }

    /// Longest contiguous queued chunk starting at the drain cursor.
    /// Consuming it may expose another chunk past the wrap point.
    pub fn peek(&self) -> &[u8] {
        if self.queue_pos >= self.send_pos {
            &self.buf[self.send_pos..self.queue_pos]
        } else {
            &self.buf[self.send_pos..]
        }
    }

    /// Advance the drain cursor past `n` consumed bytes.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.send_pos = (self.send_pos + n) % self.buf.len();
    }

    /// Reset both cursors, discarding everything queued.
    pub fn clear(&mut self) {
        self.queue_pos = 0;
        self.send_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_invariant() {
        let mut ring = ByteRing::new(8);
        // Usable capacity is one less than the raw buffer.
        assert_eq!(ring.available(), 7);
        assert_eq!(ring.push(&[0xaa; 16]), 7);
        assert_eq!(ring.len(), 7);
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.push(b"x"), 0);
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let mut ring = ByteRing::new(8);
        assert_eq!(ring.push(b"abcde"), 5);
        assert_eq!(ring.peek(), b"abcde");
        ring.consume(4);
        // Cursors now sit near the end; the next push wraps.
        assert_eq!(ring.push(b"fghi"), 4);
        let mut drained = Vec::new();
        while !ring.is_empty() {
            let chunk = ring.peek().to_vec();
            assert!(!chunk.is_empty());
            drained.extend_from_slice(&chunk);
            ring.consume(chunk.len());
        }
        assert_eq!(drained, b"efghi");
    }

    #[test]
    fn test_randomized_chunks_never_exceed_capacity() {
        let mut ring = ByteRing::new(64);
        let mut pushed = Vec::new();
        let mut drained = Vec::new();
        let mut next: u8 = 0;
        for _ in 0..200 {
            let n = fastrand::usize(1..16);
            let chunk: Vec<u8> = (0..n)
                .map(|_| {
                    next = next.wrapping_add(1);
                    next
                })
                .collect();
            let accepted = ring.push(&chunk);
            pushed.extend_from_slice(&chunk[..accepted]);
            assert!(ring.len() <= ring.capacity() - 1);
            if fastrand::bool() {
                let take = ring.peek().len().min(fastrand::usize(0..24));
                drained.extend_from_slice(&ring.peek()[..take]);
                ring.consume(take);
            }
        }
        while !ring.is_empty() {
            let chunk = ring.peek().to_vec();
            drained.extend_from_slice(&chunk);
            ring.consume(chunk.len());
        }
        assert_eq!(drained, pushed);
    }

    #[test]
    fn test_clear_discards_queued_bytes() {
        let mut ring = ByteRing::new(16);
        ring.push(b"stale");
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.available(), 15);
        ring.push(b"fresh");
        assert_eq!(ring.peek(), b"fresh");
    }
}
