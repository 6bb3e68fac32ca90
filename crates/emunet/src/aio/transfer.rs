// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-size restartable transfers over a non-blocking stream.
//!
//! An [`AsyncReader`] (or [`AsyncWriter`]) is armed with `reset()` for an
//! exact byte count, then `run()` is called from the fd-watch callback each
//! time the socket reports readiness. The helper keeps its own cursor and
//! toggles the watch's want-flag, so the owning state machine only has to
//! react to the three-way [`AsyncStatus`].

use std::io::{self, Read, Write};

use crate::looper::{FdWatch, Looper};

/// Outcome of one `run()` step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsyncStatus {
    /// The full transfer finished; the want-flag has been cleared.
    Completed,
    /// The socket would block; wait for the next readiness event.
    Again,
    /// The stream failed (orderly EOF while reading maps to
    /// `ConnectionReset`). The want-flag has been cleared.
    Error(io::ErrorKind),
}

/// Incremental reader of an exact number of bytes.
#[derive(Default)]
pub struct AsyncReader {
    buf: Vec<u8>,
    pos: usize,
    watch: Option<FdWatch>,
}

impl AsyncReader {
    pub fn new() -> AsyncReader {
        AsyncReader::default()
    }

    /// Arm the reader for `size` bytes and request read readiness.
    pub fn reset(&mut self, size: usize, watch: FdWatch, looper: &mut Looper) {
        self.buf.clear();
        self.buf.resize(size, 0);
        self.pos = 0;
        self.watch = Some(watch);
        looper.watch_want_read(watch);
    }

    /// Bytes read so far (the full buffer once `Completed`).
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    /// Advance the transfer as far as the stream allows.
    pub fn run<R: Read>(&mut self, stream: &mut R, looper: &mut Looper) -> AsyncStatus {
        while self.pos < self.buf.len() {
            match stream.read(&mut self.buf[self.pos..]) {
                Ok(0) => return self.fail(io::ErrorKind::ConnectionReset, looper),
                Ok(n) => self.pos += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return AsyncStatus::Again;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return self.fail(e.kind(), looper),
            }
        }
        if let Some(watch) = self.watch.take() {
            looper.watch_dont_want_read(watch);
        }
        AsyncStatus::Completed
    }

    fn fail(&mut self, kind: io::ErrorKind, looper: &mut Looper) -> AsyncStatus {
        if let Some(watch) = self.watch.take() {
            looper.watch_dont_want_read(watch);
        }
        AsyncStatus::Error(kind)
    }
}

/// Incremental writer of an exact byte slice.
#[derive(Default)]
pub struct AsyncWriter {
    buf: Vec<u8>,
    pos: usize,
    watch: Option<FdWatch>,
}

impl AsyncWriter {
    pub fn new() -> AsyncWriter {
        AsyncWriter::default()
    }

    /// Arm the writer with a copy of `data` and request write readiness.
    pub fn reset(&mut self, data: &[u8], watch: FdWatch, looper: &mut Looper) {
        self.buf.clear();
        self.buf.extend_from_slice(data);
        self.pos = 0;
        self.watch = Some(watch);
        looper.watch_want_write(watch);
    }

    pub fn run<W: Write>(&mut self, stream: &mut W, looper: &mut Looper) -> AsyncStatus {
        while self.pos < self.buf.len() {
            match stream.write(&self.buf[self.pos..]) {
                Ok(0) => return self.fail(io::ErrorKind::WriteZero, looper),
                Ok(n) => self.pos += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return AsyncStatus::Again;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return self.fail(e.kind(), looper),
            }
        }
        if let Some(watch) = self.watch.take() {
            looper.watch_dont_want_write(watch);
        }
        AsyncStatus::Completed
    }

    fn fail(&mut self, kind: io::ErrorKind, looper: &mut Looper) -> AsyncStatus {
        if let Some(watch) = self.watch.take() {
            looper.watch_dont_want_write(watch);
        }
        AsyncStatus::Error(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_reader_partial_then_complete() {
        let mut looper = Looper::new().unwrap();
        let (mut a, mut b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let watch = looper
            .create_fd_watch(b.as_raw_fd(), Box::new(|_, _, _| {}))
            .unwrap();

        let mut reader = AsyncReader::new();
        reader.reset(8, watch, &mut looper);
        assert!(looper.watch_wanted(watch).contains(crate::EventSet::READ));

        a.write_all(b"hell").unwrap();
        assert_eq!(reader.run(&mut b, &mut looper), AsyncStatus::Again);
        assert_eq!(reader.buffer(), b"hell");

        a.write_all(b"o123").unwrap();
        assert_eq!(reader.run(&mut b, &mut looper), AsyncStatus::Completed);
        assert_eq!(reader.buffer(), b"hello123");
        // Completion clears the want-flag.
        assert!(looper.watch_wanted(watch).is_empty());
    }

    #[test]
    fn test_reader_eof_is_connection_reset() {
        let mut looper = Looper::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let watch = looper
            .create_fd_watch(b.as_raw_fd(), Box::new(|_, _, _| {}))
            .unwrap();

        let mut reader = AsyncReader::new();
        reader.reset(4, watch, &mut looper);
        drop(a);
        assert_eq!(
            reader.run(&mut b, &mut looper),
            AsyncStatus::Error(io::ErrorKind::ConnectionReset)
        );
        assert!(looper.watch_wanted(watch).is_empty());
    }

    #[test]
    fn test_writer_round_trip() {
        let mut looper = Looper::new().unwrap();
        let (mut a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let watch = looper
            .create_fd_watch(a.as_raw_fd(), Box::new(|_, _, _| {}))
            .unwrap();

        let mut writer = AsyncWriter::new();
        writer.reset(b"ping", watch, &mut looper);
        assert_eq!(writer.run(&mut a, &mut looper), AsyncStatus::Completed);
        assert!(looper.watch_wanted(watch).is_empty());

        let mut got = [0u8; 4];
        b.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ping");
    }
}
