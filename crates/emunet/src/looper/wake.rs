// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Self-pipe used to interrupt a [`Looper`](super::Looper) blocked in poll
//! from another thread.
//!
//! The writer half is `Send` and can be moved to any thread; each
//! [`WakeSender::wake`] writes a single byte. The reader half stays on the
//! looper thread, registered as an ordinary fd-watch, and is drained with
//! [`WakeReceiver::drain`] inside the watch callback before acting on the
//! wake reason.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use mio::unix::pipe;

/// Thread-safe wake trigger.
pub struct WakeSender {
    inner: pipe::Sender,
}

/// Looper-side end of the wake pipe.
pub struct WakeReceiver {
    inner: pipe::Receiver,
}

/// Create a connected, non-blocking wake pipe.
pub fn wake_pair() -> io::Result<(WakeSender, WakeReceiver)> {
    let (tx, rx) = pipe::new()?;
    Ok((WakeSender { inner: tx }, WakeReceiver { inner: rx }))
}

impl WakeSender {
    /// Interrupt the looper. A full pipe means a wake is already queued,
    /// so `WouldBlock` is not an error.
    pub fn wake(&self) {
        match (&self.inner).write(&[1u8]) {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => log::warn!("wake pipe write failed: {}", e),
        }
    }
}

impl WakeReceiver {
    /// Fd to hand to [`Looper::create_fd_watch`](super::Looper::create_fd_watch).
    pub fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    /// Consume every queued wake byte. Returns how many were pending.
    pub fn drain(&mut self) -> usize {
        let mut total = 0;
        let mut scratch = [0u8; 64];
        loop {
            match self.inner.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("wake pipe read failed: {}", e);
                    break;
                }
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::looper::{ExitReason, Looper};
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn test_wake_from_another_thread() {
        let mut looper = Looper::new().unwrap();
        let (tx, mut rx) = wake_pair().unwrap();

        let woken = Rc::new(Cell::new(0usize));
        let fd = rx.as_raw_fd();
        let watch = looper
            .create_fd_watch(fd, {
                let woken = woken.clone();
                Box::new(move |lp, _w, _ev| {
                    woken.set(woken.get() + rx.drain());
                    lp.force_quit();
                })
            })
            .unwrap();
        looper.watch_want_read(watch);

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            tx.wake();
            tx.wake();
        });
        assert_eq!(
            looper.run_with_timeout(Duration::from_secs(5)),
            ExitReason::Quit
        );
        handle.join().unwrap();
        assert!(woken.get() >= 1);
    }

    #[test]
    fn test_drain_without_wake_is_empty() {
        let (_tx, mut rx) = wake_pair().unwrap();
        assert_eq!(rx.drain(), 0);
    }
}
