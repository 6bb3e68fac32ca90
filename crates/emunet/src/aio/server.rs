// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Loopback TCP listener with a single-admission accept policy.
//!
//! The server stops listening *before* handing an accepted stream to the
//! `on_connect` callback, so at most one connection is ever in flight. A
//! callback that declines the stream (returns `false`) drops it and the
//! server resumes listening on its own; a callback that keeps it leaves
//! the server stopped until someone calls `start_listening` again.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::rc::{Rc, Weak};

use std::cell::RefCell;

use crate::looper::{FdWatch, Looper};

/// Attempts at finding a port both families can share when the caller
/// asked for an auto-chosen port.
const BIND_ATTEMPTS: u32 = 5;

/// Which loopback families to bind, and which of them may fail silently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopbackMode(u8);

impl LoopbackMode {
    /// Bind 127.0.0.1; failure is an error unless `OPTIONAL_IPV4` is set.
    pub const IPV4: LoopbackMode = LoopbackMode(1);
    /// Bind ::1; failure is an error unless `OPTIONAL_IPV6` is set.
    pub const IPV6: LoopbackMode = LoopbackMode(2);
    /// Tolerate an IPv4 bind failure when another family succeeded.
    pub const OPTIONAL_IPV4: LoopbackMode = LoopbackMode(4);
    /// Tolerate an IPv6 bind failure when another family succeeded.
    pub const OPTIONAL_IPV6: LoopbackMode = LoopbackMode(8);
    /// Both families, both mandatory.
    pub const IPV4_AND_IPV6: LoopbackMode = LoopbackMode(3);

    pub fn contains(self, other: LoopbackMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for LoopbackMode {
    type Output = LoopbackMode;
    fn bitor(self, rhs: LoopbackMode) -> LoopbackMode {
        LoopbackMode(self.0 | rhs.0)
    }
}

/// Decides the fate of an accepted stream: `true` keeps it (listening
/// stays stopped), `false` drops it (listening resumes).
pub type ConnectCallback = Box<dyn FnMut(&mut Looper, TcpStream) -> bool>;

struct BoundListener {
    socket: TcpListener,
    watch: FdWatch,
}

struct Inner {
    listeners: Vec<BoundListener>,
    port: u16,
    on_connect: Option<ConnectCallback>,
    listening: bool,
}

/// Loopback TCP listener driven by a [`Looper`]. Cheap to clone; clones
/// share the same listening state.
#[derive(Clone)]
pub struct AsyncSocketServer {
    inner: Rc<RefCell<Inner>>,
}

impl AsyncSocketServer {
    /// Bind loopback listeners per `mode` and start listening.
    ///
    /// With `port == 0` and both families requested, an OS-chosen IPv4
    /// port is re-used for the IPv6 bind; on collision the whole bind is
    /// retried a bounded number of times.
    pub fn create_tcp_loopback(
        port: u16,
        mode: LoopbackMode,
        on_connect: ConnectCallback,
        looper: &mut Looper,
    ) -> io::Result<AsyncSocketServer> {
        let want_v4 = mode.contains(LoopbackMode::IPV4);
        let want_v6 = mode.contains(LoopbackMode::IPV6);
        if !want_v4 && !want_v6 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "loopback mode selects no address family",
            ));
        }

        let mut last_err = io::Error::new(io::ErrorKind::AddrInUse, "no bind attempt made");
        for attempt in 0..BIND_ATTEMPTS {
            match Self::bind_families(port, mode) {
                Ok(sockets) => {
                    let bound_port = sockets[0].local_addr()?.port();
                    log::debug!(
                        "loopback server bound on port {} ({} listener(s))",
                        bound_port,
                        sockets.len()
                    );
                    return Self::finish(sockets, bound_port, on_connect, looper);
                }
                Err(e) => {
                    log::debug!("loopback bind attempt {} failed: {}", attempt, e);
                    last_err = e;
                    // A fixed port will not free up by retrying.
                    if port != 0 {
                        break;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// Wrap a pre-bound listener (used when the caller needs the port
    /// before the looper thread exists). The socket is switched to
    /// non-blocking mode here.
    pub fn from_listener(
        socket: TcpListener,
        on_connect: ConnectCallback,
        looper: &mut Looper,
    ) -> io::Result<AsyncSocketServer> {
        socket.set_nonblocking(true)?;
        let port = socket.local_addr()?.port();
        Self::finish(vec![socket], port, on_connect, looper)
    }

    fn bind_families(port: u16, mode: LoopbackMode) -> io::Result<Vec<TcpListener>> {
        let want_v4 = mode.contains(LoopbackMode::IPV4);
        let want_v6 = mode.contains(LoopbackMode::IPV6);
        let mut sockets = Vec::new();
        let mut chosen_port = port;

        if want_v4 {
            match bind_loopback(chosen_port, false) {
                Ok(socket) => {
                    chosen_port = socket.local_addr()?.port();
                    sockets.push(socket);
                }
                Err(e) if mode.contains(LoopbackMode::OPTIONAL_IPV4) && want_v6 => {
                    log::debug!("optional IPv4 loopback bind failed: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        if want_v6 {
            match bind_loopback(chosen_port, true) {
                Ok(socket) => sockets.push(socket),
                Err(e) if mode.contains(LoopbackMode::OPTIONAL_IPV6) && !sockets.is_empty() => {
                    log::debug!("optional IPv6 loopback bind failed: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        if sockets.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no loopback family could be bound",
            ));
        }
        Ok(sockets)
    }

    fn finish(
        sockets: Vec<TcpListener>,
        port: u16,
        on_connect: ConnectCallback,
        looper: &mut Looper,
    ) -> io::Result<AsyncSocketServer> {
        let inner = Rc::new(RefCell::new(Inner {
            listeners: Vec::new(),
            port,
            on_connect: Some(on_connect),
            listening: false,
        }));
        for (index, socket) in sockets.into_iter().enumerate() {
            use std::os::unix::io::AsRawFd;
            let weak = Rc::downgrade(&inner);
            let watch = looper.create_fd_watch(
                socket.as_raw_fd(),
                Box::new(move |lp, _w, _ev| Inner::on_ready(&weak, lp, index)),
            )?;
            inner
                .borrow_mut()
                .listeners
                .push(BoundListener { socket, watch });
        }
        let server = AsyncSocketServer { inner };
        server.start_listening(looper);
        Ok(server)
    }

    /// Port the listeners share.
    pub fn port(&self) -> u16 {
        self.inner.borrow().port
    }

    pub fn is_listening(&self) -> bool {
        self.inner.borrow().listening
    }

    /// Arm accept readiness on every bound family.
    pub fn start_listening(&self, looper: &mut Looper) {
        let watches: Vec<FdWatch> = {
            let mut inner = self.inner.borrow_mut();
            if inner.listening {
                return;
            }
            inner.listening = true;
            inner.listeners.iter().map(|l| l.watch).collect()
        };
        for watch in watches {
            looper.watch_want_read(watch);
        }
    }

    /// De-arm accept readiness; queued connections stay in the backlog.
    pub fn stop_listening(&self, looper: &mut Looper) {
        let watches: Vec<FdWatch> = {
            let mut inner = self.inner.borrow_mut();
            if !inner.listening {
                return;
            }
            inner.listening = false;
            inner.listeners.iter().map(|l| l.watch).collect()
        };
        for watch in watches {
            looper.watch_dont_want_read(watch);
        }
    }

    /// Tear down the listeners and their watches.
    pub fn close(&self, looper: &mut Looper) {
        let listeners = {
            let mut inner = self.inner.borrow_mut();
            inner.listening = false;
            std::mem::take(&mut inner.listeners)
        };
        for listener in listeners {
            looper.delete_watch(listener.watch);
            drop(listener.socket);
        }
    }
}

impl Inner {
    fn on_ready(weak: &Weak<RefCell<Inner>>, looper: &mut Looper, index: usize) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let server = AsyncSocketServer {
            inner: inner.clone(),
        };
        loop {
            if !inner.borrow().listening {
                return;
            }
            let accepted = {
                let guard = inner.borrow();
                let Some(listener) = guard.listeners.get(index) else {
                    return;
                };
                listener.socket.accept()
            };
            match accepted {
                Ok((stream, peer)) => {
                    log::debug!("loopback server: connection from {}", peer);
                    // Single admission: no more accepts until the callback
                    // decides what to do with this one.
                    server.stop_listening(looper);
                    let mut callback = inner.borrow_mut().on_connect.take();
                    let kept = match callback.as_mut() {
                        Some(cb) => cb(looper, stream),
                        None => false,
                    };
                    {
                        let mut guard = inner.borrow_mut();
                        if guard.on_connect.is_none() {
                            guard.on_connect = callback;
                        }
                    }
                    if kept {
                        return;
                    }
                    server.start_listening(looper);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("loopback server: accept failed: {}", e);
                    return;
                }
            }
        }
    }
}

pub(crate) fn bind_loopback(port: u16, v6: bool) -> io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};
    let domain = if v6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = if v6 {
        socket.set_only_v6(true)?;
        (Ipv6Addr::LOCALHOST, port).into()
    } else {
        (Ipv4Addr::LOCALHOST, port).into()
    };
    socket.bind(&addr.into())?;
    socket.listen(8)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_auto_port() {
        let mut looper = Looper::new().unwrap();
        let server = AsyncSocketServer::create_tcp_loopback(
            0,
            LoopbackMode::IPV4,
            Box::new(|_, _| false),
            &mut looper,
        )
        .unwrap();
        assert_ne!(server.port(), 0);
        assert!(server.is_listening());
        server.close(&mut looper);
    }

    #[test]
    fn test_bind_both_families_shares_port() {
        let mut looper = Looper::new().unwrap();
        let mode = LoopbackMode::IPV4_AND_IPV6 | LoopbackMode::OPTIONAL_IPV6;
        let server =
            AsyncSocketServer::create_tcp_loopback(0, mode, Box::new(|_, _| false), &mut looper)
                .unwrap();
        let port = server.port();
        assert_ne!(port, 0);
        // Whatever families bound, they all share the chosen port.
        for listener in &server.inner.borrow().listeners {
            assert_eq!(listener.socket.local_addr().unwrap().port(), port);
        }
        server.close(&mut looper);
    }

    #[test]
    fn test_empty_mode_rejected() {
        let mut looper = Looper::new().unwrap();
        let result = AsyncSocketServer::create_tcp_loopback(
            0,
            LoopbackMode(0),
            Box::new(|_, _| false),
            &mut looper,
        );
        match result {
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::InvalidInput),
            Ok(_) => panic!("empty loopback mode must be rejected"),
        }
    }

    #[test]
    fn test_stop_start_idempotent() {
        let mut looper = Looper::new().unwrap();
        let server = AsyncSocketServer::create_tcp_loopback(
            0,
            LoopbackMode::IPV4,
            Box::new(|_, _| false),
            &mut looper,
        )
        .unwrap();
        server.stop_listening(&mut looper);
        server.stop_listening(&mut looper);
        assert!(!server.is_listening());
        server.start_listening(&mut looper);
        server.start_listening(&mut looper);
        assert!(server.is_listening());
        server.close(&mut looper);
    }
}
