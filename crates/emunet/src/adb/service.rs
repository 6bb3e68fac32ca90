// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registry handing host ADB connections to waiting guest pipes.
//!
//! Pipes register at creation and stay until the guest closes them. The
//! loopback listener runs only while at least one pipe is in
//! `WaitingForHostAdbConnection`; an accepted connection goes to the
//! oldest waiting pipe (FIFO) and stops the listener until the next pipe
//! asks for one.

use std::cell::RefCell;
use std::io;
use std::net::TcpStream;
use std::rc::Rc;

use crate::adb::pipe::{AdbGuestPipe, WakeSignal};
use crate::adb::PipeState;
use crate::aio::{AsyncSocketServer, LoopbackMode};
use crate::looper::Looper;

pub(crate) struct ServiceInner {
    pipes: Vec<Rc<RefCell<AdbGuestPipe>>>,
    server: Option<AsyncSocketServer>,
}

/// Owner handle for the pipe registry and its loopback listener.
pub struct AdbPipeService {
    inner: Rc<RefCell<ServiceInner>>,
}

impl AdbPipeService {
    /// Bind the ADB loopback listener on `port` (0 picks one). The
    /// listener stays stopped until a pipe waits for a connection.
    pub fn new(port: u16, looper: &mut Looper) -> io::Result<AdbPipeService> {
        let inner = Rc::new(RefCell::new(ServiceInner {
            pipes: Vec::new(),
            server: None,
        }));
        let weak = Rc::downgrade(&inner);
        let mode = LoopbackMode::IPV4_AND_IPV6 | LoopbackMode::OPTIONAL_IPV6;
        let server = AsyncSocketServer::create_tcp_loopback(
            port,
            mode,
            Box::new(move |lp, stream| {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };
                ServiceInner::on_host_connection(&inner, lp, stream)
            }),
            looper,
        )?;
        server.stop_listening(looper);
        inner.borrow_mut().server = Some(server);
        Ok(AdbPipeService { inner })
    }

    /// Port the host side connects to.
    pub fn port(&self) -> u16 {
        self.inner
            .borrow()
            .server
            .as_ref()
            .map_or(0, AsyncSocketServer::port)
    }

    /// Create a guest pipe expecting the `"accept"` command.
    pub fn create_pipe(&self, wake_signal: WakeSignal) -> Rc<RefCell<AdbGuestPipe>> {
        let pipe = AdbGuestPipe::new(wake_signal, Rc::downgrade(&self.inner));
        self.inner.borrow_mut().pipes.push(pipe.clone());
        pipe
    }

    pub fn pipe_count(&self) -> usize {
        self.inner.borrow().pipes.len()
    }

    /// Tear down the listener. Pipes already proxying keep their sockets.
    pub fn close(&self, looper: &mut Looper) {
        let server = self.inner.borrow_mut().server.take();
        if let Some(server) = server {
            server.close(looper);
        }
    }
}

impl ServiceInner {
    /// A pipe entered `WaitingForHostAdbConnection`.
    pub(crate) fn start_listening(inner: &Rc<RefCell<ServiceInner>>, looper: &mut Looper) {
        let server = inner.borrow().server.clone();
        if let Some(server) = server {
            server.start_listening(looper);
        }
    }

    /// Accepted host connection: hand it to the oldest waiting pipe.
    fn on_host_connection(
        inner: &Rc<RefCell<ServiceInner>>,
        looper: &mut Looper,
        stream: TcpStream,
    ) -> bool {
        let pipe = {
            let guard = inner.borrow();
            guard
                .pipes
                .iter()
                .find(|p| p.borrow().state() == PipeState::WaitingForHostAdbConnection)
                .cloned()
        };
        match pipe {
            Some(pipe) => AdbGuestPipe::on_host_connection(&pipe, looper, stream),
            None => {
                log::warn!("adb service: host connection with no waiting pipe");
                false
            }
        }
    }

    /// Guest closed a pipe: drop it, and the listener too when nothing
    /// is left to serve.
    pub(crate) fn on_pipe_close(
        inner: &Rc<RefCell<ServiceInner>>,
        looper: &mut Looper,
        pipe: &Rc<RefCell<AdbGuestPipe>>,
    ) {
        let (empty, server) = {
            let mut guard = inner.borrow_mut();
            guard.pipes.retain(|p| !Rc::ptr_eq(p, pipe));
            (guard.pipes.is_empty(), guard.server.clone())
        };
        if empty {
            if let Some(server) = server {
                server.stop_listening(looper);
            }
        }
    }
}
