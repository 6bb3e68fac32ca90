// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Guest-pipe state machine bridging a guest channel to a host TCP socket.
//!
//! ```text
//!   WaitingForGuestAcceptCommand
//!         | guest writes "accept"
//!         v
//!   WaitingForHostAdbConnection        (service listener armed)
//!         | host connects
//!         v
//!   SendingAcceptReplyOk               (guest reads "ok")
//!         | reply fully read
//!         v
//!   WaitingForGuestStartCommand
//!         | guest writes "start"
//!         v
//!   ProxyingData  <--- full duplex --->  host socket
//!
//!   any state --guest closes--> ClosedByGuest
//!   any state --host breaks / bad command--> ClosedByHost
//! ```
//!
//! The guest side is a pair of `on_guest_send` / `on_guest_recv` calls
//! plus a wake-signal closure; the host side is an fd-watch on the
//! accepted socket. A command mismatch is terminal: the pipe drops its
//! socket and reports `Closed` from then on.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};

use crate::adb::service::ServiceInner;
use crate::adb::{
    PipeError, PIPE_POLL_HUP, PIPE_POLL_IN, PIPE_POLL_OUT, PIPE_WAKE_CLOSED, PIPE_WAKE_READ,
    PIPE_WAKE_WRITE,
};
use crate::looper::{EventSet, FdWatch, Looper};
use crate::snapshot::Stream;

/// Largest handshake token ("accept").
const MATCH_BUFFER_SIZE: usize = 16;

/// Signals the guest that the pipe became readable/writable/closed.
pub type WakeSignal = Box<dyn Fn(u8)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipeState {
    WaitingForGuestAcceptCommand,
    WaitingForHostAdbConnection,
    SendingAcceptReplyOk,
    WaitingForGuestStartCommand,
    ProxyingData,
    ClosedByGuest,
    ClosedByHost,
}

impl PipeState {
    fn to_wire(self) -> u8 {
        match self {
            PipeState::WaitingForGuestAcceptCommand => 0,
            PipeState::WaitingForHostAdbConnection => 1,
            PipeState::SendingAcceptReplyOk => 2,
            PipeState::WaitingForGuestStartCommand => 3,
            PipeState::ProxyingData => 4,
            PipeState::ClosedByGuest => 5,
            PipeState::ClosedByHost => 6,
        }
    }

    fn from_wire(raw: u8) -> io::Result<PipeState> {
        Ok(match raw {
            0 => PipeState::WaitingForGuestAcceptCommand,
            1 => PipeState::WaitingForHostAdbConnection,
            2 => PipeState::SendingAcceptReplyOk,
            3 => PipeState::WaitingForGuestStartCommand,
            4 => PipeState::ProxyingData,
            5 => PipeState::ClosedByGuest,
            6 => PipeState::ClosedByHost,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown pipe state {}", other),
                ))
            }
        })
    }
}

pub struct AdbGuestPipe {
    state: PipeState,
    /// Handshake match/reply buffer plus its cursor.
    buffer: [u8; MATCH_BUFFER_SIZE],
    buffer_size: usize,
    buffer_pos: usize,
    host_socket: Option<TcpStream>,
    watch: Option<FdWatch>,
    wake_signal: WakeSignal,
    service: Weak<RefCell<ServiceInner>>,
}

impl AdbGuestPipe {
    pub(crate) fn new(
        wake_signal: WakeSignal,
        service: Weak<RefCell<ServiceInner>>,
    ) -> Rc<RefCell<AdbGuestPipe>> {
        let mut pipe = AdbGuestPipe {
            state: PipeState::WaitingForGuestAcceptCommand,
            buffer: [0; MATCH_BUFFER_SIZE],
            buffer_size: 0,
            buffer_pos: 0,
            host_socket: None,
            watch: None,
            wake_signal,
            service,
        };
        pipe.set_expected_guest_command(b"accept", PipeState::WaitingForGuestAcceptCommand);
        Rc::new(RefCell::new(pipe))
    }

    pub fn state(&self) -> PipeState {
        self.state
    }

    // ------------------------------------------------------------------
    // Guest side
    // ------------------------------------------------------------------

    /// Guest wrote `data` into the pipe.
    pub fn on_guest_send(&mut self, looper: &mut Looper, data: &[u8]) -> Result<usize, PipeError> {
        match self.state {
            PipeState::ProxyingData => self.send_data(looper, data),
            PipeState::WaitingForGuestAcceptCommand | PipeState::WaitingForGuestStartCommand => {
                self.send_command(looper, data)
            }
            _ => Err(PipeError::Closed),
        }
    }

    /// Guest wants up to `buf.len()` bytes from the pipe.
    pub fn on_guest_recv(&mut self, looper: &mut Looper, buf: &mut [u8]) -> Result<usize, PipeError> {
        match self.state {
            PipeState::ProxyingData => self.recv_data(looper, buf),
            PipeState::SendingAcceptReplyOk => Ok(self.recv_reply(buf)),
            PipeState::WaitingForHostAdbConnection | PipeState::WaitingForGuestStartCommand => {
                Err(PipeError::Again)
            }
            _ => Err(PipeError::Closed),
        }
    }

    /// Readiness flags for the guest's poll.
    pub fn on_guest_poll(&self, looper: &Looper) -> u8 {
        match self.state {
            PipeState::WaitingForGuestAcceptCommand | PipeState::WaitingForGuestStartCommand => {
                PIPE_POLL_OUT
            }
            PipeState::WaitingForHostAdbConnection => 0,
            PipeState::SendingAcceptReplyOk => PIPE_POLL_IN,
            PipeState::ProxyingData => {
                let mut flags = 0;
                if let Some(watch) = self.watch {
                    let events = looper.watch_poll(watch);
                    if events.contains(EventSet::READ) {
                        flags |= PIPE_POLL_IN;
                    }
                    if events.contains(EventSet::WRITE) {
                        flags |= PIPE_POLL_OUT;
                    }
                }
                flags
            }
            PipeState::ClosedByGuest | PipeState::ClosedByHost => PIPE_POLL_HUP,
        }
    }

    /// Guest asked to be woken when `flags` conditions hold.
    pub fn on_guest_want_wake_on(&mut self, looper: &mut Looper, flags: u8) {
        if self.state == PipeState::ProxyingData {
            if let Some(watch) = self.watch {
                if flags & PIPE_WAKE_READ != 0 {
                    looper.watch_want_read(watch);
                }
                if flags & PIPE_WAKE_WRITE != 0 {
                    looper.watch_want_write(watch);
                }
            }
            return;
        }
        // Handshake states are synchronously ready or not; signal at once
        // when the condition already holds.
        let ready = self.on_guest_poll(looper);
        let mut wake = 0;
        if flags & PIPE_WAKE_READ != 0 && ready & PIPE_POLL_IN != 0 {
            wake |= PIPE_WAKE_READ;
        }
        if flags & PIPE_WAKE_WRITE != 0 && ready & PIPE_POLL_OUT != 0 {
            wake |= PIPE_WAKE_WRITE;
        }
        if wake != 0 {
            (self.wake_signal)(wake);
        }
    }

    /// Guest closed its end. Removes the pipe from its service.
    pub fn on_guest_close(pipe: &Rc<RefCell<AdbGuestPipe>>, looper: &mut Looper) {
        let (socket, watch, service) = {
            let mut p = pipe.borrow_mut();
            p.state = PipeState::ClosedByGuest;
            (p.host_socket.take(), p.watch.take(), p.service.clone())
        };
        if let Some(watch) = watch {
            looper.delete_watch(watch);
        }
        drop(socket);
        if let Some(service) = service.upgrade() {
            ServiceInner::on_pipe_close(&service, looper, pipe);
        }
    }

    // ------------------------------------------------------------------
    // Host side
    // ------------------------------------------------------------------

    /// The service accepted a host connection for this pipe. Returns
    /// `false` when the socket could not be adopted (the pipe then keeps
    /// waiting).
    pub(crate) fn on_host_connection(
        pipe: &Rc<RefCell<AdbGuestPipe>>,
        looper: &mut Looper,
        stream: TcpStream,
    ) -> bool {
        if let Err(e) = stream.set_nonblocking(true) {
            log::warn!("adb pipe: host socket setup failed: {}", e);
            return false;
        }
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("adb pipe: TCP_NODELAY failed: {}", e);
        }
        let weak = Rc::downgrade(pipe);
        let watch = match looper.create_fd_watch(
            stream.as_raw_fd(),
            Box::new(move |lp, w, ev| {
                if let Some(pipe) = weak.upgrade() {
                    AdbGuestPipe::on_host_socket_event(&pipe, lp, w, ev);
                }
            }),
        ) {
            Ok(watch) => watch,
            Err(e) => {
                log::warn!("adb pipe: host socket watch failed: {}", e);
                return false;
            }
        };
        let mut p = pipe.borrow_mut();
        p.host_socket = Some(stream);
        p.watch = Some(watch);
        p.set_reply(b"ok", PipeState::SendingAcceptReplyOk);
        log::debug!("adb pipe: host connected, sending reply");
        (p.wake_signal)(PIPE_WAKE_READ);
        true
    }

    /// Readiness on the host socket: translate to guest wake flags and
    /// de-arm the delivered interests (the guest re-arms them).
    fn on_host_socket_event(
        pipe: &Rc<RefCell<AdbGuestPipe>>,
        looper: &mut Looper,
        watch: FdWatch,
        events: EventSet,
    ) {
        let mut wake = 0;
        if events.contains(EventSet::READ) {
            looper.watch_dont_want_read(watch);
            wake |= PIPE_WAKE_READ;
        }
        if events.contains(EventSet::WRITE) {
            looper.watch_dont_want_write(watch);
            wake |= PIPE_WAKE_WRITE;
        }
        if wake != 0 {
            let p = pipe.borrow();
            (p.wake_signal)(wake);
        }
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    fn set_expected_guest_command(&mut self, command: &[u8], state: PipeState) {
        debug_assert!(command.len() <= MATCH_BUFFER_SIZE);
        self.buffer[..command.len()].copy_from_slice(command);
        self.buffer_size = command.len();
        self.buffer_pos = 0;
        self.state = state;
    }

    fn set_reply(&mut self, reply: &[u8], state: PipeState) {
        debug_assert!(reply.len() <= MATCH_BUFFER_SIZE);
        self.buffer[..reply.len()].copy_from_slice(reply);
        self.buffer_size = reply.len();
        self.buffer_pos = 0;
        self.state = state;
    }

    fn send_command(&mut self, looper: &mut Looper, data: &[u8]) -> Result<usize, PipeError> {
        if data.is_empty() {
            return Ok(0);
        }
        let n = data.len().min(self.buffer_size - self.buffer_pos);
        if data[..n] != self.buffer[self.buffer_pos..self.buffer_pos + n] {
            log::warn!("adb pipe: unexpected guest command, closing");
            self.close_from_host(looper);
            return Err(PipeError::Closed);
        }
        self.buffer_pos += n;
        if self.buffer_pos == self.buffer_size {
            match self.state {
                PipeState::WaitingForGuestAcceptCommand => self.wait_for_host_connection(looper),
                PipeState::WaitingForGuestStartCommand => {
                    log::debug!("adb pipe: proxying started");
                    self.state = PipeState::ProxyingData;
                }
                _ => {}
            }
        }
        Ok(n)
    }

    fn wait_for_host_connection(&mut self, looper: &mut Looper) {
        self.state = PipeState::WaitingForHostAdbConnection;
        log::debug!("adb pipe: waiting for a host connection");
        if let Some(service) = self.service.upgrade() {
            ServiceInner::start_listening(&service, looper);
        }
    }

    fn recv_reply(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.buffer_size - self.buffer_pos);
        buf[..n].copy_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + n]);
        self.buffer_pos += n;
        if self.buffer_pos == self.buffer_size {
            self.set_expected_guest_command(b"start", PipeState::WaitingForGuestStartCommand);
        }
        n
    }

    // ------------------------------------------------------------------
    // Proxying
    // ------------------------------------------------------------------

    fn send_data(&mut self, looper: &mut Looper, data: &[u8]) -> Result<usize, PipeError> {
        let Some(socket) = self.host_socket.as_mut() else {
            return Err(PipeError::Closed);
        };
        let mut total = 0;
        while total < data.len() {
            match socket.write(&data[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if total > 0 {
                        break;
                    }
                    log::debug!("adb pipe: host write failed: {}", e);
                    self.close_from_host(looper);
                    return Err(PipeError::Closed);
                }
            }
        }
        if total == 0 {
            Err(PipeError::Again)
        } else {
            Ok(total)
        }
    }

    fn recv_data(&mut self, looper: &mut Looper, buf: &mut [u8]) -> Result<usize, PipeError> {
        let Some(socket) = self.host_socket.as_mut() else {
            return Err(PipeError::Closed);
        };
        let mut total = 0;
        while total < buf.len() {
            match socket.read(&mut buf[total..]) {
                Ok(0) => {
                    if total > 0 {
                        break;
                    }
                    log::debug!("adb pipe: host closed the connection");
                    self.close_from_host(looper);
                    return Err(PipeError::Closed);
                }
                Ok(n) => total += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if total > 0 {
                        break;
                    }
                    log::debug!("adb pipe: host read failed: {}", e);
                    self.close_from_host(looper);
                    return Err(PipeError::Closed);
                }
            }
        }
        if total == 0 {
            Err(PipeError::Again)
        } else {
            Ok(total)
        }
    }

    fn close_from_host(&mut self, looper: &mut Looper) {
        if let Some(watch) = self.watch.take() {
            looper.delete_watch(watch);
        }
        self.host_socket = None;
        self.state = PipeState::ClosedByHost;
        // A guest blocked on a wake would otherwise never learn the
        // socket is gone.
        (self.wake_signal)(PIPE_WAKE_CLOSED);
    }

    // ------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------

    pub fn on_save(&self, stream: &mut Stream) {
        stream.put_byte(self.state.to_wire());
        stream.write(&self.buffer);
        stream.put_be32(self.buffer_size as u32);
        stream.put_be32(self.buffer_pos as u32);
        stream.put_byte(u8::from(self.host_socket.is_some()));
    }

    /// Restore handshake state. Live sockets are not recreated: a pipe
    /// that was connected goes to `ClosedByHost`, the same outcome the
    /// guest sees when the host vanishes.
    pub fn on_load(&mut self, stream: &mut Stream) -> io::Result<()> {
        let state = PipeState::from_wire(stream.get_byte()?)?;
        stream.read_exact(&mut self.buffer)?;
        let size = stream.get_be32()? as usize;
        let pos = stream.get_be32()? as usize;
        if size > MATCH_BUFFER_SIZE || pos > size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "pipe buffer cursor out of range",
            ));
        }
        let had_socket = stream.get_byte()? != 0;
        self.buffer_size = size;
        self.buffer_pos = pos;
        self.host_socket = None;
        self.watch = None;
        if had_socket {
            self.state = PipeState::ClosedByHost;
            (self.wake_signal)(PIPE_WAKE_CLOSED);
        } else {
            self.state = state;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::Cell;

    fn test_pipe() -> Rc<RefCell<AdbGuestPipe>> {
        AdbGuestPipe::new(Box::new(|_| {}), Weak::new())
    }

    fn pipe_with_wakes() -> (Rc<RefCell<AdbGuestPipe>>, Rc<Cell<u8>>) {
        let wakes = Rc::new(Cell::new(0u8));
        let pipe = AdbGuestPipe::new(
            {
                let wakes = wakes.clone();
                Box::new(move |flags| wakes.set(wakes.get() | flags))
            },
            Weak::new(),
        );
        (pipe, wakes)
    }

    #[test]
    fn test_accept_in_chunks() {
        let mut looper = Looper::new().unwrap();
        let pipe = test_pipe();
        let mut p = pipe.borrow_mut();
        assert_eq!(p.on_guest_send(&mut looper, b"acc"), Ok(3));
        assert_eq!(p.state(), PipeState::WaitingForGuestAcceptCommand);
        assert_eq!(p.on_guest_send(&mut looper, b"ept"), Ok(3));
        assert_eq!(p.state(), PipeState::WaitingForHostAdbConnection);
    }

    #[test]
    fn test_bad_command_closes_pipe() {
        let mut looper = Looper::new().unwrap();
        let (pipe, wakes) = pipe_with_wakes();
        let mut p = pipe.borrow_mut();
        // Case matters.
        assert_eq!(p.on_guest_send(&mut looper, b"ACCEPT"), Err(PipeError::Closed));
        assert_eq!(p.state(), PipeState::ClosedByHost);
        assert_ne!(wakes.get() & PIPE_WAKE_CLOSED, 0);
        assert_eq!(p.on_guest_send(&mut looper, b"accept"), Err(PipeError::Closed));
        assert_eq!(p.on_guest_poll(&looper), PIPE_POLL_HUP);
    }

    #[test]
    fn test_mismatch_after_partial_match_closes() {
        let mut looper = Looper::new().unwrap();
        let pipe = test_pipe();
        let mut p = pipe.borrow_mut();
        assert_eq!(p.on_guest_send(&mut looper, b"acc"), Ok(3));
        assert_eq!(p.on_guest_send(&mut looper, b"xyz"), Err(PipeError::Closed));
        assert_eq!(p.state(), PipeState::ClosedByHost);
    }

    #[test]
    fn test_recv_before_connection_is_again() {
        let mut looper = Looper::new().unwrap();
        let pipe = test_pipe();
        let mut p = pipe.borrow_mut();
        p.on_guest_send(&mut looper, b"accept").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(p.on_guest_recv(&mut looper, &mut buf), Err(PipeError::Again));
        assert_eq!(p.on_guest_poll(&looper), 0);
    }

    #[test]
    fn test_reply_streamed_byte_at_a_time() {
        let mut looper = Looper::new().unwrap();
        let pipe = test_pipe();
        let mut p = pipe.borrow_mut();
        p.on_guest_send(&mut looper, b"accept").unwrap();
        // Simulate the host connection without a socket: only the reply
        // streaming is under test here.
        p.set_reply(b"ok", PipeState::SendingAcceptReplyOk);
        let mut byte = [0u8; 1];
        assert_eq!(p.on_guest_recv(&mut looper, &mut byte), Ok(1));
        assert_eq!(byte[0], b'o');
        assert_eq!(p.on_guest_recv(&mut looper, &mut byte), Ok(1));
        assert_eq!(byte[0], b'k');
        assert_eq!(p.state(), PipeState::WaitingForGuestStartCommand);
        assert_eq!(p.on_guest_send(&mut looper, b"start"), Ok(5));
        assert_eq!(p.state(), PipeState::ProxyingData);
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut looper = Looper::new().unwrap();
        let pipe = test_pipe();
        pipe.borrow_mut().on_guest_send(&mut looper, b"acc").unwrap();

        let mut stream = Stream::new();
        pipe.borrow().on_save(&mut stream);

        let restored = test_pipe();
        let mut stream = Stream::from_bytes(stream.into_bytes());
        restored.borrow_mut().on_load(&mut stream).unwrap();
        let mut r = restored.borrow_mut();
        assert_eq!(r.state(), PipeState::WaitingForGuestAcceptCommand);
        // The match cursor survived: only "ept" remains.
        assert_eq!(r.on_guest_send(&mut looper, b"ept"), Ok(3));
        assert_eq!(r.state(), PipeState::WaitingForHostAdbConnection);
    }

    #[test]
    fn test_load_with_lost_socket_closes_and_wakes() {
        let (pipe, wakes) = pipe_with_wakes();
        let mut p = pipe.borrow_mut();
        p.state = PipeState::ProxyingData;
        // Pretend a socket existed at save time.
        let mut stream = Stream::new();
        stream.put_byte(p.state.to_wire());
        stream.write(&p.buffer);
        stream.put_be32(p.buffer_size as u32);
        stream.put_be32(p.buffer_pos as u32);
        stream.put_byte(1);
        let mut stream = Stream::from_bytes(stream.into_bytes());
        p.on_load(&mut stream).unwrap();
        // A guest blocked on the old socket gets the close signal.
        assert_eq!(p.state(), PipeState::ClosedByHost);
        assert_ne!(wakes.get() & PIPE_WAKE_CLOSED, 0);
    }
}
