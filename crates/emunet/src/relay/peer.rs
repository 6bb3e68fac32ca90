// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Auto-reconnecting byte forwarder between two emulator instances.
//!
//! A [`ForwardPeer`] owns a dedicated thread running a private
//! [`Looper`]. The caller-facing surface is two thread-safe entry points:
//! [`ForwardPeer::queue`] (push bytes into the mutex-guarded transmit
//! ring, then write the wake pipe) and `Drop` (clear the running flag,
//! wake, join). Everything else — connecting, retrying, draining the
//! ring, delivering received bytes — happens on the peer thread.
//!
//! ```text
//!  caller threads                 peer thread
//!  --------------                 -----------------------------------
//!  queue(bytes) --push--> [ring] --drain--> socket --> remote peer
//!               --wake--> [pipe] --watch--> Looper
//!                                 deliver(&[u8]) <-- socket reads
//! ```
//!
//! The client role retries a failed or dropped connection every 5000 ms;
//! the server role re-opens its listener 15000 ms after losing a peer.
//! Transmit cursors are reset on every disconnect, so bytes queued but
//! not yet written do not survive a reconnect.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use std::cell::RefCell;

use parking_lot::Mutex;

use crate::aio::server::bind_loopback;
use crate::looper::wake::{wake_pair, WakeReceiver, WakeSender};
use crate::looper::{EventSet, FdWatch, Looper, Timer};
use crate::relay::ring::ByteRing;
use crate::AsyncSocketServer;

/// Transmit ring size (usable capacity is one byte less).
pub const TX_RING_CAPACITY: usize = 256 * 1024;
/// Fixed receive buffer size.
const RECV_BUFFER_SIZE: usize = 64 * 1024;
/// Client reconnect interval.
const CLIENT_RETRY_MS: u64 = 5000;
/// Server re-listen interval after losing its peer.
const SERVER_RETRY_MS: u64 = 15_000;
/// Largest chunk copied out of the ring per write attempt.
const DRAIN_CHUNK: usize = 4096;

/// Receives bytes read from the remote peer; returns how many it
/// consumed. The unconsumed tail is retained and offered again.
pub type DeliverCallback = Box<dyn FnMut(&[u8]) -> usize + Send>;

struct Shared {
    ring: Mutex<ByteRing>,
    running: AtomicBool,
}

/// Handle to a relay peer. Dropping it shuts the peer thread down.
pub struct ForwardPeer {
    shared: Arc<Shared>,
    wake: WakeSender,
    port: u16,
    thread: Option<JoinHandle<()>>,
}

impl ForwardPeer {
    /// Connect to a remote peer, retrying every 5000 ms until it appears.
    pub fn client(addr: SocketAddr, deliver: DeliverCallback) -> io::Result<ForwardPeer> {
        Self::spawn(Role::Client(addr), None, addr.port(), deliver)
    }

    /// Listen on a loopback port (0 picks one) for a remote peer.
    pub fn server(port: u16, deliver: DeliverCallback) -> io::Result<ForwardPeer> {
        // Bind here so `port()` is valid before the thread starts.
        let listener = bind_loopback(port, false)?;
        let port = listener.local_addr()?.port();
        Self::spawn(Role::Server, Some(listener), port, deliver)
    }

    /// Port this peer connects to (client) or listens on (server).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Queue bytes for transmission. Never blocks; returns how many were
    /// accepted (less than `data.len()` when the ring is full). Any
    /// accepted byte wakes the peer thread.
    pub fn queue(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let accepted = self.shared.ring.lock().push(data);
        if accepted > 0 {
            self.wake.wake();
        }
        if accepted < data.len() {
            log::debug!(
                "relay peer: transmit ring full, dropped {} bytes",
                data.len() - accepted
            );
        }
        accepted
    }

    fn spawn(
        role: Role,
        listener: Option<TcpListener>,
        port: u16,
        deliver: DeliverCallback,
    ) -> io::Result<ForwardPeer> {
        let shared = Arc::new(Shared {
            ring: Mutex::new(ByteRing::new(TX_RING_CAPACITY)),
            running: AtomicBool::new(true),
        });
        let (wake, receiver) = wake_pair()?;
        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("relay-peer".into())
            .spawn(move || {
                if let Err(e) = run_worker(thread_shared, receiver, role, listener, deliver) {
                    log::error!("relay peer thread failed: {}", e);
                }
            })?;
        Ok(ForwardPeer {
            shared,
            wake,
            port,
            thread: Some(thread),
        })
    }
}

impl Drop for ForwardPeer {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.wake.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ============================================================================
// Peer thread
// ============================================================================

#[derive(Clone, Copy)]
enum Role {
    Client(SocketAddr),
    Server,
}

struct Connection {
    stream: TcpStream,
    watch: FdWatch,
    /// Non-blocking connect still in flight; resolved on writability.
    connecting: bool,
}

struct PeerWorker {
    shared: Arc<Shared>,
    deliver: DeliverCallback,
    role: Role,
    conn: Option<Connection>,
    server: Option<AsyncSocketServer>,
    retry_timer: Option<Timer>,
    recv_buf: Vec<u8>,
    recv_len: usize,
}

fn run_worker(
    shared: Arc<Shared>,
    mut receiver: WakeReceiver,
    role: Role,
    listener: Option<TcpListener>,
    deliver: DeliverCallback,
) -> io::Result<()> {
    let mut looper = Looper::new()?;
    let worker = Rc::new(RefCell::new(PeerWorker {
        shared,
        deliver,
        role,
        conn: None,
        server: None,
        retry_timer: None,
        recv_buf: vec![0u8; RECV_BUFFER_SIZE],
        recv_len: 0,
    }));

    // Wake pipe: queue() notifications and the shutdown signal.
    let wake_fd = receiver.as_raw_fd();
    let weak = Rc::downgrade(&worker);
    let wake_watch = looper.create_fd_watch(
        wake_fd,
        Box::new(move |lp, _w, _ev| {
            receiver.drain();
            let Some(worker) = weak.upgrade() else {
                return;
            };
            if !worker.borrow().shared.running.load(Ordering::SeqCst) {
                lp.force_quit();
                return;
            }
            PeerWorker::drain_tx(&worker, lp);
        }),
    )?;
    looper.watch_want_read(wake_watch);

    if let Some(listener) = listener {
        let weak = Rc::downgrade(&worker);
        let server = AsyncSocketServer::from_listener(
            listener,
            Box::new(move |lp, stream| {
                let Some(worker) = weak.upgrade() else {
                    return false;
                };
                PeerWorker::adopt(&worker, lp, stream)
            }),
            &mut looper,
        )?;
        worker.borrow_mut().server = Some(server);
    }

    PeerWorker::start(&worker, &mut looper);
    looper.run();
    Ok(())
}

impl PeerWorker {
    /// (Re)start the connection attempt appropriate for the role.
    fn start(worker: &Rc<RefCell<PeerWorker>>, looper: &mut Looper) {
        let role = worker.borrow().role;
        match role {
            Role::Client(addr) => Self::attempt_connect(worker, looper, addr),
            Role::Server => {
                let server = worker.borrow().server.clone();
                if let Some(server) = server {
                    log::debug!("relay peer: listening for a peer");
                    server.start_listening(looper);
                }
            }
        }
    }

    fn attempt_connect(worker: &Rc<RefCell<PeerWorker>>, looper: &mut Looper, addr: SocketAddr) {
        match start_nonblocking_connect(addr) {
            Ok((stream, connecting)) => {
                let weak = Rc::downgrade(worker);
                let watch = match looper.create_fd_watch(
                    stream.as_raw_fd(),
                    Box::new(move |lp, _w, ev| {
                        if let Some(worker) = weak.upgrade() {
                            PeerWorker::on_socket_event(&worker, lp, ev);
                        }
                    }),
                ) {
                    Ok(watch) => watch,
                    Err(e) => {
                        log::warn!("relay peer: watch setup failed: {}", e);
                        Self::schedule_retry(worker, looper, CLIENT_RETRY_MS);
                        return;
                    }
                };
                worker.borrow_mut().conn = Some(Connection {
                    stream,
                    watch,
                    connecting,
                });
                if connecting {
                    looper.watch_want_write(watch);
                } else {
                    Self::on_connected(worker, looper);
                }
            }
            Err(e) => {
                log::debug!("relay peer: connect to {} failed: {}", addr, e);
                Self::schedule_retry(worker, looper, CLIENT_RETRY_MS);
            }
        }
    }

    /// Server-side admission. At most one peer at a time.
    fn adopt(worker: &Rc<RefCell<PeerWorker>>, looper: &mut Looper, stream: TcpStream) -> bool {
        if worker.borrow().conn.is_some() {
            log::warn!("relay peer: rejecting second connection");
            return false;
        }
        if let Err(e) = stream.set_nonblocking(true) {
            log::warn!("relay peer: accepted socket setup failed: {}", e);
            return false;
        }
        let weak = Rc::downgrade(worker);
        let watch = match looper.create_fd_watch(
            stream.as_raw_fd(),
            Box::new(move |lp, _w, ev| {
                if let Some(worker) = weak.upgrade() {
                    PeerWorker::on_socket_event(&worker, lp, ev);
                }
            }),
        ) {
            Ok(watch) => watch,
            Err(e) => {
                log::warn!("relay peer: watch setup failed: {}", e);
                return false;
            }
        };
        worker.borrow_mut().conn = Some(Connection {
            stream,
            watch,
            connecting: false,
        });
        Self::on_connected(worker, looper);
        true
    }

    fn on_socket_event(worker: &Rc<RefCell<PeerWorker>>, looper: &mut Looper, events: EventSet) {
        let connecting = worker.borrow().conn.as_ref().is_some_and(|c| c.connecting);
        if connecting {
            if events.contains(EventSet::WRITE) {
                Self::finish_connect(worker, looper);
            }
            return;
        }
        if events.contains(EventSet::READ) && !Self::handle_readable(worker, looper) {
            return;
        }
        if events.contains(EventSet::WRITE) {
            Self::drain_tx(worker, looper);
        }
    }

    fn finish_connect(worker: &Rc<RefCell<PeerWorker>>, looper: &mut Looper) {
        let established = {
            let guard = worker.borrow();
            let Some(conn) = guard.conn.as_ref() else {
                return;
            };
            match conn.stream.take_error() {
                Ok(None) => true,
                Ok(Some(e)) => {
                    log::debug!("relay peer: connect failed: {}", e);
                    false
                }
                Err(e) => {
                    log::debug!("relay peer: connect status check failed: {}", e);
                    false
                }
            }
        };
        if established {
            {
                let mut guard = worker.borrow_mut();
                if let Some(conn) = guard.conn.as_mut() {
                    conn.connecting = false;
                }
                let watch = guard.conn.as_ref().map(|c| c.watch);
                drop(guard);
                if let Some(watch) = watch {
                    looper.watch_dont_want_write(watch);
                }
            }
            Self::on_connected(worker, looper);
        } else {
            Self::disconnect(worker, looper);
        }
    }

    fn on_connected(worker: &Rc<RefCell<PeerWorker>>, looper: &mut Looper) {
        let watch = {
            let guard = worker.borrow();
            let Some(conn) = guard.conn.as_ref() else {
                return;
            };
            if let Err(e) = conn.stream.set_nodelay(true) {
                log::debug!("relay peer: TCP_NODELAY failed: {}", e);
            }
            conn.watch
        };
        log::info!("relay peer: connected");
        looper.watch_want_read(watch);
        // Bytes may have been queued while we were connecting.
        Self::drain_tx(worker, looper);
    }

    /// Read everything the socket has, delivering as we go. Returns
    /// `false` when the connection died.
    fn handle_readable(worker: &Rc<RefCell<PeerWorker>>, looper: &mut Looper) -> bool {
        loop {
            let mut failed = false;
            {
                let mut guard = worker.borrow_mut();
                let w = &mut *guard;
                let Some(conn) = w.conn.as_mut() else {
                    return false;
                };
                if w.recv_len == w.recv_buf.len() {
                    // Full buffer: offer the retained tail once more.
                    let consumed = (w.deliver)(&w.recv_buf[..w.recv_len]).min(w.recv_len);
                    if consumed > 0 {
                        w.recv_buf.copy_within(consumed..w.recv_len, 0);
                        w.recv_len -= consumed;
                        continue;
                    }
                    // Consumer is stuck: incoming bytes are read off the
                    // socket and dropped.
                    let mut scratch = [0u8; DRAIN_CHUNK];
                    match conn.stream.read(&mut scratch) {
                        Ok(0) => failed = true,
                        Ok(n) => {
                            log::warn!("relay peer: receive buffer full, dropping {} bytes", n);
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            log::debug!("relay peer: read failed: {}", e);
                            failed = true;
                        }
                    }
                } else {
                    let len = w.recv_len;
                    match conn.stream.read(&mut w.recv_buf[len..]) {
                        Ok(0) => failed = true,
                        Ok(n) => {
                            w.recv_len += n;
                            let consumed = (w.deliver)(&w.recv_buf[..w.recv_len]);
                            let consumed = consumed.min(w.recv_len);
                            if consumed > 0 {
                                w.recv_buf.copy_within(consumed..w.recv_len, 0);
                                w.recv_len -= consumed;
                            }
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            log::debug!("relay peer: read failed: {}", e);
                            failed = true;
                        }
                    }
                }
            }
            if failed {
                Self::disconnect(worker, looper);
                return false;
            }
        }
    }

    /// Move bytes from the ring to the socket until the ring empties or
    /// the socket pushes back. Called directly on wake: with the socket
    /// already writable, no readiness event would arrive.
    fn drain_tx(worker: &Rc<RefCell<PeerWorker>>, looper: &mut Looper) {
        loop {
            let mut failed = false;
            {
                let mut guard = worker.borrow_mut();
                let w = &mut *guard;
                let Some(conn) = w.conn.as_mut() else {
                    return;
                };
                if conn.connecting {
                    return;
                }
                let mut chunk = [0u8; DRAIN_CHUNK];
                let n = {
                    let ring = w.shared.ring.lock();
                    let src = ring.peek();
                    let n = src.len().min(DRAIN_CHUNK);
                    chunk[..n].copy_from_slice(&src[..n]);
                    n
                };
                if n == 0 {
                    looper.watch_dont_want_write(conn.watch);
                    return;
                }
                // The ring lock is not held across the write.
                match conn.stream.write(&chunk[..n]) {
                    Ok(written) => {
                        w.shared.ring.lock().consume(written);
                        if written < n {
                            looper.watch_want_write(conn.watch);
                            return;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        looper.watch_want_write(conn.watch);
                        return;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        log::debug!("relay peer: write failed: {}", e);
                        failed = true;
                    }
                }
            }
            if failed {
                Self::disconnect(worker, looper);
                return;
            }
        }
    }

    /// Drop the connection, reset both directions, and schedule the
    /// role-appropriate restart.
    fn disconnect(worker: &Rc<RefCell<PeerWorker>>, looper: &mut Looper) {
        let (conn, retry_ms) = {
            let mut guard = worker.borrow_mut();
            let conn = guard.conn.take();
            guard.recv_len = 0;
            guard.shared.ring.lock().clear();
            let retry_ms = match guard.role {
                Role::Client(_) => CLIENT_RETRY_MS,
                Role::Server => SERVER_RETRY_MS,
            };
            (conn, retry_ms)
        };
        if let Some(conn) = conn {
            looper.delete_watch(conn.watch);
            drop(conn.stream);
        }
        log::info!("relay peer: disconnected, restarting in {} ms", retry_ms);
        Self::schedule_retry(worker, looper, retry_ms);
    }

    fn schedule_retry(worker: &Rc<RefCell<PeerWorker>>, looper: &mut Looper, ms: u64) {
        let timer = worker.borrow().retry_timer;
        let timer = match timer {
            Some(timer) => timer,
            None => {
                let weak = Rc::downgrade(worker);
                let timer = looper.create_timer(Box::new(move |lp, _t| {
                    if let Some(worker) = weak.upgrade() {
                        PeerWorker::start(&worker, lp);
                    }
                }));
                worker.borrow_mut().retry_timer = Some(timer);
                timer
            }
        };
        looper.timer_start_relative(timer, ms);
    }
}

fn start_nonblocking_connect(addr: SocketAddr) -> io::Result<(TcpStream, bool)> {
    use socket2::{Domain, Protocol, Socket, Type};
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => Ok((socket.into(), false)),
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok((socket.into(), true)),
        Err(e) => Err(e),
    }
}
