// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ADB packet hub: reassembly, routing, and per-connection proxies.
//!
//! Two independent reassembly cursors turn the guest byte stream and the
//! host byte stream into whole [`Apacket`]s; nothing is dispatched until
//! a packet is complete. Complete packets either pass through the send /
//! receive queues untouched or get routed through a registered
//! [`PacketProxy`], which may rewrite connection ids (a host restart
//! hands out fresh ids for connections the guest still addresses by the
//! original ones) and synthesize packets of its own.
//!
//! The guest's `CNXN` reply is cached: after a snapshot load the next
//! host handshake is answered from the cache instead of waking a guest
//! that already believes it is connected.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};

use crate::adb::packet::{Amessage, Apacket, A_CNXN, A_OKAY, A_OPEN, MESSAGE_SIZE};
use crate::adb::{PipeError, PIPE_POLL_IN, PIPE_POLL_OUT, PIPE_WAKE_READ, PIPE_WAKE_WRITE};
use crate::looper::EventSet;
use crate::snapshot::Stream;

/// Read chunk used when draining the host socket.
const READ_CHUNK: usize = 4096;

/// Per-connection packet interceptor.
///
/// Registered under the guest-side connection id once the guest
/// acknowledges an `OPEN`. The hub performs the id rewriting (origin
/// host id <-> current host id) before calling in; the proxy decides
/// forwarding and may queue synthesized packets toward the host.
pub trait PacketProxy {
    fn guest_id(&self) -> u32;
    /// Host id the guest knows this connection by.
    fn origin_host_id(&self) -> u32;
    /// Host id the current host session uses (equals the origin until a
    /// reconnect reassigns it).
    fn current_host_id(&self) -> u32;
    fn set_current_host_id(&mut self, id: u32);
    /// Guest-to-host packet after rewriting. Clear `forward` to swallow
    /// it; push to `to_host` to synthesize traffic.
    fn on_guest_send(
        &mut self,
        mesg: &mut Amessage,
        data: &[u8],
        forward: &mut bool,
        to_host: &mut VecDeque<Apacket>,
    );
    /// Host-to-guest packet after rewriting. For a reused `OPEN`,
    /// `forward` starts out `false` and stays that way.
    fn on_host_recv(
        &mut self,
        mesg: &mut Amessage,
        data: &[u8],
        forward: &mut bool,
        to_host: &mut VecDeque<Apacket>,
    );
    /// Polled after each routed packet; `true` unregisters the proxy.
    fn should_close(&self) -> bool;
}

/// Builds a proxy from the `OPEN` packet and the guest's `OKAY` answer;
/// `None` leaves the connection unproxied.
pub type ProxyFactory = Box<dyn FnMut(&Apacket, &Apacket) -> Option<Box<dyn PacketProxy>>>;

// ============================================================================
// Reassembly / serialization cursors
// ============================================================================

/// Incremental packet reassembly: header first, then exactly
/// `data_length` payload bytes.
#[derive(Default)]
struct Assembler {
    header: [u8; MESSAGE_SIZE],
    header_pos: usize,
    mesg: Option<Amessage>,
    data: Vec<u8>,
}

impl Assembler {
    /// Consume all of `input`, appending completed packets to `out`.
    fn push(&mut self, mut input: &[u8], out: &mut Vec<Apacket>) {
        while !input.is_empty() {
            match self.mesg {
                None => {
                    let n = input.len().min(MESSAGE_SIZE - self.header_pos);
                    self.header[self.header_pos..self.header_pos + n]
                        .copy_from_slice(&input[..n]);
                    self.header_pos += n;
                    input = &input[n..];
                    if self.header_pos == MESSAGE_SIZE {
                        self.header_pos = 0;
                        let mesg = Amessage::decode(&self.header);
                        if !mesg.magic_ok() {
                            log::warn!(
                                "adb hub: header magic mismatch (command {:#x})",
                                mesg.command
                            );
                        }
                        if mesg.data_length == 0 {
                            out.push(Apacket {
                                mesg,
                                data: Vec::new(),
                            });
                        } else {
                            self.data.clear();
                            self.data.reserve(mesg.data_length as usize);
                            self.mesg = Some(mesg);
                        }
                    }
                }
                Some(mesg) => {
                    let need = mesg.data_length as usize - self.data.len();
                    let n = input.len().min(need);
                    self.data.extend_from_slice(&input[..n]);
                    input = &input[n..];
                    if self.data.len() == mesg.data_length as usize {
                        self.mesg = None;
                        out.push(Apacket {
                            mesg,
                            data: std::mem::take(&mut self.data),
                        });
                    }
                }
            }
        }
    }

    fn save(&self, stream: &mut Stream) {
        match self.mesg {
            Some(mesg) => {
                stream.put_byte(1);
                stream.write(&mesg.encode());
                stream.put_blob(&self.data);
            }
            None => {
                stream.put_byte(0);
                stream.put_blob(&self.header[..self.header_pos]);
            }
        }
    }

    fn load(&mut self, stream: &mut Stream) -> io::Result<()> {
        *self = Assembler::default();
        if stream.get_byte()? != 0 {
            let mut header = [0u8; MESSAGE_SIZE];
            stream.read_exact(&mut header)?;
            self.mesg = Some(Amessage::decode(&header));
            self.data = stream.get_blob()?;
        } else {
            let partial = stream.get_blob()?;
            if partial.len() > MESSAGE_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "partial header too long",
                ));
            }
            self.header[..partial.len()].copy_from_slice(&partial);
            self.header_pos = partial.len();
        }
        Ok(())
    }
}

/// Serialization cursor over one packet's wire bytes.
#[derive(Default)]
struct Outgoing {
    bytes: Vec<u8>,
    pos: usize,
}

impl Outgoing {
    fn is_done(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn load(&mut self, packet: &Apacket) {
        self.bytes.clear();
        packet.encode_into(&mut self.bytes);
        self.pos = 0;
    }

    fn remaining(&self) -> &[u8] {
        &self.bytes[self.pos..]
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    fn copy_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.bytes.len() - self.pos);
        out[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
        self.pos += n;
        n
    }
}

// ============================================================================
// Hub
// ============================================================================

/// See module docs.
#[derive(Default)]
pub struct AdbHub {
    guest_assembler: Assembler,
    host_assembler: Assembler,
    /// Whole packets awaiting the host socket.
    send_to_host: VecDeque<Apacket>,
    /// Whole packets awaiting the guest.
    recv_from_host: VecDeque<Apacket>,
    /// Partially written / read packet cursors.
    host_outgoing: Outgoing,
    guest_outgoing: Outgoing,
    /// Guest's CNXN reply, replayed after a snapshot load.
    cnxn: Option<Apacket>,
    should_reconnect: bool,
    /// OPEN packets waiting for the guest's OKAY, keyed by host id.
    pending_connections: HashMap<u32, Apacket>,
    /// Registered proxies keyed by guest id, plus the service-key index
    /// used to recognize a reconnecting host.
    proxies: HashMap<u32, Box<dyn PacketProxy>>,
    proxy_keys: HashMap<String, u32>,
    factory: Option<ProxyFactory>,
}

impl AdbHub {
    pub fn new() -> AdbHub {
        AdbHub::default()
    }

    pub fn set_proxy_factory(&mut self, factory: ProxyFactory) {
        self.factory = Some(factory);
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    // ------------------------------------------------------------------
    // Guest side
    // ------------------------------------------------------------------

    /// Guest wrote `data`. All bytes are consumed; complete packets are
    /// routed immediately.
    pub fn on_guest_send(&mut self, data: &[u8]) -> Result<usize, PipeError> {
        if data.is_empty() {
            return Err(PipeError::Again);
        }
        let mut packets = Vec::new();
        self.guest_assembler.push(data, &mut packets);
        for packet in packets {
            self.handle_guest_packet(packet);
        }
        Ok(data.len())
    }

    /// Fill `buf` with as many queued host-to-guest wire bytes as fit.
    pub fn on_guest_recv(&mut self, buf: &mut [u8]) -> Result<usize, PipeError> {
        let mut total = 0;
        while total < buf.len() {
            if self.guest_outgoing.is_done() {
                match self.recv_from_host.pop_front() {
                    Some(packet) => self.guest_outgoing.load(&packet),
                    None => break,
                }
            }
            total += self.guest_outgoing.copy_into(&mut buf[total..]);
        }
        if total == 0 {
            Err(PipeError::Again)
        } else {
            Ok(total)
        }
    }

    pub fn on_guest_poll(&self) -> u8 {
        let mut flags = PIPE_POLL_OUT;
        if self.guest_pending() {
            flags |= PIPE_POLL_IN;
        }
        flags
    }

    /// Wake flags to raise toward the guest after socket activity.
    pub fn guest_wake_flags(&self) -> u8 {
        let mut flags = PIPE_WAKE_WRITE;
        if self.guest_pending() {
            flags |= PIPE_WAKE_READ;
        }
        flags
    }

    fn guest_pending(&self) -> bool {
        !self.recv_from_host.is_empty() || !self.guest_outgoing.is_done()
    }

    // ------------------------------------------------------------------
    // Host socket side
    // ------------------------------------------------------------------

    pub fn socket_want_read(&self) -> bool {
        true
    }

    pub fn socket_want_write(&self) -> bool {
        !self.host_outgoing.is_done() || !self.send_to_host.is_empty()
    }

    /// Drain readiness events on the host socket.
    pub fn on_host_socket_event<S: Read + Write>(
        &mut self,
        stream: &mut S,
        events: EventSet,
    ) -> Result<(), PipeError> {
        if events.contains(EventSet::READ) {
            self.read_socket(stream)?;
        }
        if events.contains(EventSet::WRITE) {
            self.write_socket(stream)?;
        }
        Ok(())
    }

    /// Read everything available, feeding the host-side assembler.
    pub fn read_socket<R: Read>(&mut self, stream: &mut R) -> Result<(), PipeError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return Err(PipeError::Closed),
                Ok(n) => {
                    let mut packets = Vec::new();
                    self.host_assembler.push(&chunk[..n], &mut packets);
                    for packet in packets {
                        self.handle_host_packet(packet);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::debug!("adb hub: host read failed: {}", e);
                    return Err(PipeError::Closed);
                }
            }
        }
    }

    /// Write queued packets until the socket pushes back.
    pub fn write_socket<W: Write>(&mut self, stream: &mut W) -> Result<(), PipeError> {
        loop {
            if self.host_outgoing.is_done() {
                match self.send_to_host.pop_front() {
                    Some(packet) => self.host_outgoing.load(&packet),
                    None => return Ok(()),
                }
            }
            match stream.write(self.host_outgoing.remaining()) {
                Ok(0) => return Err(PipeError::Closed),
                Ok(n) => self.host_outgoing.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::debug!("adb hub: host write failed: {}", e);
                    return Err(PipeError::Closed);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    fn handle_guest_packet(&mut self, packet: Apacket) {
        match packet.mesg.command {
            A_CNXN => {
                self.cnxn = Some(packet.clone());
                self.send_to_host.push_back(packet);
            }
            A_OKAY if self.pending_connections.contains_key(&packet.mesg.arg1) => {
                if let Some(open) = self.pending_connections.remove(&packet.mesg.arg1) {
                    self.on_new_connection(&open, &packet);
                }
                self.send_to_host.push_back(packet);
            }
            _ => {
                let guest_id = packet.mesg.arg0;
                if let Some(proxy) = self.proxies.get_mut(&guest_id) {
                    let mut mesg = packet.mesg;
                    if mesg.arg1 == proxy.origin_host_id() {
                        mesg.arg1 = proxy.current_host_id();
                    }
                    let mut forward = true;
                    proxy.on_guest_send(&mut mesg, &packet.data, &mut forward, &mut self.send_to_host);
                    let close = proxy.should_close();
                    if forward {
                        self.send_to_host.push_back(Apacket {
                            mesg,
                            data: packet.data,
                        });
                    }
                    if close {
                        self.remove_proxy(guest_id);
                    }
                } else {
                    self.send_to_host.push_back(packet);
                }
            }
        }
    }

    fn handle_host_packet(&mut self, packet: Apacket) {
        match packet.mesg.command {
            A_CNXN => {
                if self.should_reconnect {
                    // The guest already holds a session; answer the new
                    // host from the cache instead of waking the guest.
                    self.should_reconnect = false;
                    if let Some(cnxn) = self.cnxn.clone() {
                        log::debug!("adb hub: replaying cached connection reply");
                        self.send_to_host.push_back(cnxn);
                    }
                } else {
                    self.recv_from_host.push_back(packet);
                }
            }
            A_OPEN => {
                let key = service_key(&packet.data);
                if let Some(&guest_id) = self.proxy_keys.get(&key) {
                    if let Some(proxy) = self.proxies.get_mut(&guest_id) {
                        log::debug!("adb hub: reusing proxy for service {:?}", key);
                        proxy.set_current_host_id(packet.mesg.arg0);
                        let mut mesg = packet.mesg;
                        let mut forward = false;
                        proxy.on_host_recv(
                            &mut mesg,
                            &packet.data,
                            &mut forward,
                            &mut self.send_to_host,
                        );
                        if proxy.should_close() {
                            self.remove_proxy(guest_id);
                        }
                        return;
                    }
                }
                self.pending_connections
                    .insert(packet.mesg.arg0, packet.clone());
                self.recv_from_host.push_back(packet);
            }
            _ => {
                let guest_id = packet.mesg.arg1;
                if let Some(proxy) = self.proxies.get_mut(&guest_id) {
                    let mut mesg = packet.mesg;
                    if mesg.arg0 == proxy.current_host_id() {
                        mesg.arg0 = proxy.origin_host_id();
                    }
                    let mut forward = true;
                    proxy.on_host_recv(&mut mesg, &packet.data, &mut forward, &mut self.send_to_host);
                    let close = proxy.should_close();
                    if forward {
                        self.recv_from_host.push_back(Apacket {
                            mesg,
                            data: packet.data,
                        });
                    }
                    if close {
                        self.remove_proxy(guest_id);
                    }
                } else {
                    self.recv_from_host.push_back(packet);
                }
            }
        }
    }

    fn on_new_connection(&mut self, open: &Apacket, okay: &Apacket) {
        if open.mesg.command != A_OPEN
            || okay.mesg.command != A_OKAY
            || open.mesg.arg0 != okay.mesg.arg1
        {
            log::warn!("adb hub: inconsistent connection packets");
            return;
        }
        let Some(factory) = self.factory.as_mut() else {
            return;
        };
        if let Some(proxy) = factory(open, okay) {
            let guest_id = okay.mesg.arg0;
            let key = service_key(&open.data);
            log::debug!("adb hub: proxy registered for service {:?}", key);
            self.proxy_keys.insert(key, guest_id);
            self.proxies.insert(guest_id, proxy);
        }
    }

    fn remove_proxy(&mut self, guest_id: u32) {
        self.proxies.remove(&guest_id);
        self.proxy_keys.retain(|_, id| *id != guest_id);
    }

    // ------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------

    /// Proxies are rebuilt from live traffic after a load and are not
    /// persisted.
    pub fn on_save(&self, stream: &mut Stream) {
        match &self.cnxn {
            Some(packet) => {
                stream.put_byte(1);
                save_packet(stream, packet);
            }
            None => stream.put_byte(0),
        }
        save_queue(stream, &self.send_to_host);
        save_queue(stream, &self.recv_from_host);
        stream.put_blob(self.host_outgoing.remaining());
        stream.put_blob(self.guest_outgoing.remaining());
        self.guest_assembler.save(stream);
        self.host_assembler.save(stream);
    }

    pub fn on_load(&mut self, stream: &mut Stream) -> io::Result<()> {
        self.cnxn = if stream.get_byte()? != 0 {
            Some(load_packet(stream)?)
        } else {
            None
        };
        self.send_to_host = load_queue(stream)?;
        self.recv_from_host = load_queue(stream)?;
        self.host_outgoing = Outgoing {
            bytes: stream.get_blob()?,
            pos: 0,
        };
        self.guest_outgoing = Outgoing {
            bytes: stream.get_blob()?,
            pos: 0,
        };
        self.guest_assembler.load(stream)?;
        self.host_assembler.load(stream)?;
        // The host process reconnects after a load; greet it from the
        // cache if we ever completed a handshake.
        self.should_reconnect = self.cnxn.is_some();
        Ok(())
    }
}

fn service_key(data: &[u8]) -> String {
    let trimmed = data.split(|&b| b == 0).next().unwrap_or(data);
    String::from_utf8_lossy(trimmed).into_owned()
}

fn save_packet(stream: &mut Stream, packet: &Apacket) {
    stream.write(&packet.mesg.encode());
    stream.put_blob(&packet.data);
}

fn load_packet(stream: &mut Stream) -> io::Result<Apacket> {
    let mut header = [0u8; MESSAGE_SIZE];
    stream.read_exact(&mut header)?;
    let mesg = Amessage::decode(&header);
    let data = stream.get_blob()?;
    if data.len() != mesg.data_length as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "packet payload length mismatch",
        ));
    }
    Ok(Apacket { mesg, data })
}

fn save_queue(stream: &mut Stream, queue: &VecDeque<Apacket>) {
    stream.put_be32(queue.len() as u32);
    for packet in queue {
        save_packet(stream, packet);
    }
}

fn load_queue(stream: &mut Stream) -> io::Result<VecDeque<Apacket>> {
    let count = stream.get_be32()? as usize;
    let mut queue = VecDeque::with_capacity(count.min(1024));
    for _ in 0..count {
        queue.push_back(load_packet(stream)?);
    }
    Ok(queue)
}
