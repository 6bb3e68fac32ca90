// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # EMUNET - Event-driven I/O core for emulator guest/host networking
//!
//! A single-threaded reactor ("looper") multiplexing socket readiness and
//! timers, plus the protocol state machines built on top of it: the
//! ADB-over-pipe guest/host bridge and the WiFi-forwarding datagram relay.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                       Protocol state machines                       |
//! |   AdbGuestPipe (6-state bridge) | AdbHub (packet reassembly/proxy)  |
//! |   ForwardPeer (framed relay over auto-reconnecting TCP)             |
//! +---------------------------------------------------------------------+
//! |                            I/O helpers                              |
//! |   AsyncReader/AsyncWriter | AsyncSocketServer (loopback listener)   |
//! +---------------------------------------------------------------------+
//! |                          Reactor (Looper)                           |
//! |   FdWatch (readiness) | Timer (deadlines) | WakePipe (cross-thread) |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Looper`] | Single-threaded event loop: fd watches, timers, `force_quit` |
//! | [`AsyncSocketServer`] | Loopback TCP listener with single-admission accept |
//! | [`ForwardPeer`] | Peer-to-peer byte forwarder with a ring-buffered TX path |
//! | [`AdbGuestPipe`](adb::AdbGuestPipe) | Guest channel to host TCP bridge |
//! | [`AdbHub`](adb::AdbHub) | Length-prefixed ADB packet hub with proxies |
//!
//! This crate is a library consumed by a host process; it has no CLI
//! surface. All reactor callbacks run on the thread driving the looper;
//! the only cross-thread entry points are [`ForwardPeer::queue`] and the
//! wake pipe it is built on. Unix only.

/// ADB bridge: guest-pipe state machine, packet hub, pipe service registry.
pub mod adb;
/// Non-blocking transfer helpers and the loopback socket listener.
pub mod aio;
/// Single-threaded reactor: fd watches, timers, wake pipe.
pub mod looper;
/// Peer-to-peer forwarding: wire framing, ring buffer, reconnecting peer.
pub mod relay;
/// Opaque save/load byte stream for snapshot support.
pub mod snapshot;

pub use aio::{AsyncReader, AsyncSocketServer, AsyncStatus, AsyncWriter, LoopbackMode};
pub use looper::{EventSet, ExitReason, FdWatch, Looper, Timer};
pub use relay::ForwardPeer;
