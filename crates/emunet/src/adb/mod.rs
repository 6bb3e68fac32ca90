// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ADB bridge between a guest pipe channel and a host TCP server.
//!
//! [`AdbGuestPipe`] is the per-pipe state machine handling the
//! `"accept"` / `"ok"` / `"start"` handshake and the proxying phase;
//! [`AdbPipeService`] is the registry handing host connections to waiting
//! pipes; [`AdbHub`] reassembles the byte stream into ADB packets and
//! routes them through per-connection proxies.

pub mod hub;
pub mod packet;
pub mod pipe;
pub mod service;

pub use hub::{AdbHub, PacketProxy, ProxyFactory};
pub use packet::{Amessage, Apacket};
pub use pipe::{AdbGuestPipe, PipeState};
pub use service::AdbPipeService;

/// Reduced error vocabulary of the guest-facing pipe operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipeError {
    /// Nothing to do right now; retry after the next wake.
    Again,
    /// The pipe is finished; no operation will ever succeed again.
    Closed,
}

/// Guest poll flags.
pub const PIPE_POLL_IN: u8 = 1;
pub const PIPE_POLL_OUT: u8 = 2;
pub const PIPE_POLL_HUP: u8 = 4;

/// Guest wake flags.
pub const PIPE_WAKE_CLOSED: u8 = 1;
pub const PIPE_WAKE_READ: u8 = 2;
pub const PIPE_WAKE_WRITE: u8 = 4;
