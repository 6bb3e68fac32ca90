// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Non-blocking I/O helpers layered on [`Looper`](crate::Looper) fd watches:
//! fixed-size restartable transfers and a loopback TCP listener with a
//! single-admission accept policy.

pub(crate) mod server;
mod transfer;

pub use server::{AsyncSocketServer, LoopbackMode};
pub use transfer::{AsyncReader, AsyncStatus, AsyncWriter};
