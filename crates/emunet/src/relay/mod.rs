// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer-to-peer byte forwarding: the relay wire framing, the transmit ring
//! it is staged through, and the auto-reconnecting [`ForwardPeer`] that
//! ties both to a private reactor thread.

pub mod header;
pub mod peer;
pub mod ring;

pub use header::{parse_frames, ForwardHeader, FrameType};
pub use peer::ForwardPeer;
pub use ring::ByteRing;
