// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

//! Reliable datagram transport core for a small cubesat network stack.
//!
//! The crate implements a connection-oriented, reliable, ordered transport
//! (RDP) on top of an unreliable datagram router: three-way handshake,
//! sequence/ack numbering, sliding-window retransmission, selective
//! acknowledgements, and RST-based teardown. Everything that surrounds the
//! transport (link drivers, routing, fragmentation) is reached through the
//! narrow seams in [`stack`].

#[macro_use]
extern crate log;

pub mod rdp;
pub mod runtime;
pub mod stack;

pub use crate::{
    rdp::{CloseOutcome, ConnInfo, RdpStack},
    runtime::{
        fail::Fail,
        memory::{Packet, PacketId},
    },
    stack::{
        conn::{ConnHandle, ConnReceiver, ListenSocket},
        link::{BufferedLink, SendDirect},
    },
};
