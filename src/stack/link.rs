// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{fail::Fail, memory::Packet};
use ::parking_lot::Mutex;
use ::std::collections::VecDeque;

//======================================================================================================================
// Traits
//======================================================================================================================

/// The router's transmit seam. The transport hands every outbound packet
/// (data, control, and retransmissions) to this interface and transfers
/// ownership with it. Implementations must be callable while the transport
/// token is held, so they must not re-enter the transport.
pub trait SendDirect: Send + Sync {
    fn send_direct(&self, packet: Packet) -> Result<(), Fail>;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// A link that parks outbound frames in a queue for a driver loop (or a
/// test harness) to collect and deliver. This is the in-memory analogue of
/// a loopback interface: transmission never fails, delivery is whoever
/// drains the queue.
pub struct BufferedLink {
    frames: Mutex<VecDeque<Packet>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl BufferedLink {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
        }
    }

    /// Takes the oldest transmitted frame, if any.
    pub fn pop_frame(&self) -> Option<Packet> {
        self.frames.lock().pop_front()
    }

    /// Takes every transmitted frame in transmission order.
    pub fn pop_all_frames(&self) -> VecDeque<Packet> {
        std::mem::take(&mut *self.frames.lock())
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for BufferedLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SendDirect for BufferedLink {
    fn send_direct(&self, packet: Packet) -> Result<(), Fail> {
        trace!("send_direct(): id={:?} len={}", packet.id, packet.len());
        self.frames.lock().push_back(packet);
        Ok(())
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
