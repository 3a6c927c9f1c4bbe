// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    rdp::{params::RdpParams, seq::SeqNumber},
    runtime::{fail::Fail, memory::Packet},
};
use ::std::collections::VecDeque;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Absolute cap on parked retransmission copies, independent of the
/// negotiated window.
pub const RDP_MAX_WINDOW: usize = 5;

/// Absolute cap on buffered out-of-order packets.
pub const RDP_MAX_RX_QUEUE: usize = 2 * RDP_MAX_WINDOW;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Open,
    CloseWait,
}

/// A parked copy of an outbound packet (transport header included) awaiting
/// acknowledgement, stamped with its enqueue time.
pub struct TxEntry {
    pub packet: Packet,
    pub timestamp_ms: u64,
}

/// Per-connection transport state.
///
/// This struct has only public members because it holds state for both the
/// send and the receive path and is accessed by both. Every access happens
/// under the stack token.
pub struct RdpControlBlock {
    pub state: State,

    //
    // Send sequence space:
    //
    //            snd_una                  snd_nxt
    //               v                        v
    // ... ----------|------------------------|-------------------------------
    //  acknowledged |      in flight         |  future sequence number space
    //
    /// Initial send sequence number, fixed at handshake time.
    pub snd_iss: SeqNumber,
    /// Next sequence number to assign.
    pub snd_nxt: SeqNumber,
    /// Smallest unacknowledged sequence number.
    pub snd_una: SeqNumber,

    /// Peer's initial sequence number.
    pub rcv_irs: SeqNumber,
    /// Highest in-order sequence number delivered to the application.
    pub rcv_cur: SeqNumber,
    /// Last sequence number acknowledged to the peer by a control-plane ack.
    pub rcv_lsa: SeqNumber,

    /// Negotiated parameters; the passive side adopts these from the SYN.
    pub params: RdpParams,

    /// When the last control-plane ack left, for delayed-ack aging.
    pub ack_timestamp_ms: u64,
    /// When the connection entered its current lifecycle phase, for the
    /// connection-idle and CLOSE_WAIT linger timeouts.
    pub open_timestamp_ms: u64,

    /// Retransmission queue: parked copies of unacknowledged packets in
    /// transmission order.
    pub tx_queue: VecDeque<TxEntry>,
    /// Reorder buffer: out-of-order packets keyed by sequence number,
    /// de-duplicated on insert, awaiting in-order delivery.
    pub rx_queue: VecDeque<(SeqNumber, Packet)>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl RdpControlBlock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            state: State::Closed,
            snd_iss: SeqNumber::default(),
            snd_nxt: SeqNumber::default(),
            snd_una: SeqNumber::default(),
            rcv_irs: SeqNumber::default(),
            rcv_cur: SeqNumber::default(),
            rcv_lsa: SeqNumber::default(),
            params: RdpParams::default(),
            ack_timestamp_ms: now_ms,
            open_timestamp_ms: now_ms,
            tx_queue: VecDeque::with_capacity(RDP_MAX_WINDOW),
            rx_queue: VecDeque::with_capacity(RDP_MAX_RX_QUEUE),
        }
    }

    /// Unacknowledged packets in flight (`snd_nxt - snd_una`).
    pub fn in_flight(&self) -> u16 {
        self.snd_nxt - self.snd_una
    }

    /// Parks a retransmission copy.
    pub fn park(&mut self, entry: TxEntry) -> Result<(), Fail> {
        if self.tx_queue.len() >= RDP_MAX_WINDOW {
            return Err(Fail::new(libc::ENOBUFS, "no space in retransmission queue"));
        }
        self.tx_queue.push_back(entry);
        Ok(())
    }

    /// Drops every parked copy whose sequence number has been acknowledged.
    pub fn prune_acked(&mut self) {
        let snd_una: SeqNumber = self.snd_una;
        self.tx_queue.retain(|entry| {
            match crate::rdp::header::peek(&entry.packet) {
                Ok(header) if header.seq_nr < snd_una => {
                    debug!("prune_acked(): seq {} acknowledged, freeing copy", header.seq_nr);
                    false
                },
                _ => true,
            }
        });
    }

    pub fn rx_contains(&self, seq_nr: SeqNumber) -> bool {
        self.rx_queue.iter().any(|(seq, _)| *seq == seq_nr)
    }

    /// Buffers an out-of-order packet unless its sequence number is already
    /// present or the buffer is full.
    pub fn rx_insert(&mut self, seq_nr: SeqNumber, packet: Packet) -> Result<(), Fail> {
        if self.rx_contains(seq_nr) {
            return Err(Fail::new(libc::EEXIST, "duplicate sequence number"));
        }
        if self.rx_queue.len() >= RDP_MAX_RX_QUEUE {
            return Err(Fail::new(libc::ENOBUFS, "reorder buffer full"));
        }
        self.rx_queue.push_back((seq_nr, packet));
        Ok(())
    }

    /// Sequence numbers currently buffered out of order, one entry each, in
    /// buffer order.
    pub fn rx_seqs(&self) -> Vec<SeqNumber> {
        self.rx_queue.iter().map(|(seq, _)| *seq).collect()
    }

    /// Removes and returns the packet that continues the in-order stream
    /// (`rcv_cur + 1`), if buffered. Each call rescans the buffer, so a
    /// delivery loop restarts from the top after every advance.
    pub fn rx_take_next(&mut self) -> Option<Packet> {
        let wanted: SeqNumber = self.rcv_cur + 1;
        let index: usize = self.rx_queue.iter().position(|(seq, _)| *seq == wanted)?;
        self.rx_queue.remove(index).map(|(_, packet)| packet)
    }

    /// Drops every parked copy and every buffered out-of-order packet.
    pub fn flush_all(&mut self) {
        for entry in self.tx_queue.drain(..) {
            trace!("flush_all(): clear tx element, time {}", entry.timestamp_ms);
        }
        for (seq, _) in self.rx_queue.drain(..) {
            trace!("flush_all(): clear rx element, seq {}", seq);
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
