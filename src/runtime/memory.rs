// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::fmt;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Hard cap on a packet's byte content, transport header included. Mirrors
/// the fixed-size buffers handed out by the flight-side packet pool.
pub const MAX_PACKET_SIZE: usize = 256;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Addressing tuple stamped on every packet: source and destination node
/// plus source and destination port. A connection is identified by the
/// tuple of its outbound direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PacketId {
    pub src: u8,
    pub dst: u8,
    pub sport: u8,
    pub dport: u8,
}

/// An owned datagram: addressing tuple plus byte content. The transport
/// appends its header at the tail of the content, so `data` always holds
/// `payload ++ header` once stamped.
///
/// Ownership is the allocator contract: a packet is single-owner at every
/// instant, handing it to the router transfers it, and dropping it frees it.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: PacketId,
    data: Vec<u8>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl PacketId {
    pub fn new(src: u8, dst: u8, sport: u8, dport: u8) -> Self {
        Self { src, dst, sport, dport }
    }

    /// The tuple of the opposite direction; an inbound datagram carrying
    /// `id` belongs to the connection keyed by `id.reverse()`.
    pub fn reverse(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            sport: self.dport,
            dport: self.sport,
        }
    }
}

impl Packet {
    /// Creates an empty packet addressed by `id`.
    pub fn new(id: PacketId) -> Self {
        Self { id, data: Vec::new() }
    }

    /// Creates a packet carrying `payload`.
    pub fn with_payload(id: PacketId, payload: &[u8]) -> Result<Self, Fail> {
        let mut packet: Packet = Self::new(id);
        packet.append(payload)?;
        Ok(packet)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Appends `bytes` at the tail, bounded by [`MAX_PACKET_SIZE`].
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), Fail> {
        if self.data.len() + bytes.len() > MAX_PACKET_SIZE {
            let cause: String = format!(
                "packet overflows buffer (len={}, append={})",
                self.data.len(),
                bytes.len()
            );
            error!("append(): {}", cause);
            return Err(Fail::new(libc::EMSGSIZE, &cause));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Removes `nbytes` from the tail.
    pub fn trim(&mut self, nbytes: usize) -> Result<(), Fail> {
        if nbytes > self.data.len() {
            let cause: String = format!("trim past packet start (len={}, trim={})", self.data.len(), nbytes);
            error!("trim(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        self.data.truncate(self.data.len() - nbytes);
        Ok(())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{Packet, PacketId, MAX_PACKET_SIZE};
    use ::anyhow::Result;

    fn id() -> PacketId {
        PacketId::new(1, 2, 17, 18)
    }

    #[test]
    fn test_append_and_trim() -> Result<()> {
        let mut packet: Packet = Packet::new(id());
        packet.append(b"abc")?;
        packet.append(b"de")?;
        anyhow::ensure!(packet.bytes() == b"abcde");
        packet.trim(2)?;
        anyhow::ensure!(packet.bytes() == b"abc");
        anyhow::ensure!(packet.trim(4).is_err());
        Ok(())
    }

    #[test]
    fn test_append_respects_buffer_size() -> Result<()> {
        let mut packet: Packet = Packet::with_payload(id(), &[0u8; MAX_PACKET_SIZE])?;
        anyhow::ensure!(packet.append(&[0u8]).is_err());
        anyhow::ensure!(packet.len() == MAX_PACKET_SIZE);
        Ok(())
    }

    #[test]
    fn test_reverse_swaps_both_pairs() -> Result<()> {
        let reversed: PacketId = id().reverse();
        anyhow::ensure!(reversed == PacketId::new(2, 1, 18, 17));
        anyhow::ensure!(reversed.reverse() == id());
        Ok(())
    }
}
