// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    rdp::seq::SeqNumber,
    runtime::{fail::Fail, memory::Packet},
};
use ::byteorder::{ByteOrder, NetworkEndian};

//======================================================================================================================
// Constants
//======================================================================================================================

/// On-wire size of the transport header, appended after the payload.
pub const RDP_HEADER_SIZE: usize = 5;

mod field {
    pub const FLAGS: usize = 0;
    pub const SEQ_NR: ::std::ops::Range<usize> = 1..3;
    pub const ACK_NR: ::std::ops::Range<usize> = 3..5;

    pub const FLG_RST: u8 = 0x01;
    pub const FLG_EAK: u8 = 0x02;
    pub const FLG_ACK: u8 = 0x04;
    pub const FLG_SYN: u8 = 0x08;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Decoded transport header.
///
/// Wire layout, tail-appended: one flag byte (bit 0 = RST, bit 1 = EAK,
/// bit 2 = ACK, bit 3 = SYN, high nibble reserved zero), then `seq_nr` and
/// `ack_nr` as network-order 16-bit fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RdpHeader {
    pub syn: bool,
    pub ack: bool,
    pub eak: bool,
    pub rst: bool,
    pub seq_nr: SeqNumber,
    pub ack_nr: SeqNumber,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl RdpHeader {
    pub fn serialize(&self) -> [u8; RDP_HEADER_SIZE] {
        let mut buf: [u8; RDP_HEADER_SIZE] = [0; RDP_HEADER_SIZE];
        let mut flags: u8 = 0;
        if self.rst {
            flags |= field::FLG_RST;
        }
        if self.eak {
            flags |= field::FLG_EAK;
        }
        if self.ack {
            flags |= field::FLG_ACK;
        }
        if self.syn {
            flags |= field::FLG_SYN;
        }
        buf[field::FLAGS] = flags;
        NetworkEndian::write_u16(&mut buf[field::SEQ_NR], self.seq_nr.into());
        NetworkEndian::write_u16(&mut buf[field::ACK_NR], self.ack_nr.into());
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, Fail> {
        if buf.len() != RDP_HEADER_SIZE {
            return Err(Fail::new(libc::EBADMSG, "truncated transport header"));
        }
        let flags: u8 = buf[field::FLAGS];
        Ok(Self {
            rst: flags & field::FLG_RST != 0,
            eak: flags & field::FLG_EAK != 0,
            ack: flags & field::FLG_ACK != 0,
            syn: flags & field::FLG_SYN != 0,
            seq_nr: NetworkEndian::read_u16(&buf[field::SEQ_NR]).into(),
            ack_nr: NetworkEndian::read_u16(&buf[field::ACK_NR]).into(),
        })
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Appends `header` at the tail of `packet`.
pub fn attach(packet: &mut Packet, header: &RdpHeader) -> Result<(), Fail> {
    packet.append(&header.serialize())
}

/// Strips and returns the tail header.
pub fn detach(packet: &mut Packet) -> Result<RdpHeader, Fail> {
    let header: RdpHeader = peek(packet)?;
    packet.trim(RDP_HEADER_SIZE)?;
    Ok(header)
}

/// Decodes the tail header without consuming it.
pub fn peek(packet: &Packet) -> Result<RdpHeader, Fail> {
    let len: usize = packet.len();
    if len < RDP_HEADER_SIZE {
        let cause: String = format!("packet too short for transport header (len={})", len);
        debug!("peek(): {}", cause);
        return Err(Fail::new(libc::EBADMSG, &cause));
    }
    RdpHeader::parse(&packet.bytes()[len - RDP_HEADER_SIZE..])
}

/// Overwrites the tail header in place. Used by the retransmission pass to
/// refresh the piggybacked ack on a parked copy.
pub fn rewrite(packet: &mut Packet, header: &RdpHeader) -> Result<(), Fail> {
    let len: usize = packet.len();
    if len < RDP_HEADER_SIZE {
        return Err(Fail::new(libc::EBADMSG, "packet too short for transport header"));
    }
    packet.bytes_mut()[len - RDP_HEADER_SIZE..].copy_from_slice(&header.serialize());
    Ok(())
}

/// Number of payload bytes preceding the header.
pub fn payload_len(packet: &Packet) -> usize {
    packet.len().saturating_sub(RDP_HEADER_SIZE)
}

/// Encodes an extended-ack payload: one network-order 16-bit entry per
/// out-of-order sequence number buffered at the receiver.
pub fn encode_eack(seqs: &[SeqNumber]) -> Vec<u8> {
    let mut payload: Vec<u8> = vec![0; seqs.len() * 2];
    for (i, seq) in seqs.iter().enumerate() {
        NetworkEndian::write_u16(&mut payload[i * 2..i * 2 + 2], (*seq).into());
    }
    payload
}

/// Decodes an extended-ack payload.
pub fn decode_eack(payload: &[u8]) -> Result<Vec<SeqNumber>, Fail> {
    if payload.len() % 2 != 0 {
        let cause: String = format!("odd extended-ack payload length ({})", payload.len());
        error!("decode_eack(): {}", cause);
        return Err(Fail::new(libc::EBADMSG, &cause));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|chunk| NetworkEndian::read_u16(chunk).into())
        .collect())
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
