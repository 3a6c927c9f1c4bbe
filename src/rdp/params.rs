// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::byteorder::{ByteOrder, NetworkEndian};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Exact size of the handshake parameter payload: six network-order 32-bit
/// fields. The length is authoritative; a future format change must use a
/// different size rather than extending this one in place.
pub const SYN_PAYLOAD_SIZE: usize = 24;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Per-connection transport parameters.
///
/// The active side stamps its process defaults into the handshake payload;
/// the passive side adopts the initiator's values verbatim, so both ends of
/// a connection always agree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RdpParams {
    /// Flow-control credit: maximum unacknowledged packets in flight.
    pub window_size: u32,
    /// Lifecycle timeout for unaccepted connections and CLOSE_WAIT linger.
    pub conn_timeout_ms: u32,
    /// Age at which a parked packet is retransmitted.
    pub packet_timeout_ms: u32,
    /// Whether acks are delayed and batched.
    pub delayed_acks: bool,
    /// Maximum age of an unacknowledged in-order delivery before a bare ack
    /// is forced out.
    pub ack_timeout_ms: u32,
    /// In-order deliveries accumulated before an ack is emitted.
    pub ack_delay_count: u32,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl RdpParams {
    /// Rejects parameter blocks no connection could make progress with.
    pub fn validate(&self) -> Result<(), Fail> {
        if self.window_size == 0
            || self.conn_timeout_ms == 0
            || self.packet_timeout_ms == 0
            || self.ack_timeout_ms == 0
        {
            let cause: String = format!("invalid transport parameters ({:?})", self);
            error!("validate(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(())
    }

    pub fn to_syn_payload(&self) -> [u8; SYN_PAYLOAD_SIZE] {
        let mut buf: [u8; SYN_PAYLOAD_SIZE] = [0; SYN_PAYLOAD_SIZE];
        NetworkEndian::write_u32(&mut buf[0..4], self.window_size);
        NetworkEndian::write_u32(&mut buf[4..8], self.conn_timeout_ms);
        NetworkEndian::write_u32(&mut buf[8..12], self.packet_timeout_ms);
        NetworkEndian::write_u32(&mut buf[12..16], self.delayed_acks as u32);
        NetworkEndian::write_u32(&mut buf[16..20], self.ack_timeout_ms);
        NetworkEndian::write_u32(&mut buf[20..24], self.ack_delay_count);
        buf
    }

    pub fn from_syn_payload(payload: &[u8]) -> Result<Self, Fail> {
        if payload.len() != SYN_PAYLOAD_SIZE {
            let cause: String = format!("unexpected handshake payload length ({})", payload.len());
            error!("from_syn_payload(): {}", cause);
            return Err(Fail::new(libc::EBADMSG, &cause));
        }
        let params: RdpParams = Self {
            window_size: NetworkEndian::read_u32(&payload[0..4]),
            conn_timeout_ms: NetworkEndian::read_u32(&payload[4..8]),
            packet_timeout_ms: NetworkEndian::read_u32(&payload[8..12]),
            delayed_acks: NetworkEndian::read_u32(&payload[12..16]) != 0,
            ack_timeout_ms: NetworkEndian::read_u32(&payload[16..20]),
            ack_delay_count: NetworkEndian::read_u32(&payload[20..24]),
        };
        params.validate()?;
        Ok(params)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for RdpParams {
    fn default() -> Self {
        Self {
            window_size: 10,
            conn_timeout_ms: 10_000,
            packet_timeout_ms: 1_000,
            delayed_acks: true,
            ack_timeout_ms: 500,
            ack_delay_count: 5,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{RdpParams, SYN_PAYLOAD_SIZE};
    use ::anyhow::Result;

    #[test]
    fn test_syn_payload_round_trip() -> Result<()> {
        let params: RdpParams = RdpParams {
            window_size: 5,
            conn_timeout_ms: 2_000,
            packet_timeout_ms: 750,
            delayed_acks: false,
            ack_timeout_ms: 300,
            ack_delay_count: 2,
        };
        let payload: [u8; SYN_PAYLOAD_SIZE] = params.to_syn_payload();
        anyhow::ensure!(RdpParams::from_syn_payload(&payload)? == params);
        Ok(())
    }

    #[test]
    fn test_syn_payload_length_is_authoritative() -> Result<()> {
        let payload: [u8; SYN_PAYLOAD_SIZE] = RdpParams::default().to_syn_payload();
        anyhow::ensure!(RdpParams::from_syn_payload(&payload[..20]).is_err());
        let mut longer: Vec<u8> = payload.to_vec();
        longer.push(0);
        anyhow::ensure!(RdpParams::from_syn_payload(&longer).is_err());
        Ok(())
    }

    #[test]
    fn test_zero_window_is_rejected() -> Result<()> {
        let params: RdpParams = RdpParams {
            window_size: 0,
            ..Default::default()
        };
        anyhow::ensure!(params.validate().is_err());
        Ok(())
    }
}
