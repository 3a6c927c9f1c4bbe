// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    rdp::{
        ctrlblk::TxEntry,
        header::{self, RdpHeader},
        seq::SeqNumber,
    },
    runtime::{fail::Fail, memory::Packet},
    stack::{conn::Connection, link::SendDirect},
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Emits a control packet: the given header appended after `payload` (empty
/// for bare acks and resets). With `park`, a copy goes to the retransmission
/// queue first; a full queue is logged and the original is transmitted
/// anyway, leaving recovery to the peer's retransmission of whatever
/// prompted this packet.
///
/// A control-plane ack is what resets the delayed-ack clock; piggybacked
/// acks on data packets do not.
pub(crate) fn send_control(
    conn: &mut Connection,
    router: &dyn SendDirect,
    header: RdpHeader,
    payload: &[u8],
    park: bool,
    now_ms: u64,
) -> Result<(), Fail> {
    let mut packet: Packet = Packet::with_payload(conn.id, payload)?;
    header::attach(&mut packet, &header)?;

    if park {
        let entry: TxEntry = TxEntry {
            packet: packet.clone(),
            timestamp_ms: now_ms,
        };
        if let Err(e) = conn.rdp.park(entry) {
            warn!("send_control(): dropping retransmission copy ({:?})", e);
        }
    }

    if let Err(e) = router.send_direct(packet) {
        error!("send_control(): interface error, not possible to send ({:?})", e);
        return Err(e);
    }

    if header.ack {
        conn.rdp.rcv_lsa = header.ack_nr;
        conn.rdp.ack_timestamp_ms = now_ms;
    }

    Ok(())
}

/// Emits the handshake packet carrying this connection's parameter block,
/// parked for retransmission.
pub(crate) fn send_syn(conn: &mut Connection, router: &dyn SendDirect, now_ms: u64) -> Result<(), Fail> {
    let payload: [u8; crate::rdp::params::SYN_PAYLOAD_SIZE] = conn.rdp.params.to_syn_payload();
    let header: RdpHeader = RdpHeader {
        syn: true,
        seq_nr: conn.rdp.snd_iss,
        ..Default::default()
    };
    send_control(conn, router, header, &payload, true, now_ms)
}

/// Emits a bare cumulative ack at `(snd_nxt, rcv_cur)`.
pub(crate) fn send_ack(conn: &mut Connection, router: &dyn SendDirect, now_ms: u64) -> Result<(), Fail> {
    let header: RdpHeader = RdpHeader {
        ack: true,
        seq_nr: conn.rdp.snd_nxt,
        ack_nr: conn.rdp.rcv_cur,
        ..Default::default()
    };
    send_control(conn, router, header, &[], false, now_ms)
}

/// Emits an extended ack listing every sequence number currently parked in
/// the reorder buffer, cumulative ack included.
pub(crate) fn send_eack(conn: &mut Connection, router: &dyn SendDirect, now_ms: u64) -> Result<(), Fail> {
    let seqs: Vec<SeqNumber> = conn.rdp.rx_seqs();
    for seq in &seqs {
        trace!("send_eack(): listing seq {}", seq);
    }
    let payload: Vec<u8> = header::encode_eack(&seqs);
    let header: RdpHeader = RdpHeader {
        ack: true,
        eak: true,
        seq_nr: conn.rdp.snd_nxt,
        ack_nr: conn.rdp.rcv_cur,
        ..Default::default()
    };
    send_control(conn, router, header, &payload, false, now_ms)
}

/// Stamps and transmits one application payload: appends the transport
/// header at `snd_nxt` with the cumulative ack piggybacked, parks a copy
/// sized from the stamped packet, and hands the original to the router.
///
/// If the copy cannot be parked the sequence number is not consumed and the
/// packet is not transmitted, so the failure is visible instead of silently
/// losing retransmission state.
pub(crate) fn push(
    conn: &mut Connection,
    router: &dyn SendDirect,
    mut packet: Packet,
    now_ms: u64,
) -> Result<(), Fail> {
    trace!("push(): seq {}", conn.rdp.snd_nxt);

    let header: RdpHeader = RdpHeader {
        ack: true,
        seq_nr: conn.rdp.snd_nxt,
        ack_nr: conn.rdp.rcv_cur,
        ..Default::default()
    };
    header::attach(&mut packet, &header)?;
    conn.rdp.snd_nxt += 1;

    let entry: TxEntry = TxEntry {
        packet: packet.clone(),
        timestamp_ms: now_ms,
    };
    if let Err(e) = conn.rdp.park(entry) {
        conn.rdp.snd_nxt = conn.rdp.snd_nxt - 1;
        error!("push(): no space in retransmission queue ({:?})", e);
        return Err(e);
    }

    // A transmit error is still a successful send from the window's point of
    // view: the parked copy goes out on the next retransmission pass.
    if let Err(e) = router.send_direct(packet) {
        warn!("push(): transmit failed, copy stays parked ({:?})", e);
    }
    Ok(())
}

/// Ages the retransmission queue: acknowledged copies are freed, copies
/// older than the packet timeout are refreshed (current cumulative ack,
/// fresh timestamp) and retransmitted. One full rotation of the queue.
pub(crate) fn check_retransmissions(conn: &mut Connection, router: &dyn SendDirect, now_ms: u64) {
    let packet_timeout_ms: u64 = conn.rdp.params.packet_timeout_ms as u64;

    for _ in 0..conn.rdp.tx_queue.len() {
        let mut entry: TxEntry = match conn.rdp.tx_queue.pop_front() {
            Some(entry) => entry,
            None => break,
        };

        let mut hdr: RdpHeader = match header::peek(&entry.packet) {
            Ok(hdr) => hdr,
            Err(e) => {
                error!("check_retransmissions(): unreadable parked copy, freeing ({:?})", e);
                continue;
            },
        };

        // Acknowledged while parked.
        if hdr.seq_nr < conn.rdp.snd_una {
            debug!(
                "check_retransmissions(): tx element free, time {}, seq {}",
                entry.timestamp_ms, hdr.seq_nr
            );
            continue;
        }

        if entry.timestamp_ms + packet_timeout_ms < now_ms {
            warn!("check_retransmissions(): tx element timed out, retransmitting seq {}", hdr.seq_nr);

            hdr.ack_nr = conn.rdp.rcv_cur;
            if let Err(e) = header::rewrite(&mut entry.packet, &hdr) {
                error!("check_retransmissions(): cannot refresh parked copy ({:?})", e);
                continue;
            }
            entry.timestamp_ms = now_ms;

            if let Err(e) = router.send_direct(entry.packet.clone()) {
                warn!("check_retransmissions(): retransmission failed ({:?})", e);
            }
        }

        conn.rdp.tx_queue.push_back(entry);
    }
}

/// Consumes an extended ack: parked copies whose sequence number appears in
/// the list are selectively acknowledged and freed; copies older than any
/// listed sequence number were missed by the peer and get their timestamp
/// expired so the next maintenance pass retransmits them immediately.
pub(crate) fn flush_eack(conn: &mut Connection, seqs: &[SeqNumber], now_ms: u64) {
    let packet_timeout_ms: u64 = conn.rdp.params.packet_timeout_ms as u64;

    for _ in 0..conn.rdp.tx_queue.len() {
        let mut entry: TxEntry = match conn.rdp.tx_queue.pop_front() {
            Some(entry) => entry,
            None => break,
        };

        let hdr: RdpHeader = match header::peek(&entry.packet) {
            Ok(hdr) => hdr,
            Err(e) => {
                error!("flush_eack(): unreadable parked copy, freeing ({:?})", e);
                continue;
            },
        };

        let mut acknowledged: bool = false;
        for seq in seqs {
            if *seq == hdr.seq_nr {
                acknowledged = true;
            }
            if *seq > hdr.seq_nr {
                entry.timestamp_ms = now_ms.saturating_sub(packet_timeout_ms + 1);
            }
        }

        if acknowledged {
            debug!("flush_eack(): tx element {} freed", hdr.seq_nr);
        } else {
            conn.rdp.tx_queue.push_back(entry);
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
