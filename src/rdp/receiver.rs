// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    rdp::{
        ctrlblk::State,
        header::{self, RdpHeader, RDP_HEADER_SIZE},
        params::RdpParams,
        seq::SeqNumber,
        sender,
    },
    runtime::memory::Packet,
    stack::{
        conn::{ConnHandle, Connection},
        link::SendDirect,
    },
};

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// What the ingress dispatcher decided about the connection record itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IngressOutcome {
    /// The record stays in the table.
    Keep,
    /// The record is done (reset acknowledged in CLOSE_WAIT) and must be
    /// destroyed by the caller, which still holds the token.
    Destroy,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Ingress dispatcher: runs one inbound packet through the connection state
/// machine. Called with the stack token held; consumes the packet.
pub(crate) fn process(
    conn: &mut Connection,
    router: &dyn SendDirect,
    handle: ConnHandle,
    packet: Packet,
    now_ms: u64,
) -> IngressOutcome {
    let rx_header: RdpHeader = match header::peek(&packet) {
        Ok(rx_header) => rx_header,
        Err(e) => {
            debug!("process(): dropping malformed packet ({:?})", e);
            return IngressOutcome::Keep;
        },
    };

    trace!(
        "process(): state {:?}: syn {}, ack {}, eack {}, rst {}, seq_nr {}, ack_nr {}, packet_len {} ({})",
        conn.rdp.state,
        rx_header.syn,
        rx_header.ack,
        rx_header.eak,
        rx_header.rst,
        rx_header.seq_nr,
        rx_header.ack_nr,
        packet.len(),
        header::payload_len(&packet),
    );

    // First packet on a closed record: run the passive-open sequence lazily.
    if conn.rdp.state == State::Closed {
        conn.rdp.snd_iss = SeqNumber::from(crate::rdp::PASSIVE_ISS);
        conn.rdp.snd_nxt = conn.rdp.snd_iss + 1;
        conn.rdp.snd_una = conn.rdp.snd_iss;
        conn.rdp.state = State::Listen;
    }

    if rx_header.rst {
        return handle_rst(conn, router, &rx_header, now_ms);
    }

    match conn.rdp.state {
        State::Listen => handle_listen(conn, router, &rx_header, &packet, now_ms),
        State::SynSent => handle_syn_sent(conn, router, &rx_header, now_ms),
        State::SynRcvd | State::Open => handle_established(conn, router, handle, &rx_header, packet, now_ms),
        State::CloseWait => handle_close_wait(conn, router, &rx_header, now_ms),
        State::Closed => IngressOutcome::Keep,
    }
}

/// A reset arrived. In sequence it is answered with a reset of our own and
/// the connection lingers in CLOSE_WAIT; in CLOSE_WAIT it completes the
/// teardown; out of sequence it is ignored.
fn handle_rst(
    conn: &mut Connection,
    router: &dyn SendDirect,
    rx_header: &RdpHeader,
    now_ms: u64,
) -> IngressOutcome {
    if rx_header.ack {
        conn.rdp.snd_una = rx_header.ack_nr + 1;
        conn.rdp.prune_acked();
    }

    if conn.rdp.state == State::CloseWait {
        debug!("handle_rst(): reset received in CLOSE_WAIT, now closing connection");
        return IngressOutcome::Destroy;
    }

    debug!("handle_rst(): got reset in state {:?}", conn.rdp.state);
    if rx_header.seq_nr == conn.rdp.rcv_cur + 1 {
        debug!("handle_rst(): reset in sequence, no more data incoming, replying with reset");
        let reply: RdpHeader = RdpHeader {
            ack: true,
            rst: true,
            seq_nr: conn.rdp.snd_nxt,
            ack_nr: conn.rdp.rcv_cur,
            ..Default::default()
        };
        let _ = sender::send_control(conn, router, reply, &[], false, now_ms);
        conn.rdp.state = State::CloseWait;
        conn.rdp.open_timestamp_ms = now_ms;
        conn.post_reset_sentinel();
    } else {
        debug!("handle_rst(): reset out of sequence, keeping connection open");
    }
    IngressOutcome::Keep
}

fn handle_listen(
    conn: &mut Connection,
    router: &dyn SendDirect,
    rx_header: &RdpHeader,
    packet: &Packet,
    now_ms: u64,
) -> IngressOutcome {
    // An ack with no handshake means the peer believes a connection exists.
    if rx_header.ack {
        error!("handle_listen(): ack received in LISTEN state");
        let reply: RdpHeader = RdpHeader {
            rst: true,
            seq_nr: conn.rdp.snd_nxt,
            ack_nr: conn.rdp.rcv_cur,
            ..Default::default()
        };
        let _ = sender::send_control(conn, router, reply, &[], false, now_ms);
        conn.post_reset_sentinel();
        return IngressOutcome::Keep;
    }

    if rx_header.syn {
        debug!("handle_listen(): handshake received");

        // The payload length is authoritative for the parameter block.
        let payload: &[u8] = &packet.bytes()[..header::payload_len(packet)];
        let params: RdpParams = match RdpParams::from_syn_payload(payload) {
            Ok(params) => params,
            Err(_) => {
                error!("handle_listen(): rejecting handshake with malformed parameter block");
                conn.post_reset_sentinel();
                return IngressOutcome::Keep;
            },
        };

        conn.rdp.rcv_cur = rx_header.seq_nr;
        conn.rdp.rcv_irs = rx_header.seq_nr;
        if params.delayed_acks {
            conn.rdp.rcv_lsa = rx_header.seq_nr;
        }
        conn.rdp.state = State::SynRcvd;
        conn.rdp.params = params;

        debug!(
            "handle_listen(): window {}, conn timeout {}, packet timeout {}",
            params.window_size, params.conn_timeout_ms, params.packet_timeout_ms
        );
        debug!(
            "handle_listen(): delayed acks {}, ack timeout {}, ack each {} packets",
            params.delayed_acks, params.ack_timeout_ms, params.ack_delay_count
        );

        let reply: RdpHeader = RdpHeader {
            syn: true,
            ack: true,
            seq_nr: conn.rdp.snd_iss,
            ack_nr: conn.rdp.rcv_irs,
            ..Default::default()
        };
        let _ = sender::send_control(conn, router, reply, &[], true, now_ms);
        return IngressOutcome::Keep;
    }

    error!("handle_listen(): unexpected packet in LISTEN state");
    conn.post_reset_sentinel();
    IngressOutcome::Keep
}

fn handle_syn_sent(
    conn: &mut Connection,
    router: &dyn SendDirect,
    rx_header: &RdpHeader,
    now_ms: u64,
) -> IngressOutcome {
    if rx_header.syn && rx_header.ack {
        conn.rdp.rcv_cur = rx_header.seq_nr;
        conn.rdp.rcv_irs = rx_header.seq_nr;
        conn.rdp.snd_una = rx_header.ack_nr + 1;
        conn.rdp.prune_acked();
        conn.rdp.state = State::Open;
        conn.rdp.open_timestamp_ms = now_ms;

        debug!("handle_syn_sent(): connection open");

        if conn.rdp.params.delayed_acks {
            // Defer the ack; the maintenance driver or the first data packet
            // carries it.
            conn.rdp.rcv_lsa = rx_header.seq_nr - 1;
        } else {
            let _ = sender::send_ack(conn, router, now_ms);
        }

        conn.tx_wait.post();
        return IngressOutcome::Keep;
    }

    // An ack without a handshake means our SYN hit an already open
    // connection: half-open. Reset it; the connect path retries.
    if rx_header.ack {
        error!("handle_syn_sent(): half-open connection found, sending reset");
        let reply: RdpHeader = RdpHeader {
            rst: true,
            seq_nr: conn.rdp.snd_nxt,
            ack_nr: conn.rdp.rcv_cur,
            ..Default::default()
        };
        let _ = sender::send_control(conn, router, reply, &[], false, now_ms);
        conn.tx_wait.post();
        return IngressOutcome::Keep;
    }

    error!("handle_syn_sent(): invalid reply to handshake request");
    conn.post_reset_sentinel();
    IngressOutcome::Keep
}

fn handle_established(
    conn: &mut Connection,
    router: &dyn SendDirect,
    handle: ConnHandle,
    rx_header: &RdpHeader,
    packet: Packet,
    now_ms: u64,
) -> IngressOutcome {
    let window: u16 = conn.rdp.params.window_size as u16;

    // A handshake flag or a missing ack is invalid on a live connection.
    if rx_header.syn || !rx_header.ack {
        error!("handle_established(): invalid syn or missing ack, resetting");
        conn.post_reset_sentinel();
        return IngressOutcome::Keep;
    }

    // Sequence window check.
    if rx_header.seq_nr <= conn.rdp.rcv_cur || rx_header.seq_nr > conn.rdp.rcv_cur + 2 * window {
        warn!(
            "handle_established(): sequence number unacceptable ({} vs rcv_cur {})",
            rx_header.seq_nr, conn.rdp.rcv_cur
        );
        match conn.rdp.state {
            // A duplicate handshake lost our SYN+ACK; emit it again.
            State::SynRcvd => {
                let reply: RdpHeader = RdpHeader {
                    syn: true,
                    ack: true,
                    seq_nr: conn.rdp.snd_iss,
                    ack_nr: conn.rdp.rcv_irs,
                    ..Default::default()
                };
                let _ = sender::send_control(conn, router, reply, &[], true, now_ms);
            },
            // A duplicate data packet lost an ack; the extended ack resyncs.
            State::Open => {
                let _ = sender::send_eack(conn, router, now_ms);
            },
            _ => (),
        }
        return IngressOutcome::Keep;
    }

    // Ack window check, high then low boundary.
    if rx_header.ack_nr >= conn.rdp.snd_nxt {
        error!(
            "handle_established(): ack number too high ({} >= {})",
            rx_header.ack_nr, conn.rdp.snd_nxt
        );
        conn.post_reset_sentinel();
        return IngressOutcome::Keep;
    }
    let low_bound: SeqNumber = conn.rdp.snd_una - (1 + 2 * window);
    if rx_header.ack_nr < low_bound {
        error!(
            "handle_established(): ack number too low ({} < {})",
            rx_header.ack_nr, low_bound
        );
        conn.post_reset_sentinel();
        return IngressOutcome::Keep;
    }

    // The handshake completes when the passive side sees its SYN acked.
    if conn.rdp.state == State::SynRcvd {
        if rx_header.ack_nr != conn.rdp.snd_iss {
            error!("handle_established(): wrong ack number for handshake");
            conn.post_reset_sentinel();
            return IngressOutcome::Keep;
        }
        debug!("handle_established(): connection open");
        conn.rdp.state = State::Open;
        conn.rdp.open_timestamp_ms = now_ms;
    }

    conn.rdp.snd_una = rx_header.ack_nr + 1;
    conn.rdp.prune_acked();

    // Selective acknowledgement: free listed copies, expire overtaken ones.
    if rx_header.eak {
        if packet.len() > RDP_HEADER_SIZE {
            let payload: &[u8] = &packet.bytes()[..header::payload_len(&packet)];
            match header::decode_eack(payload) {
                Ok(seqs) => sender::flush_eack(conn, &seqs, now_ms),
                Err(e) => debug!("handle_established(): ignoring malformed extended ack ({:?})", e),
            }
        }
        return IngressOutcome::Keep;
    }

    // Bare ack: nothing further to do.
    if packet.len() <= RDP_HEADER_SIZE {
        return IngressOutcome::Keep;
    }

    // Out-of-order data is buffered (unless duplicate) and advertised back
    // through an extended ack.
    if rx_header.seq_nr != conn.rdp.rcv_cur + 1 {
        match conn.rdp.rx_insert(rx_header.seq_nr, packet) {
            Ok(()) => {
                let _ = sender::send_eack(conn, router, now_ms);
            },
            Err(_) => debug!("handle_established(): duplicate sequence number {}", rx_header.seq_nr),
        }
        return IngressOutcome::Keep;
    }

    // In-order data: deliver, then drain whatever the reorder buffer can
    // continue with.
    let seq_nr: SeqNumber = rx_header.seq_nr;
    if let Err(e) = conn.post_payload(handle, packet) {
        error!("handle_established(): cannot receive data, rejecting packet ({:?})", e);
        return IngressOutcome::Keep;
    }
    conn.rdp.rcv_cur = seq_nr;

    if conn.rdp.params.delayed_acks {
        // Ack once enough deliveries accumulated; otherwise the maintenance
        // driver acks on the timer.
        if conn.rdp.rcv_cur > conn.rdp.rcv_lsa + conn.rdp.params.ack_delay_count as u16 {
            let _ = sender::send_ack(conn, router, now_ms);
        }
    } else {
        let _ = sender::send_ack(conn, router, now_ms);
    }

    drain_rx_queue(conn, handle, now_ms);
    IngressOutcome::Keep
}

/// Repeatedly scans the reorder buffer for the packet continuing the stream
/// and delivers it, restarting from the top after every advance, until no
/// continuation exists.
fn drain_rx_queue(conn: &mut Connection, handle: ConnHandle, _now_ms: u64) {
    while let Some(packet) = conn.rdp.rx_take_next() {
        let seq_nr: SeqNumber = conn.rdp.rcv_cur + 1;
        debug!("drain_rx_queue(): deliver seq {}", seq_nr);
        if let Err(e) = conn.post_payload(handle, packet) {
            // The stream position still advances; the payload is lost to a
            // full queue and the peer sees it acknowledged.
            error!("drain_rx_queue(): cannot deliver buffered packet ({:?})", e);
        }
        conn.rdp.rcv_cur = seq_nr;
    }
}

fn handle_close_wait(
    conn: &mut Connection,
    router: &dyn SendDirect,
    rx_header: &RdpHeader,
    now_ms: u64,
) -> IngressOutcome {
    let window: u16 = conn.rdp.params.window_size as u16;

    if rx_header.ack_nr >= conn.rdp.snd_nxt {
        error!(
            "handle_close_wait(): ack number too high ({} >= {})",
            rx_header.ack_nr, conn.rdp.snd_nxt
        );
        return IngressOutcome::Keep;
    }
    let low_bound: SeqNumber = conn.rdp.snd_una - (1 + 2 * window);
    if rx_header.ack_nr < low_bound {
        error!(
            "handle_close_wait(): ack number too low ({} < {})",
            rx_header.ack_nr, low_bound
        );
        return IngressOutcome::Keep;
    }

    conn.rdp.snd_una = rx_header.ack_nr + 1;
    conn.rdp.prune_acked();

    // Whatever the peer wanted, the answer in CLOSE_WAIT is a reset.
    let reply: RdpHeader = RdpHeader {
        ack: true,
        rst: true,
        seq_nr: conn.rdp.snd_nxt,
        ack_nr: conn.rdp.rcv_cur,
        ..Default::default()
    };
    let _ = sender::send_control(conn, router, reply, &[], false, now_ms);
    IngressOutcome::Keep
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
