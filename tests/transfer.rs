// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

mod common;

use crate::common::{conn_id, serialize_tests, Engine};
use ::anyhow::Result;
use ::cubenet::{
    rdp::{header, RdpParams, SeqNumber, State},
    runtime::timer,
    ConnHandle, ConnInfo, ConnReceiver, Packet,
};
use ::std::{
    collections::VecDeque,
    thread,
    time::Duration,
};

const SEND_TIMEOUT: Duration = Duration::from_secs(2);

fn transfer_params() -> RdpParams {
    RdpParams {
        window_size: 5,
        conn_timeout_ms: 10_000,
        packet_timeout_ms: 1_000,
        delayed_acks: true,
        ack_timeout_ms: 500,
        ack_delay_count: 2,
    }
}

fn payload(bytes: &[u8]) -> Result<Packet> {
    Ok(Packet::with_payload(conn_id(), bytes)?)
}

/// Established pair ready for data transfer. The initiator's deferred
/// handshake ack is flushed through the delayed-ack timer so both sides are
/// open and no side still owes a control ack.
fn established(engine: &Engine) -> Result<(ConnHandle, ConnHandle, cubenet::stack::conn::ListenSocket)> {
    let (alpha_handle, _alpha_rx, beta_handle, socket) = engine.open_pair()?;
    engine.establish(alpha_handle)?;
    timer::global_advance_clock(501);
    engine.alpha.check_timeouts(alpha_handle);
    engine.beta.check_timeouts(beta_handle);
    engine.pump();
    anyhow::ensure!(engine.alpha.describe(alpha_handle)?.state == State::Open);
    anyhow::ensure!(engine.beta.describe(beta_handle)?.state == State::Open);
    Ok((alpha_handle, beta_handle, socket))
}

#[test]
fn test_in_order_payloads_single_cumulative_ack() -> Result<()> {
    let _guard = serialize_tests();
    let engine: Engine = Engine::new(transfer_params())?;
    let (alpha_handle, beta_handle, socket) = established(&engine)?;

    for bytes in [b"aaa".as_slice(), b"bbb", b"ccc"] {
        engine.alpha.send(alpha_handle, payload(bytes)?, SEND_TIMEOUT)?;
    }
    for frame in engine.alpha_frames() {
        engine.deliver_to_beta(frame);
    }

    // Ack-delay threshold of 2 means exactly one cumulative ack, after the
    // third delivery.
    let mut acks: VecDeque<Packet> = engine.beta_frames();
    anyhow::ensure!(acks.len() == 1);
    let ack: Packet = acks.pop_front().unwrap();
    let ack_header = header::peek(&ack)?;
    anyhow::ensure!(ack_header.ack && !ack_header.eak);
    anyhow::ensure!(ack_header.ack_nr == SeqNumber::from(1_003));

    // Delivery is in order, through the accept socket on the first payload.
    let (_accepted, beta_rx): (ConnHandle, ConnReceiver) = socket.accept(Duration::from_millis(100))?;
    for expected in [b"aaa".as_slice(), b"bbb", b"ccc"] {
        let received: Packet = beta_rx.recv(Duration::from_millis(100))?.expect("payload, not a sentinel");
        anyhow::ensure!(received.bytes() == expected);
    }

    // The ack empties the initiator's retransmission queue.
    engine.deliver_to_alpha(ack);
    let alpha: ConnInfo = engine.alpha.describe(alpha_handle)?;
    anyhow::ensure!(alpha.snd_una == SeqNumber::from(1_004));
    anyhow::ensure!(alpha.snd_nxt == SeqNumber::from(1_004));
    anyhow::ensure!(alpha.tx_queued == 0);
    anyhow::ensure!(engine.beta.describe(beta_handle)?.rcv_cur == SeqNumber::from(1_003));
    Ok(())
}

#[test]
fn test_drop_recovery_through_extended_acks() -> Result<()> {
    let _guard = serialize_tests();
    let engine: Engine = Engine::new(transfer_params())?;
    let (alpha_handle, beta_handle, socket) = established(&engine)?;

    for bytes in [b"a".as_slice(), b"b", b"c", b"d"] {
        engine.alpha.send(alpha_handle, payload(bytes)?, SEND_TIMEOUT)?;
    }

    // Lose the second packet (seq 1002) in transit.
    let mut frames: VecDeque<Packet> = engine.alpha_frames();
    anyhow::ensure!(frames.len() == 4);
    for (index, frame) in frames.drain(..).enumerate() {
        if index != 1 {
            engine.deliver_to_beta(frame);
        }
    }

    // The receiver buffers 1003 and 1004 and advertises them; the second
    // extended ack lists both with the cumulative ack stuck at 1001.
    let eacks: VecDeque<Packet> = engine.beta_frames();
    anyhow::ensure!(eacks.len() == 2);
    let wire: Packet = eacks.into_iter().last().unwrap();
    let mut inspected: Packet = wire.clone();
    let eack_header = header::detach(&mut inspected)?;
    anyhow::ensure!(eack_header.eak && eack_header.ack);
    anyhow::ensure!(eack_header.ack_nr == SeqNumber::from(1_001));
    let listed: Vec<SeqNumber> = header::decode_eack(inspected.bytes())?;
    anyhow::ensure!(listed == vec![SeqNumber::from(1_003), SeqNumber::from(1_004)]);
    engine.deliver_to_alpha(wire);

    // 1001 is cumulatively acked, 1003/1004 selectively acked; only 1002
    // stays parked, already marked expired.
    let alpha: ConnInfo = engine.alpha.describe(alpha_handle)?;
    anyhow::ensure!(alpha.snd_una == SeqNumber::from(1_002));
    anyhow::ensure!(alpha.tx_queued == 1);

    // The expired copy goes out on the next maintenance pass; one
    // retransmission recovers the stream.
    timer::global_advance_clock(1_000);
    engine.alpha.check_timeouts(alpha_handle);
    let retransmissions: VecDeque<Packet> = engine.alpha_frames();
    anyhow::ensure!(retransmissions.len() == 1);
    anyhow::ensure!(header::peek(&retransmissions[0])?.seq_nr == SeqNumber::from(1_002));
    for frame in retransmissions {
        engine.deliver_to_beta(frame);
    }

    let beta: ConnInfo = engine.beta.describe(beta_handle)?;
    anyhow::ensure!(beta.rcv_cur == SeqNumber::from(1_004));
    anyhow::ensure!(beta.rx_buffered == 0);

    let (_accepted, beta_rx): (ConnHandle, ConnReceiver) = socket.accept(Duration::from_millis(100))?;
    for expected in [b"a".as_slice(), b"b", b"c", b"d"] {
        let received: Packet = beta_rx.recv(Duration::from_millis(100))?.expect("payload, not a sentinel");
        anyhow::ensure!(received.bytes() == expected);
    }

    // The recovered tail is acknowledged on the delayed-ack timer, which
    // settles the sender.
    engine.beta.check_timeouts(beta_handle);
    engine.pump();
    let alpha: ConnInfo = engine.alpha.describe(alpha_handle)?;
    anyhow::ensure!(alpha.snd_una == alpha.snd_nxt);
    anyhow::ensure!(alpha.tx_queued == 0);
    Ok(())
}

#[test]
fn test_reordered_delivery_generates_one_eack_and_no_retransmission() -> Result<()> {
    let _guard = serialize_tests();
    let engine: Engine = Engine::new(transfer_params())?;
    let (alpha_handle, beta_handle, socket) = established(&engine)?;

    engine.alpha.send(alpha_handle, payload(b"first")?, SEND_TIMEOUT)?;
    engine.alpha.send(alpha_handle, payload(b"second")?, SEND_TIMEOUT)?;

    // Swap the two packets in flight.
    let mut frames: VecDeque<Packet> = engine.alpha_frames();
    anyhow::ensure!(frames.len() == 2);
    let first: Packet = frames.pop_front().unwrap();
    let second: Packet = frames.pop_front().unwrap();
    engine.deliver_to_beta(second);
    engine.deliver_to_beta(first);

    // Exactly one extended ack, from the out-of-order arrival.
    let advertisements: VecDeque<Packet> = engine.beta_frames();
    anyhow::ensure!(advertisements.len() == 1);
    anyhow::ensure!(header::peek(&advertisements[0])?.eak);
    for frame in advertisements {
        engine.deliver_to_alpha(frame);
    }

    // Delivered sequence is identical to the in-order trace.
    let (_accepted, beta_rx): (ConnHandle, ConnReceiver) = socket.accept(Duration::from_millis(100))?;
    for expected in [b"first".as_slice(), b"second"] {
        let received: Packet = beta_rx.recv(Duration::from_millis(100))?.expect("payload, not a sentinel");
        anyhow::ensure!(received.bytes() == expected);
    }
    anyhow::ensure!(engine.beta.describe(beta_handle)?.rcv_cur == SeqNumber::from(1_002));

    // Nothing is old enough to retransmit.
    engine.alpha.check_timeouts(alpha_handle);
    anyhow::ensure!(engine.alpha_frames().is_empty());

    // The still-unacknowledged tail goes out on the delayed-ack timer and
    // the trace reaches quiescence.
    timer::global_advance_clock(501);
    engine.beta.check_timeouts(beta_handle);
    engine.pump();
    let alpha: ConnInfo = engine.alpha.describe(alpha_handle)?;
    anyhow::ensure!(alpha.snd_una == alpha.snd_nxt);
    anyhow::ensure!(alpha.tx_queued == 0);
    Ok(())
}

#[test]
fn test_duplicate_data_is_idempotent() -> Result<()> {
    let _guard = serialize_tests();
    let engine: Engine = Engine::new(transfer_params())?;
    let (alpha_handle, beta_handle, socket) = established(&engine)?;

    engine.alpha.send(alpha_handle, payload(b"once")?, SEND_TIMEOUT)?;
    let frame: Packet = engine.alpha_frames().pop_front().unwrap();
    engine.deliver_to_beta(frame.clone());
    let before: ConnInfo = engine.beta.describe(beta_handle)?;

    // Replay of an already delivered packet: no state movement, just a
    // resynchronizing extended ack.
    engine.deliver_to_beta(frame);
    let after: ConnInfo = engine.beta.describe(beta_handle)?;
    anyhow::ensure!(after.rcv_cur == before.rcv_cur);
    anyhow::ensure!(after.snd_nxt == before.snd_nxt);
    anyhow::ensure!(after.snd_una == before.snd_una);
    anyhow::ensure!(after.rx_buffered == 0);

    let resync: VecDeque<Packet> = engine.beta_frames();
    anyhow::ensure!(resync.iter().any(|p| header::peek(p).map(|h| h.eak).unwrap_or(false)));

    // The application saw the payload exactly once.
    let (_accepted, beta_rx): (ConnHandle, ConnReceiver) = socket.accept(Duration::from_millis(100))?;
    anyhow::ensure!(beta_rx.recv(Duration::from_millis(100))?.expect("payload").bytes() == b"once");
    anyhow::ensure!(beta_rx.try_recv().is_err());
    Ok(())
}

#[test]
fn test_window_backpressure_blocks_and_wakes() -> Result<()> {
    let _guard = serialize_tests();
    let engine: Engine = Engine::new(transfer_params())?;
    let (alpha_handle, beta_handle, _socket) = established(&engine)?;
    let _ = beta_handle;

    // With a window of five, four packets fill the flow-control credit.
    for bytes in [b"1".as_slice(), b"2", b"3", b"4"] {
        engine.alpha.send(alpha_handle, payload(bytes)?, SEND_TIMEOUT)?;
    }

    // The next send parks until maintenance frees credit.
    let stack = engine.alpha.clone();
    let parked_payload: Packet = payload(b"5")?;
    let parked = thread::spawn(move || stack.send(alpha_handle, parked_payload, SEND_TIMEOUT));
    thread::sleep(Duration::from_millis(50));
    anyhow::ensure!(!parked.is_finished());

    // Drain the window: deliver the four packets, return the ack.
    for frame in engine.alpha_frames() {
        engine.deliver_to_beta(frame);
    }
    for frame in engine.beta_frames() {
        engine.deliver_to_alpha(frame);
    }
    engine.alpha.check_timeouts(alpha_handle);

    let result = parked.join().expect("send thread panicked");
    anyhow::ensure!(result.is_ok());
    anyhow::ensure!(engine.alpha.describe(alpha_handle)?.snd_nxt == SeqNumber::from(1_006));
    Ok(())
}

#[test]
fn test_window_backpressure_timeout_leaves_state_unchanged() -> Result<()> {
    let _guard = serialize_tests();
    let engine: Engine = Engine::new(transfer_params())?;
    let (alpha_handle, _beta_handle, _socket) = established(&engine)?;

    for bytes in [b"1".as_slice(), b"2", b"3", b"4"] {
        engine.alpha.send(alpha_handle, payload(bytes)?, SEND_TIMEOUT)?;
    }
    let before: ConnInfo = engine.alpha.describe(alpha_handle)?;

    // Nobody acks, so the parked send expires.
    let result = engine
        .alpha
        .send(alpha_handle, payload(b"5")?, Duration::from_millis(50));
    anyhow::ensure!(result.is_err());
    anyhow::ensure!(result.unwrap_err().errno == libc::ETIMEDOUT);

    let after: ConnInfo = engine.alpha.describe(alpha_handle)?;
    anyhow::ensure!(after.snd_nxt == before.snd_nxt);
    anyhow::ensure!(after.tx_queued == before.tx_queued);
    anyhow::ensure!(after.state == State::Open);
    Ok(())
}

#[test]
fn test_lossless_stream_reaches_quiescence() -> Result<()> {
    let _guard = serialize_tests();
    let engine: Engine = Engine::new(transfer_params())?;
    let (alpha_handle, beta_handle, socket) = established(&engine)?;

    for index in 0u8..8 {
        engine
            .alpha
            .send(alpha_handle, payload(&[b'p', index])?, SEND_TIMEOUT)?;
        engine.pump();
    }

    // Flush the trailing delayed ack.
    timer::global_advance_clock(501);
    engine.beta.check_timeouts(beta_handle);
    engine.pump();

    let alpha: ConnInfo = engine.alpha.describe(alpha_handle)?;
    anyhow::ensure!(alpha.snd_una == alpha.snd_nxt);
    anyhow::ensure!(alpha.snd_nxt == SeqNumber::from(1_009));
    anyhow::ensure!(alpha.tx_queued == 0);

    let beta: ConnInfo = engine.beta.describe(beta_handle)?;
    anyhow::ensure!(beta.rcv_cur == SeqNumber::from(1_008));
    anyhow::ensure!(beta.rx_buffered == 0);

    let (_accepted, beta_rx): (ConnHandle, ConnReceiver) = socket.accept(Duration::from_millis(100))?;
    for index in 0u8..8 {
        let received: Packet = beta_rx.recv(Duration::from_millis(100))?.expect("payload, not a sentinel");
        anyhow::ensure!(received.bytes() == [b'p', index]);
    }
    Ok(())
}
