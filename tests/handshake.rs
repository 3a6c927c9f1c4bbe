// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

mod common;

use crate::common::{conn_id, serialize_tests, Engine};
use ::anyhow::Result;
use ::cubenet::{
    rdp::{header, header::RdpHeader, RdpParams, SeqNumber, State},
    runtime::timer,
    ConnInfo, Packet,
};
use ::std::time::Duration;

fn handshake_params() -> RdpParams {
    RdpParams {
        window_size: 5,
        conn_timeout_ms: 10_000,
        packet_timeout_ms: 1_000,
        delayed_acks: false,
        ack_timeout_ms: 500,
        ack_delay_count: 2,
    }
}

#[test]
fn test_three_way_handshake() -> Result<()> {
    let _guard = serialize_tests();
    let engine: Engine = Engine::new(handshake_params())?;
    let (alpha_handle, _alpha_rx, beta_handle, _socket) = engine.open_pair()?;

    engine.establish(alpha_handle)?;

    let alpha: ConnInfo = engine.alpha.describe(alpha_handle)?;
    anyhow::ensure!(alpha.state == State::Open);
    anyhow::ensure!(alpha.snd_iss == SeqNumber::from(1_000));
    anyhow::ensure!(alpha.snd_una == SeqNumber::from(1_001));
    anyhow::ensure!(alpha.snd_nxt == SeqNumber::from(1_001));
    anyhow::ensure!(alpha.rcv_irs == SeqNumber::from(2_000));
    anyhow::ensure!(alpha.rcv_cur == SeqNumber::from(2_000));
    anyhow::ensure!(alpha.tx_queued == 0);

    let beta: ConnInfo = engine.beta.describe(beta_handle)?;
    anyhow::ensure!(beta.state == State::Open);
    anyhow::ensure!(beta.snd_iss == SeqNumber::from(2_000));
    anyhow::ensure!(beta.snd_una == SeqNumber::from(2_001));
    anyhow::ensure!(beta.snd_nxt == SeqNumber::from(2_001));
    anyhow::ensure!(beta.rcv_cur == SeqNumber::from(1_000));
    anyhow::ensure!(beta.tx_queued == 0);

    // The passive side adopted the initiator's parameters verbatim.
    anyhow::ensure!(beta.params == handshake_params());
    Ok(())
}

#[test]
fn test_handshake_with_delayed_acks() -> Result<()> {
    let _guard = serialize_tests();
    let params: RdpParams = RdpParams {
        delayed_acks: true,
        ..handshake_params()
    };
    let engine: Engine = Engine::new(params)?;
    let (alpha_handle, _alpha_rx, beta_handle, _socket) = engine.open_pair()?;

    engine.establish(alpha_handle)?;

    // The initiator defers its final ack, so the responder is still waiting
    // for its SYN to be acknowledged.
    anyhow::ensure!(engine.alpha.describe(alpha_handle)?.state == State::Open);
    anyhow::ensure!(engine.beta.describe(beta_handle)?.state == State::SynRcvd);

    // The deferred ack goes out on the delayed-ack timer.
    timer::global_advance_clock(501);
    engine.alpha.check_timeouts(alpha_handle);
    engine.pump();

    let beta: ConnInfo = engine.beta.describe(beta_handle)?;
    anyhow::ensure!(beta.state == State::Open);
    anyhow::ensure!(beta.snd_una == SeqNumber::from(2_001));
    Ok(())
}

#[test]
fn test_half_open_reset_and_retry() -> Result<()> {
    let _guard = serialize_tests();
    let engine: Engine = Engine::new(handshake_params())?;
    let (alpha_handle, _alpha_rx, _beta_handle, _socket) = engine.open_pair()?;

    let connector = engine.connect_in_background(alpha_handle);

    // Swallow the first SYN and answer with a bare ack, as an already open
    // peer connection would.
    let syn: Packet = engine
        .wait_for_alpha_frame(Duration::from_secs(2))
        .expect("no SYN transmitted");
    anyhow::ensure!(header::peek(&syn)?.syn);

    let mut bare_ack: Packet = Packet::new(conn_id().reverse());
    header::attach(
        &mut bare_ack,
        &RdpHeader {
            ack: true,
            seq_nr: SeqNumber::from(4_242),
            ack_nr: SeqNumber::from(1_000),
            ..Default::default()
        },
    )?;
    engine.deliver_to_alpha(bare_ack);

    // The initiator must answer the half-open peer with a reset...
    let reset: Packet = engine
        .wait_for_alpha_frame(Duration::from_secs(2))
        .expect("no reset transmitted");
    let reset_header: RdpHeader = header::peek(&reset)?;
    anyhow::ensure!(reset_header.rst && !reset_header.ack && !reset_header.syn);

    // ...and retry the handshake, which now runs to completion.
    let second_syn: Packet = engine
        .wait_for_alpha_frame(Duration::from_secs(2))
        .expect("no retry SYN transmitted");
    anyhow::ensure!(header::peek(&second_syn)?.syn);
    engine.deliver_to_beta(second_syn);
    while !connector.is_finished() {
        engine.pump_once();
        std::thread::sleep(Duration::from_millis(1));
    }
    anyhow::ensure!(connector.join().expect("connect thread panicked").is_ok());
    anyhow::ensure!(engine.alpha.describe(alpha_handle)?.state == State::Open);
    Ok(())
}

#[test]
fn test_connect_timeout_enters_close_wait() -> Result<()> {
    let _guard = serialize_tests();
    let params: RdpParams = RdpParams {
        conn_timeout_ms: 50,
        ..handshake_params()
    };
    let engine: Engine = Engine::new(params)?;
    let (alpha_handle, _alpha_rx, _beta_handle, _socket) = engine.open_pair()?;

    // Nobody pumps: the SYN goes nowhere and the attempt expires.
    let result = engine.alpha.connect(alpha_handle);
    anyhow::ensure!(result.is_err());
    anyhow::ensure!(result.unwrap_err().errno == libc::ETIMEDOUT);
    anyhow::ensure!(engine.alpha.describe(alpha_handle)?.state == State::CloseWait);
    Ok(())
}

#[test]
fn test_connect_rejects_open_connection() -> Result<()> {
    let _guard = serialize_tests();
    let engine: Engine = Engine::new(handshake_params())?;
    let (alpha_handle, _alpha_rx, _beta_handle, _socket) = engine.open_pair()?;
    engine.establish(alpha_handle)?;

    let result = engine.alpha.connect(alpha_handle);
    anyhow::ensure!(result.is_err());
    anyhow::ensure!(result.unwrap_err().errno == libc::EISCONN);
    Ok(())
}
