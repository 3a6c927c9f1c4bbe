// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod ctrlblk;
pub mod header;
pub mod params;
pub mod seq;

mod receiver;
mod sender;

pub use ctrlblk::State;
pub use params::RdpParams;
pub use seq::SeqNumber;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    rdp::{
        ctrlblk::{State as RdpState, RDP_MAX_WINDOW},
        receiver::IngressOutcome,
    },
    runtime::{
        fail::Fail,
        memory::{Packet, PacketId},
        semaphore::BinarySemaphore,
        timer,
    },
    stack::{
        conn::{AcceptState, ConnHandle, ConnReceiver, ConnTable, Connection, ListenSocket},
        link::SendDirect,
    },
};
use ::parking_lot::{Mutex, MutexGuard};
use ::std::{sync::Arc, time::Duration};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Initial send sequence number of the active (initiating) side.
const ACTIVE_ISS: u16 = 1_000;

/// Initial send sequence number of the passive (responding) side. Distinct
/// from the active value so captured traces identify each direction at a
/// glance; no adversary is assumed on the space link.
pub(crate) const PASSIVE_ISS: u16 = 2_000;

/// Nothing in the transport should hold the token longer than this; failing
/// to acquire it within the limit is treated as a deadlock indicator.
const TOKEN_TIMEOUT: Duration = Duration::from_secs(1);

//======================================================================================================================
// Structures
//======================================================================================================================

/// The transport context: the connection table behind the single
/// serialization token, the process defaults for future active connects,
/// and the router's transmit seam.
///
/// Every state transition and queue mutation in the transport happens under
/// the token. Connection destruction also happens under it, which is what
/// makes ingress on a dying connection safe: a handle that lost its record
/// simply misses in the table.
#[derive(Clone)]
pub struct RdpStack {
    inner: Arc<StackInner>,
}

struct StackInner {
    /// The serialization token and everything it protects.
    table: Mutex<ConnTable>,
    /// Defaults stamped into future active connects; replaced by `set_opt`.
    defaults: Mutex<RdpParams>,
    router: Arc<dyn SendDirect>,
}

/// Result of [`RdpStack::close`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    /// A reset was emitted and the connection lingers in CLOSE_WAIT to
    /// drain late packets; a later close (or the linger timeout) finishes.
    Pending,
    /// The record was destroyed.
    Closed,
}

/// Point-in-time connection summary for operator debugging and tests.
#[derive(Clone, Copy, Debug)]
pub struct ConnInfo {
    pub id: PacketId,
    pub state: State,
    pub snd_iss: SeqNumber,
    pub snd_nxt: SeqNumber,
    pub snd_una: SeqNumber,
    pub rcv_irs: SeqNumber,
    pub rcv_cur: SeqNumber,
    pub rcv_lsa: SeqNumber,
    pub tx_queued: usize,
    pub rx_buffered: usize,
    pub params: RdpParams,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl RdpStack {
    /// Creates a transport context transmitting through `router`, with
    /// `defaults` as the initial parameter block for active connects.
    pub fn new(router: Arc<dyn SendDirect>, defaults: RdpParams) -> Result<Self, Fail> {
        defaults.validate()?;
        Ok(Self {
            inner: Arc::new(StackInner {
                table: Mutex::new(ConnTable::new()),
                defaults: Mutex::new(defaults),
                router,
            }),
        })
    }

    /// Acquires the serialization token. Failure after the full timeout is
    /// a deadlock somewhere in the transport; the operation is abandoned
    /// without touching state.
    fn lock(&self) -> Result<MutexGuard<'_, ConnTable>, Fail> {
        match self.inner.table.try_lock_for(TOKEN_TIMEOUT) {
            Some(guard) => Ok(guard),
            None => {
                let cause: &str = "dead-lock in transport code found";
                error!("lock(): {}", cause);
                Err(Fail::new(libc::EDEADLK, cause))
            },
        }
    }

    /// Creates a connection record for active use: CLOSED state, queues and
    /// window semaphore allocated. Returns the handle and the consumer side
    /// of the receive queue.
    pub fn allocate(&self, id: PacketId) -> Result<(ConnHandle, ConnReceiver), Fail> {
        let mut table: MutexGuard<ConnTable> = self.lock()?;
        let (conn, rx): (Connection, ConnReceiver) = Connection::new(id, timer::clock_ms(), AcceptState::Detached);
        let handle: ConnHandle = table.insert(conn);
        debug!("allocate(): created connection {:?} for {:?}", handle, id);
        Ok((handle, rx))
    }

    /// Creates a connection record for passive use, bound to an accept
    /// socket. The handle (and a receiver) are posted to the socket when
    /// the first payload arrives after the handshake.
    pub fn allocate_passive(&self, id: PacketId, socket: &ListenSocket) -> Result<ConnHandle, Fail> {
        let mut table: MutexGuard<ConnTable> = self.lock()?;
        let (conn, _rx): (Connection, ConnReceiver) =
            Connection::new(id, timer::clock_ms(), AcceptState::Attached(socket.sender()));
        let handle: ConnHandle = table.insert(conn);
        debug!("allocate_passive(): created connection {:?} for {:?}", handle, id);
        Ok(handle)
    }

    /// Finds the connection whose outbound tuple is `id`. Inbound datagrams
    /// carrying tuple `t` belong to the connection `lookup(t.reverse())`.
    pub fn lookup(&self, id: PacketId) -> Option<ConnHandle> {
        self.inner.table.lock().lookup(id)
    }

    /// Active connect: emits the handshake carrying the process defaults
    /// and blocks until the connection opens, the peer proves half-open, or
    /// `conn_timeout_ms` elapses. A half-open detection is retried once.
    pub fn connect(&self, handle: ConnHandle) -> Result<(), Fail> {
        let mut table: MutexGuard<ConnTable> = self.lock()?;
        let defaults: RdpParams = *self.inner.defaults.lock();

        let (tx_wait, conn_timeout): (Arc<BinarySemaphore>, Duration) = {
            let conn: &mut Connection = table.get_mut(handle).ok_or(Fail::new(libc::EBADF, "no such connection"))?;
            conn.rdp.params = defaults;
            conn.rdp.ack_timestamp_ms = timer::clock_ms();
            (conn.tx_wait.clone(), Duration::from_millis(defaults.conn_timeout_ms as u64))
        };

        let mut retries_left: u32 = 1;
        loop {
            let now_ms: u64 = timer::clock_ms();
            let conn: &mut Connection = table.get_mut(handle).ok_or(Fail::new(libc::EBADF, "no such connection"))?;
            trace!("connect(): active connect, state {:?}", conn.rdp.state);

            if conn.rdp.state == RdpState::Open {
                error!("connect(): connection already open");
                return Err(Fail::new(libc::EISCONN, "connection already open"));
            }

            conn.rdp.snd_iss = SeqNumber::from(ACTIVE_ISS);
            conn.rdp.snd_nxt = conn.rdp.snd_iss + 1;
            conn.rdp.snd_una = conn.rdp.snd_iss;
            conn.rdp.state = RdpState::SynSent;

            debug!("connect(): sending handshake");
            if sender::send_syn(conn, &*self.inner.router, now_ms).is_err() {
                conn.rdp.state = RdpState::CloseWait;
                conn.rdp.open_timestamp_ms = now_ms;
                return Err(Fail::new(libc::EIO, "could not transmit handshake"));
            }

            // Park the caller until ingress signals progress. Any stale
            // signal is drained first so only this attempt can wake us.
            drop(table);
            tx_wait.drain();
            let signalled: bool = tx_wait.wait(conn_timeout);
            table = self.lock()?;

            let conn: &mut Connection = table.get_mut(handle).ok_or(Fail::new(libc::EBADF, "no such connection"))?;
            if signalled {
                match conn.rdp.state {
                    RdpState::Open => {
                        debug!("connect(): connection open");
                        return Ok(());
                    },
                    RdpState::SynSent if retries_left > 0 => {
                        warn!("connect(): half-open connection detected, reset sent, now retrying");
                        conn.rdp.flush_all();
                        retries_left -= 1;
                        continue;
                    },
                    RdpState::SynSent => {
                        error!("connect(): connection stayed half-open, even after reset and retry");
                        break;
                    },
                    _ => break,
                }
            } else {
                debug!("connect(): connection failed");
                break;
            }
        }

        if let Some(conn) = table.get_mut(handle) {
            conn.rdp.state = RdpState::CloseWait;
            conn.rdp.open_timestamp_ms = timer::clock_ms();
        }
        Err(Fail::new(libc::ETIMEDOUT, "connect failed"))
    }

    /// Sends one application payload. Blocks up to `timeout` for window
    /// credit when `snd_nxt - snd_una + 1` would reach the negotiated
    /// window. Consumes the packet on success.
    pub fn send(&self, handle: ConnHandle, packet: Packet, timeout: Duration) -> Result<(), Fail> {
        let mut table: MutexGuard<ConnTable> = self.lock()?;
        let conn: &mut Connection = table.get_mut(handle).ok_or(Fail::new(libc::EBADF, "no such connection"))?;

        if conn.rdp.state != RdpState::Open {
            error!("send(): cannot send, connection reset by peer");
            return Err(Fail::new(libc::ECONNRESET, "connection not open"));
        }

        // Out of flow-control credit: park until the maintenance driver
        // signals a free slot, then revalidate the connection.
        if conn.rdp.in_flight() as u32 + 1 >= conn.rdp.params.window_size {
            let tx_wait: Arc<BinarySemaphore> = conn.tx_wait.clone();
            drop(table);
            tx_wait.drain();
            if !tx_wait.wait(timeout) {
                error!("send(): timeout during send");
                return Err(Fail::new(libc::ETIMEDOUT, "timeout during send"));
            }
            table = self.lock()?;
            let conn: &mut Connection = table.get_mut(handle).ok_or(Fail::new(libc::EBADF, "no such connection"))?;
            if conn.rdp.state != RdpState::Open {
                error!("send(): connection no longer open");
                return Err(Fail::new(libc::ECONNRESET, "connection not open"));
            }
            return sender::push(conn, &*self.inner.router, packet, timer::clock_ms());
        }

        sender::push(conn, &*self.inner.router, packet, timer::clock_ms())
    }

    /// Ingress: dispatches one inbound datagram to the connection state
    /// machine. Consumes the packet; a missing record (destroyed while the
    /// datagram was in flight) just frees it.
    pub fn new_packet(&self, handle: ConnHandle, packet: Packet) {
        let mut table: MutexGuard<ConnTable> = match self.lock() {
            Ok(table) => table,
            Err(_) => return,
        };
        let conn: &mut Connection = match table.get_mut(handle) {
            Some(conn) => conn,
            None => {
                debug!("new_packet(): connection gone, dropping packet");
                return;
            },
        };
        match receiver::process(conn, &*self.inner.router, handle, packet, timer::clock_ms()) {
            IngressOutcome::Keep => (),
            IngressOutcome::Destroy => {
                debug!("new_packet(): destroying connection {:?}", handle);
                table.remove(handle);
            },
        }
    }

    /// Periodic maintenance: reaps connections past their lifecycle
    /// timeouts, ages the retransmission queue, emits the delayed ack when
    /// due, and wakes a parked sender when credit is available. Idempotent
    /// under repeated invocation; call it at least as often as the smaller
    /// of the ack and packet timeouts.
    pub fn check_timeouts(&self, handle: ConnHandle) {
        let mut table: MutexGuard<ConnTable> = match self.lock() {
            Ok(table) => table,
            Err(_) => return,
        };
        let now_ms: u64 = timer::clock_ms();
        let conn: &mut Connection = match table.get_mut(handle) {
            Some(conn) => conn,
            None => return,
        };
        let conn_timeout_ms: u64 = conn.rdp.params.conn_timeout_ms as u64;

        // A passively opened connection nobody accepted is lost; reap it.
        if conn.awaiting_accept() && conn.rdp.open_timestamp_ms + conn_timeout_ms < now_ms {
            warn!("check_timeouts(): found a lost connection, closing now");
            if Self::close_conn(conn, &*self.inner.router, now_ms) == CloseOutcome::Closed {
                table.remove(handle);
            }
            return;
        }

        // CLOSE_WAIT is a linger, not a resting state.
        if conn.rdp.state == RdpState::CloseWait && conn.rdp.open_timestamp_ms + conn_timeout_ms < now_ms {
            debug!("check_timeouts(): CLOSE_WAIT timeout");
            if Self::close_conn(conn, &*self.inner.router, now_ms) == CloseOutcome::Closed {
                table.remove(handle);
            }
            return;
        }

        sender::check_retransmissions(conn, &*self.inner.router, now_ms);

        // Send the timeout ack only if the segment was not acknowledged by
        // a regular ack in the meantime.
        if conn.rdp.params.delayed_acks
            && conn.rdp.rcv_lsa < conn.rdp.rcv_cur
            && now_ms.saturating_sub(conn.rdp.ack_timestamp_ms) > conn.rdp.params.ack_timeout_ms as u64
        {
            let _ = sender::send_ack(conn, &*self.inner.router, now_ms);
        }

        // Wake a parked sender once the queue has room and the window has
        // credit again.
        if conn.rdp.state == RdpState::Open
            && conn.rdp.tx_queue.len() < (conn.rdp.params.window_size as usize).saturating_sub(1).min(RDP_MAX_WINDOW)
            && conn.rdp.snd_nxt < conn.rdp.snd_una + 2 * conn.rdp.params.window_size as u16
        {
            conn.tx_wait.post();
        }
    }

    /// Teardown. Outside CLOSE_WAIT this emits a reset and leaves the
    /// connection lingering; in CLOSE_WAIT it destroys the record (queues
    /// and semaphore go with it).
    pub fn close(&self, handle: ConnHandle) -> Result<CloseOutcome, Fail> {
        let mut table: MutexGuard<ConnTable> = self.lock()?;
        let now_ms: u64 = timer::clock_ms();
        let conn: &mut Connection = table.get_mut(handle).ok_or(Fail::new(libc::EBADF, "no such connection"))?;
        let outcome: CloseOutcome = Self::close_conn(conn, &*self.inner.router, now_ms);
        if outcome == CloseOutcome::Closed {
            table.remove(handle);
        }
        Ok(outcome)
    }

    fn close_conn(conn: &mut Connection, router: &dyn SendDirect, now_ms: u64) -> CloseOutcome {
        if conn.rdp.state != RdpState::CloseWait {
            debug!("close_conn(): sending reset");
            let reset: header::RdpHeader = header::RdpHeader {
                ack: true,
                rst: true,
                seq_nr: conn.rdp.snd_nxt,
                ack_nr: conn.rdp.rcv_cur,
                ..Default::default()
            };
            let _ = sender::send_control(conn, router, reset, &[], false, now_ms);
            conn.rdp.state = RdpState::CloseWait;
            conn.rdp.open_timestamp_ms = now_ms;
            return CloseOutcome::Pending;
        }
        debug!("close_conn(): in CLOSE_WAIT, now closing");
        conn.rdp.state = RdpState::Closed;
        CloseOutcome::Closed
    }

    /// Drops every parked retransmission copy and buffered out-of-order
    /// packet of the connection.
    pub fn flush_all(&self, handle: ConnHandle) -> Result<(), Fail> {
        let mut table: MutexGuard<ConnTable> = self.lock()?;
        let conn: &mut Connection = table.get_mut(handle).ok_or(Fail::new(libc::EBADF, "no such connection"))?;
        conn.rdp.flush_all();
        Ok(())
    }

    /// Replaces the process defaults applied to future active connects.
    /// Existing connections keep their negotiated parameters.
    pub fn set_opt(&self, params: RdpParams) -> Result<(), Fail> {
        params.validate()?;
        *self.inner.defaults.lock() = params;
        Ok(())
    }

    /// Point-in-time summary of a connection, for operator debugging.
    pub fn describe(&self, handle: ConnHandle) -> Result<ConnInfo, Fail> {
        let table: MutexGuard<ConnTable> = self.lock()?;
        let conn: &Connection = table.get(handle).ok_or(Fail::new(libc::EBADF, "no such connection"))?;
        let info: ConnInfo = ConnInfo {
            id: conn.id,
            state: conn.rdp.state,
            snd_iss: conn.rdp.snd_iss,
            snd_nxt: conn.rdp.snd_nxt,
            snd_una: conn.rdp.snd_una,
            rcv_irs: conn.rdp.rcv_irs,
            rcv_cur: conn.rdp.rcv_cur,
            rcv_lsa: conn.rdp.rcv_lsa,
            tx_queued: conn.rdp.tx_queue.len(),
            rx_buffered: conn.rdp.rx_queue.len(),
            params: conn.rdp.params,
        };
        debug!(
            "describe(): state {:?}, rcv {}, snd {}, win {}",
            info.state, info.rcv_cur, info.snd_una, info.params.window_size
        );
        Ok(info)
    }
}
