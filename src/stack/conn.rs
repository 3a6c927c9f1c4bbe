// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    rdp::{ctrlblk::RdpControlBlock, header},
    runtime::{
        fail::Fail,
        memory::{Packet, PacketId},
        semaphore::BinarySemaphore,
    },
};
use ::crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use ::std::{sync::Arc, time::Duration};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Depth of the application-facing receive queue of each connection.
const CONN_RX_QUEUE_DEPTH: usize = 64;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Handle to a connection record. Handles are generation-stamped: once a
/// connection is destroyed, handles to it go stale and every table access
/// through them misses, so late ingress or maintenance calls cannot touch a
/// recycled slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnHandle {
    index: usize,
    generation: u64,
}

/// Whether (and where) this connection still owes its handle to a listener.
pub(crate) enum AcceptState {
    /// Born passively; the handle is posted to this socket on first payload.
    Attached(Sender<(ConnHandle, ConnReceiver)>),
    /// Handle already handed to userspace; reset sentinels go to the
    /// receive queue from now on.
    Accepted,
    /// Actively opened; userspace already holds the handle.
    Detached,
}

/// A connection record: addressing, the transport control block, the
/// producer side of the application receive queue, and the window-credit
/// semaphore.
pub struct Connection {
    pub id: PacketId,
    pub rdp: RdpControlBlock,
    pub tx_wait: Arc<BinarySemaphore>,
    pub(crate) accept: AcceptState,
    rx_tx: Sender<Option<Packet>>,
    rx_rx: Receiver<Option<Packet>>,
}

/// Consumer side of a connection's receive queue.
///
/// `Ok(Some(packet))` is an in-order payload with the transport header
/// already stripped. `Ok(None)` is the peer-reset sentinel: no more data
/// will arrive and the reader is expected to close. A disconnected queue
/// means the record itself is gone.
#[derive(Clone)]
pub struct ConnReceiver {
    queue: Receiver<Option<Packet>>,
}

/// Accept socket for passively opened connections. The transport posts
/// `(handle, receiver)` the first time a payload arrives on a connection
/// bound to this socket.
pub struct ListenSocket {
    tx: Sender<(ConnHandle, ConnReceiver)>,
    rx: Receiver<(ConnHandle, ConnReceiver)>,
}

struct Slot {
    generation: u64,
    conn: Option<Connection>,
}

/// The connection table. Lives inside the stack token, so every record
/// mutation and every destruction is serialized with ingress.
pub(crate) struct ConnTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Connection {
    pub(crate) fn new(id: PacketId, now_ms: u64, accept: AcceptState) -> (Self, ConnReceiver) {
        let (rx_tx, rx_rx): (Sender<Option<Packet>>, Receiver<Option<Packet>>) = bounded(CONN_RX_QUEUE_DEPTH);
        let receiver: ConnReceiver = ConnReceiver { queue: rx_rx.clone() };
        let conn: Connection = Self {
            id,
            rdp: RdpControlBlock::new(now_ms),
            tx_wait: Arc::new(BinarySemaphore::new()),
            accept,
            rx_tx,
            rx_rx,
        };
        (conn, receiver)
    }

    /// True while the connection was born passively and userspace has not
    /// yet accepted it.
    pub(crate) fn awaiting_accept(&self) -> bool {
        matches!(self.accept, AcceptState::Attached(_))
    }

    /// Hands an in-order data packet to the application: posts the
    /// connection handle to the accept socket if this is the first payload,
    /// strips the transport header, and enqueues the payload.
    ///
    /// The handle is posted at most once; after a successful post the
    /// socket attachment is replaced by the accepted marker.
    pub(crate) fn post_payload(&mut self, handle: ConnHandle, mut packet: Packet) -> Result<(), Fail> {
        match std::mem::replace(&mut self.accept, AcceptState::Accepted) {
            AcceptState::Attached(socket) => {
                let receiver: ConnReceiver = ConnReceiver {
                    queue: self.rx_rx.clone(),
                };
                if socket.try_send((handle, receiver)).is_err() {
                    self.accept = AcceptState::Attached(socket);
                    let cause: &str = "socket cannot accept more connections";
                    error!("post_payload(): {}", cause);
                    return Err(Fail::new(libc::ENOBUFS, cause));
                }
            },
            other => self.accept = other,
        }

        header::detach(&mut packet)?;

        match self.rx_tx.try_send(Some(packet)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                let cause: &str = "connection receive queue full";
                error!("post_payload(): {}", cause);
                Err(Fail::new(libc::ENOBUFS, cause))
            },
        }
    }

    /// Posts the reset sentinel so a blocked reader wakes and observes the
    /// teardown. Only meaningful once userspace holds the handle.
    pub(crate) fn post_reset_sentinel(&self) {
        if matches!(self.accept, AcceptState::Accepted) {
            debug!("post_reset_sentinel(): waking userspace for close");
            let _ = self.rx_tx.try_send(None);
        }
    }
}

impl ConnReceiver {
    /// Blocks up to `timeout` for the next in-order payload (`Some`) or the
    /// peer-reset sentinel (`None`).
    pub fn recv(&self, timeout: Duration) -> Result<Option<Packet>, Fail> {
        match self.queue.recv_timeout(timeout) {
            Ok(entry) => Ok(entry),
            Err(RecvTimeoutError::Timeout) => Err(Fail::new(libc::ETIMEDOUT, "receive timed out")),
            Err(RecvTimeoutError::Disconnected) => Err(Fail::new(libc::ECONNRESET, "connection closed")),
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&self) -> Result<Option<Packet>, Fail> {
        match self.queue.try_recv() {
            Ok(entry) => Ok(entry),
            Err(_) => Err(Fail::new(libc::EWOULDBLOCK, "no payload queued")),
        }
    }
}

impl ListenSocket {
    pub fn new(backlog: usize) -> Self {
        let (tx, rx): (Sender<(ConnHandle, ConnReceiver)>, Receiver<(ConnHandle, ConnReceiver)>) = bounded(backlog);
        Self { tx, rx }
    }

    pub(crate) fn sender(&self) -> Sender<(ConnHandle, ConnReceiver)> {
        self.tx.clone()
    }

    /// Blocks up to `timeout` for the next passively opened connection.
    pub fn accept(&self, timeout: Duration) -> Result<(ConnHandle, ConnReceiver), Fail> {
        match self.rx.recv_timeout(timeout) {
            Ok(entry) => Ok(entry),
            Err(RecvTimeoutError::Timeout) => Err(Fail::new(libc::ETIMEDOUT, "accept timed out")),
            Err(RecvTimeoutError::Disconnected) => Err(Fail::new(libc::EINVAL, "socket closed")),
        }
    }
}

impl ConnTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, conn: Connection) -> ConnHandle {
        match self.free.pop() {
            Some(index) => {
                let slot: &mut Slot = &mut self.slots[index];
                slot.generation += 1;
                slot.conn = Some(conn);
                ConnHandle {
                    index,
                    generation: slot.generation,
                }
            },
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    conn: Some(conn),
                });
                ConnHandle {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            },
        }
    }

    pub fn get(&self, handle: ConnHandle) -> Option<&Connection> {
        match self.slots.get(handle.index) {
            Some(slot) if slot.generation == handle.generation => slot.conn.as_ref(),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: ConnHandle) -> Option<&mut Connection> {
        match self.slots.get_mut(handle.index) {
            Some(slot) if slot.generation == handle.generation => slot.conn.as_mut(),
            _ => None,
        }
    }

    pub fn remove(&mut self, handle: ConnHandle) -> Option<Connection> {
        match self.slots.get_mut(handle.index) {
            Some(slot) if slot.generation == handle.generation => {
                let conn: Option<Connection> = slot.conn.take();
                if conn.is_some() {
                    self.free.push(handle.index);
                }
                conn
            },
            _ => None,
        }
    }

    /// Finds the connection whose outbound tuple is `id`.
    pub fn lookup(&self, id: PacketId) -> Option<ConnHandle> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            slot.conn.as_ref().filter(|conn| conn.id == id).map(|_| ConnHandle {
                index,
                generation: slot.generation,
            })
        })
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
