// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

// Shared two-stack test engine: two transport contexts wired back to back
// through buffered links, with manual clock control and frame-level access
// so suites can drop, reorder, duplicate, and inject datagrams.

use ::anyhow::Result;
use ::cubenet::{
    rdp::RdpParams,
    runtime::timer,
    stack::conn::ListenSocket,
    BufferedLink, ConnHandle, ConnReceiver, Fail, Packet, PacketId, RdpStack,
};
use ::std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, OnceLock},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// The manual clock is process-global, so scenario tests run one at a time.
pub fn serialize_tests() -> MutexGuard<'static, ()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    GUARD
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Addressing used by every suite: alpha is node 1, beta is node 2.
pub fn conn_id() -> PacketId {
    PacketId::new(1, 2, 45, 10)
}

pub struct Engine {
    pub alpha: RdpStack,
    pub beta: RdpStack,
    alpha_link: Arc<BufferedLink>,
    beta_link: Arc<BufferedLink>,
}

impl Engine {
    pub fn new(params: RdpParams) -> Result<Self> {
        cubenet::runtime::logging::initialize();
        timer::global_set_clock(0);
        let alpha_link: Arc<BufferedLink> = Arc::new(BufferedLink::new());
        let beta_link: Arc<BufferedLink> = Arc::new(BufferedLink::new());
        let alpha: RdpStack = RdpStack::new(alpha_link.clone(), params)?;
        let beta: RdpStack = RdpStack::new(beta_link.clone(), params)?;
        Ok(Self {
            alpha,
            beta,
            alpha_link,
            beta_link,
        })
    }

    /// Allocates the active record on alpha and the passive one on beta.
    pub fn open_pair(&self) -> Result<(ConnHandle, ConnReceiver, ConnHandle, ListenSocket)> {
        let (alpha_handle, alpha_rx): (ConnHandle, ConnReceiver) = self.alpha.allocate(conn_id())?;
        let socket: ListenSocket = ListenSocket::new(8);
        let beta_handle: ConnHandle = self.beta.allocate_passive(conn_id().reverse(), &socket)?;
        Ok((alpha_handle, alpha_rx, beta_handle, socket))
    }

    pub fn alpha_frames(&self) -> VecDeque<Packet> {
        self.alpha_link.pop_all_frames()
    }

    pub fn beta_frames(&self) -> VecDeque<Packet> {
        self.beta_link.pop_all_frames()
    }

    pub fn deliver_to_alpha(&self, frame: Packet) {
        if let Some(handle) = self.alpha.lookup(frame.id.reverse()) {
            self.alpha.new_packet(handle, frame);
        }
    }

    pub fn deliver_to_beta(&self, frame: Packet) {
        if let Some(handle) = self.beta.lookup(frame.id.reverse()) {
            self.beta.new_packet(handle, frame);
        }
    }

    /// Moves every queued frame once, both directions. Returns how many
    /// frames moved.
    pub fn pump_once(&self) -> usize {
        let mut moved: usize = 0;
        for frame in self.alpha_frames() {
            self.deliver_to_beta(frame);
            moved += 1;
        }
        for frame in self.beta_frames() {
            self.deliver_to_alpha(frame);
            moved += 1;
        }
        moved
    }

    /// Pumps until the network is quiet.
    pub fn pump(&self) {
        while self.pump_once() > 0 {}
    }

    /// Polls for the next frame transmitted by alpha, up to `timeout` of
    /// real time; needed while another thread is blocked inside the stack.
    pub fn wait_for_alpha_frame(&self, timeout: Duration) -> Option<Packet> {
        let deadline: Instant = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.alpha_link.pop_frame() {
                return Some(frame);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Runs an active connect on its own thread so the main thread can keep
    /// pumping frames.
    pub fn connect_in_background(&self, handle: ConnHandle) -> JoinHandle<Result<(), Fail>> {
        let stack: RdpStack = self.alpha.clone();
        thread::spawn(move || stack.connect(handle))
    }

    /// Full handshake: background connect plus pumping until the connect
    /// call returns.
    pub fn establish(&self, alpha_handle: ConnHandle) -> Result<()> {
        let connector: JoinHandle<Result<(), Fail>> = self.connect_in_background(alpha_handle);
        while !connector.is_finished() {
            self.pump_once();
            thread::sleep(Duration::from_millis(1));
        }
        let result: Result<(), Fail> = connector.join().expect("connect thread panicked");
        // A final pump delivers whatever the last transition emitted.
        self.pump();
        result.map_err(|e| anyhow::anyhow!("connect failed: {}", e))
    }
}
