// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::parking_lot::{Condvar, Mutex};
use ::std::time::{Duration, Instant};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Binary signalling primitive. A post while nobody waits leaves the
/// semaphore signalled, so a single wake is never lost; repeated posts
/// collapse into one. Waiters consume the signal.
///
/// The transport uses one per connection (`tx_wait`) to park senders out of
/// window credit and the active-connect caller, always after releasing the
/// stack token.
pub struct BinarySemaphore {
    signalled: Mutex<bool>,
    condvar: Condvar,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl BinarySemaphore {
    pub fn new() -> Self {
        Self {
            signalled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Signals the semaphore and wakes one waiter.
    pub fn post(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        self.condvar.notify_one();
    }

    /// Consumes any pending signal without blocking. Callers about to arm a
    /// fresh wait use this to discard stale wakeups.
    pub fn drain(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = false;
    }

    /// Blocks until signalled or until `timeout` elapses. Returns whether a
    /// signal was consumed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline: Instant = Instant::now() + timeout;
        let mut signalled = self.signalled.lock();
        while !*signalled {
            if self.condvar.wait_until(&mut signalled, deadline).timed_out() {
                break;
            }
        }
        let woken: bool = *signalled;
        *signalled = false;
        woken
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for BinarySemaphore {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
