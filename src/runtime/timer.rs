// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        OnceLock,
    },
    time::Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Process start reference for the free-running clock.
static CLOCK_BASE: OnceLock<Instant> = OnceLock::new();

/// When set, [`clock_ms`] reads the manual clock instead of the wall clock,
/// so protocol timeouts can be driven deterministically from tests.
static MANUAL_MODE: AtomicBool = AtomicBool::new(false);
static MANUAL_MS: AtomicU64 = AtomicU64::new(0);

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Monotonic milliseconds. All transport timestamps (retransmission ages,
/// delayed-ack deadlines, lifecycle timeouts) come from here. 64-bit width
/// makes timestamp wrap a non-issue for any plausible mission duration.
pub fn clock_ms() -> u64 {
    if MANUAL_MODE.load(Ordering::Acquire) {
        return MANUAL_MS.load(Ordering::Acquire);
    }
    let base: &Instant = CLOCK_BASE.get_or_init(Instant::now);
    base.elapsed().as_millis() as u64
}

/// Switches to the manual clock and pins it at `now_ms`.
pub fn global_set_clock(now_ms: u64) {
    MANUAL_MS.store(now_ms, Ordering::Release);
    MANUAL_MODE.store(true, Ordering::Release);
}

/// Moves the manual clock forward deterministically.
pub fn global_advance_clock(delta_ms: u64) {
    MANUAL_MS.fetch_add(delta_ms, Ordering::AcqRel);
}

/// Returns to the free-running clock.
pub fn global_reset_clock() {
    MANUAL_MODE.store(false, Ordering::Release);
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{clock_ms, global_advance_clock, global_reset_clock, global_set_clock};
    use ::anyhow::Result;

    #[test]
    fn test_manual_clock_advances() -> Result<()> {
        global_set_clock(1_000);
        anyhow::ensure!(clock_ms() == 1_000);
        global_advance_clock(250);
        anyhow::ensure!(clock_ms() == 1_250);
        global_reset_clock();
        Ok(())
    }
}
