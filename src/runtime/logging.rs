// Copyright (c) the cubenet authors.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::log::{Level, LevelFilter, Log, Metadata, Record};
use ::std::sync::Once;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Environment variable controlling the log level (error, warn, info, debug, trace).
const LOG_LEVEL_VAR: &str = "CUBENET_LOG";

//======================================================================================================================
// Structures
//======================================================================================================================

/// Minimal stderr logger behind the `log` facade. Flight builds are expected
/// to install their own sink; this one exists so host-side tools and tests
/// get output without further wiring.
struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;
static INIT: Once = Once::new();

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Installs the stderr logger. Idempotent; a logger installed by the
/// embedding application wins.
pub fn initialize() {
    INIT.call_once(|| {
        let level: LevelFilter = match std::env::var(LOG_LEVEL_VAR).as_deref() {
            Ok("error") => LevelFilter::Error,
            Ok("warn") => LevelFilter::Warn,
            Ok("info") => LevelFilter::Info,
            Ok("debug") => LevelFilter::Debug,
            Ok("trace") => LevelFilter::Trace,
            _ => LevelFilter::Warn,
        };
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(level);
        }
    });
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}
