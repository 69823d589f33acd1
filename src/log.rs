//! Structured logging for the cadence engine.
//!
//! All modules log through `tracing`. This module only installs the
//! subscriber:
//! - ERROR: failures that abort an operation (persistence, executor crashes)
//! - WARN: recoverable surprises (unknown dependencies, rejected push updates)
//! - INFO: lifecycle transitions (task started/completed/failed, workflow levels)
//! - DEBUG: slot, queue and trigger activity
//! - TRACE: condition evaluation and cache traffic
//!
//! Debug mode can be enabled with `--debug` or `CADENCE_DEBUG=1`. An explicit
//! `RUST_LOG` always wins.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::EnvFilter;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging to ~/.cadence/cadence.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let default_level = if debug_enabled { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file = dirs::home_dir()
        .map(|h| h.join(".cadence"))
        .and_then(|dir| {
            std::fs::create_dir_all(&dir).ok()?;
            let path = dir.join("cadence.log");
            // Truncate file on startup
            let file = File::create(&path).ok()?;
            LOG_PATH.set(path).ok();
            Some(file)
        });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    // try_init: a second call (tests, embedding hosts) keeps the first subscriber.
    let _ = match file {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the active log file, if logging to a file.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

fn env_debug() -> bool {
    parse_debug_flag(std::env::var("CADENCE_DEBUG").ok().as_deref())
}

fn parse_debug_flag(value: Option<&str>) -> bool {
    value
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
