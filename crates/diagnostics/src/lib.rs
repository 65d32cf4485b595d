//! Logging shim shared by the afcondense crates
//!
//! Every crate logs through the macros defined here so the runtime is set up
//! in exactly one place.
//!
//! Usage:
//! - Set AFCONDENSE_LOG=off (default) - no logs
//! - Set AFCONDENSE_LOG=info - fetch, condense and extract progress
//! - Set AFCONDENSE_LOG=debug - per-level and per-chunk detail

use std::sync::Once;

// Re-export emit so macros can use it
pub use emit;

/// Environment variable holding the minimum log level.
pub const LOG_ENV: &str = "AFCONDENSE_LOG";

static INIT: Once = Once::new();

fn level_filter(name: &str) -> Option<emit::Level> {
    match name {
        "debug" => Some(emit::Level::Debug),
        "info" => Some(emit::Level::Info),
        "warn" => Some(emit::Level::Warn),
        "error" => Some(emit::Level::Error),
        _ => None,
    }
}

/// Initialize diagnostics based on the AFCONDENSE_LOG environment variable
///
/// Call once at startup. Later calls are ignored.
pub fn init_diagnostics() {
    INIT.call_once(|| {
        let log_level = std::env::var(LOG_ENV).unwrap_or_else(|_| "off".to_string());
        if log_level == "off" {
            return;
        }

        let (min_level, known) = match level_filter(&log_level) {
            Some(level) => (level, true),
            None => (emit::Level::Info, false),
        };

        let rt = emit::setup()
            .emit_to(emit_term::stderr())
            .emit_when(emit::level::min_filter(min_level))
            .init();

        if !known {
            // Bootstrap warning, the runtime above may filter it otherwise
            eprintln!("Warning: Unknown {LOG_ENV} value '{log_level}', using 'info'");
        }

        // The runtime lives for the whole process
        std::mem::forget(rt);
    });
}

/// Log progress that users want to see in normal usage.
/// Examples: "Fetching hierarchy for 3 roots", "Condensing 4 levels"
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

/// Log detailed diagnostics.
/// Examples: "Level 2 has 14 rows", "Chunk 3 finished with 200 rows"
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

/// Log conditions that don't stop the operation but should be noted.
/// Examples: "Extracting for 400 rows", "Dropped 2 rows without a node"
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

/// Log failures.
/// Examples: "Chunk 2 failed", "Data source rejected the query"
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

/// Re-export the init function for convenience
pub use init_diagnostics as init;
