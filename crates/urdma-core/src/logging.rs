//! Logging setup
//!
//! All crates log through `tracing`. Binaries call [`init`] once at
//! startup; libraries only emit events.
//!
//! # Environment Variables
//!
//! - `URDMA_LOG_LEVEL`: filter directive (`error`, `info`, `urdma_cm=debug`, ...)
//! - `RUST_LOG`: used when `URDMA_LOG_LEVEL` is unset
//! - `URDMA_LOG_TARGET`: show the module target on each line (default off)

use std::sync::Once;

use tracing_subscriber::EnvFilter;

use crate::env::env_get_bool;

pub const LOG_LEVEL_ENV: &str = "URDMA_LOG_LEVEL";
pub const LOG_TARGET_ENV: &str = "URDMA_LOG_TARGET";

static INIT: Once = Once::new();

/// Install the global subscriber with an `info` default
pub fn init() {
    init_with_default("info");
}

/// Install the global subscriber; later calls are no-ops
pub fn init_with_default(default_level: &str) {
    INIT.call_once(|| {
        let filter = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|v| EnvFilter::try_new(v).ok())
            .or_else(|| EnvFilter::try_from_default_env().ok())
            .unwrap_or_else(|| EnvFilter::new(default_level));

        // A test harness may already have installed a subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(env_get_bool(LOG_TARGET_ENV, false))
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// Log an error the first time this call site is reached
///
/// Used for conditions a misbehaving peer can trigger repeatedly.
#[macro_export]
macro_rules! error_once {
    ($($arg:tt)+) => {{
        static LOGGED: ::std::sync::atomic::AtomicBool =
            ::std::sync::atomic::AtomicBool::new(false);
        if !LOGGED.swap(true, ::std::sync::atomic::Ordering::Relaxed) {
            $crate::tracing::error!($($arg)+);
        }
    }};
}

/// Log a warning the first time this call site is reached
#[macro_export]
macro_rules! warn_once {
    ($($arg:tt)+) => {{
        static LOGGED: ::std::sync::atomic::AtomicBool =
            ::std::sync::atomic::AtomicBool::new(false);
        if !LOGGED.swap(true, ::std::sync::atomic::Ordering::Relaxed) {
            $crate::tracing::warn!($($arg)+);
        }
    }};
}
