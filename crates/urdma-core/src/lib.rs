//! # urdma-core
//!
//! Platform-agnostic building blocks shared by the iWARP connection
//! manager (`urdma-cm`) and the dataplane daemon (`urdma-daemon`).
//!
//! ## Modules
//!
//! - [`error`]: Error type and taxonomy classes
//! - [`core_mask`]: Worker-core bitmask and allocation pool
//! - [`ids`]: Device and queue-pair identifiers
//! - [`sock`]: Control-channel message codec (client <-> daemon)
//! - [`kabi`]: Kernel notification record codec (kernel <-> daemon)
//! - [`spinlock`]: Slot-local lock shared with the packet-processing core
//! - [`poller`]: epoll readiness polling (Linux)
//! - [`env`]: Environment variable helpers used by config loaders
//! - [`logging`]: `tracing` subscriber setup and log-once macros

pub mod core_mask;
pub mod env;
pub mod error;
pub mod ids;
pub mod kabi;
pub mod logging;
pub mod sock;
pub mod spinlock;

// Platform detection
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod poller;
        pub use poller::{Interest, Poller, Readiness};
    } else {
        compile_error!("urdma requires Linux (epoll, eventfd)");
    }
}

// Re-exports for convenience
pub use core_mask::{CoreMask, CorePool, CORE_MASK_WORDS, MAX_CORES};
pub use error::{ConfigError, Error, ErrorClass, Result};
pub use ids::{DevId, QpId};
pub use spinlock::{SpinLock, SpinLockGuard};

// Used by the log-once macros so callers don't need their own import.
#[doc(hidden)]
pub use tracing;

/// Protocol constants shared across the kernel/daemon boundary
pub mod constants {
    /// Maximum MPA private data length accepted or sent
    pub const PDATA_LEN_MAX: usize = 512;

    /// Queue pair 0 on each port carries port control traffic
    pub const CONTROL_QP_ID: u16 = 0;

    /// Default number of queue pairs per port (excluding the control QP)
    pub const DEFAULT_MAX_QP: u16 = 63;

    /// Default receive descriptor count when the port cannot report one
    pub const DEFAULT_RX_DESC_COUNT: u16 = 512;
}
