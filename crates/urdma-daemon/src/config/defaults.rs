//! Library defaults for [`DaemonConfig`](super::DaemonConfig)

use std::net::Ipv4Addr;

use urdma_core::constants::{DEFAULT_MAX_QP, DEFAULT_RX_DESC_COUNT};

/// Control socket path
pub const SOCK_NAME: &str = "/run/urdma.sock";

/// Kernel notification character device
pub const CHARDEV: &str = "/dev/urdma";

pub const PORT_COUNT: usize = 1;

pub const PORT_IPV4: Ipv4Addr = Ipv4Addr::LOCALHOST;

pub const PORT_MTU: u16 = 1500;

/// Queue pairs per port, excluding the control QP 0
pub const MAX_QP: u16 = DEFAULT_MAX_QP;

/// Used when the port cannot report its rx ring size
pub const RX_DESC_COUNT: u16 = DEFAULT_RX_DESC_COUNT;

/// Install flow-director steering rules
pub const FLOW_DIRECTOR: bool = false;

/// Event loop wait before the per-port tick
pub const POLL_TIMEOUT_MS: u64 = 50;

/// Worker cores when `URDMA_WORKER_CORES` is unset: every online core
/// except core 0, which runs the event loop
pub fn worker_cores() -> Vec<usize> {
    let online = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (1..online.max(2)).collect()
}
