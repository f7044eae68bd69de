//! urdma dataplane daemon
//!
//! Hands worker cores and queue pairs to client processes over a
//! SOCK_SEQPACKET control socket, and brings QP dataplanes up and down
//! as the kernel module reports connections.
//!
//! # Architecture
//!
//! | Module | Role |
//! |--------|------|
//! | `daemon` | Event loop and `DaemonBuilder` |
//! | `process` | Client registry and control protocol |
//! | `qp_pool` | Per-port QP slots with published connection state |
//! | `chardev` | Kernel notification channel |
//! | `control` | Control socket listener |
//! | `port` | NIC queue and steering boundary |
//! | `signal` | SIGINT/SIGTERM shutdown flag |
//! | `config` | `DaemonConfig` with env overrides |
//!
//! ```rust,ignore
//! use urdma_daemon::{DaemonBuilder, DaemonConfig, SoftPorts};
//!
//! let config = DaemonConfig::from_env();
//! let ports = SoftPorts::new(config.ports.len(), config.flow_director);
//! DaemonBuilder::new().config(config).build(ports)?.run()?;
//! ```

pub mod chardev;
pub mod config;
pub mod control;
pub mod daemon;
pub mod port;
pub mod process;
pub mod qp_pool;
pub mod signal;

pub use config::{DaemonConfig, PortConfig};
pub use daemon::{Daemon, DaemonBuilder};
pub use port::{PortOps, SoftPorts, SteeringRule};
pub use process::{ProcessId, ProcessRegistry, Session};
pub use qp_pool::{QpConnState, QpParams, QpPool, QpSlot};
