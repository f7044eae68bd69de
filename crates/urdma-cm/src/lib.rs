//! # urdma-cm
//!
//! iWARP connection manager: per-connection endpoints (CEPs) driven
//! through the MPA handshake over TCP, with one deferred work item per
//! CEP at a time.
//!
//! ## Modules
//!
//! | Module      | Role                                              |
//! |-------------|---------------------------------------------------|
//! | `cm`        | `ConnectionManager`: operations and event loop    |
//! | `cep`       | Endpoint arena with generational ids and refcounts |
//! | `state`     | Handshake states                                  |
//! | `mpa`       | MPA frame codec and incremental receiver          |
//! | `work`      | Per-CEP work slots and the deadline dispatcher    |
//! | `link`      | QP boundary: upcalls, `QpLink`, `RtrNotifier`     |
//! | `transport` | Non-blocking TCP sockets                          |
//! | `notifier`  | eventfd wakeup for cross-thread RTR notices       |
//! | `config`    | Timeouts and limits with env overrides            |
//!
//! ```rust,ignore
//! let mut cm = CmBuilder::new().build(Vec::<KernelEvent>::new())?;
//! let (tx, rx) = std::sync::mpsc::channel();
//! let listener = cm.create_listener(addr, tx)?;
//! loop {
//!     cm.poll(None)?;
//!     while let Ok(CmEvent::ConnectRequest { cep, .. }) = rx.try_recv() {
//!         cm.accept(cep, b"", qp)?;
//!     }
//! }
//! ```

pub mod cep;
pub mod cm;
pub mod config;
pub mod link;
pub mod mpa;
pub mod notifier;
pub mod state;
pub mod transport;
pub mod work;

pub use cep::{Cep, CepId};
pub use cm::{CmBuilder, ConnectionManager};
pub use config::CmConfig;
pub use link::{BoundQp, CloseReason, CmEvent, QpLink, RecordLink, RtrNotifier};
pub use state::CepState;
pub use work::{WorkStats, WorkType};
