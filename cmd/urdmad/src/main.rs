//! urdmad: the urdma dataplane daemon
//!
//! Configured entirely from the environment; see `DaemonConfig::from_env`.
//!
//! Usage:
//!   URDMA_WORKER_CORES=2-7 URDMA_FDIR=1 urdmad

use std::process::ExitCode;

use tracing::{error, info};
use urdma_core::error::Result;
use urdma_core::logging;
use urdma_daemon::{signal, DaemonBuilder, DaemonConfig, SoftPorts};

fn run() -> Result<()> {
    let config = DaemonConfig::from_env();
    config.validate()?;
    info!(
        sock = %config.sock_name.display(),
        chardev = %config.chardev.display(),
        worker_cores = ?config.worker_cores,
        "starting"
    );

    signal::install()?;

    let ports = SoftPorts::new(config.ports.len(), config.flow_director)
        .with_desc_count(config.rx_desc_count);
    let mut daemon = DaemonBuilder::new().config(config).build(ports)?;
    daemon.run()
}

fn main() -> ExitCode {
    logging::init();

    match run() {
        Ok(()) => {
            info!("exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, class = ?e.class(), "urdmad failed");
            ExitCode::FAILURE
        }
    }
}
