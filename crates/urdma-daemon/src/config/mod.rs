//! Daemon configuration
//!
//! Library defaults with environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder methods
//! 2. Environment variables
//! 3. Library defaults
//!
//! ```rust,ignore
//! use urdma_daemon::config::DaemonConfig;
//!
//! let config = DaemonConfig::from_env().max_qp(31).flow_director(true);
//! config.validate()?;
//! ```

pub mod defaults;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;
use urdma_core::core_mask::{CoreMask, MAX_CORES};
use urdma_core::env::{env_get, env_get_bool, env_get_opt, env_get_str};
use urdma_core::error::ConfigError;

/// One network port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConfig {
    /// Address QPs on this port send from
    pub ipv4: Ipv4Addr,
    pub mtu: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self { ipv4: defaults::PORT_IPV4, mtu: defaults::PORT_MTU }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// SOCK_SEQPACKET control socket path
    pub sock_name: PathBuf,
    /// Kernel notification channel
    pub chardev: PathBuf,
    /// Ports, indexed by dev_id
    pub ports: Vec<PortConfig>,
    /// Allocatable QPs per port
    pub max_qp: u16,
    /// Fallback rx descriptor count
    pub rx_desc_count: u16,
    pub flow_director: bool,
    /// Cores handed out to client processes
    pub worker_cores: CoreMask,
    pub poll_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl DaemonConfig {
    /// Defaults with environment overrides
    ///
    /// Environment variables (all optional):
    /// - `URDMA_SOCK_NAME` - Control socket path
    /// - `URDMA_CHARDEV` - Kernel channel path
    /// - `URDMA_PORT_COUNT` - Number of ports
    /// - `URDMA_PORT<n>_IPV4` - Address of port n
    /// - `URDMA_PORT<n>_MTU` - MTU of port n
    /// - `URDMA_MAX_QP` - QPs per port
    /// - `URDMA_RX_DESC_COUNT` - Fallback rx descriptor count
    /// - `URDMA_FDIR` - Use flow-director steering (0/1)
    /// - `URDMA_WORKER_CORES` - Core list, e.g. `1,2,4-7`
    /// - `URDMA_POLL_TIMEOUT_MS` - Event loop wait in milliseconds
    pub fn from_env() -> Self {
        let port_count = env_get("URDMA_PORT_COUNT", defaults::PORT_COUNT);
        let ports = (0..port_count)
            .map(|n| PortConfig {
                ipv4: env_get(&format!("URDMA_PORT{}_IPV4", n), defaults::PORT_IPV4),
                mtu: env_get(&format!("URDMA_PORT{}_MTU", n), defaults::PORT_MTU),
            })
            .collect();

        Self {
            sock_name: PathBuf::from(env_get_str("URDMA_SOCK_NAME", defaults::SOCK_NAME)),
            chardev: PathBuf::from(env_get_str("URDMA_CHARDEV", defaults::CHARDEV)),
            ports,
            max_qp: env_get("URDMA_MAX_QP", defaults::MAX_QP),
            rx_desc_count: env_get("URDMA_RX_DESC_COUNT", defaults::RX_DESC_COUNT),
            flow_director: env_get_bool("URDMA_FDIR", defaults::FLOW_DIRECTOR),
            worker_cores: worker_cores_from_env(),
            poll_timeout: Duration::from_millis(env_get(
                "URDMA_POLL_TIMEOUT_MS",
                defaults::POLL_TIMEOUT_MS,
            )),
        }
    }

    /// Library defaults only
    pub fn new() -> Self {
        Self {
            sock_name: PathBuf::from(defaults::SOCK_NAME),
            chardev: PathBuf::from(defaults::CHARDEV),
            ports: vec![PortConfig::default(); defaults::PORT_COUNT],
            max_qp: defaults::MAX_QP,
            rx_desc_count: defaults::RX_DESC_COUNT,
            flow_director: defaults::FLOW_DIRECTOR,
            worker_cores: default_worker_cores(),
            poll_timeout: Duration::from_millis(defaults::POLL_TIMEOUT_MS),
        }
    }

    // Builder methods

    pub fn sock_name(mut self, path: impl Into<PathBuf>) -> Self {
        self.sock_name = path.into();
        self
    }

    pub fn chardev(mut self, path: impl Into<PathBuf>) -> Self {
        self.chardev = path.into();
        self
    }

    pub fn ports(mut self, ports: Vec<PortConfig>) -> Self {
        self.ports = ports;
        self
    }

    pub fn max_qp(mut self, n: u16) -> Self {
        self.max_qp = n;
        self
    }

    pub fn rx_desc_count(mut self, n: u16) -> Self {
        self.rx_desc_count = n;
        self
    }

    pub fn flow_director(mut self, enable: bool) -> Self {
        self.flow_director = enable;
        self
    }

    pub fn worker_cores(mut self, cores: CoreMask) -> Self {
        self.worker_cores = cores;
        self
    }

    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.poll_timeout = d;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.is_empty() {
            return Err(ConfigError::InvalidValue("port_count must be > 0"));
        }
        if self.ports.len() > u16::MAX as usize {
            return Err(ConfigError::InvalidValue("port_count must fit a 16-bit dev_id"));
        }
        if self.max_qp == 0 {
            return Err(ConfigError::InvalidValue("max_qp must be > 0"));
        }
        if self.rx_desc_count == 0 {
            return Err(ConfigError::InvalidValue("rx_desc_count must be > 0"));
        }
        if self.ports.iter().any(|p| p.mtu < 576) {
            return Err(ConfigError::InvalidValue("port mtu must be >= 576"));
        }
        if self.worker_cores.is_empty() {
            return Err(ConfigError::InvalidValue("worker_cores must not be empty"));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("poll_timeout must be > 0"));
        }
        Ok(())
    }
}

fn default_worker_cores() -> CoreMask {
    CoreMask::from_cores(defaults::worker_cores().into_iter().filter(|&c| c < MAX_CORES))
        .unwrap_or_default()
}

fn worker_cores_from_env() -> CoreMask {
    let Some(list) = env_get_opt::<String>("URDMA_WORKER_CORES") else {
        return default_worker_cores();
    };
    match CoreMask::parse_list(&list) {
        Ok(mask) => mask,
        Err(e) => {
            warn!(list = %list, error = %e, "ignoring URDMA_WORKER_CORES");
            default_worker_cores()
        }
    }
}
