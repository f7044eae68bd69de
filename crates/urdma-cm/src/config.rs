//! Connection manager configuration
//!
//! Library defaults with environment overrides, in the same shape as the
//! daemon's config.
//!
//! ```rust,ignore
//! use urdma_cm::config::CmConfig;
//!
//! let config = CmConfig::from_env().mpa_reply_timeout(Duration::from_secs(2));
//! ```

use std::time::Duration;

use urdma_core::env::env_get;
use urdma_core::error::ConfigError;

/// Library defaults
pub mod defaults {
    use urdma_core::constants::PDATA_LEN_MAX;

    /// Time for the peer's MPA request (passive) or reply (active)
    pub const MPA_REQ_TIMEOUT_MS: u64 = 10_000;

    /// Time between sending our reply and the QP reaching RTR
    pub const MPA_REP_TIMEOUT_MS: u64 = 5_000;

    pub const PDATA_MAX: usize = PDATA_LEN_MAX;

    /// Readiness events handled per poll
    pub const MAX_EVENTS: usize = 64;
}

#[derive(Debug, Clone)]
pub struct CmConfig {
    /// Bound on waiting for the peer's MPA frame
    pub mpa_request_timeout: Duration,
    /// Bound on waiting for RTR after the handshake
    pub mpa_reply_timeout: Duration,
    /// Largest private data accepted from or sent to a peer
    pub pdata_max: usize,
    pub max_events: usize,
}

impl Default for CmConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl CmConfig {
    /// Defaults with environment overrides
    ///
    /// - `URDMA_MPA_REQ_TIMEOUT_MS`
    /// - `URDMA_MPA_REP_TIMEOUT_MS`
    /// - `URDMA_PDATA_MAX`
    pub fn from_env() -> Self {
        Self {
            mpa_request_timeout: Duration::from_millis(env_get(
                "URDMA_MPA_REQ_TIMEOUT_MS",
                defaults::MPA_REQ_TIMEOUT_MS,
            )),
            mpa_reply_timeout: Duration::from_millis(env_get(
                "URDMA_MPA_REP_TIMEOUT_MS",
                defaults::MPA_REP_TIMEOUT_MS,
            )),
            pdata_max: env_get("URDMA_PDATA_MAX", defaults::PDATA_MAX),
            max_events: defaults::MAX_EVENTS,
        }
    }

    /// Library defaults only
    pub fn new() -> Self {
        Self {
            mpa_request_timeout: Duration::from_millis(defaults::MPA_REQ_TIMEOUT_MS),
            mpa_reply_timeout: Duration::from_millis(defaults::MPA_REP_TIMEOUT_MS),
            pdata_max: defaults::PDATA_MAX,
            max_events: defaults::MAX_EVENTS,
        }
    }

    // Builder methods

    pub fn mpa_request_timeout(mut self, d: Duration) -> Self {
        self.mpa_request_timeout = d;
        self
    }

    pub fn mpa_reply_timeout(mut self, d: Duration) -> Self {
        self.mpa_reply_timeout = d;
        self
    }

    pub fn pdata_max(mut self, n: usize) -> Self {
        self.pdata_max = n;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mpa_request_timeout.is_zero() || self.mpa_reply_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("MPA timeouts must be > 0"));
        }
        if self.pdata_max > u16::MAX as usize {
            return Err(ConfigError::InvalidValue("pdata_max must fit the 16-bit length field"));
        }
        if self.max_events == 0 {
            return Err(ConfigError::InvalidValue("max_events must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CmConfig::new();
        assert_eq!(config.mpa_request_timeout, Duration::from_secs(10));
        assert_eq!(config.mpa_reply_timeout, Duration::from_secs(5));
        assert_eq!(config.pdata_max, 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_and_validation() {
        let config = CmConfig::new().mpa_reply_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = CmConfig::new().pdata_max(70_000);
        assert!(config.validate().is_err());

        let config = CmConfig::new().mpa_request_timeout(Duration::from_millis(50));
        assert_eq!(config.mpa_request_timeout, Duration::from_millis(50));
    }
}
