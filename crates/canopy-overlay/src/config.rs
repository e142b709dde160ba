//! Node configuration.

use std::time::Duration;

use crate::delegation::DelegationMode;
use crate::error::{Error, Result};
use crate::types::PeerOptions;

/// Default upper bound on simultaneous children plus candidates.
pub const DEFAULT_MAX_DEGREE: usize = 10;

/// Default time after which an unconfirmed attempt is abandoned.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a tree node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Maximum simultaneous children plus candidates.
    pub max_degree: usize,

    /// Abandon a parent or candidate attempt that has not connected by then.
    pub request_timeout: Duration,

    /// Opaque transport options forwarded to every `connect`.
    pub peer_options: PeerOptions,

    /// Slot selection for delegated join requests.
    pub delegation: DelegationMode,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_degree: DEFAULT_MAX_DEGREE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            peer_options: PeerOptions::Object(Default::default()),
            delegation: DelegationMode::default(),
        }
    }
}

impl NodeConfig {
    /// Set the fan-out bound.
    #[must_use]
    pub fn with_max_degree(mut self, max_degree: usize) -> Self {
        self.max_degree = max_degree;
        self
    }

    /// Set the attempt timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the transport options.
    #[must_use]
    pub fn with_peer_options(mut self, options: PeerOptions) -> Self {
        self.peer_options = options;
        self
    }

    /// Set the delegation mode.
    #[must_use]
    pub fn with_delegation(mut self, mode: DelegationMode) -> Self {
        self.delegation = mode;
        self
    }

    /// Reject configurations a node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_degree == 0 {
            return Err(Error::InvalidConfig("max_degree must be at least 1".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidConfig("request_timeout must be non-zero".into()));
        }
        Ok(())
    }

    /// Defaults overridden by `CANOPY_MAX_DEGREE`, `CANOPY_REQUEST_TIMEOUT_MS`
    /// and `CANOPY_DELEGATION`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup("CANOPY_MAX_DEGREE") {
            config.max_degree = raw
                .trim()
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("CANOPY_MAX_DEGREE={raw:?}")))?;
        }

        if let Some(raw) = lookup("CANOPY_REQUEST_TIMEOUT_MS") {
            let ms: u64 = raw
                .trim()
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("CANOPY_REQUEST_TIMEOUT_MS={raw:?}")))?;
            config.request_timeout = Duration::from_millis(ms);
        }

        if let Some(raw) = lookup("CANOPY_DELEGATION") {
            config.delegation = raw.trim().parse()?;
        }

        config.validate()?;
        Ok(config)
    }
}
