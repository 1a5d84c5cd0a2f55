use std::time::Duration;
use thiserror::Error;

/// Tunables for the application layer.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Flush the registry and persist watermarks every N applied entries.
    /// Count-based only; there is no time-based trigger.
    pub flush_every: u64,
    /// Records written to a durable state file before rotating to its twin.
    pub rotation_bound: usize,
    /// Capacity of the in-memory entry tail cache.
    pub cache_capacity: usize,
    /// Bound on waiting for a peer's snapshot during catch-up.
    pub snapshot_request_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            flush_every: 512,
            rotation_bound: 1_000,
            cache_capacity: 1_024,
            snapshot_request_timeout: Duration::from_secs(30),
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_every == 0 {
            return Err(ConfigError::InvalidFlushInterval);
        }
        if self.rotation_bound == 0 {
            return Err(ConfigError::InvalidRotationBound);
        }
        if self.snapshot_request_timeout.is_zero() {
            return Err(ConfigError::InvalidSnapshotTimeout);
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("flush interval must be non-zero")]
    InvalidFlushInterval,
    #[error("rotation bound must be non-zero")]
    InvalidRotationBound,
    #[error("snapshot request timeout must be non-zero")]
    InvalidSnapshotTimeout,
}
