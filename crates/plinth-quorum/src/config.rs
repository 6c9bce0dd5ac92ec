// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Quorum configuration and its static validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default replication factor (number of replicas per object).
pub const DEFAULT_REPLICATION_FACTOR: usize = 3;

/// Default write quorum.
pub const DEFAULT_WRITE_QUORUM: usize = 2;

/// Default read quorum.
pub const DEFAULT_READ_QUORUM: usize = 2;

/// Default per-node operation timeout in milliseconds.
pub const DEFAULT_NODE_TIMEOUT_MS: u64 = 5_000;

/// Default deadline for a whole quorum call in milliseconds.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 10_000;

/// Replication factor, quorum thresholds, and timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    /// Target number of replicas per object.
    pub replication_factor: usize,

    /// Acknowledgments required for a write to succeed.
    pub write_quorum: usize,

    /// Agreeing replicas required for a read to succeed.
    pub read_quorum: usize,

    /// Timeout for a single node operation in milliseconds.
    pub node_timeout_ms: u64,

    /// Deadline for a whole quorum call in milliseconds.
    pub operation_timeout_ms: u64,

    /// Reject configurations where read and write quorums need not overlap.
    ///
    /// Off by default: `write_quorum + read_quorum > replication_factor` is
    /// required for read-your-writes but is only reported, not enforced.
    pub require_overlap: bool,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            write_quorum: DEFAULT_WRITE_QUORUM,
            read_quorum: DEFAULT_READ_QUORUM,
            node_timeout_ms: DEFAULT_NODE_TIMEOUT_MS,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            require_overlap: false,
        }
    }
}

impl QuorumConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the replication factor.
    #[must_use]
    pub fn replication_factor(mut self, factor: usize) -> Self {
        self.replication_factor = factor;
        self
    }

    /// Sets the write quorum.
    #[must_use]
    pub fn write_quorum(mut self, quorum: usize) -> Self {
        self.write_quorum = quorum;
        self
    }

    /// Sets the read quorum.
    #[must_use]
    pub fn read_quorum(mut self, quorum: usize) -> Self {
        self.read_quorum = quorum;
        self
    }

    /// Sets the per-node timeout.
    #[must_use]
    pub fn node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the whole-call deadline.
    #[must_use]
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets whether quorum overlap is enforced.
    #[must_use]
    pub fn require_overlap(mut self, require: bool) -> Self {
        self.require_overlap = require;
        self
    }

    /// Returns the per-node timeout as a Duration.
    #[must_use]
    pub fn node_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    /// Returns the whole-call deadline as a Duration.
    #[must_use]
    pub fn operation_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Returns true if every read quorum intersects every write quorum.
    #[must_use]
    pub fn is_strongly_consistent(&self) -> bool {
        self.write_quorum + self.read_quorum > self.replication_factor
    }

    /// Number of replica failures a write tolerates.
    #[must_use]
    pub fn write_fault_tolerance(&self) -> usize {
        self.replication_factor.saturating_sub(self.write_quorum)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first bound the configuration violates.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        validate(self)
    }
}

/// Checks the static bounds of a quorum configuration.
///
/// Called once when a coordinator is built, never per request.
///
/// # Errors
///
/// Returns the first bound the configuration violates.
pub fn validate(config: &QuorumConfig) -> Result<(), ConfigValidationError> {
    let rf = config.replication_factor;
    if rf == 0 {
        return Err(ConfigValidationError::InvalidReplicationFactor);
    }
    if config.write_quorum == 0 || config.write_quorum > rf {
        return Err(ConfigValidationError::InvalidWriteQuorum {
            write_quorum: config.write_quorum,
            replication_factor: rf,
        });
    }
    if config.read_quorum == 0 || config.read_quorum > rf {
        return Err(ConfigValidationError::InvalidReadQuorum {
            read_quorum: config.read_quorum,
            replication_factor: rf,
        });
    }
    if config.node_timeout_ms == 0 || config.operation_timeout_ms == 0 {
        return Err(ConfigValidationError::InvalidTimeout);
    }
    if config.require_overlap && !config.is_strongly_consistent() {
        return Err(ConfigValidationError::NoQuorumOverlap {
            write_quorum: config.write_quorum,
            read_quorum: config.read_quorum,
            replication_factor: rf,
        });
    }
    Ok(())
}

/// Errors from configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    /// Replication factor must be at least 1.
    #[error("replication factor must be at least 1")]
    InvalidReplicationFactor,

    /// Write quorum must be within `[1, replication_factor]`.
    #[error("write quorum {write_quorum} outside [1, {replication_factor}]")]
    InvalidWriteQuorum {
        /// Configured write quorum.
        write_quorum: usize,
        /// Configured replication factor.
        replication_factor: usize,
    },

    /// Read quorum must be within `[1, replication_factor]`.
    #[error("read quorum {read_quorum} outside [1, {replication_factor}]")]
    InvalidReadQuorum {
        /// Configured read quorum.
        read_quorum: usize,
        /// Configured replication factor.
        replication_factor: usize,
    },

    /// Timeouts must be positive.
    #[error("timeouts must be positive")]
    InvalidTimeout,

    /// Overlap was required but the quorums do not intersect.
    #[error(
        "write quorum {write_quorum} + read quorum {read_quorum} must exceed replication factor {replication_factor}"
    )]
    NoQuorumOverlap {
        /// Configured write quorum.
        write_quorum: usize,
        /// Configured read quorum.
        read_quorum: usize,
        /// Configured replication factor.
        replication_factor: usize,
    },
}

impl From<ConfigValidationError> for plinth_core::Error {
    fn from(err: ConfigValidationError) -> Self {
        Self::InvalidQuorumConfig(err.to_string())
    }
}
