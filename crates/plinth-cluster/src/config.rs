// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Cluster configuration loaded from TOML.
//!
//! Every section is optional; missing fields take their defaults.
//!
//! ```toml
//! [quorum]
//! replication_factor = 3
//! write_quorum = 2
//! read_quorum = 2
//!
//! [placement]
//! offline_after_ms = 60000
//!
//! [repair]
//! interval_ms = 60000
//!
//! [scrub]
//! interval_ms = 300000
//! sample_size = 1000
//! ```

use std::path::Path;
use std::time::Duration;

use plinth_core::{Error, Result};
use plinth_placement::PlacementConfig;
use plinth_quorum::QuorumConfig;
use serde::{Deserialize, Serialize};

/// Default repair cycle interval in milliseconds.
pub const DEFAULT_REPAIR_INTERVAL_MS: u64 = 60_000;

/// Default scrub cycle interval in milliseconds.
pub const DEFAULT_SCRUB_INTERVAL_MS: u64 = 300_000;

/// Default number of objects verified per scrub cycle.
pub const DEFAULT_SCRUB_SAMPLE_SIZE: usize = 1_000;

/// Settings for the repair cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Interval between repair cycles in milliseconds.
    pub interval_ms: u64,

    /// Run a cycle immediately when a node is removed or goes offline.
    pub wake_on_node_loss: bool,

    /// Upper bound on objects repaired per cycle. Zero means no bound.
    pub max_objects_per_cycle: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_REPAIR_INTERVAL_MS,
            wake_on_node_loss: true,
            max_objects_per_cycle: 0,
        }
    }
}

impl RepairConfig {
    /// Sets the cycle interval.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets whether node loss wakes the repair loop.
    #[must_use]
    pub fn wake_on_node_loss(mut self, wake: bool) -> Self {
        self.wake_on_node_loss = wake;
        self
    }

    /// Sets the per-cycle object bound.
    #[must_use]
    pub fn max_objects_per_cycle(mut self, max: usize) -> Self {
        self.max_objects_per_cycle = max;
        self
    }

    /// Returns the cycle interval as a Duration.
    #[must_use]
    pub fn interval_duration(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Settings for the scrub cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrubConfig {
    /// Interval between scrub cycles in milliseconds.
    pub interval_ms: u64,

    /// Objects verified per cycle.
    pub sample_size: usize,
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self { interval_ms: DEFAULT_SCRUB_INTERVAL_MS, sample_size: DEFAULT_SCRUB_SAMPLE_SIZE }
    }
}

impl ScrubConfig {
    /// Sets the cycle interval.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the per-cycle sample size.
    #[must_use]
    pub fn sample_size(mut self, size: usize) -> Self {
        self.sample_size = size;
        self
    }

    /// Returns the cycle interval as a Duration.
    #[must_use]
    pub fn interval_duration(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Configuration for a replication cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Interval of the liveness sweep in milliseconds. Zero disables it.
    pub liveness_sweep_ms: u64,
    /// Replication factor, quorums, and timeouts.
    pub quorum: QuorumConfig,
    /// Node liveness thresholds and selection options.
    pub placement: PlacementConfig,
    /// Repair cycle settings.
    pub repair: RepairConfig,
    /// Scrub cycle settings.
    pub scrub: ScrubConfig,
}

impl ClusterConfig {
    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the text is not valid TOML for this schema.
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid cluster config: {e}")))
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Returns the liveness sweep interval, if enabled.
    #[must_use]
    pub fn liveness_sweep_duration(&self) -> Option<Duration> {
        (self.liveness_sweep_ms > 0).then(|| Duration::from_millis(self.liveness_sweep_ms))
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuorumConfig` for quorum bounds and `Config` for the
    /// other sections.
    pub fn validate(&self) -> Result<()> {
        self.quorum.validate()?;
        self.placement.validate()?;
        if self.repair.interval_ms == 0 {
            return Err(Error::Config("repair.interval_ms must be positive".to_string()));
        }
        if self.scrub.interval_ms == 0 {
            return Err(Error::Config("scrub.interval_ms must be positive".to_string()));
        }
        if self.scrub.sample_size == 0 {
            return Err(Error::Config("scrub.sample_size must be positive".to_string()));
        }
        Ok(())
    }
}
