// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Placement controller configuration.

use std::time::Duration;

use plinth_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default heartbeat age after which a node is considered degraded.
pub const DEFAULT_DEGRADED_AFTER_MS: u64 = 15_000;

/// Default heartbeat age after which a node is considered offline.
pub const DEFAULT_OFFLINE_AFTER_MS: u64 = 60_000;

/// Default capacity of the placement event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configuration for the [`PlacementController`](crate::PlacementController).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Heartbeat age (ms) after which a healthy node is demoted to degraded.
    pub degraded_after_ms: u64,
    /// Heartbeat age (ms) after which a node is demoted to offline.
    pub offline_after_ms: u64,
    /// Take one node per distinct tier before filling by rank.
    pub spread_tiers: bool,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            degraded_after_ms: DEFAULT_DEGRADED_AFTER_MS,
            offline_after_ms: DEFAULT_OFFLINE_AFTER_MS,
            spread_tiers: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl PlacementConfig {
    /// Sets the degraded threshold.
    #[must_use]
    pub fn degraded_after(mut self, after: Duration) -> Self {
        self.degraded_after_ms = after.as_millis() as u64;
        self
    }

    /// Sets the offline threshold.
    #[must_use]
    pub fn offline_after(mut self, after: Duration) -> Self {
        self.offline_after_ms = after.as_millis() as u64;
        self
    }

    /// Enables or disables tier spreading.
    #[must_use]
    pub fn spread_tiers(mut self, spread: bool) -> Self {
        self.spread_tiers = spread;
        self
    }

    /// Returns the degraded threshold as a Duration.
    #[must_use]
    pub fn degraded_after_duration(&self) -> Duration {
        Duration::from_millis(self.degraded_after_ms)
    }

    /// Returns the offline threshold as a Duration.
    #[must_use]
    pub fn offline_after_duration(&self) -> Duration {
        Duration::from_millis(self.offline_after_ms)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a threshold is zero, the offline threshold
    /// does not exceed the degraded one, or the event capacity is zero.
    pub fn validate(&self) -> Result<()> {
        if self.degraded_after_ms == 0 {
            return Err(Error::Config("placement.degraded_after_ms must be > 0".to_string()));
        }
        if self.offline_after_ms <= self.degraded_after_ms {
            return Err(Error::Config(
                "placement.offline_after_ms must exceed degraded_after_ms".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("placement.event_capacity must be > 0".to_string()));
        }
        Ok(())
    }
}
