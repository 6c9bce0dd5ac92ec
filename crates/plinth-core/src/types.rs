// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Shared data model: nodes, objects, buckets, and per-node results.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Version id used for objects in buckets without versioning.
pub const NULL_VERSION_ID: &str = "null";

/// Storage tier of a node. Placement spreads replicas across tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeTier {
    /// Fast media for frequently accessed data.
    #[default]
    Hot,
    /// Balanced media.
    Warm,
    /// Dense, slow media.
    Cold,
}

impl fmt::Display for NodeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
        };
        f.write_str(s)
    }
}

/// Health of a storage node.
///
/// `Healthy → Degraded → Offline` follows missed heartbeats, and a fresh
/// report brings a node back to `Healthy`. `Removed` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Responding normally; preferred for placement.
    #[default]
    Healthy,
    /// Responding late or partially; placement fallback only.
    Degraded,
    /// Not responding; never selected.
    Offline,
    /// Explicitly deregistered; never selected again.
    Removed,
}

impl NodeStatus {
    /// Returns true if the state machine allows moving to `to`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        !matches!(self, Self::Removed) || matches!(to, Self::Removed)
    }

    /// Returns true if a node in this state may receive new replicas.
    #[must_use]
    pub const fn is_placeable(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// A storage target in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique, stable identifier.
    pub id: String,
    /// Network address (host:port).
    pub address: String,
    /// Storage tier.
    pub tier: NodeTier,
    /// Total capacity in bytes.
    pub capacity_bytes: u64,
    /// Bytes in use.
    pub used_bytes: u64,
    /// Current health.
    pub status: NodeStatus,
    /// Time of the last health report.
    pub last_heartbeat: DateTime<Utc>,
}

impl Node {
    /// Creates a healthy node with no capacity information.
    #[must_use]
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            tier: NodeTier::default(),
            capacity_bytes: 0,
            used_bytes: 0,
            status: NodeStatus::Healthy,
            last_heartbeat: Utc::now(),
        }
    }

    /// Sets the storage tier.
    #[must_use]
    pub fn with_tier(mut self, tier: NodeTier) -> Self {
        self.tier = tier;
        self
    }

    /// Sets capacity and usage.
    #[must_use]
    pub fn with_capacity(mut self, capacity_bytes: u64, used_bytes: u64) -> Self {
        self.capacity_bytes = capacity_bytes;
        self.used_bytes = used_bytes;
        self
    }

    /// Sets the health status.
    #[must_use]
    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    /// Returns the free bytes on this node.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }
}

/// Lifecycle state of an object version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectState {
    /// Data write in progress.
    #[default]
    Pending,
    /// Data durable at write quorum; visible to readers.
    Committed,
    /// Logically deleted. Terminal.
    Tombstoned,
}

/// Catalog entry for one object version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Unique id of this version record.
    pub id: String,
    /// Bucket name.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Version id (`"null"` when versioning is off).
    pub version_id: String,
    /// Whether this is the current version of the key.
    pub is_latest: bool,
    /// Whether this version is a delete marker.
    pub is_delete_marker: bool,
    /// Payload size in bytes.
    pub size: u64,
    /// Content digest (hex), surfaced as ETag.
    pub etag: String,
    /// MIME type.
    pub content_type: String,
    /// Nodes believed to hold a replica.
    pub placement: Vec<String>,
    /// Placement entries flagged as corrupt and awaiting replacement.
    pub corrupt_replicas: BTreeSet<String>,
    /// Lifecycle state.
    pub state: ObjectState,
    /// User metadata.
    pub metadata: HashMap<String, String>,
    /// Object tags.
    pub tags: HashMap<String, String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl ObjectRecord {
    /// Creates a pending record with a fresh id and the null version.
    #[must_use]
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            bucket: bucket.into(),
            key: key.into(),
            version_id: NULL_VERSION_ID.to_string(),
            is_latest: false,
            is_delete_marker: false,
            size: 0,
            etag: String::new(),
            content_type: "application/octet-stream".to_string(),
            placement: Vec::new(),
            corrupt_replicas: BTreeSet::new(),
            state: ObjectState::Pending,
            metadata: HashMap::new(),
            tags: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Key under which replicas are stored on data nodes.
    #[must_use]
    pub fn storage_key(&self) -> String {
        storage_key(&self.bucket, &self.key, &self.version_id)
    }

    /// Placement entries that are not flagged as corrupt.
    pub fn intact_replicas(&self) -> impl Iterator<Item = &String> {
        self.placement.iter().filter(|id| !self.corrupt_replicas.contains(*id))
    }

    /// Returns true if readers may see this version.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.state == ObjectState::Committed && !self.is_delete_marker
    }
}

/// Builds the data-node key for an object version.
#[must_use]
pub fn storage_key(bucket: &str, key: &str, version_id: &str) -> String {
    if version_id == NULL_VERSION_ID {
        format!("{bucket}/{key}")
    } else {
        format!("{bucket}/{key}@{version_id}")
    }
}

/// Catalog entry for a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRecord {
    /// Unique id.
    pub id: String,
    /// Unique bucket name.
    pub name: String,
    /// Whether new writes create versions.
    pub versioning_enabled: bool,
    /// Region label.
    pub region: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl BucketRecord {
    /// Creates an unversioned bucket record.
    #[must_use]
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            versioning_enabled: false,
            region: region.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of one per-node operation inside a quorum call.
#[derive(Debug, Clone)]
pub struct NodeResult {
    /// Target node.
    pub node_id: String,
    /// Whether the operation counted toward the quorum.
    pub success: bool,
    /// Failure cause when `success` is false.
    pub error: Option<Error>,
}

impl NodeResult {
    /// A successful result.
    #[must_use]
    pub fn ok(node_id: impl Into<String>) -> Self {
        Self { node_id: node_id.into(), success: true, error: None }
    }

    /// A failed result.
    #[must_use]
    pub fn failed(node_id: impl Into<String>, error: Error) -> Self {
        Self { node_id: node_id.into(), success: false, error: Some(error) }
    }
}
