// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Error taxonomy for the replication core.
//!
//! Per-node failures are captured in [`NodeResult`]s and only escalate to an
//! aggregate error (`WriteQuorumNotMet`, `ReadQuorumNotMet`) once the quorum
//! threshold can no longer be met.

use thiserror::Error;

use crate::types::{NodeResult, NodeStatus};

/// A specialized `Result` type for replication core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in placement, quorum, and repair operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Not enough eligible nodes to satisfy a requested replica count.
    #[error("insufficient nodes: need {needed}, have {available}")]
    InsufficientNodes {
        /// Number of nodes requested.
        needed: usize,
        /// Number of eligible nodes.
        available: usize,
    },

    /// Fewer nodes than the write quorum acknowledged the write.
    #[error("write quorum not met: required {required}, got {achieved}")]
    WriteQuorumNotMet {
        /// Acknowledgments required.
        required: usize,
        /// Acknowledgments received.
        achieved: usize,
        /// One result per target node.
        results: Vec<NodeResult>,
    },

    /// Fewer agreeing replicas than the read quorum answered.
    #[error("read quorum not met: required {required}, got {achieved}")]
    ReadQuorumNotMet {
        /// Agreeing responses required.
        required: usize,
        /// Agreeing responses received.
        achieved: usize,
        /// One result per target node.
        results: Vec<NodeResult>,
    },

    /// Content digest disagreement indicating corruption.
    #[error("checksum mismatch on {node_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Node holding the divergent replica.
        node_id: String,
        /// Digest that was expected.
        expected: String,
        /// Digest that was computed.
        actual: String,
    },

    /// A node could not be reached. Transient; callers may retry.
    #[error("node {node_id} unreachable: {reason}")]
    NodeUnreachable {
        /// The unreachable node.
        node_id: String,
        /// Why the node could not be reached.
        reason: String,
    },

    /// A per-node operation exceeded its deadline.
    #[error("operation on {node_id} timed out after {timeout_ms}ms")]
    Timeout {
        /// The node that timed out.
        node_id: String,
        /// The timeout in milliseconds.
        timeout_ms: u64,
    },

    /// A per-node operation was still pending when the call's outcome was
    /// decided, so it was dropped. Says nothing about the node's health.
    #[error("operation on {node_id} abandoned after the outcome was decided")]
    Abandoned {
        /// The node whose operation was dropped.
        node_id: String,
    },

    /// No node with this identifier is registered.
    #[error("node {0} not found")]
    NodeNotFound(String),

    /// A node with this identifier is already registered.
    #[error("node {0} already exists")]
    NodeAlreadyExists(String),

    /// A health report asked for a transition the state machine forbids.
    #[error("invalid health transition for {node_id}: {from} -> {to}")]
    InvalidHealthTransition {
        /// The node being updated.
        node_id: String,
        /// Current status.
        from: NodeStatus,
        /// Requested status.
        to: NodeStatus,
    },

    /// Quorum configuration failed static validation.
    #[error("invalid quorum config: {0}")]
    InvalidQuorumConfig(String),

    /// A node does not hold the requested replica.
    #[error("replica {key} missing on {node_id}")]
    ReplicaMissing {
        /// Node that was asked.
        node_id: String,
        /// Storage key that was requested.
        key: String,
    },

    /// The bucket does not exist.
    #[error("bucket '{0}' not found")]
    BucketNotFound(String),

    /// The bucket already exists.
    #[error("bucket '{0}' already exists")]
    BucketAlreadyExists(String),

    /// The bucket still holds live objects.
    #[error("bucket '{0}' is not empty")]
    BucketNotEmpty(String),

    /// The object (or object version) does not exist.
    #[error("object {0} not found")]
    ObjectNotFound(String),

    /// A compare-and-set placement update lost a race.
    #[error("placement of object {0} changed concurrently")]
    PlacementConflict(String),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if the caller may retry the operation with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NodeUnreachable { .. } | Self::Timeout { .. })
    }

    /// Returns the per-node results carried by an aggregate quorum error.
    #[must_use]
    pub fn node_results(&self) -> Option<&[NodeResult]> {
        match self {
            Self::WriteQuorumNotMet { results, .. } | Self::ReadQuorumNotMet { results, .. } => {
                Some(results)
            }
            _ => None,
        }
    }

    /// Creates a `NodeUnreachable` error.
    #[must_use]
    pub fn unreachable(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NodeUnreachable { node_id: node_id.into(), reason: reason.into() }
    }
}
