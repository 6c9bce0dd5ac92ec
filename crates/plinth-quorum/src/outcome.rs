// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Results of quorum calls.

use bytes::Bytes;
use plinth_core::{Digest, NodeResult, Result};

/// A write that reached its quorum.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    /// Digest of the payload, computed once before dispatch.
    pub digest: Digest,
    /// One result per target node, in request order.
    pub results: Vec<NodeResult>,
    /// Number of nodes that acknowledged the correct digest.
    pub acks: usize,
    /// Acknowledgments that were required.
    pub required: usize,
}

impl WriteOutcome {
    /// Nodes that acknowledged the write, in request order.
    #[must_use]
    pub fn acked_nodes(&self) -> Vec<String> {
        self.results.iter().filter(|r| r.success).map(|r| r.node_id.clone()).collect()
    }

    /// Nodes that did not acknowledge the write.
    #[must_use]
    pub fn failed_nodes(&self) -> Vec<String> {
        self.results.iter().filter(|r| !r.success).map(|r| r.node_id.clone()).collect()
    }
}

/// A read that reached its quorum.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    /// Payload agreed on by the quorum.
    pub data: Bytes,
    /// Digest of `data`.
    pub digest: Digest,
    /// One result per target node, in request order.
    pub results: Vec<NodeResult>,
    /// Nodes whose replica diverged from `digest` or was missing.
    pub repair_candidates: Vec<String>,
}

impl ReadOutcome {
    /// Number of replicas that agreed on `digest`.
    #[must_use]
    pub fn agreeing(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }
}

/// Digest of one replica as reported by a probe.
#[derive(Debug, Clone)]
pub struct ReplicaProbe {
    /// Probed node.
    pub node_id: String,
    /// Recomputed digest of the stored replica, or why it could not be read.
    pub result: Result<Digest>,
}
