// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Traits for quorum writes and verified reads.

use async_trait::async_trait;
use bytes::Bytes;
use plinth_core::{Digest, Result};

use crate::coordinator::QuorumCoordinator;
use crate::outcome::{ReadOutcome, ReplicaProbe, WriteOutcome};

/// Writes a payload to a replica set.
#[async_trait]
pub trait QuorumWriter: Send + Sync {
    /// Number of replicas each object should have.
    fn replication_factor(&self) -> usize;

    /// Writes `data` under `key`, requiring the configured write quorum.
    ///
    /// # Errors
    ///
    /// Returns `WriteQuorumNotMet` or `InsufficientNodes`.
    async fn write(&self, node_ids: &[String], key: &str, data: Bytes) -> Result<WriteOutcome>;

    /// Writes `data` under `key`, requiring `required` acks.
    ///
    /// # Errors
    ///
    /// Returns `WriteQuorumNotMet` or `InsufficientNodes`.
    async fn write_with_quorum(
        &self,
        node_ids: &[String],
        key: &str,
        data: Bytes,
        required: usize,
    ) -> Result<WriteOutcome>;
}

/// Reads and verifies replicas.
#[async_trait]
pub trait QuorumReader: Send + Sync {
    /// Reads `key`, requiring the configured read quorum.
    ///
    /// # Errors
    ///
    /// Returns `ReadQuorumNotMet` or `InsufficientNodes`.
    async fn read(
        &self,
        node_ids: &[String],
        key: &str,
        expected: Option<Digest>,
    ) -> Result<ReadOutcome>;

    /// Reads `key`, requiring `required` agreeing replicas.
    ///
    /// # Errors
    ///
    /// Returns `ReadQuorumNotMet` or `InsufficientNodes`.
    async fn read_with_quorum(
        &self,
        node_ids: &[String],
        key: &str,
        expected: Option<Digest>,
        required: usize,
    ) -> Result<ReadOutcome>;

    /// Fetches every replica of `key` and reports its digest.
    async fn probe(&self, node_ids: &[String], key: &str) -> Vec<ReplicaProbe>;
}

#[async_trait]
impl QuorumWriter for QuorumCoordinator {
    fn replication_factor(&self) -> usize {
        self.config().replication_factor
    }

    async fn write(&self, node_ids: &[String], key: &str, data: Bytes) -> Result<WriteOutcome> {
        QuorumCoordinator::write(self, node_ids, key, data).await
    }

    async fn write_with_quorum(
        &self,
        node_ids: &[String],
        key: &str,
        data: Bytes,
        required: usize,
    ) -> Result<WriteOutcome> {
        QuorumCoordinator::write_with_quorum(self, node_ids, key, data, required).await
    }
}

#[async_trait]
impl QuorumReader for QuorumCoordinator {
    async fn read(
        &self,
        node_ids: &[String],
        key: &str,
        expected: Option<Digest>,
    ) -> Result<ReadOutcome> {
        QuorumCoordinator::read(self, node_ids, key, expected).await
    }

    async fn read_with_quorum(
        &self,
        node_ids: &[String],
        key: &str,
        expected: Option<Digest>,
        required: usize,
    ) -> Result<ReadOutcome> {
        QuorumCoordinator::read_with_quorum(self, node_ids, key, expected, required).await
    }

    async fn probe(&self, node_ids: &[String], key: &str) -> Vec<ReplicaProbe> {
        QuorumCoordinator::probe(self, node_ids, key).await
    }
}
