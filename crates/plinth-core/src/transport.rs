// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Per-node byte transport.
//!
//! [`NodeTransport`] is the only way the replication core touches replica
//! bytes. [`MemoryTransport`] keeps replicas in memory and can inject the
//! failures the quorum and repair paths have to survive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::trace;

use crate::checksum::{ChecksumCalculator, Crc32cCalculator, Digest};
use crate::error::{Error, Result};

/// Byte-level put/get/delete against a single node.
#[async_trait]
pub trait NodeTransport: Send + Sync + 'static {
    /// Stores `data` under `key` on `node_id` and returns the digest the
    /// node computed over what it stored.
    async fn put(&self, node_id: &str, key: &str, data: Bytes) -> Result<Digest>;

    /// Fetches the replica stored under `key` on `node_id`.
    async fn get(&self, node_id: &str, key: &str) -> Result<Bytes>;

    /// Deletes the replica stored under `key` on `node_id`. Deleting a
    /// missing replica succeeds.
    async fn delete(&self, node_id: &str, key: &str) -> Result<()>;
}

/// A failure injected into [`MemoryTransport`] for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every call fails with `NodeUnreachable`.
    Unreachable,
    /// Every call hangs forever.
    Stall,
    /// Puts store the data, then hang before acknowledging. Other calls
    /// behave normally.
    StoreThenStall,
    /// Puts store a bit-flipped payload and acknowledge its digest.
    CorruptWrites,
    /// Gets return a bit-flipped payload.
    CorruptReads,
}

/// In-memory [`NodeTransport`] with fault injection.
#[derive(Default)]
pub struct MemoryTransport {
    replicas: DashMap<String, HashMap<String, Bytes>>,
    faults: DashMap<String, Fault>,
    puts: AtomicU64,
    calculator: Crc32cCalculator,
}

impl MemoryTransport {
    /// Creates a transport with no replicas and no faults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Injects `fault` for every later call against `node_id`.
    pub fn set_fault(&self, node_id: &str, fault: Fault) {
        self.faults.insert(node_id.to_string(), fault);
    }

    /// Clears any fault on `node_id`.
    pub fn clear_fault(&self, node_id: &str) {
        self.faults.remove(node_id);
    }

    /// Flips a bit in the stored replica. Returns false if there is none.
    pub fn corrupt(&self, node_id: &str, key: &str) -> bool {
        let Some(mut node) = self.replicas.get_mut(node_id) else {
            return false;
        };
        match node.get_mut(key) {
            Some(data) => {
                *data = flip(data);
                true
            }
            None => false,
        }
    }

    /// Drops a replica without going through the transport.
    pub fn lose(&self, node_id: &str, key: &str) -> bool {
        self.replicas.get_mut(node_id).map_or(false, |mut node| node.remove(key).is_some())
    }

    /// Returns the stored replica, bypassing faults.
    #[must_use]
    pub fn replica(&self, node_id: &str, key: &str) -> Option<Bytes> {
        self.replicas.get(node_id).and_then(|node| node.get(key).cloned())
    }

    /// Returns true if `node_id` holds a replica of `key`.
    #[must_use]
    pub fn has_replica(&self, node_id: &str, key: &str) -> bool {
        self.replica(node_id, key).is_some()
    }

    /// Total number of put calls that reached a node.
    #[must_use]
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    fn fault(&self, node_id: &str) -> Option<Fault> {
        self.faults.get(node_id).map(|f| *f)
    }

    fn store(&self, node_id: &str, key: &str, data: Bytes) -> Digest {
        let digest = self.calculator.calculate(&data);
        self.replicas.entry(node_id.to_string()).or_default().insert(key.to_string(), data);
        digest
    }
}

fn flip(data: &Bytes) -> Bytes {
    let mut corrupted = data.to_vec();
    match corrupted.first_mut() {
        Some(byte) => *byte ^= 0x01,
        None => corrupted.push(0x01),
    }
    Bytes::from(corrupted)
}

fn unreachable(node_id: &str) -> Error {
    Error::unreachable(node_id, "connection refused")
}

#[async_trait]
impl NodeTransport for MemoryTransport {
    async fn put(&self, node_id: &str, key: &str, data: Bytes) -> Result<Digest> {
        trace!(node_id = %node_id, key = %key, size = data.len(), "Put");
        match self.fault(node_id) {
            Some(Fault::Unreachable) => Err(unreachable(node_id)),
            Some(Fault::Stall) => std::future::pending().await,
            Some(Fault::StoreThenStall) => {
                self.puts.fetch_add(1, Ordering::Relaxed);
                self.store(node_id, key, data);
                std::future::pending().await
            }
            Some(Fault::CorruptWrites) => {
                self.puts.fetch_add(1, Ordering::Relaxed);
                Ok(self.store(node_id, key, flip(&data)))
            }
            Some(Fault::CorruptReads) | None => {
                self.puts.fetch_add(1, Ordering::Relaxed);
                Ok(self.store(node_id, key, data))
            }
        }
    }

    async fn get(&self, node_id: &str, key: &str) -> Result<Bytes> {
        trace!(node_id = %node_id, key = %key, "Get");
        match self.fault(node_id) {
            Some(Fault::Unreachable) => return Err(unreachable(node_id)),
            Some(Fault::Stall) => std::future::pending().await,
            _ => {}
        }
        let data = self
            .replica(node_id, key)
            .ok_or_else(|| Error::ReplicaMissing { node_id: node_id.to_string(), key: key.to_string() })?;
        if self.fault(node_id) == Some(Fault::CorruptReads) {
            return Ok(flip(&data));
        }
        Ok(data)
    }

    async fn delete(&self, node_id: &str, key: &str) -> Result<()> {
        trace!(node_id = %node_id, key = %key, "Delete");
        match self.fault(node_id) {
            Some(Fault::Unreachable) => Err(unreachable(node_id)),
            Some(Fault::Stall) => std::future::pending().await,
            _ => {
                self.lose(node_id, key);
                Ok(())
            }
        }
    }
}
