// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Quorum-coordinated replication for Plinth.
//!
//! A write succeeds once `write_quorum` of the target nodes acknowledge the
//! payload's digest; a read succeeds once `read_quorum` replicas agree on
//! one digest.
//!
//! # Architecture
//!
//! ```text
//!              write(nodes, key, data)
//!                        │
//!                 digest computed once
//!                        │
//!        ┌───────────────┼───────────────┐
//!        ▼               ▼               ▼
//!   put(n1) ≤ t     put(n2) ≤ t     put(n3) ≤ t      (JoinSet, per-node timeout)
//!        │               │               │
//!        └───────► tally acks ◄──────────┘
//!                        │
//!         acks ≥ WQ ──► WriteOutcome { results }
//!         acks < WQ ──► WriteQuorumNotMet { results }
//! ```
//!
//! Reads fan out the same way, recompute every payload's digest, and exclude
//! divergent replicas from the count. Those replicas are reported as repair
//! candidates and left for the background repair cycle.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use plinth_core::MemoryTransport;
//! use plinth_quorum::{QuorumConfig, QuorumCoordinator};
//!
//! # tokio_test_runtime();
//! # fn tokio_test_runtime() {
//! # let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
//! # rt.block_on(async {
//! let transport = Arc::new(MemoryTransport::new());
//! let coordinator = QuorumCoordinator::new(QuorumConfig::default(), transport).unwrap();
//!
//! let nodes: Vec<String> = vec!["n1".into(), "n2".into(), "n3".into()];
//! let written = coordinator.write(&nodes, "bucket1/key1", Bytes::from_static(b"data1")).await.unwrap();
//! assert_eq!(written.acks, 3);
//!
//! let read = coordinator.read(&nodes, "bucket1/key1", Some(written.digest)).await.unwrap();
//! assert_eq!(read.data, Bytes::from_static(b"data1"));
//! # });
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod coordinator;
pub mod outcome;
pub mod traits;

pub use config::{validate, ConfigValidationError, QuorumConfig};
pub use coordinator::QuorumCoordinator;
pub use outcome::{ReadOutcome, ReplicaProbe, WriteOutcome};
pub use traits::{QuorumReader, QuorumWriter};
