// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Replicated object service and background maintenance for Plinth.
//!
//! This crate provides:
//! - The object service: quorum puts and verified gets over the placement
//! - The repair cycle, restoring under-replicated objects
//! - The scrub cycle, flagging replicas whose digest no longer matches
//! - A worker running both cycles until cancelled
//! - TOML cluster configuration
//!
//! # Architecture
//!
//! ```text
//!   put/get ──► ObjectService ──► PlacementController (which nodes)
//!                    │         └─► QuorumCoordinator  (fan-out, digests)
//!                    ▼
//!              MetadataStore ◄── RepairCycle  (under-replicated → new replicas)
//!                    ▲
//!                    └────────── ScrubCycle   (digest mismatch → corrupt flag)
//! ```
//!
//! Requests never repair data themselves. Divergent replicas found by a get
//! or a scrub are flagged in metadata, and the next repair cycle writes
//! replacements to nodes that hold no replica.
//!
//! # Example
//!
//! ```
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use plinth_cluster::{Cluster, ClusterConfig};
//! use plinth_core::{MemoryTransport, MetadataStore, Node};
//!
//! # let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
//! # rt.block_on(async {
//! let cluster = Cluster::in_memory(ClusterConfig::default(), Arc::new(MemoryTransport::new())).unwrap();
//! for id in ["n1", "n2", "n3"] {
//!     cluster.placement().add_node(Node::new(id, format!("{id}:9000"))).unwrap();
//! }
//! cluster.metadata().create_bucket("photos").await.unwrap();
//!
//! let service = cluster.service();
//! service
//!     .put_object("photos", "cat.jpg", Bytes::from_static(b"meow"), "image/jpeg", HashMap::new())
//!     .await
//!     .unwrap();
//! let object = service.get_object("photos", "cat.jpg", None).await.unwrap();
//! assert_eq!(object.data, Bytes::from_static(b"meow"));
//!
//! let worker = cluster.spawn_worker();
//! worker.shutdown().await;
//! # });
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod config;
pub mod repair;
pub mod scrub;
pub mod service;
pub mod worker;

pub use cluster::Cluster;
pub use config::{ClusterConfig, RepairConfig, ScrubConfig};
pub use repair::{RepairCycle, RepairEvent, RepairReport, SkipReason};
pub use scrub::{ScrubCycle, ScrubEvent, ScrubReport};
pub use service::{GetObjectOutput, ObjectService, PutObjectOutput};
pub use worker::ReplicationWorker;
