// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Replica placement for Plinth.
//!
//! This crate owns the node registry and decides which nodes hold the
//! replicas of an object.
//!
//! # Overview
//!
//! Selection uses rendezvous hashing with straw2 draws:
//! - Every eligible node draws a weighted pseudo-random straw for the key
//! - The longest straws win, so the result is stable for an unchanged pool
//! - Adding or removing one node only moves the keys it wins or loses
//! - Replicas spread across storage tiers before doubling up on one
//!
//! Node health follows `Healthy → Degraded → Offline`, driven by heartbeat
//! age, with `Removed` as a terminal state for deregistered nodes.
//!
//! # Usage
//!
//! ```
//! use plinth_core::Node;
//! use plinth_placement::{PlacementConfig, PlacementController};
//!
//! let controller = PlacementController::new(PlacementConfig::default());
//! for id in ["n1", "n2", "n3"] {
//!     controller.add_node(Node::new(id, format!("{id}:7000"))).unwrap();
//! }
//!
//! let replicas = controller.get_nodes("bucket1/key1", 3).unwrap();
//! assert_eq!(replicas.len(), 3);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod hash;
pub mod traits;

pub use config::PlacementConfig;
pub use controller::{PlacementController, PlacementEvent};
pub use hash::{key_hash, straw2_draw};
pub use traits::ReplicaPlacement;
