// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Trait for choosing replica sets and looking up node state.

use plinth_core::{Node, Result};

use crate::controller::PlacementController;

/// Chooses which nodes hold an object's replicas.
///
/// The object service, repair, and scrub only need selection and node
/// lookups, so they take this trait instead of the controller itself.
pub trait ReplicaPlacement: Send + Sync {
    /// Selects `count` distinct nodes for `key`, never returning any id in
    /// `exclude`.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientNodes` if fewer than `count` eligible nodes
    /// remain after exclusion.
    fn select_nodes(&self, key: &str, count: usize, exclude: &[String]) -> Result<Vec<Node>>;

    /// Selects `count` distinct nodes for `key`.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientNodes` if fewer than `count` eligible nodes exist.
    fn get_nodes(&self, key: &str, count: usize) -> Result<Vec<Node>> {
        self.select_nodes(key, count, &[])
    }

    /// Looks up a node.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` if the id is not registered.
    fn get_node(&self, node_id: &str) -> Result<Node>;
}

impl ReplicaPlacement for PlacementController {
    fn select_nodes(&self, key: &str, count: usize, exclude: &[String]) -> Result<Vec<Node>> {
        PlacementController::select_nodes(self, key, count, exclude)
    }

    fn get_nodes(&self, key: &str, count: usize) -> Result<Vec<Node>> {
        PlacementController::get_nodes(self, key, count)
    }

    fn get_node(&self, node_id: &str) -> Result<Node> {
        PlacementController::get_node(self, node_id)
    }
}
