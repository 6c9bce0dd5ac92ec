// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Node registry and replica-set selection.
//!
//! The registry is an id-indexed map behind a reader/writer lock: lookups and
//! selections share the read side, while add/remove/health transitions take
//! the write side. The lock is never held across an await point.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::RwLock;
use plinth_core::{Error, Node, NodeLiveness, NodeStatus, NodeTier, Result};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::PlacementConfig;
use crate::hash::{key_hash, straw2_draw};

/// Events emitted when the registry changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementEvent {
    /// A node was registered.
    NodeAdded {
        /// The node ID.
        node_id: String,
    },
    /// A node's health status changed.
    NodeStatusChanged {
        /// The node ID.
        node_id: String,
        /// Previous status.
        from: NodeStatus,
        /// New status.
        to: NodeStatus,
    },
    /// A node was deregistered. Its replicas no longer count as live.
    NodeRemoved {
        /// The node ID.
        node_id: String,
    },
}

/// Owns the node registry and chooses replica sets.
pub struct PlacementController {
    config: PlacementConfig,
    nodes: RwLock<HashMap<String, Node>>,
    event_tx: broadcast::Sender<PlacementEvent>,
}

impl PlacementController {
    /// Creates a controller with an empty registry.
    #[must_use]
    pub fn new(config: PlacementConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self { config, nodes: RwLock::new(HashMap::new()), event_tx }
    }

    /// Subscribes to registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<PlacementEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    /// Selects `count` distinct nodes for `key`.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientNodes` if fewer than `count` healthy or degraded
    /// nodes are registered.
    pub fn get_nodes(&self, key: &str, count: usize) -> Result<Vec<Node>> {
        self.select_nodes(key, count, &[])
    }

    /// Selects `count` distinct nodes for `key`, never returning any id in
    /// `exclude`.
    ///
    /// Healthy nodes are ranked by straw2 draw and taken first, one per tier
    /// before filling by rank. Degraded nodes are only used to make up a
    /// shortfall. Offline and removed nodes are never selected.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientNodes` if fewer than `count` eligible nodes
    /// remain after exclusion.
    pub fn select_nodes(&self, key: &str, count: usize, exclude: &[String]) -> Result<Vec<Node>> {
        let exclude: HashSet<&str> = exclude.iter().map(String::as_str).collect();
        let seed = key_hash(key);

        let (healthy, degraded) = {
            let nodes = self.nodes.read();
            let mut healthy = Vec::new();
            let mut degraded = Vec::new();
            for node in nodes.values().filter(|n| !exclude.contains(n.id.as_str())) {
                let ranked = (straw2_draw(seed, &node.id, weight(node)), node.clone());
                match node.status {
                    NodeStatus::Healthy => healthy.push(ranked),
                    NodeStatus::Degraded => degraded.push(ranked),
                    NodeStatus::Offline | NodeStatus::Removed => {}
                }
            }
            (healthy, degraded)
        };

        let available = healthy.len() + degraded.len();
        if available < count {
            counter!("plinth_placement_insufficient_nodes_total").increment(1);
            warn!(key = %key, needed = count, available, "Not enough eligible nodes");
            return Err(Error::InsufficientNodes { needed: count, available });
        }

        let mut selected = self.pick(rank(healthy), count);
        if selected.len() < count {
            let shortfall = count - selected.len();
            debug!(key = %key, shortfall, "Filling replica set from degraded nodes");
            selected.extend(self.pick(rank(degraded), shortfall));
        }

        counter!("plinth_placement_selections_total").increment(1);
        Ok(selected)
    }

    /// Takes up to `count` nodes from a ranked list, one per tier first.
    fn pick(&self, ranked: Vec<Node>, count: usize) -> Vec<Node> {
        if !self.config.spread_tiers {
            return ranked.into_iter().take(count).collect();
        }

        let mut seen_tiers: HashSet<NodeTier> = HashSet::new();
        let mut first = Vec::with_capacity(count);
        let mut rest = Vec::new();
        for node in ranked {
            if first.len() < count && seen_tiers.insert(node.tier) {
                first.push(node);
            } else {
                rest.push(node);
            }
        }
        let remaining = count - first.len();
        first.extend(rest.into_iter().take(remaining));
        first
    }

    /// Looks up a node.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` if the id is not registered.
    pub fn get_node(&self, node_id: &str) -> Result<Node> {
        self.nodes.read().get(node_id).cloned().ok_or_else(|| Error::NodeNotFound(node_id.to_string()))
    }

    /// Returns a snapshot of every registered node, ordered by id.
    #[must_use]
    pub fn list_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Registers a node.
    ///
    /// # Errors
    ///
    /// Returns `NodeAlreadyExists` if the id is taken, including by a removed
    /// node.
    pub fn add_node(&self, node: Node) -> Result<()> {
        let node_id = node.id.clone();
        {
            let mut nodes = self.nodes.write();
            if nodes.contains_key(&node_id) {
                return Err(Error::NodeAlreadyExists(node_id));
            }
            info!(node_id = %node_id, address = %node.address, tier = %node.tier, "Node added");
            nodes.insert(node_id.clone(), node);
            self.record_gauges(&nodes);
        }
        let _ = self.event_tx.send(PlacementEvent::NodeAdded { node_id });
        Ok(())
    }

    /// Marks a node removed. Removing an already removed node is a no-op.
    ///
    /// Repair observes the resulting [`PlacementEvent::NodeRemoved`] and
    /// treats the node's replicas as lost on its next cycle.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` if the id is not registered.
    pub fn remove_node(&self, node_id: &str) -> Result<()> {
        {
            let mut nodes = self.nodes.write();
            let node =
                nodes.get_mut(node_id).ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
            if node.status == NodeStatus::Removed {
                debug!(node_id = %node_id, "Node already removed");
                return Ok(());
            }
            node.status = NodeStatus::Removed;
            info!(node_id = %node_id, "Node removed");
            self.record_gauges(&nodes);
        }
        let _ = self.event_tx.send(PlacementEvent::NodeRemoved { node_id: node_id.to_string() });
        Ok(())
    }

    /// Applies a health and capacity report.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for an unknown id, and `InvalidHealthTransition`
    /// when the node is removed or the report itself says `Removed`.
    pub fn update_node_health(
        &self,
        node_id: &str,
        status: NodeStatus,
        capacity_bytes: u64,
        used_bytes: u64,
    ) -> Result<()> {
        let changed = {
            let mut nodes = self.nodes.write();
            let node =
                nodes.get_mut(node_id).ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
            let from = node.status;
            if status == NodeStatus::Removed || !from.can_transition_to(status) {
                warn!(node_id = %node_id, from = %from, to = %status, "Rejected health report");
                return Err(Error::InvalidHealthTransition {
                    node_id: node_id.to_string(),
                    from,
                    to: status,
                });
            }
            node.status = status;
            node.capacity_bytes = capacity_bytes;
            node.used_bytes = used_bytes;
            node.last_heartbeat = Utc::now();
            let changed = from != status;
            if changed {
                info!(node_id = %node_id, from = %from, to = %status, "Node status changed");
                self.record_gauges(&nodes);
            }
            changed.then_some(from)
        };

        if let Some(from) = changed {
            let _ = self.event_tx.send(PlacementEvent::NodeStatusChanged {
                node_id: node_id.to_string(),
                from,
                to: status,
            });
        }
        Ok(())
    }

    /// Records a liveness report: the node is healthy with the given usage.
    ///
    /// # Errors
    ///
    /// Same as [`update_node_health`](Self::update_node_health).
    pub fn heartbeat(&self, node_id: &str, capacity_bytes: u64, used_bytes: u64) -> Result<()> {
        self.update_node_health(node_id, NodeStatus::Healthy, capacity_bytes, used_bytes)
    }

    /// Demotes nodes whose last heartbeat is too old. Returns the nodes that
    /// changed and their new status.
    pub fn sweep_liveness(&self) -> Vec<(String, NodeStatus)> {
        self.sweep_liveness_at(Utc::now())
    }

    /// [`sweep_liveness`](Self::sweep_liveness) against an explicit clock.
    pub fn sweep_liveness_at(&self, now: DateTime<Utc>) -> Vec<(String, NodeStatus)> {
        let degraded_after = self.config.degraded_after_ms as i64;
        let offline_after = self.config.offline_after_ms as i64;

        let mut events = Vec::new();
        let mut changes = Vec::new();
        {
            let mut nodes = self.nodes.write();
            for node in nodes.values_mut() {
                if matches!(node.status, NodeStatus::Removed | NodeStatus::Offline) {
                    continue;
                }
                let age_ms = (now - node.last_heartbeat).num_milliseconds();
                let target = if age_ms >= offline_after {
                    NodeStatus::Offline
                } else if age_ms >= degraded_after {
                    NodeStatus::Degraded
                } else {
                    continue;
                };
                if target == node.status {
                    continue;
                }
                warn!(node_id = %node.id, age_ms, from = %node.status, to = %target, "Heartbeat overdue");
                events.push(PlacementEvent::NodeStatusChanged {
                    node_id: node.id.clone(),
                    from: node.status,
                    to: target,
                });
                node.status = target;
                changes.push((node.id.clone(), target));
            }
            if !changes.is_empty() {
                self.record_gauges(&nodes);
            }
        }

        for event in events {
            let _ = self.event_tx.send(event);
        }
        changes.sort_by(|a, b| a.0.cmp(&b.0));
        changes
    }

    fn record_gauges(&self, nodes: &HashMap<String, Node>) {
        let mut counts = [0usize; 4];
        for node in nodes.values() {
            let idx = match node.status {
                NodeStatus::Healthy => 0,
                NodeStatus::Degraded => 1,
                NodeStatus::Offline => 2,
                NodeStatus::Removed => 3,
            };
            counts[idx] += 1;
        }
        gauge!("plinth_placement_nodes", "status" => "healthy").set(counts[0] as f64);
        gauge!("plinth_placement_nodes", "status" => "degraded").set(counts[1] as f64);
        gauge!("plinth_placement_nodes", "status" => "offline").set(counts[2] as f64);
        gauge!("plinth_placement_nodes", "status" => "removed").set(counts[3] as f64);
    }
}

impl NodeLiveness for PlacementController {
    fn is_live(&self, node_id: &str) -> bool {
        self.nodes.read().get(node_id).is_some_and(|n| n.status == NodeStatus::Healthy)
    }
}

/// Straw2 weight: capacity in bytes, or 1 when the node reports none.
fn weight(node: &Node) -> f64 {
    if node.capacity_bytes == 0 {
        1.0
    } else {
        node.capacity_bytes as f64
    }
}

/// Orders candidates by draw, longest first. Ties go to the smaller id.
fn rank(mut candidates: Vec<(f64, Node)>) -> Vec<Node> {
    candidates.sort_by(|(da, a), (db, b)| {
        db.partial_cmp(da).unwrap_or(Ordering::Equal).then_with(|| a.id.cmp(&b.id))
    });
    candidates.into_iter().map(|(_, node)| node).collect()
}
