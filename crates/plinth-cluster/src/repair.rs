// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Repair cycle: restores under-replicated objects to the replication factor.
//!
//! # Architecture
//!
//! One cycle runs in three phases:
//! 1. **Detection**: the metadata store lists committed objects whose intact
//!    replicas on healthy nodes fall below the replication factor.
//! 2. **Recovery**: for each object the record is re-read, the live holder
//!    set recomputed, and the payload read from one holder verified against
//!    the stored digest.
//! 3. **Placement**: fresh nodes that hold no replica are selected and
//!    written. When the cluster has no fresh node left, corrupt holders on
//!    placeable nodes are overwritten in place instead. The placement is
//!    replaced with compare-and-set so a concurrent change makes the cycle
//!    skip the object instead of overwriting it.
//!
//! The committed placement keeps intact replicas on healthy nodes, the
//! rewritten and new replicas, and replicas on degraded or offline nodes
//! only while they are needed to reach the replication factor. Surplus
//! replicas dropped that way, like replicas on removed nodes, stay on disk
//! until garbage collection exists.
//!
//! Objects already at the replication factor are skipped, so a second cycle
//! with no intervening change writes nothing.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use plinth_core::{Digest, Error, MetadataStore, NodeStatus, ObjectRecord, ObjectState, Result};
use plinth_placement::ReplicaPlacement;
use plinth_quorum::{QuorumReader, QuorumWriter};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RepairConfig;

/// Why an object was left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The object already has enough live replicas.
    AtTarget,
    /// The object was deleted or replaced since detection.
    Gone,
    /// The placement changed while the repair was in flight.
    Conflict,
}

/// Totals for one repair cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Under-replicated objects found by detection.
    pub examined: usize,
    /// Objects whose placement was updated.
    pub repaired: usize,
    /// Objects left unchanged.
    pub skipped: usize,
    /// Objects that could not be repaired.
    pub failed: usize,
    /// New replicas written across all objects.
    pub replicas_written: usize,
}

/// Events emitted by the repair cycle.
#[derive(Debug, Clone)]
pub enum RepairEvent {
    /// A cycle started.
    CycleStarted {
        /// Under-replicated objects found.
        deficient: usize,
    },
    /// An object received new replicas.
    ObjectRepaired {
        /// Object record id.
        object_id: String,
        /// Storage key of the object version.
        key: String,
        /// Nodes that received a new replica, including rewritten corrupt
        /// holders.
        written: Vec<String>,
    },
    /// An object was left unchanged.
    ObjectSkipped {
        /// Object record id.
        object_id: String,
        /// Why it was skipped.
        reason: SkipReason,
    },
    /// Repairing an object failed.
    ObjectFailed {
        /// Object record id.
        object_id: String,
        /// Error message.
        error: String,
    },
    /// A cycle completed.
    CycleCompleted {
        /// Cycle totals.
        report: RepairReport,
        /// Duration of the cycle.
        duration: Duration,
    },
}

enum Repair {
    Written(Vec<String>),
    Skipped(SkipReason),
}

/// Finds under-replicated objects and writes the missing replicas.
pub struct RepairCycle {
    config: RepairConfig,
    metadata: Arc<dyn MetadataStore>,
    placement: Arc<dyn ReplicaPlacement>,
    reader: Arc<dyn QuorumReader>,
    writer: Arc<dyn QuorumWriter>,
    event_tx: broadcast::Sender<RepairEvent>,
}

impl RepairCycle {
    /// Creates a repair cycle.
    pub fn new(
        config: RepairConfig,
        metadata: Arc<dyn MetadataStore>,
        placement: Arc<dyn ReplicaPlacement>,
        reader: Arc<dyn QuorumReader>,
        writer: Arc<dyn QuorumWriter>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self { config, metadata, placement, reader, writer, event_tx }
    }

    /// Subscribes to repair events.
    pub fn subscribe(&self) -> broadcast::Receiver<RepairEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RepairConfig {
        &self.config
    }

    /// Runs one cycle to completion.
    ///
    /// # Errors
    ///
    /// Returns an error only if detection fails. Per-object failures are
    /// counted in the report.
    pub async fn run_once(&self) -> Result<RepairReport> {
        self.run_until_cancelled(&CancellationToken::new()).await
    }

    /// Runs one cycle, stopping between objects once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error only if detection fails.
    pub async fn run_until_cancelled(&self, cancel: &CancellationToken) -> Result<RepairReport> {
        let started = Instant::now();
        let rf = self.writer.replication_factor();

        let mut deficient = self.metadata.find_under_replicated_objects(rf).await?;
        if self.config.max_objects_per_cycle > 0 {
            deficient.truncate(self.config.max_objects_per_cycle);
        }
        gauge!("plinth_repair_deficient_objects").set(deficient.len() as f64);
        let _ = self.event_tx.send(RepairEvent::CycleStarted { deficient: deficient.len() });

        let mut report = RepairReport { examined: deficient.len(), ..Default::default() };
        for object in &deficient {
            if cancel.is_cancelled() {
                let done = report.repaired + report.skipped + report.failed;
                info!(remaining = report.examined - done, "Repair cycle interrupted by shutdown");
                break;
            }

            match self.repair_object(&object.id).await {
                Ok(Repair::Written(written)) => {
                    report.repaired += 1;
                    report.replicas_written += written.len();
                    counter!("plinth_repair_objects_total", "outcome" => "repaired").increment(1);
                    counter!("plinth_repair_replicas_written_total").increment(written.len() as u64);
                    info!(
                        object_id = %object.id,
                        key = %object.storage_key(),
                        written = ?written,
                        "Object repaired"
                    );
                    let _ = self.event_tx.send(RepairEvent::ObjectRepaired {
                        object_id: object.id.clone(),
                        key: object.storage_key(),
                        written,
                    });
                }
                Ok(Repair::Skipped(reason)) => {
                    report.skipped += 1;
                    counter!("plinth_repair_objects_total", "outcome" => "skipped").increment(1);
                    debug!(object_id = %object.id, reason = ?reason, "Repair skipped");
                    let _ = self.event_tx.send(RepairEvent::ObjectSkipped {
                        object_id: object.id.clone(),
                        reason,
                    });
                }
                Err(e) => {
                    report.failed += 1;
                    counter!("plinth_repair_objects_total", "outcome" => "failed").increment(1);
                    warn!(object_id = %object.id, error = %e, "Repair failed");
                    let _ = self.event_tx.send(RepairEvent::ObjectFailed {
                        object_id: object.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let duration = started.elapsed();
        histogram!("plinth_repair_cycle_duration_seconds").record(duration.as_secs_f64());
        info!(
            examined = report.examined,
            repaired = report.repaired,
            skipped = report.skipped,
            failed = report.failed,
            replicas_written = report.replicas_written,
            duration_ms = duration.as_millis() as u64,
            "Repair cycle completed"
        );
        let _ = self.event_tx.send(RepairEvent::CycleCompleted { report: report.clone(), duration });
        Ok(report)
    }

    async fn repair_object(&self, object_id: &str) -> Result<Repair> {
        // Detection worked from a snapshot; decide on the current record.
        let record = match self.metadata.get_object_by_id(object_id).await {
            Ok(record) => record,
            Err(Error::ObjectNotFound(_)) => return Ok(Repair::Skipped(SkipReason::Gone)),
            Err(e) => return Err(e),
        };
        if record.state != ObjectState::Committed || record.is_delete_marker {
            return Ok(Repair::Skipped(SkipReason::Gone));
        }

        let rf = self.writer.replication_factor();
        let live = record
            .intact_replicas()
            .filter(|id| self.status(id) == Some(NodeStatus::Healthy))
            .count();
        if live >= rf {
            return Ok(Repair::Skipped(SkipReason::AtTarget));
        }

        let sources: Vec<String> = record
            .intact_replicas()
            .filter(|id| self.status(id).is_some_and(NodeStatus::is_placeable))
            .cloned()
            .collect();
        if sources.is_empty() {
            return Err(Error::InsufficientNodes { needed: 1, available: 0 });
        }

        let key = record.storage_key();
        let expected = record.etag.parse::<Digest>().ok();
        let read = self.reader.read_with_quorum(&sources, &key, expected, 1).await?;
        let mut corrupt = record.corrupt_replicas.clone();
        for node_id in &read.repair_candidates {
            self.metadata.mark_replica_corrupt(&record.id, node_id).await?;
            corrupt.insert(node_id.clone());
        }

        let deficit = rf - live;
        let fresh = self.select_fresh(&key, deficit, &record)?;
        let rewrite = self.select_rewrites(&record, &corrupt, deficit - fresh.len());
        if fresh.is_empty() && rewrite.is_empty() {
            return Err(Error::InsufficientNodes { needed: deficit, available: 0 });
        }
        if !rewrite.is_empty() {
            warn!(key = %key, nodes = ?rewrite, "No fresh nodes, rewriting corrupt replicas in place");
        }

        let targets: Vec<String> = fresh.iter().chain(&rewrite).cloned().collect();
        let outcome = self.writer.write_with_quorum(&targets, &key, read.data, 1).await?;
        let written = outcome.acked_nodes();
        let rewritten: Vec<String> =
            rewrite.into_iter().filter(|id| written.contains(id)).collect();

        let placement = self.next_placement(&record, &corrupt, &written, &rewritten, rf);
        match self
            .metadata
            .commit_repair(&record.id, &record.placement, placement, &rewritten)
            .await
        {
            Ok(()) => Ok(Repair::Written(written)),
            Err(Error::PlacementConflict(_)) => {
                counter!("plinth_repair_conflicts_total").increment(1);
                Ok(Repair::Skipped(SkipReason::Conflict))
            }
            Err(e) => Err(e),
        }
    }

    /// Picks up to `deficit` nodes holding no replica of the object, settling
    /// for fewer, possibly none, when the cluster is short.
    fn select_fresh(&self, key: &str, deficit: usize, record: &ObjectRecord) -> Result<Vec<String>> {
        let nodes = match self.placement.select_nodes(key, deficit, &record.placement) {
            Ok(nodes) => nodes,
            Err(Error::InsufficientNodes { available: 0, .. }) => Vec::new(),
            Err(Error::InsufficientNodes { available, .. }) => {
                warn!(key = %key, deficit, available, "Partial repair, not enough fresh nodes");
                self.placement.select_nodes(key, available, &record.placement)?
            }
            Err(e) => return Err(e),
        };
        Ok(nodes.into_iter().map(|n| n.id).collect())
    }

    /// Corrupt holders on placeable nodes, healthy ones first, that can take
    /// a verified copy in place of their bad replica.
    fn select_rewrites(
        &self,
        record: &ObjectRecord,
        corrupt: &BTreeSet<String>,
        count: usize,
    ) -> Vec<String> {
        let mut candidates: Vec<(bool, &String)> = record
            .placement
            .iter()
            .filter(|id| corrupt.contains(*id))
            .filter_map(|id| {
                let status = self.status(id)?;
                status.is_placeable().then_some((status != NodeStatus::Healthy, id))
            })
            .collect();
        candidates.sort_by_key(|(degraded, _)| *degraded);
        candidates.into_iter().take(count).map(|(_, id)| id.clone()).collect()
    }

    /// Placement committed after a repair, in the original order with new
    /// nodes appended.
    ///
    /// Intact replicas on healthy nodes and rewritten replicas are always
    /// kept. Intact replicas on degraded, then offline, nodes are kept only
    /// while the placement is short of `rf`. Corrupt replicas and replicas
    /// on removed or unknown nodes are dropped.
    fn next_placement(
        &self,
        record: &ObjectRecord,
        corrupt: &BTreeSet<String>,
        written: &[String],
        rewritten: &[String],
        rf: usize,
    ) -> Vec<String> {
        let fresh: Vec<&String> = written.iter().filter(|id| !rewritten.contains(*id)).collect();
        let mut kept: BTreeSet<&String> = record
            .placement
            .iter()
            .filter(|id| {
                rewritten.contains(*id)
                    || (!corrupt.contains(*id) && self.status(id) == Some(NodeStatus::Healthy))
            })
            .collect();

        let mut standby: Vec<(NodeStatus, &String)> = record
            .placement
            .iter()
            .filter(|id| !corrupt.contains(*id))
            .filter_map(|id| match self.status(id) {
                Some(status @ (NodeStatus::Degraded | NodeStatus::Offline)) => Some((status, id)),
                _ => None,
            })
            .collect();
        standby.sort_by_key(|(status, _)| *status == NodeStatus::Offline);
        let spare_slots = rf.saturating_sub(kept.len() + fresh.len());
        for (i, (_, id)) in standby.into_iter().enumerate() {
            if i < spare_slots {
                kept.insert(id);
            } else {
                debug!(object_id = %record.id, node_id = %id, "Dropping surplus replica");
            }
        }

        record
            .placement
            .iter()
            .filter(|id| kept.contains(id))
            .chain(fresh)
            .cloned()
            .collect()
    }

    fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.placement.get_node(node_id).ok().map(|n| n.status)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use plinth_core::{MemoryMetadataStore, MemoryTransport, Node, NodeTransport};
    use plinth_placement::{PlacementConfig, PlacementController};
    use plinth_quorum::{QuorumConfig, QuorumCoordinator};

    use super::*;

    struct Fixture {
        transport: Arc<MemoryTransport>,
        metadata: Arc<MemoryMetadataStore>,
        placement: Arc<PlacementController>,
        cycle: RepairCycle,
    }

    fn fixture(node_count: usize) -> Fixture {
        let placement = Arc::new(PlacementController::new(PlacementConfig::default()));
        for i in 1..=node_count {
            placement.add_node(Node::new(format!("n{i}"), format!("10.0.0.{i}:9000"))).unwrap();
        }
        let transport = Arc::new(MemoryTransport::new());
        let metadata = Arc::new(MemoryMetadataStore::new().with_liveness(placement.clone()));
        let coordinator =
            Arc::new(QuorumCoordinator::new(QuorumConfig::default(), transport.clone()).unwrap());
        let cycle = RepairCycle::new(
            RepairConfig::default(),
            metadata.clone(),
            placement.clone(),
            coordinator.clone(),
            coordinator,
        );
        Fixture { transport, metadata, placement, cycle }
    }

    async fn store(fx: &Fixture, key: &str, holders: &[&str]) -> ObjectRecord {
        let data = Bytes::from_static(b"payload");
        let mut record = ObjectRecord::new("b1", key);
        for holder in holders {
            fx.transport.put(holder, &record.storage_key(), data.clone()).await.unwrap();
        }
        record.state = ObjectState::Committed;
        record.size = data.len() as u64;
        record.etag = plinth_core::digest(&data).to_hex();
        record.placement = holders.iter().map(|s| s.to_string()).collect();
        fx.metadata.create_object(record).await.unwrap()
    }

    #[tokio::test]
    async fn test_nothing_to_repair() {
        let fx = fixture(3);
        fx.metadata.create_bucket("b1").await.unwrap();
        store(&fx, "k", &["n1", "n2", "n3"]).await;

        let report = fx.cycle.run_once().await.unwrap();
        assert_eq!(report, RepairReport::default());
    }

    #[tokio::test]
    async fn test_replaces_removed_node() {
        let fx = fixture(4);
        fx.metadata.create_bucket("b1").await.unwrap();
        let record = store(&fx, "k", &["n1", "n2", "n3"]).await;
        fx.placement.remove_node("n2").unwrap();

        let report = fx.cycle.run_once().await.unwrap();
        assert_eq!(report.repaired, 1);
        assert_eq!(report.replicas_written, 1);

        let updated = fx.metadata.get_object_by_id(&record.id).await.unwrap();
        assert_eq!(updated.placement, vec!["n1", "n3", "n4"]);
        assert!(fx.transport.has_replica("n4", &record.storage_key()));
    }

    #[tokio::test]
    async fn test_rewrites_corrupt_replica_when_no_fresh_node() {
        let fx = fixture(3);
        fx.metadata.create_bucket("b1").await.unwrap();
        let record = store(&fx, "k", &["n3", "n1", "n2"]).await;
        let key = record.storage_key();
        fx.transport.corrupt("n1", &key);
        fx.metadata.mark_replica_corrupt(&record.id, "n1").await.unwrap();

        let report = fx.cycle.run_once().await.unwrap();
        assert_eq!(report.repaired, 1);
        assert_eq!(report.replicas_written, 1);

        let updated = fx.metadata.get_object_by_id(&record.id).await.unwrap();
        assert_eq!(updated.placement, vec!["n3", "n1", "n2"]);
        assert!(updated.corrupt_replicas.is_empty());
        assert_eq!(fx.transport.replica("n1", &key), Some(Bytes::from_static(b"payload")));

        assert_eq!(fx.cycle.run_once().await.unwrap(), RepairReport::default());
    }

    #[tokio::test]
    async fn test_fresh_nodes_preferred_over_rewrites() {
        let fx = fixture(4);
        fx.metadata.create_bucket("b1").await.unwrap();
        let record = store(&fx, "k", &["n1", "n2", "n3"]).await;
        fx.transport.corrupt("n2", &record.storage_key());
        fx.metadata.mark_replica_corrupt(&record.id, "n2").await.unwrap();

        let puts_before = fx.transport.put_count();
        fx.cycle.run_once().await.unwrap();
        assert_eq!(fx.transport.put_count(), puts_before + 1);

        let updated = fx.metadata.get_object_by_id(&record.id).await.unwrap();
        assert_eq!(updated.placement, vec!["n1", "n3", "n4"]);
        assert!(updated.corrupt_replicas.is_empty());
    }

    #[tokio::test]
    async fn test_surplus_unhealthy_holders_trimmed() {
        let fx = fixture(4);
        fx.metadata.create_bucket("b1").await.unwrap();
        let record = store(&fx, "k", &["n1", "n2", "n3"]).await;
        fx.placement.update_node_health("n2", NodeStatus::Degraded, 0, 0).unwrap();

        let report = fx.cycle.run_once().await.unwrap();
        assert_eq!(report.replicas_written, 1);

        // n4 restores three healthy replicas, so the degraded one is dropped.
        let updated = fx.metadata.get_object_by_id(&record.id).await.unwrap();
        assert_eq!(updated.placement, vec!["n1", "n3", "n4"]);

        fx.placement.heartbeat("n2", 0, 0).unwrap();
        assert_eq!(fx.cycle.run_once().await.unwrap().examined, 0);
    }

    #[tokio::test]
    async fn test_unhealthy_holders_kept_while_short() {
        let fx = fixture(4);
        fx.metadata.create_bucket("b1").await.unwrap();
        let record = store(&fx, "k", &["n1", "n2", "n3"]).await;
        fx.placement.update_node_health("n2", NodeStatus::Offline, 0, 0).unwrap();
        fx.placement.update_node_health("n3", NodeStatus::Degraded, 0, 0).unwrap();

        let report = fx.cycle.run_once().await.unwrap();
        assert_eq!(report.replicas_written, 1);

        // One slot is left after n1 and n4; the degraded holder takes it.
        let updated = fx.metadata.get_object_by_id(&record.id).await.unwrap();
        assert_eq!(updated.placement, vec!["n1", "n3", "n4"]);
    }

    #[tokio::test]
    async fn test_partial_repair_when_cluster_short() {
        let fx = fixture(3);
        fx.metadata.create_bucket("b1").await.unwrap();
        let record = store(&fx, "k", &["n1"]).await;
        fx.placement.remove_node("n3").unwrap();

        let report = fx.cycle.run_once().await.unwrap();
        assert_eq!(report.repaired, 1);
        assert_eq!(report.replicas_written, 1);
        let updated = fx.metadata.get_object_by_id(&record.id).await.unwrap();
        assert_eq!(updated.placement, vec!["n1", "n2"]);
    }

    #[tokio::test]
    async fn test_fails_without_sources() {
        let fx = fixture(3);
        fx.metadata.create_bucket("b1").await.unwrap();
        store(&fx, "k", &["n1"]).await;
        fx.placement.remove_node("n1").unwrap();

        let mut events = fx.cycle.subscribe();
        let report = fx.cycle.run_once().await.unwrap();
        assert_eq!(report.failed, 1);

        assert!(matches!(events.recv().await.unwrap(), RepairEvent::CycleStarted { deficient: 1 }));
        assert!(matches!(events.recv().await.unwrap(), RepairEvent::ObjectFailed { .. }));
        assert!(matches!(events.recv().await.unwrap(), RepairEvent::CycleCompleted { .. }));
    }

    #[tokio::test]
    async fn test_cycle_bound() {
        let fx = fixture(3);
        fx.metadata.create_bucket("b1").await.unwrap();
        store(&fx, "a", &["n1"]).await;
        store(&fx, "b", &["n1"]).await;

        let coordinator =
            Arc::new(QuorumCoordinator::new(QuorumConfig::default(), fx.transport.clone()).unwrap());
        let cycle = RepairCycle::new(
            RepairConfig::default().max_objects_per_cycle(1),
            fx.metadata.clone(),
            fx.placement.clone(),
            coordinator.clone(),
            coordinator,
        );
        let report = cycle.run_once().await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(cycle.run_once().await.unwrap().examined, 1);
        assert_eq!(cycle.run_once().await.unwrap().examined, 0);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_touches_nothing() {
        let fx = fixture(3);
        fx.metadata.create_bucket("b1").await.unwrap();
        store(&fx, "k", &["n1"]).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = fx.cycle.run_until_cancelled(&cancel).await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.repaired + report.skipped + report.failed, 0);
    }
}
