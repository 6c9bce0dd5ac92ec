// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Background scrubbing for replica integrity.
//!
//! Each cycle verifies a bounded sample of committed object versions,
//! current and noncurrent alike. The sample is paged from the metadata store
//! in `(bucket, key, version_id)` order starting after a cursor that
//! remembers where the previous cycle stopped, so successive cycles walk the
//! whole catalog and wrap around.
//!
//! For every sampled object, each listed replica on a node that has not been
//! removed is fetched and its digest recomputed:
//! - digest matches the stored ETag: valid
//! - digest differs, or the node no longer has the replica: the replica is
//!   flagged corrupt in metadata for the repair cycle to replace
//! - the node cannot be reached: counted as an error, nothing is flagged
//!
//! Scrubbing never deletes or rewrites a replica.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use parking_lot::Mutex;
use plinth_core::{
    Digest, Error, MetadataStore, NodeStatus, ObjectRecord, Result, VersionCursor,
};
use plinth_placement::ReplicaPlacement;
use plinth_quorum::QuorumReader;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ScrubConfig;

/// Totals for one scrub cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrubReport {
    /// Objects verified.
    pub objects_checked: usize,
    /// Replicas probed.
    pub replicas_checked: usize,
    /// Replicas whose digest matched.
    pub valid: usize,
    /// Replicas whose digest differed.
    pub corrupted: usize,
    /// Replicas the node no longer had.
    pub missing: usize,
    /// Replicas that could not be verified.
    pub errors: usize,
}

/// Events emitted by the scrub cycle.
#[derive(Debug, Clone)]
pub enum ScrubEvent {
    /// A scrub cycle started.
    CycleStarted {
        /// Objects in this cycle's sample.
        sampled: usize,
    },
    /// A replica failed verification and was flagged.
    CorruptionDetected {
        /// Object record id.
        object_id: String,
        /// Storage key of the object version.
        key: String,
        /// Node holding the bad replica.
        node_id: String,
        /// Digest recorded in metadata.
        expected: Digest,
        /// Recomputed digest, or `None` if the replica was missing.
        actual: Option<Digest>,
    },
    /// A scrub cycle completed.
    CycleCompleted {
        /// Cycle totals.
        report: ScrubReport,
        /// Duration of the cycle.
        duration: Duration,
    },
}

/// Verifies replica digests and flags bad replicas.
pub struct ScrubCycle {
    config: ScrubConfig,
    metadata: Arc<dyn MetadataStore>,
    placement: Arc<dyn ReplicaPlacement>,
    reader: Arc<dyn QuorumReader>,
    /// Last version verified.
    cursor: Mutex<Option<VersionCursor>>,
    event_tx: broadcast::Sender<ScrubEvent>,
}

impl ScrubCycle {
    /// Creates a scrub cycle starting at the beginning of the catalog.
    pub fn new(
        config: ScrubConfig,
        metadata: Arc<dyn MetadataStore>,
        placement: Arc<dyn ReplicaPlacement>,
        reader: Arc<dyn QuorumReader>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self { config, metadata, placement, reader, cursor: Mutex::new(None), event_tx }
    }

    /// Subscribes to scrub events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScrubEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ScrubConfig {
        &self.config
    }

    /// Runs one cycle to completion.
    ///
    /// # Errors
    ///
    /// Returns an error only if the catalog cannot be listed.
    pub async fn run_once(&self) -> Result<ScrubReport> {
        self.run_until_cancelled(&CancellationToken::new()).await
    }

    /// Runs one cycle, stopping between objects once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error only if the catalog cannot be listed.
    pub async fn run_until_cancelled(&self, cancel: &CancellationToken) -> Result<ScrubReport> {
        let started = Instant::now();
        let sample = self.next_sample().await?;
        let _ = self.event_tx.send(ScrubEvent::CycleStarted { sampled: sample.len() });

        let mut report = ScrubReport::default();
        for object in &sample {
            if cancel.is_cancelled() {
                let remaining = sample.len() - report.objects_checked;
                info!(remaining, "Scrub cycle interrupted by shutdown");
                break;
            }
            self.scrub_object(object, &mut report).await;
            report.objects_checked += 1;
            *self.cursor.lock() = Some(VersionCursor::at(object));
        }

        let duration = started.elapsed();
        histogram!("plinth_scrub_cycle_duration_seconds").record(duration.as_secs_f64());
        info!(
            objects = report.objects_checked,
            valid = report.valid,
            corrupted = report.corrupted,
            missing = report.missing,
            errors = report.errors,
            duration_ms = duration.as_millis() as u64,
            "Scrub cycle completed"
        );
        let _ = self.event_tx.send(ScrubEvent::CycleCompleted { report: report.clone(), duration });
        Ok(report)
    }

    /// Takes up to `sample_size` versions following the cursor, wrapping
    /// around to the start of the catalog.
    async fn next_sample(&self) -> Result<Vec<ObjectRecord>> {
        let size = self.config.sample_size;
        let cursor = self.cursor.lock().clone();
        let mut sample = self.metadata.list_committed_versions(cursor.as_ref(), size).await?;
        if sample.len() < size && cursor.is_some() {
            let wrapped = self.metadata.list_committed_versions(None, size - sample.len()).await?;
            for object in wrapped {
                if !sample.iter().any(|o| o.id == object.id) {
                    sample.push(object);
                }
            }
        }
        Ok(sample)
    }

    async fn scrub_object(&self, object: &ObjectRecord, report: &mut ScrubReport) {
        let key = object.storage_key();
        let expected = match object.etag.parse::<Digest>() {
            Ok(expected) => expected,
            Err(e) => {
                report.errors += 1;
                warn!(object_id = %object.id, error = %e, "Unreadable stored digest");
                return;
            }
        };

        // Flagged replicas are already queued for repair.
        let targets: Vec<String> = object
            .intact_replicas()
            .filter(|id| {
                self.placement.get_node(id).is_ok_and(|n| n.status != NodeStatus::Removed)
            })
            .cloned()
            .collect();

        for probe in self.reader.probe(&targets, &key).await {
            report.replicas_checked += 1;
            let actual = match probe.result {
                Ok(actual) if actual == expected => {
                    report.valid += 1;
                    counter!("plinth_scrub_replicas_total", "result" => "valid").increment(1);
                    continue;
                }
                Ok(actual) => {
                    report.corrupted += 1;
                    counter!("plinth_scrub_replicas_total", "result" => "corrupted").increment(1);
                    Some(actual)
                }
                Err(Error::ReplicaMissing { .. }) => {
                    report.missing += 1;
                    counter!("plinth_scrub_replicas_total", "result" => "missing").increment(1);
                    None
                }
                Err(e) => {
                    report.errors += 1;
                    counter!("plinth_scrub_replicas_total", "result" => "error").increment(1);
                    debug!(node_id = %probe.node_id, key = %key, error = %e, "Replica not verified");
                    continue;
                }
            };

            warn!(
                object_id = %object.id,
                key = %key,
                node_id = %probe.node_id,
                expected = %expected,
                actual = ?actual,
                "Corrupt replica detected"
            );
            if let Err(e) = self.metadata.mark_replica_corrupt(&object.id, &probe.node_id).await {
                // The placement moved on since the sample was taken.
                debug!(node_id = %probe.node_id, error = %e, "Corrupt flag not recorded");
                continue;
            }
            let _ = self.event_tx.send(ScrubEvent::CorruptionDetected {
                object_id: object.id.clone(),
                key: key.clone(),
                node_id: probe.node_id,
                expected,
                actual,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use plinth_core::{
        digest, Fault, MemoryMetadataStore, MemoryTransport, Node, NodeTransport, ObjectState,
        NULL_VERSION_ID,
    };
    use plinth_placement::{PlacementConfig, PlacementController};
    use plinth_quorum::{QuorumConfig, QuorumCoordinator};

    use super::*;

    struct Fixture {
        transport: Arc<MemoryTransport>,
        metadata: Arc<MemoryMetadataStore>,
        placement: Arc<PlacementController>,
        coordinator: Arc<QuorumCoordinator>,
    }

    impl Fixture {
        fn new() -> Self {
            let placement = Arc::new(PlacementController::new(PlacementConfig::default()));
            for id in ["n1", "n2", "n3"] {
                placement.add_node(Node::new(id, format!("{id}:9000"))).unwrap();
            }
            let transport = Arc::new(MemoryTransport::new());
            let coordinator = Arc::new(
                QuorumCoordinator::new(QuorumConfig::default(), transport.clone()).unwrap(),
            );
            Self { transport, metadata: Arc::new(MemoryMetadataStore::new()), placement, coordinator }
        }

        fn cycle(&self, sample_size: usize) -> ScrubCycle {
            ScrubCycle::new(
                ScrubConfig::default().sample_size(sample_size),
                self.metadata.clone(),
                self.placement.clone(),
                self.coordinator.clone(),
            )
        }

        async fn store(&self, bucket: &str, key: &str) -> ObjectRecord {
            self.store_version(bucket, key, NULL_VERSION_ID).await
        }

        async fn store_version(&self, bucket: &str, key: &str, version_id: &str) -> ObjectRecord {
            let data = Bytes::from(format!("{bucket}/{key} payload"));
            let mut record = ObjectRecord::new(bucket, key);
            record.version_id = version_id.to_string();
            let placement = vec!["n1".to_string(), "n2".to_string(), "n3".to_string()];
            for node in &placement {
                self.transport.put(node, &record.storage_key(), data.clone()).await.unwrap();
            }
            record.state = ObjectState::Committed;
            record.etag = digest(&data).to_hex();
            record.placement = placement;
            self.metadata.create_object(record).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_clean_cycle() {
        let fx = Fixture::new();
        fx.metadata.create_bucket("b1").await.unwrap();
        fx.store("b1", "k1").await;

        let report = fx.cycle(10).run_once().await.unwrap();
        assert_eq!(report.objects_checked, 1);
        assert_eq!(report.replicas_checked, 3);
        assert_eq!(report.valid, 3);
    }

    #[tokio::test]
    async fn test_flags_corrupt_and_missing() {
        let fx = Fixture::new();
        fx.metadata.create_bucket("b1").await.unwrap();
        let record = fx.store("b1", "k1").await;
        fx.transport.corrupt("n1", &record.storage_key());
        fx.transport.lose("n2", &record.storage_key());

        let cycle = fx.cycle(10);
        let mut events = cycle.subscribe();
        let report = cycle.run_once().await.unwrap();
        assert_eq!((report.valid, report.corrupted, report.missing), (1, 1, 1));

        let flagged = fx.metadata.get_object_by_id(&record.id).await.unwrap().corrupt_replicas;
        assert_eq!(flagged.into_iter().collect::<Vec<_>>(), vec!["n1", "n2"]);
        // Flagging never deletes.
        assert!(fx.transport.has_replica("n1", &record.storage_key()));

        assert!(matches!(events.recv().await.unwrap(), ScrubEvent::CycleStarted { sampled: 1 }));
        assert!(matches!(
            events.recv().await.unwrap(),
            ScrubEvent::CorruptionDetected { actual: Some(_), .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ScrubEvent::CorruptionDetected { actual: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_unreachable_is_an_error_not_corruption() {
        let fx = Fixture::new();
        fx.metadata.create_bucket("b1").await.unwrap();
        let record = fx.store("b1", "k1").await;
        fx.transport.set_fault("n3", Fault::Unreachable);

        let report = fx.cycle(10).run_once().await.unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.valid, 2);
        let stored = fx.metadata.get_object_by_id(&record.id).await.unwrap();
        assert!(stored.corrupt_replicas.is_empty());
    }

    #[tokio::test]
    async fn test_skips_removed_nodes() {
        let fx = Fixture::new();
        fx.metadata.create_bucket("b1").await.unwrap();
        fx.store("b1", "k1").await;
        fx.placement.remove_node("n2").unwrap();

        let report = fx.cycle(10).run_once().await.unwrap();
        assert_eq!(report.replicas_checked, 2);
    }

    #[tokio::test]
    async fn test_cursor_rotates_and_wraps() {
        let fx = Fixture::new();
        fx.metadata.create_bucket("a").await.unwrap();
        fx.metadata.create_bucket("b").await.unwrap();
        fx.store("a", "k1").await;
        fx.store("a", "k2").await;
        fx.store("b", "k1").await;

        let cycle = fx.cycle(2);
        let first = cycle.next_sample().await.unwrap();
        assert_eq!(first.iter().map(|o| o.storage_key()).collect::<Vec<_>>(), vec!["a/k1", "a/k2"]);

        cycle.run_once().await.unwrap();
        let second = cycle.next_sample().await.unwrap();
        assert_eq!(second.iter().map(|o| o.storage_key()).collect::<Vec<_>>(), vec!["b/k1", "a/k1"]);

        cycle.run_once().await.unwrap();
        let third = cycle.next_sample().await.unwrap();
        assert_eq!(third.iter().map(|o| o.storage_key()).collect::<Vec<_>>(), vec!["a/k2", "b/k1"]);
    }

    #[tokio::test]
    async fn test_noncurrent_versions_are_verified() {
        let fx = Fixture::new();
        fx.metadata.create_bucket("b1").await.unwrap();
        fx.metadata.set_bucket_versioning("b1", true).await.unwrap();
        let old = fx.store_version("b1", "k", "v1").await;
        let current = fx.store_version("b1", "k", "v2").await;
        assert!(!fx.metadata.get_object_by_id(&old.id).await.unwrap().is_latest);
        fx.transport.corrupt("n2", &old.storage_key());

        let report = fx.cycle(10).run_once().await.unwrap();
        assert_eq!(report.objects_checked, 2);
        assert_eq!(report.corrupted, 1);

        let flagged = fx.metadata.get_object_by_id(&old.id).await.unwrap().corrupt_replicas;
        assert_eq!(flagged.into_iter().collect::<Vec<_>>(), vec!["n2"]);
        let stored = fx.metadata.get_object_by_id(&current.id).await.unwrap();
        assert!(stored.corrupt_replicas.is_empty());
    }

    #[tokio::test]
    async fn test_cursor_pages_through_versions() {
        let fx = Fixture::new();
        fx.metadata.create_bucket("b1").await.unwrap();
        fx.metadata.set_bucket_versioning("b1", true).await.unwrap();
        for version in ["v1", "v2", "v3"] {
            fx.store_version("b1", "k", version).await;
        }

        let cycle = fx.cycle(2);
        let versions = |sample: Vec<ObjectRecord>| -> Vec<String> {
            sample.iter().map(|o| o.version_id.clone()).collect()
        };
        assert_eq!(versions(cycle.next_sample().await.unwrap()), vec!["v1", "v2"]);
        cycle.run_once().await.unwrap();
        assert_eq!(versions(cycle.next_sample().await.unwrap()), vec!["v3", "v1"]);
    }
}
