// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Integration tests for the object service, repair, scrub, and worker.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use plinth_cluster::{Cluster, ClusterConfig, RepairEvent, SkipReason};
use plinth_core::{
    BucketRecord, Error, Fault, MemoryMetadataStore, MemoryTransport, MetadataStore, Node,
    ObjectRecord, Result, VersionCursor,
};
use plinth_placement::{PlacementConfig, PlacementController};
use tokio::time::timeout;

fn cluster_with(config: ClusterConfig, nodes: &[&str]) -> (Arc<MemoryTransport>, Cluster) {
    let transport = Arc::new(MemoryTransport::new());
    let cluster = Cluster::in_memory(config, transport.clone()).unwrap();
    for id in nodes {
        cluster.placement().add_node(Node::new(*id, format!("{id}:9000"))).unwrap();
    }
    (transport, cluster)
}

fn set(ids: &[String]) -> BTreeSet<String> {
    ids.iter().cloned().collect()
}

fn names(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

async fn put(cluster: &Cluster, bucket: &str, key: &str, data: &'static [u8]) -> ObjectRecord {
    cluster
        .service()
        .put_object(bucket, key, Bytes::from_static(data), "text/plain", HashMap::new())
        .await
        .unwrap()
        .record
}

#[test]
fn test_exports() {
    let config = ClusterConfig::default();
    assert_eq!(config.quorum.replication_factor, 3);
    assert!(config.repair.wake_on_node_loss);
}

#[test]
fn test_config_from_file() {
    let path = std::env::temp_dir().join(format!("plinth-{}.toml", uuid::Uuid::new_v4()));
    std::fs::write(
        &path,
        "[quorum]\nreplication_factor = 5\nwrite_quorum = 3\nread_quorum = 3\n\n[repair]\ninterval_ms = 1000\n",
    )
    .unwrap();

    let config = ClusterConfig::from_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(config.quorum.replication_factor, 5);
    assert_eq!(config.repair.interval_duration(), Duration::from_secs(1));
    assert!(config.validate().is_ok());

    let missing = ClusterConfig::from_file(std::env::temp_dir().join("plinth-does-not-exist.toml"));
    assert!(matches!(missing, Err(Error::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn test_write_timeout_read_and_repair_end_to_end() {
    let (transport, cluster) = cluster_with(ClusterConfig::default(), &["n1", "n2", "n3"]);
    cluster.metadata().create_bucket("bucket1").await.unwrap();

    // n3 stores the payload but never acknowledges.
    transport.set_fault("n3", Fault::StoreThenStall);
    let put = cluster
        .service()
        .put_object("bucket1", "key1", Bytes::from_static(b"data1"), "text/plain", HashMap::new())
        .await
        .unwrap();

    assert_eq!(set(&put.record.placement), names(&["n1", "n2"]));
    assert_eq!(put.results.len(), 3);
    let n3 = put.results.iter().find(|r| r.node_id == "n3").unwrap();
    assert!(matches!(n3.error, Some(Error::Timeout { .. })));

    // Read with n1 down: n2 and n3 agree on the stored digest.
    transport.clear_fault("n3");
    transport.set_fault("n1", Fault::Unreachable);
    let read = cluster.service().get_object("bucket1", "key1", None).await.unwrap();
    assert_eq!(read.data, Bytes::from_static(b"data1"));

    // Repair sees n3 missing from the placement and writes it there.
    let puts_before = transport.put_count();
    let report = cluster.repair().run_once().await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.repaired, 1);
    assert_eq!(report.replicas_written, 1);
    assert_eq!(transport.put_count(), puts_before + 1);

    let record = cluster.metadata().get_object("bucket1", "key1").await.unwrap();
    assert_eq!(set(&record.placement), names(&["n1", "n2", "n3"]));
    assert_eq!(transport.replica("n3", "bucket1/key1"), Some(Bytes::from_static(b"data1")));

    // Nothing changed, so the second cycle finds nothing and writes nothing.
    let puts_after_repair = transport.put_count();
    let report = cluster.repair().run_once().await.unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(report.replicas_written, 0);
    assert_eq!(transport.put_count(), puts_after_repair);
}

#[tokio::test]
async fn test_scrub_then_repair_replaces_only_corrupt_replica() {
    let (transport, cluster) = cluster_with(ClusterConfig::default(), &["n1", "n2", "n3", "n4"]);
    cluster.metadata().create_bucket("b1").await.unwrap();
    let record = put(&cluster, "b1", "k", b"payload").await;
    let key = record.storage_key();

    let holders = record.placement.clone();
    assert_eq!(holders.len(), 3);
    let bad = holders[1].clone();
    let spare = ["n1", "n2", "n3", "n4"]
        .into_iter()
        .find(|id| !holders.iter().any(|h| h.as_str() == *id))
        .unwrap()
        .to_string();
    transport.corrupt(&bad, &key);

    let scrub = cluster.scrub().run_once().await.unwrap();
    assert_eq!(scrub.corrupted, 1);
    assert_eq!(scrub.valid, 2);
    let flagged = cluster.metadata().get_object_by_id(&record.id).await.unwrap();
    assert!(flagged.corrupt_replicas.contains(&bad));

    let puts_before = transport.put_count();
    let report = cluster.repair().run_once().await.unwrap();
    assert_eq!(report.repaired, 1);
    assert_eq!(transport.put_count(), puts_before + 1);

    let repaired = cluster.metadata().get_object_by_id(&record.id).await.unwrap();
    let expected: BTreeSet<String> = [holders[0].clone(), holders[2].clone(), spare.clone()].into();
    assert_eq!(set(&repaired.placement), expected);
    assert!(repaired.corrupt_replicas.is_empty());

    // The good replicas were not rewritten and the bad one was not deleted.
    assert_eq!(transport.replica(&holders[0], &key), Some(Bytes::from_static(b"payload")));
    assert_eq!(transport.replica(&holders[2], &key), Some(Bytes::from_static(b"payload")));
    assert_eq!(transport.replica(&spare, &key), Some(Bytes::from_static(b"payload")));
    assert!(transport.has_replica(&bad, &key));

    let rescrub = cluster.scrub().run_once().await.unwrap();
    assert_eq!(rescrub.valid, 3);
}

#[tokio::test]
async fn test_scrub_then_repair_heals_in_place_on_minimal_cluster() {
    let (transport, cluster) = cluster_with(ClusterConfig::default(), &["n1", "n2", "n3"]);
    cluster.metadata().create_bucket("b1").await.unwrap();
    let record = put(&cluster, "b1", "k", b"payload").await;
    let key = record.storage_key();
    let bad = record.placement[1].clone();
    transport.corrupt(&bad, &key);

    let scrub = cluster.scrub().run_once().await.unwrap();
    assert_eq!(scrub.corrupted, 1);

    // Every node already holds a replica, so the bad one is rewritten.
    let report = cluster.repair().run_once().await.unwrap();
    assert_eq!(report.repaired, 1);
    assert_eq!(report.replicas_written, 1);

    let healed = cluster.metadata().get_object_by_id(&record.id).await.unwrap();
    assert_eq!(healed.placement, record.placement);
    assert!(healed.corrupt_replicas.is_empty());
    assert_eq!(transport.replica(&bad, &key), Some(Bytes::from_static(b"payload")));

    let rescrub = cluster.scrub().run_once().await.unwrap();
    assert_eq!((rescrub.valid, rescrub.corrupted), (3, 0));
    assert_eq!(cluster.repair().run_once().await.unwrap().examined, 0);
}

#[tokio::test]
async fn test_scrub_reaches_old_versions() {
    let (transport, cluster) = cluster_with(ClusterConfig::default(), &["n1", "n2", "n3"]);
    cluster.metadata().create_bucket("b1").await.unwrap();
    cluster.metadata().set_bucket_versioning("b1", true).await.unwrap();
    let old = put(&cluster, "b1", "k", b"one").await;
    put(&cluster, "b1", "k", b"two").await;
    let bad = old.placement[0].clone();
    transport.corrupt(&bad, &old.storage_key());

    let scrub = cluster.scrub().run_once().await.unwrap();
    assert_eq!(scrub.objects_checked, 2);
    assert_eq!(scrub.corrupted, 1);

    cluster.repair().run_once().await.unwrap();
    let read = cluster.service().get_object("b1", "k", Some(&old.version_id)).await.unwrap();
    assert_eq!(read.data, Bytes::from_static(b"one"));
    assert_eq!(transport.replica(&bad, &old.storage_key()), Some(Bytes::from_static(b"one")));
}

/// Metadata store that changes an object's placement just before every
/// compare-and-set, as a concurrent writer would.
struct RacingStore {
    inner: MemoryMetadataStore,
    racer: String,
}

impl RacingStore {
    async fn race(&self, object_id: &str, expected: &[String]) -> Result<()> {
        let mut raced = expected.to_vec();
        raced.push(self.racer.clone());
        self.inner.update_object_placement(object_id, raced).await
    }
}

#[async_trait]
impl MetadataStore for RacingStore {
    async fn create_bucket(&self, name: &str) -> Result<BucketRecord> {
        self.inner.create_bucket(name).await
    }

    async fn get_bucket(&self, name: &str) -> Result<BucketRecord> {
        self.inner.get_bucket(name).await
    }

    async fn delete_bucket(&self, name: &str) -> Result<()> {
        self.inner.delete_bucket(name).await
    }

    async fn list_buckets(&self) -> Result<Vec<BucketRecord>> {
        self.inner.list_buckets().await
    }

    async fn set_bucket_versioning(&self, name: &str, enabled: bool) -> Result<()> {
        self.inner.set_bucket_versioning(name, enabled).await
    }

    async fn create_object(&self, object: ObjectRecord) -> Result<ObjectRecord> {
        self.inner.create_object(object).await
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectRecord> {
        self.inner.get_object(bucket, key).await
    }

    async fn get_object_version(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
    ) -> Result<ObjectRecord> {
        self.inner.get_object_version(bucket, key, version_id).await
    }

    async fn get_object_by_id(&self, object_id: &str) -> Result<ObjectRecord> {
        self.inner.get_object_by_id(object_id).await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.inner.delete_object(bucket, key).await
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<ObjectRecord>> {
        self.inner.list_objects(bucket, prefix, limit).await
    }

    async fn list_committed_versions(
        &self,
        after: Option<&VersionCursor>,
        limit: usize,
    ) -> Result<Vec<ObjectRecord>> {
        self.inner.list_committed_versions(after, limit).await
    }

    async fn update_object_placement(&self, object_id: &str, node_ids: Vec<String>) -> Result<()> {
        self.inner.update_object_placement(object_id, node_ids).await
    }

    async fn compare_and_set_placement(
        &self,
        object_id: &str,
        expected: &[String],
        node_ids: Vec<String>,
    ) -> Result<()> {
        self.race(object_id, expected).await?;
        self.inner.compare_and_set_placement(object_id, expected, node_ids).await
    }

    async fn commit_repair(
        &self,
        object_id: &str,
        expected: &[String],
        node_ids: Vec<String>,
        rewritten: &[String],
    ) -> Result<()> {
        self.race(object_id, expected).await?;
        self.inner.commit_repair(object_id, expected, node_ids, rewritten).await
    }

    async fn mark_replica_corrupt(&self, object_id: &str, node_id: &str) -> Result<()> {
        self.inner.mark_replica_corrupt(object_id, node_id).await
    }

    async fn find_under_replicated_objects(
        &self,
        replication_factor: usize,
    ) -> Result<Vec<ObjectRecord>> {
        self.inner.find_under_replicated_objects(replication_factor).await
    }
}

#[tokio::test]
async fn test_repair_skips_object_on_placement_conflict() {
    let placement = Arc::new(PlacementController::new(PlacementConfig::default()));
    for id in ["n1", "n2", "n3", "n4"] {
        placement.add_node(Node::new(id, format!("{id}:9000"))).unwrap();
    }
    let metadata = Arc::new(RacingStore {
        inner: MemoryMetadataStore::new().with_liveness(placement.clone()),
        racer: "n9".to_string(),
    });
    let transport = Arc::new(MemoryTransport::new());
    let cluster =
        Cluster::new(ClusterConfig::default(), placement.clone(), metadata, transport).unwrap();
    cluster.metadata().create_bucket("b1").await.unwrap();

    let record = put(&cluster, "b1", "k", b"payload").await;
    placement.remove_node(&record.placement[0]).unwrap();

    let mut events = cluster.repair().subscribe();
    let report = cluster.repair().run_once().await.unwrap();
    assert_eq!(report.repaired, 0);
    assert_eq!(report.skipped, 1);

    let mut expected = record.placement.clone();
    expected.push("n9".to_string());
    let stored = cluster.metadata().get_object_by_id(&record.id).await.unwrap();
    assert_eq!(stored.placement, expected);

    assert!(matches!(events.recv().await.unwrap(), RepairEvent::CycleStarted { deficient: 1 }));
    assert!(matches!(
        events.recv().await.unwrap(),
        RepairEvent::ObjectSkipped { reason: SkipReason::Conflict, .. }
    ));
}

#[tokio::test]
async fn test_read_fails_when_quorum_unreachable() {
    let (transport, cluster) = cluster_with(ClusterConfig::default(), &["n1", "n2", "n3"]);
    cluster.metadata().create_bucket("b1").await.unwrap();
    put(&cluster, "b1", "k", b"payload").await;
    transport.set_fault("n1", Fault::Unreachable);
    transport.set_fault("n2", Fault::Unreachable);

    let err = cluster.service().get_object("b1", "k", None).await.unwrap_err();
    let Error::ReadQuorumNotMet { required, achieved, results } = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(required, 2);
    assert!(achieved <= 1);
    for result in results.iter().filter(|r| r.node_id == "n1" || r.node_id == "n2") {
        assert!(matches!(result.error, Some(Error::NodeUnreachable { .. })));
    }
    let n3 = results.iter().find(|r| r.node_id == "n3").unwrap();
    assert!(n3.success || matches!(n3.error, Some(Error::Abandoned { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_worker_wakes_on_node_loss_and_shuts_down() {
    let mut config = ClusterConfig::default();
    config.repair.interval_ms = 3_600_000;
    config.scrub.interval_ms = 3_600_000;
    config.liveness_sweep_ms = 3_600_000;
    let (_transport, cluster) = cluster_with(config, &["n1", "n2", "n3", "n4"]);
    cluster.metadata().create_bucket("b1").await.unwrap();
    let record = put(&cluster, "b1", "k", b"payload").await;

    let mut events = cluster.repair().subscribe();
    let worker = cluster.spawn_worker();

    // The first tick fires immediately and finds nothing to do.
    let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, RepairEvent::CycleStarted { deficient: 0 }));
    let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, RepairEvent::CycleCompleted { .. }));

    // Removing a holder wakes the loop long before the next tick.
    cluster.placement().remove_node(&record.placement[0]).unwrap();
    let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, RepairEvent::CycleStarted { deficient: 1 }));
    let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, RepairEvent::ObjectRepaired { ref written, .. } if written.len() == 1));

    assert!(!worker.is_shutting_down());
    let token = worker.cancellation_token();
    timeout(Duration::from_secs(1), worker.shutdown()).await.unwrap();
    assert!(token.is_cancelled());
}
