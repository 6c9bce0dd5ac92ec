// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Metadata store contract and an in-memory implementation.
//!
//! The replication core never persists catalog state itself. It consumes a
//! [`MetadataStore`] for buckets, object versions, and per-object placement,
//! and relies on [`MetadataStore::compare_and_set_placement`] to serialize
//! concurrent placement rewrites.
//!
//! [`MemoryMetadataStore`] backs tests and single-process deployments.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{BucketRecord, ObjectRecord, ObjectState, NULL_VERSION_ID};

/// Position in the catalog-wide version listing, ordered by bucket, key,
/// then version id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionCursor {
    /// Bucket name.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Version id.
    pub version_id: String,
}

impl VersionCursor {
    /// Cursor positioned at `record`.
    #[must_use]
    pub fn at(record: &ObjectRecord) -> Self {
        Self {
            bucket: record.bucket.clone(),
            key: record.key.clone(),
            version_id: record.version_id.clone(),
        }
    }

    fn is_before(&self, record: &ObjectRecord) -> bool {
        (self.bucket.as_str(), self.key.as_str(), self.version_id.as_str())
            < (record.bucket.as_str(), record.key.as_str(), record.version_id.as_str())
    }
}

/// Answers whether a node currently counts toward an object's live replicas.
pub trait NodeLiveness: Send + Sync {
    /// Returns true if the node is registered and healthy.
    fn is_live(&self, node_id: &str) -> bool;
}

/// Durable catalog of buckets, object versions, and replica placement.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    // === Bucket Operations ===

    /// Creates a new, unversioned bucket.
    ///
    /// # Errors
    ///
    /// Returns `BucketAlreadyExists` if the name is taken.
    async fn create_bucket(&self, name: &str) -> Result<BucketRecord>;

    /// Gets a bucket by name.
    ///
    /// # Errors
    ///
    /// Returns `BucketNotFound` if the bucket does not exist.
    async fn get_bucket(&self, name: &str) -> Result<BucketRecord>;

    /// Deletes an empty bucket.
    ///
    /// # Errors
    ///
    /// Returns `BucketNotFound` or `BucketNotEmpty`.
    async fn delete_bucket(&self, name: &str) -> Result<()>;

    /// Lists all buckets ordered by name.
    async fn list_buckets(&self) -> Result<Vec<BucketRecord>>;

    /// Turns versioning on or off for a bucket.
    ///
    /// # Errors
    ///
    /// Returns `BucketNotFound` if the bucket does not exist.
    async fn set_bucket_versioning(&self, name: &str, enabled: bool) -> Result<()>;

    // === Object Operations ===

    /// Stores an object version and returns the stored record.
    ///
    /// Committing a version makes it the latest for its key. In a versioned
    /// bucket a `"null"` version id is replaced by a fresh one; in an
    /// unversioned bucket the previous null version is overwritten.
    ///
    /// # Errors
    ///
    /// Returns `BucketNotFound` if the bucket does not exist.
    async fn create_object(&self, object: ObjectRecord) -> Result<ObjectRecord>;

    /// Gets the latest visible version of a key.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` if the key has no version or the latest one
    /// is a delete marker.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectRecord>;

    /// Gets a specific version of a key.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` if the version does not exist.
    async fn get_object_version(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
    ) -> Result<ObjectRecord>;

    /// Gets an object version by record id.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` if no record has this id.
    async fn get_object_by_id(&self, object_id: &str) -> Result<ObjectRecord>;

    /// Deletes a key. Versioned buckets get a delete marker; unversioned
    /// buckets tombstone the current version.
    ///
    /// # Errors
    ///
    /// Returns `BucketNotFound`, or `ObjectNotFound` in an unversioned bucket
    /// with no current version.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// Lists latest visible versions whose key starts with `prefix`, ordered
    /// by key. A `limit` of zero means no limit.
    ///
    /// # Errors
    ///
    /// Returns `BucketNotFound` if the bucket does not exist.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<ObjectRecord>>;

    /// Lists committed, non-marker versions across every bucket, current
    /// and noncurrent alike, ordered by bucket, key, then version id.
    ///
    /// Starts strictly after `after` and returns at most `limit` records. A
    /// `limit` of zero means no limit.
    async fn list_committed_versions(
        &self,
        after: Option<&VersionCursor>,
        limit: usize,
    ) -> Result<Vec<ObjectRecord>>;

    // === Placement Operations ===

    /// Replaces the placement of an object version unconditionally.
    ///
    /// Corrupt flags for nodes dropped from the placement are discarded.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` if no record has this id.
    async fn update_object_placement(&self, object_id: &str, node_ids: Vec<String>) -> Result<()>;

    /// Replaces the placement only if it still equals `expected`.
    ///
    /// # Errors
    ///
    /// Returns `PlacementConflict` if the placement changed, or
    /// `ObjectNotFound`.
    async fn compare_and_set_placement(
        &self,
        object_id: &str,
        expected: &[String],
        node_ids: Vec<String>,
    ) -> Result<()>;

    /// Replaces the placement only if it still equals `expected`, and clears
    /// the corrupt flags of `rewritten`, whose replicas were just overwritten
    /// with a verified copy.
    ///
    /// # Errors
    ///
    /// Returns `PlacementConflict` if the placement changed, or
    /// `ObjectNotFound`.
    async fn commit_repair(
        &self,
        object_id: &str,
        expected: &[String],
        node_ids: Vec<String>,
        rewritten: &[String],
    ) -> Result<()>;

    /// Flags the replica on `node_id` as corrupt. The node stays in the
    /// placement until repair replaces it.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound`, or `ReplicaMissing` if the node is not in
    /// the placement.
    async fn mark_replica_corrupt(&self, object_id: &str, node_id: &str) -> Result<()>;

    // === Repair Operations ===

    /// Returns every committed, non-marker version whose count of intact
    /// replicas on live nodes is below `replication_factor`.
    async fn find_under_replicated_objects(
        &self,
        replication_factor: usize,
    ) -> Result<Vec<ObjectRecord>>;
}

/// In-memory [`MetadataStore`].
///
/// Records are keyed by id in a [`DashMap`]. Mutations of a key's version
/// chain take a commit lock so the latest-version flag stays unique.
pub struct MemoryMetadataStore {
    buckets: DashMap<String, BucketRecord>,
    objects: DashMap<String, ObjectRecord>,
    commit_lock: Mutex<()>,
    liveness: Option<Arc<dyn NodeLiveness>>,
    region: String,
}

impl MemoryMetadataStore {
    /// Creates an empty store that counts every listed replica as live.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            objects: DashMap::new(),
            commit_lock: Mutex::new(()),
            liveness: None,
            region: "local".to_string(),
        }
    }

    /// Consults `liveness` when counting live replicas.
    #[must_use]
    pub fn with_liveness(mut self, liveness: Arc<dyn NodeLiveness>) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Sets the region label for new buckets.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Number of intact replicas of `object` on live nodes.
    #[must_use]
    pub fn live_replica_count(&self, object: &ObjectRecord) -> usize {
        object
            .intact_replicas()
            .filter(|id| self.liveness.as_ref().map_or(true, |l| l.is_live(id)))
            .count()
    }

    fn require_bucket(&self, name: &str) -> Result<BucketRecord> {
        self.buckets
            .get(name)
            .map(|b| b.value().clone())
            .ok_or_else(|| Error::BucketNotFound(name.to_string()))
    }

    /// Clears the latest flag on every version of `bucket/key`. Caller holds
    /// the commit lock.
    fn demote_versions(&self, bucket: &str, key: &str) {
        for mut entry in self.objects.iter_mut() {
            let record = entry.value_mut();
            if record.bucket == bucket && record.key == key && record.is_latest {
                record.is_latest = false;
                record.updated_at = Utc::now();
            }
        }
    }

    fn find_version(&self, bucket: &str, key: &str, version_id: &str) -> Option<String> {
        self.objects.iter().find_map(|entry| {
            let r = entry.value();
            (r.bucket == bucket && r.key == key && r.version_id == version_id)
                .then(|| r.id.clone())
        })
    }

    fn latest(&self, bucket: &str, key: &str) -> Option<ObjectRecord> {
        self.objects.iter().find_map(|entry| {
            let r = entry.value();
            (r.bucket == bucket && r.key == key && r.is_latest).then(|| r.clone())
        })
    }

    fn with_object<T>(&self, object_id: &str, f: impl FnOnce(&mut ObjectRecord) -> Result<T>) -> Result<T> {
        let mut entry = self
            .objects
            .get_mut(object_id)
            .ok_or_else(|| Error::ObjectNotFound(object_id.to_string()))?;
        f(entry.value_mut())
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

fn new_version_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn set_placement(record: &mut ObjectRecord, node_ids: Vec<String>) {
    record.corrupt_replicas.retain(|id| node_ids.contains(id));
    record.placement = node_ids;
    record.updated_at = Utc::now();
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create_bucket(&self, name: &str) -> Result<BucketRecord> {
        let _guard = self.commit_lock.lock();
        if self.buckets.contains_key(name) {
            return Err(Error::BucketAlreadyExists(name.to_string()));
        }
        let bucket = BucketRecord::new(name, self.region.clone());
        self.buckets.insert(name.to_string(), bucket.clone());
        debug!(bucket = %name, "Created bucket");
        Ok(bucket)
    }

    async fn get_bucket(&self, name: &str) -> Result<BucketRecord> {
        self.require_bucket(name)
    }

    async fn delete_bucket(&self, name: &str) -> Result<()> {
        let _guard = self.commit_lock.lock();
        self.require_bucket(name)?;
        let occupied =
            self.objects.iter().any(|e| e.value().bucket == name && e.value().is_latest && e.value().is_visible());
        if occupied {
            return Err(Error::BucketNotEmpty(name.to_string()));
        }
        self.objects.retain(|_, record| record.bucket != name);
        self.buckets.remove(name);
        debug!(bucket = %name, "Deleted bucket");
        Ok(())
    }

    async fn list_buckets(&self) -> Result<Vec<BucketRecord>> {
        let mut buckets: Vec<_> = self.buckets.iter().map(|b| b.value().clone()).collect();
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    async fn set_bucket_versioning(&self, name: &str, enabled: bool) -> Result<()> {
        let mut bucket =
            self.buckets.get_mut(name).ok_or_else(|| Error::BucketNotFound(name.to_string()))?;
        bucket.versioning_enabled = enabled;
        bucket.updated_at = Utc::now();
        Ok(())
    }

    async fn create_object(&self, mut object: ObjectRecord) -> Result<ObjectRecord> {
        let _guard = self.commit_lock.lock();
        let bucket = self.require_bucket(&object.bucket)?;

        if bucket.versioning_enabled {
            if object.version_id == NULL_VERSION_ID {
                object.version_id = new_version_id();
            }
        } else {
            object.version_id = NULL_VERSION_ID.to_string();
            if let Some(previous) = self.find_version(&object.bucket, &object.key, NULL_VERSION_ID) {
                self.objects.remove(&previous);
            }
        }

        if object.state == ObjectState::Committed {
            self.demote_versions(&object.bucket, &object.key);
            object.is_latest = true;
        } else {
            object.is_latest = false;
        }
        object.updated_at = Utc::now();

        debug!(
            bucket = %object.bucket,
            key = %object.key,
            version_id = %object.version_id,
            placement = ?object.placement,
            "Stored object record"
        );
        self.objects.insert(object.id.clone(), object.clone());
        Ok(object)
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectRecord> {
        self.require_bucket(bucket)?;
        self.latest(bucket, key)
            .filter(ObjectRecord::is_visible)
            .ok_or_else(|| Error::ObjectNotFound(format!("{bucket}/{key}")))
    }

    async fn get_object_version(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
    ) -> Result<ObjectRecord> {
        self.require_bucket(bucket)?;
        self.find_version(bucket, key, version_id)
            .and_then(|id| self.objects.get(&id).map(|r| r.value().clone()))
            .filter(|r| r.state != ObjectState::Tombstoned)
            .ok_or_else(|| Error::ObjectNotFound(format!("{bucket}/{key}@{version_id}")))
    }

    async fn get_object_by_id(&self, object_id: &str) -> Result<ObjectRecord> {
        self.objects
            .get(object_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::ObjectNotFound(object_id.to_string()))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let _guard = self.commit_lock.lock();
        let bucket_record = self.require_bucket(bucket)?;

        if bucket_record.versioning_enabled {
            self.demote_versions(bucket, key);
            let mut marker = ObjectRecord::new(bucket, key);
            marker.version_id = new_version_id();
            marker.is_delete_marker = true;
            marker.is_latest = true;
            marker.state = ObjectState::Committed;
            debug!(bucket = %bucket, key = %key, version_id = %marker.version_id, "Created delete marker");
            self.objects.insert(marker.id.clone(), marker);
            return Ok(());
        }

        let current = self
            .latest(bucket, key)
            .ok_or_else(|| Error::ObjectNotFound(format!("{bucket}/{key}")))?;
        self.with_object(&current.id, |record| {
            record.state = ObjectState::Tombstoned;
            record.is_latest = false;
            record.updated_at = Utc::now();
            Ok(())
        })?;
        debug!(bucket = %bucket, key = %key, "Tombstoned object");
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<ObjectRecord>> {
        self.require_bucket(bucket)?;
        let mut objects: Vec<_> = self
            .objects
            .iter()
            .filter(|e| {
                let r = e.value();
                r.bucket == bucket && r.is_latest && r.is_visible() && r.key.starts_with(prefix)
            })
            .map(|e| e.value().clone())
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        if limit > 0 {
            objects.truncate(limit);
        }
        Ok(objects)
    }

    async fn list_committed_versions(
        &self,
        after: Option<&VersionCursor>,
        limit: usize,
    ) -> Result<Vec<ObjectRecord>> {
        let mut versions: Vec<_> = self
            .objects
            .iter()
            .filter(|e| {
                let r = e.value();
                r.state == ObjectState::Committed
                    && !r.is_delete_marker
                    && after.map_or(true, |cursor| cursor.is_before(r))
            })
            .map(|e| e.value().clone())
            .collect();
        versions.sort_by(|a, b| {
            (&a.bucket, &a.key, &a.version_id).cmp(&(&b.bucket, &b.key, &b.version_id))
        });
        if limit > 0 {
            versions.truncate(limit);
        }
        Ok(versions)
    }

    async fn update_object_placement(&self, object_id: &str, node_ids: Vec<String>) -> Result<()> {
        self.with_object(object_id, |record| {
            set_placement(record, node_ids);
            Ok(())
        })
    }

    async fn compare_and_set_placement(
        &self,
        object_id: &str,
        expected: &[String],
        node_ids: Vec<String>,
    ) -> Result<()> {
        self.with_object(object_id, |record| {
            if record.placement != expected {
                return Err(Error::PlacementConflict(object_id.to_string()));
            }
            set_placement(record, node_ids);
            Ok(())
        })
    }

    async fn commit_repair(
        &self,
        object_id: &str,
        expected: &[String],
        node_ids: Vec<String>,
        rewritten: &[String],
    ) -> Result<()> {
        self.with_object(object_id, |record| {
            if record.placement != expected {
                return Err(Error::PlacementConflict(object_id.to_string()));
            }
            set_placement(record, node_ids);
            for node_id in rewritten {
                record.corrupt_replicas.remove(node_id);
            }
            Ok(())
        })
    }

    async fn mark_replica_corrupt(&self, object_id: &str, node_id: &str) -> Result<()> {
        self.with_object(object_id, |record| {
            if !record.placement.iter().any(|id| id == node_id) {
                return Err(Error::ReplicaMissing {
                    node_id: node_id.to_string(),
                    key: record.storage_key(),
                });
            }
            if record.corrupt_replicas.insert(node_id.to_string()) {
                record.updated_at = Utc::now();
            }
            Ok(())
        })
    }

    async fn find_under_replicated_objects(
        &self,
        replication_factor: usize,
    ) -> Result<Vec<ObjectRecord>> {
        let mut deficient: Vec<_> = self
            .objects
            .iter()
            .filter(|e| {
                let r = e.value();
                r.state == ObjectState::Committed
                    && !r.is_delete_marker
                    && self.live_replica_count(r) < replication_factor
            })
            .map(|e| e.value().clone())
            .collect();
        deficient.sort_by(|a, b| {
            (&a.bucket, &a.key, a.created_at).cmp(&(&b.bucket, &b.key, b.created_at))
        });
        Ok(deficient)
    }
}
