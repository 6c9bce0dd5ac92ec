// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Replicated object operations.
//!
//! A put places the payload on the key's preferred nodes through a quorum
//! write and only then commits the metadata record, with the acknowledging
//! nodes as its placement. Nodes that failed are left to the repair cycle.
//!
//! A get reads the intact replicas with the stored digest as the reference.
//! Replicas that disagree are flagged corrupt and left in place; the read
//! path never rewrites data.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use metrics::{counter, histogram};
use plinth_core::{
    Digest, Error, MetadataStore, NodeResult, ObjectRecord, ObjectState, Result,
};
use plinth_placement::ReplicaPlacement;
use plinth_quorum::{QuorumReader, QuorumWriter};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A committed put.
#[derive(Debug, Clone)]
pub struct PutObjectOutput {
    /// The stored metadata record.
    pub record: ObjectRecord,
    /// One result per target node, including the nodes that failed.
    pub results: Vec<NodeResult>,
}

/// A successful get.
#[derive(Debug, Clone)]
pub struct GetObjectOutput {
    /// Metadata record of the version read.
    pub record: ObjectRecord,
    /// Payload agreed on by the read quorum.
    pub data: Bytes,
}

/// Object operations over the placement, quorum, and metadata layers.
pub struct ObjectService {
    metadata: Arc<dyn MetadataStore>,
    placement: Arc<dyn ReplicaPlacement>,
    reader: Arc<dyn QuorumReader>,
    writer: Arc<dyn QuorumWriter>,
}

impl ObjectService {
    /// Creates a service.
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        placement: Arc<dyn ReplicaPlacement>,
        reader: Arc<dyn QuorumReader>,
        writer: Arc<dyn QuorumWriter>,
    ) -> Self {
        Self { metadata, placement, reader, writer }
    }

    /// Stores an object and returns its committed record.
    ///
    /// # Errors
    ///
    /// Returns `BucketNotFound`, `InsufficientNodes` when the cluster has
    /// fewer placeable nodes than the replication factor, or
    /// `WriteQuorumNotMet`. Replicas written before a failed quorum are not
    /// rolled back.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<PutObjectOutput> {
        let started = Instant::now();
        let bucket_record = self.metadata.get_bucket(bucket).await?;

        let mut record = ObjectRecord::new(bucket, key);
        if bucket_record.versioning_enabled {
            record.version_id = Uuid::new_v4().simple().to_string();
        }
        let storage_key = record.storage_key();

        let rf = self.writer.replication_factor();
        let targets: Vec<String> =
            self.placement.get_nodes(&storage_key, rf)?.into_iter().map(|n| n.id).collect();
        debug!(key = %storage_key, targets = ?targets, "Writing replicas");

        let size = data.len() as u64;
        let outcome = self.writer.write(&targets, &storage_key, data).await?;

        record.state = ObjectState::Committed;
        record.size = size;
        record.etag = outcome.digest.to_hex();
        record.content_type = content_type.to_string();
        record.metadata = user_metadata;
        record.placement = outcome.acked_nodes();
        let record = self.metadata.create_object(record).await?;

        counter!("plinth_objects_put_total").increment(1);
        histogram!("plinth_object_put_duration_seconds").record(started.elapsed().as_secs_f64());
        info!(
            key = %record.storage_key(),
            size,
            etag = %record.etag,
            placement = ?record.placement,
            "Object stored"
        );
        Ok(PutObjectOutput { record, results: outcome.results })
    }

    /// Reads the latest version of an object, or `version_id` if given.
    ///
    /// The read covers the intact replicas in the placement plus the key's
    /// current preferred nodes, since a node that timed out during the put
    /// may still hold a good copy. Every replica is checked against the
    /// stored digest.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound`, `InsufficientNodes` when fewer replicas
    /// exist than the read quorum, or `ReadQuorumNotMet`.
    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<GetObjectOutput> {
        let started = Instant::now();
        let record = match version_id {
            Some(version_id) => self.metadata.get_object_version(bucket, key, version_id).await?,
            None => self.metadata.get_object(bucket, key).await?,
        };
        if !record.is_visible() {
            return Err(Error::ObjectNotFound(format!("{bucket}/{key}")));
        }

        let storage_key = record.storage_key();
        let mut targets: Vec<String> = record.intact_replicas().cloned().collect();
        let rf = self.writer.replication_factor();
        if let Ok(preferred) = self.placement.get_nodes(&storage_key, rf) {
            targets.extend(
                preferred.into_iter().map(|n| n.id).filter(|id| !record.placement.contains(id)),
            );
        }

        let expected = record.etag.parse::<Digest>().ok();
        let outcome = self.reader.read(&targets, &storage_key, expected).await?;

        for node_id in outcome.repair_candidates.iter().filter(|id| record.placement.contains(id)) {
            warn!(key = %storage_key, node_id = %node_id, "Divergent replica flagged for repair");
            if let Err(e) = self.metadata.mark_replica_corrupt(&record.id, node_id).await {
                debug!(node_id = %node_id, error = %e, "Corrupt flag not recorded");
            }
        }

        counter!("plinth_objects_get_total").increment(1);
        histogram!("plinth_object_get_duration_seconds").record(started.elapsed().as_secs_f64());
        Ok(GetObjectOutput { record, data: outcome.data })
    }

    /// Deletes an object.
    ///
    /// Versioned buckets get a delete marker; unversioned buckets tombstone
    /// the current version. Replicas stay on their nodes.
    ///
    /// # Errors
    ///
    /// Returns `BucketNotFound` or `ObjectNotFound`.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.metadata.delete_object(bucket, key).await?;
        counter!("plinth_objects_delete_total").increment(1);
        info!(bucket = %bucket, key = %key, "Object deleted");
        Ok(())
    }
}
