// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Integration tests for the core contracts and their in-memory
//! implementations.

use std::sync::Arc;

use bytes::Bytes;
use plinth_core::{
    digest, ChecksumCalculator, Crc32cCalculator, Digest, Error, MemoryMetadataStore,
    MemoryTransport, MetadataStore, NodeLiveness, NodeTransport, ObjectRecord, ObjectState,
};

struct OnlyLive(&'static [&'static str]);

impl NodeLiveness for OnlyLive {
    fn is_live(&self, node_id: &str) -> bool {
        self.0.iter().any(|id| *id == node_id)
    }
}

#[test]
fn test_exports() {
    let calculator = Crc32cCalculator;
    assert_eq!(calculator.calculate(b"123456789"), Digest::from_u32(0xe306_9283));
    assert_eq!("e3069283".parse::<Digest>().unwrap(), digest(b"123456789"));
}

#[tokio::test]
async fn test_transport_digest_matches_metadata_etag() {
    let transport = MemoryTransport::new();
    let metadata = MemoryMetadataStore::new();
    metadata.create_bucket("b1").await.unwrap();

    let data = Bytes::from_static(b"data1");
    let mut record = ObjectRecord::new("b1", "key1");
    let key = record.storage_key();
    let acked = transport.put("n1", &key, data.clone()).await.unwrap();

    record.state = ObjectState::Committed;
    record.etag = acked.to_hex();
    record.placement = vec!["n1".to_string()];
    let stored = metadata.create_object(record).await.unwrap();

    let fetched = transport.get("n1", &key).await.unwrap();
    assert_eq!(digest(&fetched).to_hex(), stored.etag);
    assert!(Crc32cCalculator.verify(&fetched, stored.etag.parse().unwrap()));
}

#[tokio::test]
async fn test_under_replicated_tracks_liveness_and_corruption() {
    let metadata = MemoryMetadataStore::new().with_liveness(Arc::new(OnlyLive(&["n1", "n2", "n3"])));
    metadata.create_bucket("b1").await.unwrap();

    let mut record = ObjectRecord::new("b1", "k");
    record.state = ObjectState::Committed;
    record.placement = vec!["n1".to_string(), "n2".to_string(), "n4".to_string()];
    let stored = metadata.create_object(record).await.unwrap();

    // n4 is not live.
    let deficient = metadata.find_under_replicated_objects(3).await.unwrap();
    assert_eq!(deficient.len(), 1);

    metadata
        .compare_and_set_placement(
            &stored.id,
            &stored.placement,
            vec!["n1".to_string(), "n2".to_string(), "n3".to_string()],
        )
        .await
        .unwrap();
    assert!(metadata.find_under_replicated_objects(3).await.unwrap().is_empty());

    metadata.mark_replica_corrupt(&stored.id, "n2").await.unwrap();
    assert_eq!(metadata.find_under_replicated_objects(3).await.unwrap().len(), 1);

    let err = metadata.mark_replica_corrupt(&stored.id, "n9").await.unwrap_err();
    assert!(matches!(err, Error::ReplicaMissing { .. }));
}
