// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Wiring of the replication components from one [`ClusterConfig`].

use std::sync::Arc;

use plinth_core::{MemoryMetadataStore, MetadataStore, NodeTransport, Result};
use plinth_placement::PlacementController;
use plinth_quorum::QuorumCoordinator;
use tracing::info;

use crate::config::ClusterConfig;
use crate::repair::RepairCycle;
use crate::scrub::ScrubCycle;
use crate::service::ObjectService;
use crate::worker::ReplicationWorker;

/// The placement controller, quorum coordinator, object service, and
/// background cycles of one cluster, sharing one metadata store and
/// transport.
pub struct Cluster {
    config: ClusterConfig,
    placement: Arc<PlacementController>,
    metadata: Arc<dyn MetadataStore>,
    coordinator: Arc<QuorumCoordinator>,
    service: ObjectService,
    repair: Arc<RepairCycle>,
    scrub: Arc<ScrubCycle>,
}

impl Cluster {
    /// Builds a cluster over an in-memory metadata store that counts only
    /// replicas on healthy nodes as live.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn in_memory(config: ClusterConfig, transport: Arc<dyn NodeTransport>) -> Result<Self> {
        let placement = Arc::new(PlacementController::new(config.placement.clone()));
        let metadata = Arc::new(MemoryMetadataStore::new().with_liveness(placement.clone()));
        Self::new(config, placement, metadata, transport)
    }

    /// Builds a cluster from existing components.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: ClusterConfig,
        placement: Arc<PlacementController>,
        metadata: Arc<dyn MetadataStore>,
        transport: Arc<dyn NodeTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let coordinator = Arc::new(QuorumCoordinator::new(config.quorum.clone(), transport)?);

        let service = ObjectService::new(
            metadata.clone(),
            placement.clone(),
            coordinator.clone(),
            coordinator.clone(),
        );
        let repair = Arc::new(RepairCycle::new(
            config.repair.clone(),
            metadata.clone(),
            placement.clone(),
            coordinator.clone(),
            coordinator.clone(),
        ));
        let scrub = Arc::new(ScrubCycle::new(
            config.scrub.clone(),
            metadata.clone(),
            placement.clone(),
            coordinator.clone(),
        ));

        info!(
            replication_factor = config.quorum.replication_factor,
            write_quorum = config.quorum.write_quorum,
            read_quorum = config.quorum.read_quorum,
            "Cluster initialized"
        );
        Ok(Self { config, placement, metadata, coordinator, service, repair, scrub })
    }

    /// Starts the repair, scrub, and liveness loops.
    pub fn spawn_worker(&self) -> ReplicationWorker {
        ReplicationWorker::spawn(
            self.repair.clone(),
            self.scrub.clone(),
            self.placement.clone(),
            self.config.liveness_sweep_duration(),
        )
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Returns the placement controller.
    pub fn placement(&self) -> &Arc<PlacementController> {
        &self.placement
    }

    /// Returns the metadata store.
    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Returns the quorum coordinator.
    pub fn coordinator(&self) -> &Arc<QuorumCoordinator> {
        &self.coordinator
    }

    /// Returns the object service.
    pub fn service(&self) -> &ObjectService {
        &self.service
    }

    /// Returns the repair cycle.
    pub fn repair(&self) -> &Arc<RepairCycle> {
        &self.repair
    }

    /// Returns the scrub cycle.
    pub fn scrub(&self) -> &Arc<ScrubCycle> {
        &self.scrub
    }
}
