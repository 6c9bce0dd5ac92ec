// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Background loops driving the repair and scrub cycles.
//!
//! The worker runs each cycle on its own interval. Every loop shares one
//! [`CancellationToken`]: cancelling it stops the loops, and a cycle that is
//! running finishes the object it is working on first.
//!
//! Losing a node (removal, or a status change to offline) wakes the repair
//! loop without waiting for the next tick.

use std::sync::Arc;
use std::time::Duration;

use plinth_core::NodeStatus;
use plinth_placement::{PlacementController, PlacementEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::repair::RepairCycle;
use crate::scrub::ScrubCycle;

/// Handle to the running repair, scrub, and liveness loops.
pub struct ReplicationWorker {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ReplicationWorker {
    /// Spawns the loops on the current runtime.
    ///
    /// `liveness_sweep` enables a periodic
    /// [`sweep_liveness`](PlacementController::sweep_liveness) on the
    /// placement controller.
    pub fn spawn(
        repair: Arc<RepairCycle>,
        scrub: Arc<ScrubCycle>,
        placement: Arc<PlacementController>,
        liveness_sweep: Option<Duration>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let events = placement.subscribe();

        let mut handles = vec![
            tokio::spawn(run_repair_loop(repair, events, cancel.clone())),
            tokio::spawn(run_scrub_loop(scrub, cancel.clone())),
        ];
        if let Some(period) = liveness_sweep {
            handles.push(tokio::spawn(run_sweep_loop(placement, period, cancel.clone())));
        }

        Self { cancel, handles }
    }

    /// Returns a clone of the token that stops every loop.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns true once shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops every loop and waits for them to exit.
    pub async fn shutdown(self) {
        info!("Replication worker shutting down");
        self.cancel.cancel();
        self.join().await;
    }

    /// Waits for every loop to exit without requesting shutdown.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker loop ended abnormally");
            }
        }
    }
}

async fn run_repair_loop(
    cycle: Arc<RepairCycle>,
    mut events: broadcast::Receiver<PlacementEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(cycle.config().interval_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut wake_on_loss = cycle.config().wake_on_node_loss;

    info!(
        interval_ms = cycle.config().interval_ms,
        wake_on_node_loss = wake_on_loss,
        "Repair loop started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Repair loop shutting down");
                break;
            }
            _ = ticker.tick() => {}
            event = events.recv(), if wake_on_loss => match event {
                Ok(PlacementEvent::NodeRemoved { node_id }) => {
                    info!(node_id = %node_id, "Node removed, waking repair");
                }
                Ok(PlacementEvent::NodeStatusChanged { node_id, to: NodeStatus::Offline, .. }) => {
                    info!(node_id = %node_id, "Node offline, waking repair");
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Placement event receiver lagged");
                }
                Err(RecvError::Closed) => {
                    debug!("Placement event channel closed");
                    wake_on_loss = false;
                    continue;
                }
            },
        }

        if let Err(e) = cycle.run_until_cancelled(&cancel).await {
            warn!(error = %e, "Repair cycle failed");
        }
    }
}

async fn run_scrub_loop(cycle: Arc<ScrubCycle>, cancel: CancellationToken) {
    let mut ticker = interval(cycle.config().interval_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        interval_ms = cycle.config().interval_ms,
        sample_size = cycle.config().sample_size,
        "Scrub loop started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Scrub loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = cycle.run_until_cancelled(&cancel).await {
                    warn!(error = %e, "Scrub cycle failed");
                }
            }
        }
    }
}

async fn run_sweep_loop(
    placement: Arc<PlacementController>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Liveness sweep shutting down");
                break;
            }
            _ = ticker.tick() => {
                let changed = placement.sweep_liveness();
                if !changed.is_empty() {
                    debug!(changed = changed.len(), "Liveness sweep demoted nodes");
                }
            }
        }
    }
}
