// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Quorum-coordinated reads and writes.
//!
//! Every call fans out one task per target node into a [`JoinSet`]. Each
//! task is bounded by the per-node timeout and the call as a whole by the
//! operation deadline. As soon as the outcome is decided (quorum reached on
//! a verified read, or quorum no longer reachable) the set is dropped and
//! the still-pending tasks are abandoned.
//!
//! Per-node failures are recorded in [`NodeResult`]s. An aggregate error is
//! returned only when the threshold is not met. Nothing is retried here.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use metrics::{counter, histogram};
use plinth_core::{
    ChecksumCalculator, Crc32cCalculator, Digest, Error, NodeResult, NodeTransport, Result,
};
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, warn};

use crate::config::QuorumConfig;
use crate::outcome::{ReadOutcome, ReplicaProbe, WriteOutcome};

type Completed<T> = Vec<(String, Result<T>)>;

struct Gathered<T> {
    completed: Completed<T>,
    deadline_hit: bool,
}

/// Executes reads and writes against replica sets.
pub struct QuorumCoordinator {
    config: QuorumConfig,
    transport: Arc<dyn NodeTransport>,
    calculator: Arc<dyn ChecksumCalculator>,
}

impl QuorumCoordinator {
    /// Creates a coordinator after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuorumConfig` if the configuration is out of bounds.
    pub fn new(config: QuorumConfig, transport: Arc<dyn NodeTransport>) -> Result<Self> {
        config.validate()?;
        if !config.is_strongly_consistent() {
            warn!(
                replication_factor = config.replication_factor,
                write_quorum = config.write_quorum,
                read_quorum = config.read_quorum,
                "Read and write quorums do not overlap; reads may miss recent writes"
            );
        }
        Ok(Self { config, transport, calculator: Arc::new(Crc32cCalculator) })
    }

    /// Replaces the checksum calculator.
    #[must_use]
    pub fn with_calculator(mut self, calculator: Arc<dyn ChecksumCalculator>) -> Self {
        self.calculator = calculator;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &QuorumConfig {
        &self.config
    }

    /// Returns the checksum calculator.
    #[must_use]
    pub fn calculator(&self) -> &Arc<dyn ChecksumCalculator> {
        &self.calculator
    }

    /// Writes `data` under `key` to every node, requiring the configured
    /// write quorum.
    ///
    /// # Errors
    ///
    /// Returns `WriteQuorumNotMet` with every node's result if too few nodes
    /// acknowledged, or `InsufficientNodes` if fewer nodes than the quorum
    /// were given.
    pub async fn write(&self, node_ids: &[String], key: &str, data: Bytes) -> Result<WriteOutcome> {
        self.write_with_quorum(node_ids, key, data, self.config.write_quorum).await
    }

    /// Writes `data` under `key` to every node, requiring `required` acks.
    ///
    /// Waits for every node (each bounded by the node timeout) unless the
    /// quorum becomes unreachable first. A node that acknowledges a digest
    /// other than the payload's counts as failed. Partial writes are left in
    /// place.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub async fn write_with_quorum(
        &self,
        node_ids: &[String],
        key: &str,
        data: Bytes,
        required: usize,
    ) -> Result<WriteOutcome> {
        let nodes = dedup(node_ids);
        check_threshold(required, nodes.len())?;
        let started = Instant::now();
        let digest = self.calculator.calculate(&data);
        let total = nodes.len();

        let owned_key = key.to_string();
        let set = self.spawn_all(&nodes, |transport, node_id| {
            let key = owned_key.clone();
            let data = data.clone();
            async move { transport.put(&node_id, &key, data).await }
        });
        let gathered = self
            .gather(set, total, |done: &Completed<Digest>| {
                let acks = done.iter().filter(|(_, r)| matches!(r, Ok(d) if *d == digest)).count();
                acks + (total - done.len()) < required
            })
            .await;

        let deadline_hit = gathered.deadline_hit;
        let mut by_node: HashMap<String, Result<Digest>> = gathered.completed.into_iter().collect();
        let mut results = Vec::with_capacity(total);
        let mut acks = 0;
        for node_id in &nodes {
            let result = match by_node.remove(node_id) {
                Some(Ok(acked)) if acked == digest => {
                    acks += 1;
                    NodeResult::ok(node_id.clone())
                }
                Some(Ok(acked)) => NodeResult::failed(
                    node_id.clone(),
                    Error::ChecksumMismatch {
                        node_id: node_id.clone(),
                        expected: digest.to_hex(),
                        actual: acked.to_hex(),
                    },
                ),
                Some(Err(e)) => NodeResult::failed(node_id.clone(), e),
                None => NodeResult::failed(node_id.clone(), self.abandoned(node_id, deadline_hit)),
            };
            if let Some(err) = &result.error {
                debug!(node_id = %node_id, key = %key, error = %err, "Replica write failed");
                counter!("plinth_quorum_node_failures_total", "op" => "write").increment(1);
            }
            results.push(result);
        }

        histogram!("plinth_quorum_write_duration_seconds").record(started.elapsed().as_secs_f64());
        if acks >= required {
            counter!("plinth_quorum_writes_total", "outcome" => "success").increment(1);
            debug!(key = %key, acks, required, digest = %digest, "Write quorum reached");
            Ok(WriteOutcome { digest, results, acks, required })
        } else {
            counter!("plinth_quorum_writes_total", "outcome" => "quorum_not_met").increment(1);
            warn!(key = %key, acks, required, "Write quorum not met");
            Err(Error::WriteQuorumNotMet { required, achieved: acks, results })
        }
    }

    /// Reads `key` from the nodes, requiring the configured read quorum.
    ///
    /// # Errors
    ///
    /// Returns `ReadQuorumNotMet` with every node's result if too few
    /// replicas agree, or `InsufficientNodes` if fewer nodes than the quorum
    /// were given.
    pub async fn read(
        &self,
        node_ids: &[String],
        key: &str,
        expected: Option<Digest>,
    ) -> Result<ReadOutcome> {
        self.read_with_quorum(node_ids, key, expected, self.config.read_quorum).await
    }

    /// Reads `key` from the nodes, requiring `required` agreeing replicas.
    ///
    /// Every payload's digest is recomputed. With `expected`, replicas agree
    /// when they match it and the call returns as soon as `required` do.
    /// Without it, the largest digest group wins, ties going to the group
    /// holding the smallest node id. Divergent or missing replicas are
    /// excluded from the count and listed as repair candidates; they are
    /// never repaired here.
    ///
    /// # Errors
    ///
    /// See [`read`](Self::read).
    pub async fn read_with_quorum(
        &self,
        node_ids: &[String],
        key: &str,
        expected: Option<Digest>,
        required: usize,
    ) -> Result<ReadOutcome> {
        let nodes = dedup(node_ids);
        check_threshold(required, nodes.len())?;
        let started = Instant::now();
        let total = nodes.len();

        let set = self.spawn_fetch(&nodes, key);
        let gathered = self
            .gather(set, total, |done: &Completed<(Bytes, Digest)>| {
                let pending = total - done.len();
                let best = match expected {
                    Some(want) => {
                        let agree = done
                            .iter()
                            .filter(|(_, r)| matches!(r, Ok((_, d)) if *d == want))
                            .count();
                        if agree >= required {
                            return true;
                        }
                        agree
                    }
                    None => largest_group(done),
                };
                best + pending < required
            })
            .await;

        let deadline_hit = gathered.deadline_hit;
        let target = expected.or_else(|| majority(&gathered.completed));
        let mut by_node: HashMap<String, Result<(Bytes, Digest)>> =
            gathered.completed.into_iter().collect();

        let mut results = Vec::with_capacity(total);
        let mut repair_candidates = Vec::new();
        let mut data = None;
        let mut agreeing = 0;
        for node_id in &nodes {
            let result = match by_node.remove(node_id) {
                Some(Ok((payload, digest))) if Some(digest) == target => {
                    agreeing += 1;
                    data.get_or_insert(payload);
                    NodeResult::ok(node_id.clone())
                }
                Some(Ok((_, digest))) => {
                    repair_candidates.push(node_id.clone());
                    NodeResult::failed(
                        node_id.clone(),
                        Error::ChecksumMismatch {
                            node_id: node_id.clone(),
                            expected: target.map(Digest::to_hex).unwrap_or_default(),
                            actual: digest.to_hex(),
                        },
                    )
                }
                Some(Err(e @ Error::ReplicaMissing { .. })) => {
                    repair_candidates.push(node_id.clone());
                    NodeResult::failed(node_id.clone(), e)
                }
                Some(Err(e)) => NodeResult::failed(node_id.clone(), e),
                None => NodeResult::failed(node_id.clone(), self.abandoned(node_id, deadline_hit)),
            };
            if let Some(err) = &result.error {
                debug!(node_id = %node_id, key = %key, error = %err, "Replica read failed");
                counter!("plinth_quorum_node_failures_total", "op" => "read").increment(1);
            }
            results.push(result);
        }

        if !repair_candidates.is_empty() {
            warn!(key = %key, candidates = ?repair_candidates, "Divergent replicas detected");
            counter!("plinth_quorum_divergent_replicas_total")
                .increment(repair_candidates.len() as u64);
        }

        histogram!("plinth_quorum_read_duration_seconds").record(started.elapsed().as_secs_f64());
        match (data, target) {
            (Some(data), Some(digest)) if agreeing >= required => {
                counter!("plinth_quorum_reads_total", "outcome" => "success").increment(1);
                Ok(ReadOutcome { data, digest, results, repair_candidates })
            }
            _ => {
                counter!("plinth_quorum_reads_total", "outcome" => "quorum_not_met").increment(1);
                warn!(key = %key, agreeing, required, "Read quorum not met");
                Err(Error::ReadQuorumNotMet { required, achieved: agreeing, results })
            }
        }
    }

    /// Fetches every replica of `key` and reports its recomputed digest,
    /// without any quorum decision.
    pub async fn probe(&self, node_ids: &[String], key: &str) -> Vec<ReplicaProbe> {
        let nodes = dedup(node_ids);
        let set = self.spawn_fetch(&nodes, key);
        let gathered = self.gather(set, nodes.len(), |_: &Completed<(Bytes, Digest)>| false).await;

        let deadline_hit = gathered.deadline_hit;
        let mut by_node: HashMap<_, _> = gathered.completed.into_iter().collect();
        nodes
            .iter()
            .map(|node_id| {
                let result = match by_node.remove(node_id) {
                    Some(result) => result.map(|(_, digest)| digest),
                    None => Err(self.abandoned(node_id, deadline_hit)),
                };
                ReplicaProbe { node_id: node_id.clone(), result }
            })
            .collect()
    }

    /// Deletes `key` from every node and reports each node's result.
    pub async fn delete(&self, node_ids: &[String], key: &str) -> Vec<NodeResult> {
        let nodes = dedup(node_ids);
        let owned_key = key.to_string();
        let set = self.spawn_all(&nodes, |transport, node_id| {
            let key = owned_key.clone();
            async move { transport.delete(&node_id, &key).await }
        });
        let gathered = self.gather(set, nodes.len(), |_: &Completed<()>| false).await;

        let deadline_hit = gathered.deadline_hit;
        let mut by_node: HashMap<_, _> = gathered.completed.into_iter().collect();
        nodes
            .iter()
            .map(|node_id| match by_node.remove(node_id) {
                Some(Ok(())) => NodeResult::ok(node_id.clone()),
                Some(Err(e)) => {
                    debug!(node_id = %node_id, key = %key, error = %e, "Replica delete failed");
                    NodeResult::failed(node_id.clone(), e)
                }
                None => NodeResult::failed(node_id.clone(), self.abandoned(node_id, deadline_hit)),
            })
            .collect()
    }

    /// Spawns a get-and-digest task per node.
    fn spawn_fetch(&self, nodes: &[String], key: &str) -> JoinSet<(String, Result<(Bytes, Digest)>)> {
        let owned_key = key.to_string();
        self.spawn_all(nodes, |transport, node_id| {
            let key = owned_key.clone();
            let calculator = Arc::clone(&self.calculator);
            async move {
                let data = transport.get(&node_id, &key).await?;
                let digest = calculator.calculate(&data);
                Ok((data, digest))
            }
        })
    }

    /// Spawns `op` once per node, each bounded by the node timeout.
    fn spawn_all<T, F, Fut>(&self, nodes: &[String], op: F) -> JoinSet<(String, Result<T>)>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn NodeTransport>, String) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let node_timeout = self.config.node_timeout_duration();
        let timeout_ms = self.config.node_timeout_ms;
        let mut set = JoinSet::new();
        for node_id in nodes {
            let fut = op(Arc::clone(&self.transport), node_id.clone());
            let node_id = node_id.clone();
            set.spawn(async move {
                let result = match timeout(node_timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout { node_id: node_id.clone(), timeout_ms }),
                };
                (node_id, result)
            });
        }
        set
    }

    /// Collects task results until all are in, `stop` says the outcome is
    /// decided, or the operation deadline passes. Pending tasks are aborted.
    async fn gather<T: Send + 'static>(
        &self,
        mut set: JoinSet<(String, Result<T>)>,
        total: usize,
        mut stop: impl FnMut(&Completed<T>) -> bool,
    ) -> Gathered<T> {
        let deadline = Instant::now() + self.config.operation_timeout_duration();
        let mut completed = Vec::with_capacity(total);
        let mut deadline_hit = false;

        while completed.len() < total && !stop(&completed) {
            match timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok(item))) => completed.push(item),
                Ok(Some(Err(e))) => error!(error = %e, "Node task failed"),
                Ok(None) => break,
                Err(_) => {
                    deadline_hit = true;
                    break;
                }
            }
        }

        set.abort_all();
        Gathered { completed, deadline_hit }
    }

    fn abandoned(&self, node_id: &str, deadline_hit: bool) -> Error {
        if deadline_hit {
            Error::Timeout { node_id: node_id.to_string(), timeout_ms: self.config.operation_timeout_ms }
        } else {
            Error::Abandoned { node_id: node_id.to_string() }
        }
    }
}

/// Removes duplicate node ids, keeping first occurrences.
fn dedup(node_ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(node_ids.len());
    node_ids.iter().filter(|id| seen.insert(id.as_str())).cloned().collect()
}

fn check_threshold(required: usize, available: usize) -> Result<()> {
    if required == 0 {
        return Err(Error::InvalidQuorumConfig("quorum threshold must be at least 1".to_string()));
    }
    if available < required {
        return Err(Error::InsufficientNodes { needed: required, available });
    }
    Ok(())
}

/// Size of the largest group of identical digests.
fn largest_group(done: &Completed<(Bytes, Digest)>) -> usize {
    let mut counts: HashMap<Digest, usize> = HashMap::new();
    for (_, result) in done {
        if let Ok((_, digest)) = result {
            *counts.entry(*digest).or_default() += 1;
        }
    }
    counts.into_values().max().unwrap_or(0)
}

/// Digest held by the most replicas; ties go to the group containing the
/// smallest node id.
fn majority(done: &Completed<(Bytes, Digest)>) -> Option<Digest> {
    let mut groups: HashMap<Digest, (usize, &str)> = HashMap::new();
    for (node_id, result) in done {
        if let Ok((_, digest)) = result {
            let group = groups.entry(*digest).or_insert((0, node_id.as_str()));
            group.0 += 1;
            if node_id.as_str() < group.1 {
                group.1 = node_id.as_str();
            }
        }
    }
    groups
        .into_iter()
        .max_by(|(_, (count_a, id_a)), (_, (count_b, id_b))| {
            count_a.cmp(count_b).then_with(|| id_b.cmp(id_a))
        })
        .map(|(digest, _)| digest)
}
