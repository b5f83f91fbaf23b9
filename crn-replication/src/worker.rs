//! The long-lived replication worker loop.
//!
//! One worker owns a disjoint set of (local replica, remote replica) pairs,
//! grouped by remote node. Each pass shuffles the peer order (so a slow or
//! failing peer cannot starve the others of their usual slot) and runs the
//! checkout → exchange → fix pipeline against every peer once. All failures
//! are scoped to a single peer iteration: the connection is destroyed, the
//! error counted, and the loop moves on.

use crate::config::ReplicationConfig;
use crate::exchange::{ExchangeMetadataResult, MetadataExchanger};
use crate::fetch::Fetcher;
use crate::state::{PeerBatch, RemoteReplicaState, group_by_remote_node};
use crate::store::Notifier;
use crate::write::Writer;
use crn_core::{DataNodeId, FindTokenFactory, PortKind, Result};
use crn_network::{ConnectedChannel, ConnectionPool};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, trace};

/// Pipeline phase names for error attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterationPhase {
    CheckOut,
    Exchange,
    Fix,
}

impl IterationPhase {
    const fn as_str(self) -> &'static str {
        match self {
            Self::CheckOut => "checkout",
            Self::Exchange => "exchange",
            Self::Fix => "fix",
        }
    }
}

/// Control handle for a running [`ReplicaWorker`].
#[derive(Clone)]
pub struct WorkerHandle {
    name: String,
    shutdown: Arc<AtomicBool>,
    running: watch::Receiver<bool>,
}

impl WorkerHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Request cooperative termination and wait for the worker's `run` to
    /// return. The flag is observed at pass boundaries and between peers;
    /// in-flight network I/O completes or errors out naturally.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let mut running = self.running.clone();
        let _ = running.wait_for(|running| !running).await;
    }
}

/// Pull-based anti-entropy worker for one peer list.
pub struct ReplicaWorker {
    name: String,
    local_node: DataNodeId,
    batches: Vec<PeerBatch>,
    pool: Arc<ConnectionPool>,
    config: ReplicationConfig,
    exchanger: MetadataExchanger,
    notifier: Arc<dyn Notifier>,
    shutdown: Arc<AtomicBool>,
    running_tx: watch::Sender<bool>,
    running_rx: watch::Receiver<bool>,
}

impl ReplicaWorker {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        local_node: DataNodeId,
        states: Vec<Arc<RemoteReplicaState>>,
        pool: Arc<ConnectionPool>,
        config: ReplicationConfig,
        token_factory: Arc<dyn FindTokenFactory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let batches = group_by_remote_node(states);
        let exchanger = MetadataExchanger::new(
            local_node.clone(),
            config.clone(),
            token_factory,
            Arc::clone(&notifier),
        );
        let (running_tx, running_rx) = watch::channel(true);
        Self {
            name: name.into(),
            local_node,
            batches,
            pool,
            config,
            exchanger,
            notifier,
            shutdown: Arc::new(AtomicBool::new(false)),
            running_tx,
            running_rx,
        }
    }

    #[must_use]
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            name: self.name.clone(),
            shutdown: Arc::clone(&self.shutdown),
            running: self.running_rx.clone(),
        }
    }

    /// Loop until [`WorkerHandle::shutdown`] is observed. Each pass shuffles
    /// the peer list and replicates with every peer once.
    pub async fn run(mut self) {
        info!(
            target: "cairn::replication",
            worker = %self.name,
            local_node = %self.local_node,
            peers = self.batches.len(),
            "Starting replication worker"
        );
        for batch in &self.batches {
            info!(
                target: "cairn::replication",
                worker = %self.name,
                remote_node = %batch.remote_node,
                replicas = batch.replicas.len(),
                "Peer assigned to worker"
            );
        }

        let mut order: Vec<usize> = (0..self.batches.len()).collect();
        while !self.shutdown.load(Ordering::Acquire) {
            if self.batches.is_empty() {
                // Nothing assigned yet; stay responsive to shutdown.
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            shuffle(&mut order);
            for i in 0..order.len() {
                if self.shutdown.load(Ordering::Acquire) {
                    break;
                }
                let idx = order[i];
                self.replicate_with_peer(idx).await;
            }
        }

        info!(
            target: "cairn::replication",
            worker = %self.name,
            "Replication worker stopped"
        );
        let _ = self.running_tx.send(false);
    }

    /// One full pipeline run against one peer. Never propagates errors:
    /// they are counted, logged with the failing phase, and scoped here.
    async fn replicate_with_peer(&mut self, idx: usize) {
        let remote_node = self.batches[idx].remote_node.clone();
        let remote_colo = remote_node.datacenter != self.local_node.datacenter;
        let iteration_start = Instant::now();

        let mut phase = IterationPhase::CheckOut;
        let mut phase_start = Instant::now();

        let kind = if self
            .config
            .ssl_enabled_colos
            .contains(&remote_node.datacenter)
        {
            crn_metrics::increment_ssl_connections_requested();
            PortKind::Ssl
        } else {
            crn_metrics::increment_plaintext_connections_requested();
            PortKind::Plaintext
        };

        let outcome = match self
            .pool
            .check_out(
                &remote_node.hostname,
                remote_node.port,
                kind,
                self.config.connection_pool_checkout_timeout_ms,
            )
            .await
        {
            Ok(mut channel) => {
                trace!(
                    target: "cairn::replication",
                    worker = %self.name,
                    remote_node = %remote_node,
                    kind = %kind,
                    checkout_ms = phase_start.elapsed().as_millis() as u64,
                    "Connection checked out"
                );

                phase = IterationPhase::Exchange;
                phase_start = Instant::now();
                match self
                    .exchanger
                    .exchange(&mut channel, &self.batches[idx], remote_colo)
                    .await
                {
                    Ok(results) => {
                        phase = IterationPhase::Fix;
                        phase_start = Instant::now();
                        let fixed = fix_missing_blobs(
                            &self.local_node,
                            self.notifier.as_ref(),
                            &self.config,
                            &mut channel,
                            &results,
                            &self.batches[idx],
                            remote_colo,
                        )
                        .await;
                        match fixed {
                            Ok(()) => {
                                self.pool.check_in(channel).await;
                                Ok(())
                            },
                            Err(e) => {
                                self.pool.destroy(channel);
                                Err(e)
                            },
                        }
                    },
                    Err(e) => {
                        self.pool.destroy(channel);
                        Err(e)
                    },
                }
            },
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            crn_metrics::increment_replication_errors();
            error!(
                target: "cairn::replication",
                worker = %self.name,
                remote_node = %remote_node,
                phase = phase.as_str(),
                phase_ms = phase_start.elapsed().as_millis() as u64,
                total_ms = iteration_start.elapsed().as_millis() as u64,
                error = %e,
                "Replication iteration failed"
            );
        }

        crn_metrics::record_total_replication_time(remote_colo, iteration_start.elapsed());
    }
}

/// Fetch the missing blobs for every healthy slot and write them locally.
async fn fix_missing_blobs(
    local_node: &DataNodeId,
    notifier: &dyn Notifier,
    config: &ReplicationConfig,
    channel: &mut ConnectedChannel,
    results: &[ExchangeMetadataResult],
    batch: &PeerBatch,
    remote_colo: bool,
) -> Result<()> {
    let start = Instant::now();
    let result = async {
        let response = Fetcher::new(local_node)
            .fetch(channel, results, batch)
            .await?;
        Writer::new(local_node, notifier, config.validate_blob_stream).write(
            results,
            response.as_ref(),
            batch,
            remote_colo,
        )
    }
    .await;
    crn_metrics::record_fix_time(remote_colo, start.elapsed());
    result
}

/// Fisher-Yates over the peer order. Seeded by hashing the clock; peer
/// scheduling needs unpredictability, not statistical quality.
fn shuffle(order: &mut [usize]) {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::time::SystemTime::now().hash(&mut hasher);
    let mut seed = hasher.finish() | 1;

    for i in (1..order.len()).rev() {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let j = (seed % (i as u64 + 1)) as usize;
        order.swap(i, j);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::NoopNotifier;
    use crn_core::OffsetTokenFactory;
    use crn_network::PoolConfig;

    #[test]
    fn test_shuffle_is_a_permutation() {
        let mut order: Vec<usize> = (0..16).collect();
        shuffle(&mut order);
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_shuffle_of_single_element() {
        let mut order = vec![0];
        shuffle(&mut order);
        assert_eq!(order, vec![0]);
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_idle_worker() {
        let worker = ReplicaWorker::new(
            "replica-worker-0",
            DataNodeId::new("local", 1992, "dc1"),
            Vec::new(),
            Arc::new(ConnectionPool::new(PoolConfig::default())),
            ReplicationConfig::default(),
            Arc::new(OffsetTokenFactory),
            Arc::new(NoopNotifier),
        );
        let handle = worker.handle();
        assert!(handle.is_running());

        let join = tokio::spawn(worker.run());
        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .unwrap();
        assert!(!handle.is_running());
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let worker = ReplicaWorker::new(
            "replica-worker-1",
            DataNodeId::new("local", 1992, "dc1"),
            Vec::new(),
            Arc::new(ConnectionPool::new(PoolConfig::default())),
            ReplicationConfig::default(),
            Arc::new(OffsetTokenFactory),
            Arc::new(NoopNotifier),
        );
        let handle = worker.handle();
        let join = tokio::spawn(worker.run());

        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .unwrap();
        // A second shutdown on a stopped worker returns immediately.
        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .unwrap();
        join.await.unwrap();
    }
}
