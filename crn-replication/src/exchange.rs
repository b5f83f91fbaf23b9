//! Metadata exchange: the first phase of the pull protocol.
//!
//! One batched request per peer asks every shared partition "what do you
//! have at/after this token?". Each per-replica answer is reconciled against
//! the local store to produce the set of keys worth fetching. Failures are
//! isolated per slot: a store hiccup or server error for one replica never
//! poisons the other replicas in the same batch.

use crate::codec::{
    ReplicaMetadataRequest, ReplicaMetadataRequestInfo, ReplicaMetadataResponse,
    ReplicaMetadataResponseInfo, ServerErrorCode,
};
use crate::config::ReplicationConfig;
use crate::next_correlation_id;
use crate::pacer::Pacer;
use crate::reconcile::Reconciler;
use crate::state::{PeerBatch, RemoteReplicaState};
use crate::store::Notifier;
use crn_core::{BlobId, CairnError, DataNodeId, FindToken, FindTokenFactory, Result};
use crn_network::ConnectedChannel;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, trace};

/// Outcome of a metadata round for one remote replica.
#[derive(Debug)]
pub enum ExchangeMetadataResult {
    /// The remote answered; `missing` is what reconciliation left to fetch
    /// and `new_token` is where this pair resumes once that completes.
    Ok {
        missing: HashSet<BlobId>,
        new_token: Arc<dyn FindToken>,
    },
    /// The remote (or local processing) failed this slot; the pair stays at
    /// its previous token and retries next iteration.
    Err { code: ServerErrorCode },
}

impl ExchangeMetadataResult {
    #[must_use]
    pub fn error_code(&self) -> ServerErrorCode {
        match self {
            Self::Ok { .. } => ServerErrorCode::NoError,
            Self::Err { code } => *code,
        }
    }

    /// Whether this slot contributes keys to the fetch phase.
    #[must_use]
    pub fn is_fetchable(&self) -> bool {
        matches!(self, Self::Ok { missing, .. } if !missing.is_empty())
    }
}

/// Runs the metadata phase for one peer batch.
pub struct MetadataExchanger {
    local_node: DataNodeId,
    config: ReplicationConfig,
    token_factory: Arc<dyn FindTokenFactory>,
    notifier: Arc<dyn Notifier>,
    pacer: Pacer,
}

impl MetadataExchanger {
    #[must_use]
    pub fn new(
        local_node: DataNodeId,
        config: ReplicationConfig,
        token_factory: Arc<dyn FindTokenFactory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let pacer = Pacer::new(&config);
        Self {
            local_node,
            config,
            token_factory,
            notifier,
            pacer,
        }
    }

    /// Exchange metadata with the peer and reconcile every slot.
    ///
    /// Returns one result per replica in `batch`, positionally aligned. A
    /// top-level failure (transport, malformed or error response, count
    /// mismatch) fails the whole batch via `Err`.
    pub async fn exchange(
        &mut self,
        channel: &mut ConnectedChannel,
        batch: &PeerBatch,
        remote_colo: bool,
    ) -> Result<Vec<ExchangeMetadataResult>> {
        if batch.replicas.is_empty() {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let result = self.exchange_inner(channel, batch, remote_colo).await;
        // Recorded even when the batch fails, like every other phase timing.
        crn_metrics::record_exchange_time(remote_colo, start.elapsed());
        crn_metrics::increment_metadata_exchanges(remote_colo);
        result
    }

    async fn exchange_inner(
        &mut self,
        channel: &mut ConnectedChannel,
        batch: &PeerBatch,
        remote_colo: bool,
    ) -> Result<Vec<ExchangeMetadataResult>> {
        let response = self.request_metadata(channel, batch).await?;

        self.pacer.reset();
        let mut results = Vec::with_capacity(batch.replicas.len());
        for (state, info) in batch.replicas.iter().zip(&response.replicas) {
            if info.error == ServerErrorCode::NoError {
                match self.process_slot(state, info, remote_colo).await {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        crn_metrics::increment_local_store_errors();
                        error!(
                            target: "cairn::replication",
                            remote_node = %batch.remote_node,
                            remote_replica = %state.remote_replica(),
                            error = %e,
                            "Failed to process metadata slot"
                        );
                        results.push(ExchangeMetadataResult::Err {
                            code: ServerErrorCode::UnknownError,
                        });
                    },
                }
            } else {
                crn_metrics::increment_metadata_request_errors();
                error!(
                    target: "cairn::replication",
                    remote_node = %batch.remote_node,
                    remote_replica = %state.remote_replica(),
                    server_error = %info.error,
                    "Remote failed metadata slot"
                );
                results.push(ExchangeMetadataResult::Err { code: info.error });
            }
        }
        Ok(results)
    }

    async fn process_slot(
        &mut self,
        state: &RemoteReplicaState,
        info: &ReplicaMetadataResponseInfo,
        remote_colo: bool,
    ) -> Result<ExchangeMetadataResult> {
        trace!(
            target: "cairn::replication",
            remote_replica = %state.remote_replica(),
            lag_bytes = info.remote_replica_lag_in_bytes,
            records = info.message_infos.len(),
            "Processing metadata slot"
        );
        self.pacer
            .maybe_wait(info.remote_replica_lag_in_bytes, remote_colo)
            .await;

        let reconciler = Reconciler::new(&self.local_node, self.notifier.as_ref());
        let missing = reconciler.reconcile(state, &info.message_infos)?;
        let new_token = self.token_factory.decode(&info.token)?;

        Ok(ExchangeMetadataResult::Ok { missing, new_token })
    }

    async fn request_metadata(
        &self,
        channel: &mut ConnectedChannel,
        batch: &PeerBatch,
    ) -> Result<ReplicaMetadataResponse> {
        let replicas: Vec<ReplicaMetadataRequestInfo> = batch
            .replicas
            .iter()
            .map(|state| {
                trace!(
                    target: "cairn::replication",
                    remote_replica = %state.remote_replica(),
                    token = ?state.token(),
                    "Sending token to remote"
                );
                ReplicaMetadataRequestInfo {
                    partition: state.remote_replica().partition,
                    token: state.token().to_bytes(),
                    requester_host: self.local_node.hostname.clone(),
                    requester_replica_path: state.local_replica().replica_path.clone(),
                }
            })
            .collect();

        let request = ReplicaMetadataRequest {
            correlation_id: next_correlation_id(),
            client_id: format!("replication-metadata-{}", self.local_node.hostname),
            fetch_size_in_bytes: self.config.fetch_size_in_bytes,
            replicas,
        };

        channel.send_request(&request.encode()).await?;
        let frame = channel.receive_response().await?;
        let response = ReplicaMetadataResponse::decode(&frame)
            .ok_or_else(|| CairnError::Protocol("Malformed metadata response".into()))?;

        if response.error != ServerErrorCode::NoError
            || response.replicas.len() != batch.replicas.len()
        {
            error!(
                target: "cairn::replication",
                remote_node = %batch.remote_node,
                server_error = %response.error,
                response_entries = response.replicas.len(),
                batch_replicas = batch.replicas.len(),
                "Metadata response failed for the whole batch"
            );
            return Err(CairnError::Replication(format!(
                "Metadata response error {} ({} entries for {} replicas)",
                response.error,
                response.replicas.len(),
                batch.replicas.len()
            )));
        }
        Ok(response)
    }
}
