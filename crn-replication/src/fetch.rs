//! Blob fetch: the second phase of the pull protocol.
//!
//! Consolidates the still-missing keys of every healthy slot into one
//! batched get-request. Deleted and expired records are requested too;
//! whether they land is the store's decision at write time, which keeps the
//! fetch symmetric with what the remote reported at metadata time.

use crate::codec::{
    GET_FLAG_INCLUDE_DELETED, GET_FLAG_INCLUDE_EXPIRED, GetOptions, GetRequest, GetResponse,
    PartitionRequestInfo, ServerErrorCode,
};
use crate::exchange::ExchangeMetadataResult;
use crate::next_correlation_id;
use crate::state::PeerBatch;
use crn_core::{CairnError, DataNodeId, Result};
use crn_network::ConnectedChannel;
use tracing::{error, trace};

/// Issues the batched get-request for a peer iteration.
pub struct Fetcher<'a> {
    local_node: &'a DataNodeId,
}

impl<'a> Fetcher<'a> {
    #[must_use]
    pub fn new(local_node: &'a DataNodeId) -> Self {
        Self { local_node }
    }

    /// Fetch the missing blobs for every fetchable slot in `results`.
    ///
    /// Returns `None` when no slot has anything to fetch: no request goes
    /// out and the writer advances tokens from the metadata results alone.
    pub async fn fetch(
        &self,
        channel: &mut ConnectedChannel,
        results: &[ExchangeMetadataResult],
        batch: &PeerBatch,
    ) -> Result<Option<GetResponse>> {
        if results.len() != batch.replicas.len() || batch.replicas.is_empty() {
            return Err(CairnError::Replication(format!(
                "Exchange produced {} results for {} replicas",
                results.len(),
                batch.replicas.len()
            )));
        }

        let mut partitions = Vec::new();
        for (result, state) in results.iter().zip(&batch.replicas) {
            if let ExchangeMetadataResult::Ok { missing, .. } = result {
                if !missing.is_empty() {
                    let mut blob_ids: Vec<_> = missing.iter().copied().collect();
                    // Deterministic request order; missing sets are unordered.
                    blob_ids.sort_unstable();
                    trace!(
                        target: "cairn::replication",
                        remote_replica = %state.remote_replica(),
                        keys = blob_ids.len(),
                        "Requesting missing blobs"
                    );
                    partitions.push(PartitionRequestInfo {
                        partition: state.remote_replica().partition,
                        blob_ids,
                    });
                }
            }
        }

        if partitions.is_empty() {
            return Ok(None);
        }

        let request = GetRequest {
            correlation_id: next_correlation_id(),
            client_id: format!("replication-fetch-{}", self.local_node.hostname),
            flags: GET_FLAG_INCLUDE_DELETED | GET_FLAG_INCLUDE_EXPIRED,
            partitions,
            options: GetOptions::None,
        };

        channel.send_request(&request.encode()).await?;
        let frame = channel.receive_response().await?;
        let response = GetResponse::decode(frame)
            .ok_or_else(|| CairnError::Protocol("Malformed get response".into()))?;

        if response.error != ServerErrorCode::NoError {
            crn_metrics::increment_get_request_errors();
            error!(
                target: "cairn::replication",
                remote_node = %batch.remote_node,
                server_error = %response.error,
                "Get request failed for the whole batch"
            );
            return Err(CairnError::Replication(format!(
                "Get response error {} from {}",
                response.error, batch.remote_node
            )));
        }

        Ok(Some(response))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::state::{RemoteReplicaState, group_by_remote_node};
    use crate::testutil::{InMemoryStore, MockRemoteNode};
    use crn_core::{BlobId, OffsetToken, PartitionId, PortKind, ReplicaId};
    use crn_network::{ConnectionPool, PoolConfig};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn batch_against(mock: &MockRemoteNode, partitions: &[u64]) -> PeerBatch {
        let remote_node = mock.node("dc1");
        let local_node = crn_core::DataNodeId::new("local", 1992, "dc1");
        let store = Arc::new(InMemoryStore::new());
        let states = partitions
            .iter()
            .map(|&p| {
                Arc::new(
                    RemoteReplicaState::new(
                        ReplicaId::new(PartitionId(p), remote_node.clone(), "/mnt/r"),
                        ReplicaId::new(PartitionId(p), local_node.clone(), "/mnt/l"),
                        Arc::clone(&store) as Arc<dyn crate::Store>,
                        Arc::new(OffsetToken::new(0)),
                    )
                    .unwrap(),
                )
            })
            .collect();
        group_by_remote_node(states).remove(0)
    }

    fn ok_result(partition: u64, keys: &[u128]) -> ExchangeMetadataResult {
        ExchangeMetadataResult::Ok {
            missing: keys
                .iter()
                .map(|&k| BlobId::new(PartitionId(partition), k))
                .collect::<HashSet<_>>(),
            new_token: Arc::new(OffsetToken::new(10)),
        }
    }

    #[tokio::test]
    async fn test_no_request_when_nothing_missing() {
        let mock = MockRemoteNode::start().await;
        let batch = batch_against(&mock, &[1, 2]);
        let results = vec![
            ok_result(1, &[]),
            ExchangeMetadataResult::Err {
                code: ServerErrorCode::IoError,
            },
        ];

        let pool = ConnectionPool::new(PoolConfig::default());
        let mut channel = pool
            .check_out("127.0.0.1", mock.addr().port(), PortKind::Plaintext, 1000)
            .await
            .unwrap();

        let local_node = crn_core::DataNodeId::new("local", 1992, "dc1");
        let response = Fetcher::new(&local_node)
            .fetch(&mut channel, &results, &batch)
            .await
            .unwrap();
        assert!(response.is_none());
        assert!(mock.get_requests().is_empty());
    }

    #[tokio::test]
    async fn test_request_consolidates_fetchable_slots() {
        let mock = MockRemoteNode::start().await;
        let batch = batch_against(&mock, &[1, 2, 3]);
        let results = vec![
            ok_result(1, &[100, 101]),
            ExchangeMetadataResult::Err {
                code: ServerErrorCode::IoError,
            },
            ok_result(3, &[300]),
        ];

        mock.push_get_response(crate::testutil::empty_get_response(&[1, 3]));

        let pool = ConnectionPool::new(PoolConfig::default());
        let mut channel = pool
            .check_out("127.0.0.1", mock.addr().port(), PortKind::Plaintext, 1000)
            .await
            .unwrap();

        let local_node = crn_core::DataNodeId::new("local", 1992, "dc1");
        let response = Fetcher::new(&local_node)
            .fetch(&mut channel, &results, &batch)
            .await
            .unwrap();
        assert!(response.is_some());

        let requests = mock.get_requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.flags, GET_FLAG_INCLUDE_DELETED | GET_FLAG_INCLUDE_EXPIRED);
        // Only slots 0 and 2 contribute, in batch order.
        assert_eq!(request.partitions.len(), 2);
        assert_eq!(request.partitions[0].partition, PartitionId(1));
        assert_eq!(request.partitions[0].blob_ids.len(), 2);
        assert_eq!(request.partitions[1].partition, PartitionId(3));
    }

    #[tokio::test]
    async fn test_top_level_get_error_fails_peer() {
        let mock = MockRemoteNode::start().await;
        let batch = batch_against(&mock, &[1]);
        let results = vec![ok_result(1, &[100])];

        mock.push_get_response(crate::testutil::error_get_response(
            ServerErrorCode::RetryAfterBackoff,
        ));

        let pool = ConnectionPool::new(PoolConfig::default());
        let mut channel = pool
            .check_out("127.0.0.1", mock.addr().port(), PortKind::Plaintext, 1000)
            .await
            .unwrap();

        let local_node = crn_core::DataNodeId::new("local", 1992, "dc1");
        let result = Fetcher::new(&local_node)
            .fetch(&mut channel, &results, &batch)
            .await;
        assert!(matches!(result, Err(CairnError::Replication(_))));
    }

    #[tokio::test]
    async fn test_result_count_mismatch_rejected() {
        let mock = MockRemoteNode::start().await;
        let batch = batch_against(&mock, &[1, 2]);
        let results = vec![ok_result(1, &[100])];

        let pool = ConnectionPool::new(PoolConfig::default());
        let mut channel = pool
            .check_out("127.0.0.1", mock.addr().port(), PortKind::Plaintext, 1000)
            .await
            .unwrap();

        let local_node = crn_core::DataNodeId::new("local", 1992, "dc1");
        let result = Fetcher::new(&local_node)
            .fetch(&mut channel, &results, &batch)
            .await;
        assert!(matches!(result, Err(CairnError::Replication(_))));
    }
}
