//! Writing fetched blobs into the local store and advancing tokens.
//!
//! The get response is one sequential stream: per-partition payloads appear
//! in exactly the order the fetcher requested them, so the walk here keeps a
//! cursor into the partition list that advances only for slots that
//! contributed to the request, and an offset into the blob stream that
//! advances only for partitions the remote served successfully.
//!
//! Token rule: a slot's token advances only when every key it reported
//! missing has been durably written or confirmed unnecessary. Everything
//! else leaves the token alone so the same window is re-requested next
//! iteration. Replication is at-least-once with monotone progress.

use crate::codec::{GetResponse, MessageInfo, ServerErrorCode};
use crate::exchange::ExchangeMetadataResult;
use crate::sieve::sieve_blob_stream;
use crate::state::PeerBatch;
use crate::store::{BlobReplicaSource, BlobWriteSet, Notifier, Store};
use bytes::Bytes;
use crn_core::{CairnError, DataNodeId, Result, StoreErrorCode};
use tracing::{error, info, trace};

/// Writes one peer iteration's fetched blobs and advances tokens.
pub struct Writer<'a> {
    local_node: &'a DataNodeId,
    notifier: &'a dyn Notifier,
    validate_blob_stream: bool,
}

impl<'a> Writer<'a> {
    #[must_use]
    pub fn new(
        local_node: &'a DataNodeId,
        notifier: &'a dyn Notifier,
        validate_blob_stream: bool,
    ) -> Self {
        Self {
            local_node,
            notifier,
            validate_blob_stream,
        }
    }

    pub fn write(
        &self,
        results: &[ExchangeMetadataResult],
        get_response: Option<&GetResponse>,
        batch: &PeerBatch,
        remote_colo: bool,
    ) -> Result<()> {
        let mut partition_cursor = 0usize;
        let mut stream_offset = 0usize;
        let mut total_bytes_fixed = 0u64;
        let mut total_blobs_fixed = 0u64;

        for (result, state) in results.iter().zip(&batch.replicas) {
            let ExchangeMetadataResult::Ok { missing, new_token } = result else {
                // Per-slot server error: no token movement, retried next
                // iteration from the same position.
                continue;
            };

            if missing.is_empty() {
                // Metadata round confirmed nothing was missing.
                state.advance_token(new_token.clone());
                trace!(
                    target: "cairn::replication",
                    remote_replica = %state.remote_replica(),
                    token = ?state.token(),
                    "Nothing missing, token advanced"
                );
                continue;
            }

            let response = get_response.ok_or_else(|| {
                CairnError::Replication("No get response for a slot with missing keys".into())
            })?;
            let partition_info = response.partitions.get(partition_cursor).ok_or_else(|| {
                CairnError::Protocol(format!(
                    "Get response has {} partitions, needed at least {}",
                    response.partitions.len(),
                    partition_cursor + 1
                ))
            })?;
            partition_cursor += 1;

            if partition_info.partition != state.local_replica().partition {
                return Err(CairnError::PartitionMismatch {
                    expected: state.local_replica().partition.0,
                    actual: partition_info.partition.0,
                });
            }

            if partition_info.error != ServerErrorCode::NoError {
                crn_metrics::increment_get_request_errors();
                error!(
                    target: "cairn::replication",
                    remote_replica = %state.remote_replica(),
                    server_error = %partition_info.error,
                    "Get failed for partition, will retry from same token"
                );
                continue;
            }

            let payload_len = partition_info.stream_len();
            let payload_end = stream_offset + payload_len;
            if payload_end > response.blob_stream.len() {
                return Err(CairnError::Protocol(format!(
                    "Blob stream exhausted: need {} bytes at offset {}, have {}",
                    payload_len,
                    stream_offset,
                    response.blob_stream.len()
                )));
            }
            let payload = response.blob_stream.slice(stream_offset..payload_end);
            stream_offset = payload_end;

            let (written_bytes, written_blobs) = self.write_partition(
                state,
                partition_info.message_infos.as_slice(),
                payload,
                new_token,
            )?;
            total_bytes_fixed += written_bytes;
            total_blobs_fixed += written_blobs;
        }

        crn_metrics::increment_bytes_replicated(remote_colo, total_bytes_fixed);
        crn_metrics::increment_blobs_replicated(remote_colo, total_blobs_fixed);
        Ok(())
    }

    /// Write one partition's payload. Returns (bytes, blobs) durably written.
    fn write_partition(
        &self,
        state: &crate::state::RemoteReplicaState,
        message_infos: &[MessageInfo],
        payload: Bytes,
        new_token: &std::sync::Arc<dyn crn_core::FindToken>,
    ) -> Result<(u64, u64)> {
        let (stream, infos) = if self.validate_blob_stream {
            let sieved = sieve_blob_stream(&payload, message_infos);
            if sieved.has_invalid_records() {
                crn_metrics::increment_invalid_blob_frames(sieved.invalid_count);
                error!(
                    target: "cairn::replication",
                    remote_replica = %state.remote_replica(),
                    invalid = sieved.invalid_count,
                    total = message_infos.len(),
                    "Invalid records found in fetched blob stream"
                );
            }
            if sieved.valid_infos.is_empty() {
                // Every record was invalidated: nothing to write, which
                // still completes this window.
                info!(
                    target: "cairn::replication",
                    remote_replica = %state.remote_replica(),
                    "All fetched records invalidated, skipping write"
                );
                state.advance_token(new_token.clone());
                return Ok((0, 0));
            }
            (sieved.stream, sieved.valid_infos)
        } else {
            (payload, message_infos.to_vec())
        };

        match state.local_store().put(BlobWriteSet::new(stream, infos.clone())) {
            Ok(()) => {
                let mut bytes = 0u64;
                for written in &infos {
                    bytes += written.size_in_bytes;
                    trace!(
                        target: "cairn::replication",
                        remote_replica = %state.remote_replica(),
                        blob = %written.blob_id,
                        size = written.size_in_bytes,
                        "Blob replicated"
                    );
                    self.notifier.on_blob_replica_created(
                        &self.local_node.hostname,
                        self.local_node.port,
                        &written.blob_id,
                        BlobReplicaSource::Repaired,
                    );
                }
                state.advance_token(new_token.clone());
                trace!(
                    target: "cairn::replication",
                    remote_replica = %state.remote_replica(),
                    token = ?state.token(),
                    "Token advanced after write"
                );
                Ok((bytes, infos.len() as u64))
            },
            Err(StoreErrorCode::AlreadyExists) => {
                // Idempotent re-delivery of a window we already hold.
                trace!(
                    target: "cairn::replication",
                    remote_replica = %state.remote_replica(),
                    "Write set already present, advancing token"
                );
                state.advance_token(new_token.clone());
                Ok((0, 0))
            },
            Err(code) => {
                crn_metrics::increment_local_store_errors();
                error!(
                    target: "cairn::replication",
                    remote_replica = %state.remote_replica(),
                    error = %code,
                    "Local store rejected write, will retry from same token"
                );
                Ok((0, 0))
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::codec::PartitionResponseInfo;
    use crate::state::{RemoteReplicaState, group_by_remote_node};
    use crate::testutil::{CapturingNotifier, InMemoryStore, NotifierEvent};
    use bytes::{BufMut, BytesMut};
    use crn_core::{BlobFrame, BlobId, OffsetToken, PartitionId, ReplicaId};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn token(offset: u64) -> Arc<dyn crn_core::FindToken> {
        Arc::new(OffsetToken::new(offset))
    }

    fn batch(store: &Arc<InMemoryStore>, partitions: &[u64]) -> PeerBatch {
        let remote_node = crn_core::DataNodeId::new("remote", 1992, "dc1");
        let local_node = crn_core::DataNodeId::new("local", 1992, "dc1");
        let states = partitions
            .iter()
            .map(|&p| {
                Arc::new(
                    RemoteReplicaState::new(
                        ReplicaId::new(PartitionId(p), remote_node.clone(), "/mnt/r"),
                        ReplicaId::new(PartitionId(p), local_node.clone(), "/mnt/l"),
                        Arc::clone(store) as Arc<dyn crate::Store>,
                        token(0),
                    )
                    .unwrap(),
                )
            })
            .collect();
        group_by_remote_node(states).remove(0)
    }

    fn frame_and_info(partition: u64, n: u128, payload: &'static [u8]) -> (Bytes, MessageInfo) {
        let id = BlobId::new(PartitionId(partition), n);
        let frame = BlobFrame::data(id, Bytes::from_static(payload));
        let encoded = frame.encode();
        let info = MessageInfo {
            blob_id: id,
            size_in_bytes: encoded.len() as u64,
            deleted: false,
            expired: false,
        };
        (encoded, info)
    }

    fn ok_result(partition: u64, keys: &[u128], new_token: u64) -> ExchangeMetadataResult {
        ExchangeMetadataResult::Ok {
            missing: keys
                .iter()
                .map(|&k| BlobId::new(PartitionId(partition), k))
                .collect::<HashSet<_>>(),
            new_token: token(new_token),
        }
    }

    fn token_offset(state: &RemoteReplicaState) -> u64 {
        let bytes = state.token().to_bytes();
        u64::from_le_bytes(bytes[..8].try_into().unwrap())
    }

    #[test]
    fn test_empty_missing_set_advances_token() {
        let store = Arc::new(InMemoryStore::new());
        let batch = batch(&store, &[1]);
        let node = crn_core::DataNodeId::new("local", 1992, "dc1");
        let notifier = CapturingNotifier::default();

        Writer::new(&node, &notifier, false)
            .write(&[ok_result(1, &[], 42)], None, &batch, false)
            .unwrap();
        assert_eq!(token_offset(&batch.replicas[0]), 42);
        assert!(notifier.events().is_empty());
    }

    #[test]
    fn test_error_slot_keeps_token() {
        let store = Arc::new(InMemoryStore::new());
        let batch = batch(&store, &[1]);
        let node = crn_core::DataNodeId::new("local", 1992, "dc1");
        let notifier = CapturingNotifier::default();

        Writer::new(&node, &notifier, false)
            .write(
                &[ExchangeMetadataResult::Err {
                    code: ServerErrorCode::IoError,
                }],
                None,
                &batch,
                false,
            )
            .unwrap();
        assert_eq!(token_offset(&batch.replicas[0]), 0);
    }

    #[test]
    fn test_write_advances_token_and_notifies() {
        let store = Arc::new(InMemoryStore::new());
        let batch = batch(&store, &[1]);
        let node = crn_core::DataNodeId::new("local", 1992, "dc1");
        let notifier = CapturingNotifier::default();

        let (payload, info) = frame_and_info(1, 100, b"blob body");
        let response = GetResponse {
            correlation_id: 1,
            error: ServerErrorCode::NoError,
            partitions: vec![PartitionResponseInfo {
                partition: PartitionId(1),
                error: ServerErrorCode::NoError,
                message_infos: vec![info],
            }],
            blob_stream: payload,
        };

        Writer::new(&node, &notifier, false)
            .write(&[ok_result(1, &[100], 7)], Some(&response), &batch, false)
            .unwrap();

        assert_eq!(token_offset(&batch.replicas[0]), 7);
        assert!(store.contains(&BlobId::new(PartitionId(1), 100)));
        assert_eq!(
            notifier.events(),
            vec![NotifierEvent::Created {
                blob_id: BlobId::new(PartitionId(1), 100),
                host: "local".into(),
                port: 1992
            }]
        );
    }

    #[test]
    fn test_partition_get_error_keeps_token_and_cursor_order() {
        // Two fetchable slots; the remote serves partition 1 and fails
        // partition 2. Partition 1 must land and advance, partition 2 must
        // stay put for the next iteration.
        let store = Arc::new(InMemoryStore::new());
        let batch = batch(&store, &[1, 2]);
        let node = crn_core::DataNodeId::new("local", 1992, "dc1");
        let notifier = CapturingNotifier::default();

        let (payload, info) = frame_and_info(1, 100, b"k6");
        let response = GetResponse {
            correlation_id: 1,
            error: ServerErrorCode::NoError,
            partitions: vec![
                PartitionResponseInfo {
                    partition: PartitionId(1),
                    error: ServerErrorCode::NoError,
                    message_infos: vec![info],
                },
                PartitionResponseInfo {
                    partition: PartitionId(2),
                    error: ServerErrorCode::IoError,
                    message_infos: Vec::new(),
                },
            ],
            blob_stream: payload,
        };

        Writer::new(&node, &notifier, false)
            .write(
                &[ok_result(1, &[100], 11), ok_result(2, &[200], 22)],
                Some(&response),
                &batch,
                false,
            )
            .unwrap();

        assert_eq!(token_offset(&batch.replicas[0]), 11);
        assert_eq!(token_offset(&batch.replicas[1]), 0);
        assert!(store.contains(&BlobId::new(PartitionId(1), 100)));
        assert!(!store.contains(&BlobId::new(PartitionId(2), 200)));
    }

    #[test]
    fn test_already_exists_treated_as_success() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_live(BlobId::new(PartitionId(1), 100), 50);
        let batch = batch(&store, &[1]);
        let node = crn_core::DataNodeId::new("local", 1992, "dc1");
        let notifier = CapturingNotifier::default();

        let (payload, info) = frame_and_info(1, 100, b"dup");
        let response = GetResponse {
            correlation_id: 1,
            error: ServerErrorCode::NoError,
            partitions: vec![PartitionResponseInfo {
                partition: PartitionId(1),
                error: ServerErrorCode::NoError,
                message_infos: vec![info],
            }],
            blob_stream: payload,
        };

        Writer::new(&node, &notifier, false)
            .write(&[ok_result(1, &[100], 9)], Some(&response), &batch, false)
            .unwrap();
        assert_eq!(token_offset(&batch.replicas[0]), 9);
        // No fresh notification for a blob that was already here.
        assert!(notifier.events().is_empty());
    }

    #[test]
    fn test_store_failure_keeps_token() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_puts_with(StoreErrorCode::IoFailure);
        let batch = batch(&store, &[1]);
        let node = crn_core::DataNodeId::new("local", 1992, "dc1");
        let notifier = CapturingNotifier::default();

        let (payload, info) = frame_and_info(1, 100, b"doomed");
        let response = GetResponse {
            correlation_id: 1,
            error: ServerErrorCode::NoError,
            partitions: vec![PartitionResponseInfo {
                partition: PartitionId(1),
                error: ServerErrorCode::NoError,
                message_infos: vec![info],
            }],
            blob_stream: payload,
        };

        Writer::new(&node, &notifier, false)
            .write(&[ok_result(1, &[100], 9)], Some(&response), &batch, false)
            .unwrap();
        assert_eq!(token_offset(&batch.replicas[0]), 0);
        assert!(notifier.events().is_empty());
    }

    #[test]
    fn test_all_invalid_stream_still_advances_token() {
        // A stream whose every record fails validation counts as "nothing
        // to write": the window is complete and the token moves on.
        let store = Arc::new(InMemoryStore::new());
        let batch = batch(&store, &[1]);
        let node = crn_core::DataNodeId::new("local", 1992, "dc1");
        let notifier = CapturingNotifier::default();

        let (payload, info) = frame_and_info(1, 100, b"garbled");
        let mut corrupted = payload.to_vec();
        corrupted[0] = b'X';
        let response = GetResponse {
            correlation_id: 1,
            error: ServerErrorCode::NoError,
            partitions: vec![PartitionResponseInfo {
                partition: PartitionId(1),
                error: ServerErrorCode::NoError,
                message_infos: vec![info],
            }],
            blob_stream: Bytes::from(corrupted),
        };

        Writer::new(&node, &notifier, true)
            .write(&[ok_result(1, &[100], 31)], Some(&response), &batch, false)
            .unwrap();
        assert_eq!(token_offset(&batch.replicas[0]), 31);
        assert_eq!(store.put_calls(), 0);
        assert!(notifier.events().is_empty());
    }

    #[test]
    fn test_sieve_writes_surviving_records() {
        let store = Arc::new(InMemoryStore::new());
        let batch = batch(&store, &[1]);
        let node = crn_core::DataNodeId::new("local", 1992, "dc1");
        let notifier = CapturingNotifier::default();

        let (good, good_info) = frame_and_info(1, 100, b"good");
        let (bad, bad_info) = frame_and_info(1, 101, b"bad!");
        let mut corrupted = bad.to_vec();
        let last = corrupted.len() - 6;
        corrupted[last] ^= 0xFF;

        let mut stream = BytesMut::new();
        stream.put_slice(&good);
        stream.put_slice(&corrupted);

        let response = GetResponse {
            correlation_id: 1,
            error: ServerErrorCode::NoError,
            partitions: vec![PartitionResponseInfo {
                partition: PartitionId(1),
                error: ServerErrorCode::NoError,
                message_infos: vec![good_info, bad_info],
            }],
            blob_stream: stream.freeze(),
        };

        Writer::new(&node, &notifier, true)
            .write(
                &[ok_result(1, &[100, 101], 13)],
                Some(&response),
                &batch,
                false,
            )
            .unwrap();
        assert_eq!(token_offset(&batch.replicas[0]), 13);
        assert!(store.contains(&BlobId::new(PartitionId(1), 100)));
        assert!(!store.contains(&BlobId::new(PartitionId(1), 101)));
        assert_eq!(notifier.events().len(), 1);
    }

    #[test]
    fn test_partition_mismatch_is_fatal_for_peer() {
        let store = Arc::new(InMemoryStore::new());
        let batch = batch(&store, &[1]);
        let node = crn_core::DataNodeId::new("local", 1992, "dc1");
        let notifier = CapturingNotifier::default();

        let (payload, info) = frame_and_info(9, 100, b"wrong");
        let response = GetResponse {
            correlation_id: 1,
            error: ServerErrorCode::NoError,
            partitions: vec![PartitionResponseInfo {
                partition: PartitionId(9),
                error: ServerErrorCode::NoError,
                message_infos: vec![info],
            }],
            blob_stream: payload,
        };

        let result = Writer::new(&node, &notifier, false).write(
            &[ok_result(1, &[100], 9)],
            Some(&response),
            &batch,
            false,
        );
        assert!(matches!(
            result,
            Err(CairnError::PartitionMismatch {
                expected: 1,
                actual: 9
            })
        ));
        assert_eq!(token_offset(&batch.replicas[0]), 0);
    }
}
