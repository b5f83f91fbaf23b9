//! Contracts for the local blob store and the notification sink.
//!
//! Both are external collaborators: the store is the node's persistent
//! partition-replica storage, the sink tells interested parties (e.g. a
//! frontend cache) that a replica appeared or disappeared on this node.
//! Replication only relies on the guarantees written here.

use crate::codec::MessageInfo;
use bytes::Bytes;
use crn_core::{BlobFrame, BlobId, StoreErrorCode};
use std::collections::HashSet;

pub type StoreResult<T> = std::result::Result<T, StoreErrorCode>;

/// A batch of blob frames plus their metadata, handed to the store as one
/// write. The stream holds the frames back-to-back in `message_infos` order.
#[derive(Debug, Clone)]
pub struct BlobWriteSet {
    pub stream: Bytes,
    pub message_infos: Vec<MessageInfo>,
}

impl BlobWriteSet {
    #[must_use]
    pub fn new(stream: Bytes, message_infos: Vec<MessageInfo>) -> Self {
        Self {
            stream,
            message_infos,
        }
    }

    /// Synthesize a single-tombstone write set for `blob_id`, used when a
    /// remote reports a deletion for a key this store holds live.
    #[must_use]
    pub fn tombstone(blob_id: BlobId) -> Self {
        let frame = BlobFrame::tombstone(blob_id);
        let info = MessageInfo {
            blob_id,
            size_in_bytes: frame.encoded_len() as u64,
            deleted: true,
            expired: false,
        };
        Self {
            stream: frame.encode(),
            message_infos: vec![info],
        }
    }
}

/// Contract the local store provides to replication.
///
/// Implementations are thread-safe and per-key linearizable. `put` is
/// content-addressed: re-delivering an existing blob fails with
/// [`StoreErrorCode::AlreadyExists`], which replication treats as success.
pub trait Store: Send + Sync {
    /// The subset of `keys` not present in this store.
    fn find_missing_keys(&self, keys: &[BlobId]) -> StoreResult<HashSet<BlobId>>;

    /// Append the blob frames in the write set.
    fn put(&self, write_set: BlobWriteSet) -> StoreResult<()>;

    /// Append tombstones for the keys in the write set.
    fn delete(&self, write_set: BlobWriteSet) -> StoreResult<()>;

    /// Whether `key` is present and tombstoned.
    fn is_key_deleted(&self, key: &BlobId) -> StoreResult<bool>;
}

/// Why a replica event happened on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobReplicaSource {
    /// Written by a client through the front door.
    Primary,
    /// Restored by anti-entropy replication.
    Repaired,
}

/// Downstream notification sink for replica lifecycle events. Calls are
/// fire-and-forget; implementations must not block.
pub trait Notifier: Send + Sync {
    fn on_blob_replica_created(
        &self,
        host: &str,
        port: u16,
        blob_id: &BlobId,
        source: BlobReplicaSource,
    );

    fn on_blob_replica_deleted(
        &self,
        host: &str,
        port: u16,
        blob_id: &BlobId,
        source: BlobReplicaSource,
    );
}

/// Default sink when no one is listening.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn on_blob_replica_created(&self, _: &str, _: u16, _: &BlobId, _: BlobReplicaSource) {}

    fn on_blob_replica_deleted(&self, _: &str, _: u16, _: &BlobId, _: BlobReplicaSource) {}
}
