//! Reconciliation of remote metadata against the local store.
//!
//! Decides, for every record the remote reported in the current token
//! window, whether it needs fetching, needs a local tombstone, or can be
//! ignored. Tombstones win over content; expired content is never fetched.

use crate::codec::MessageInfo;
use crate::state::RemoteReplicaState;
use crate::store::{BlobReplicaSource, BlobWriteSet, Notifier, Store};
use crn_core::{BlobId, CairnError, DataNodeId, Result, StoreErrorCode};
use std::collections::HashSet;
use tracing::trace;

pub struct Reconciler<'a> {
    local_node: &'a DataNodeId,
    notifier: &'a dyn Notifier,
}

impl<'a> Reconciler<'a> {
    #[must_use]
    pub fn new(local_node: &'a DataNodeId, notifier: &'a dyn Notifier) -> Self {
        Self {
            local_node,
            notifier,
        }
    }

    /// Apply one replica's metadata window to the local store and compute
    /// the final set of keys to fetch.
    ///
    /// Rules, per remote record:
    /// - present locally + remote-deleted + not deleted here: append a local
    ///   tombstone and report a replicated deletion;
    /// - missing locally + remote-deleted: drop from the missing set (no
    ///   point fetching content for a tombstone this store never held);
    /// - missing locally + expired: drop from the missing set;
    /// - missing locally otherwise: keep for the fetcher.
    pub fn reconcile(
        &self,
        state: &RemoteReplicaState,
        message_infos: &[MessageInfo],
    ) -> Result<HashSet<BlobId>> {
        let store = state.local_store();
        let keys_to_check: Vec<BlobId> = message_infos.iter().map(|m| m.blob_id).collect();
        let mut missing = store
            .find_missing_keys(&keys_to_check)
            .map_err(CairnError::Store)?;

        let expected_partition = state.local_replica().partition;
        for info in message_infos {
            if info.blob_id.partition() != expected_partition {
                return Err(CairnError::PartitionMismatch {
                    expected: expected_partition.0,
                    actual: info.blob_id.partition().0,
                });
            }

            if !missing.contains(&info.blob_id) {
                // Present locally. Only a remote tombstone matters now.
                if info.deleted && !store.is_key_deleted(&info.blob_id).map_err(CairnError::Store)?
                {
                    match store.delete(BlobWriteSet::tombstone(info.blob_id)) {
                        Ok(()) => {
                            trace!(
                                target: "cairn::replication",
                                remote_replica = %state.remote_replica(),
                                blob = %info.blob_id,
                                "Applied remote tombstone to local store"
                            );
                            self.notify_deleted(&info.blob_id);
                        },
                        // Lost a race with another deleter; outcome is the same.
                        Err(StoreErrorCode::AlreadyDeleted) => {},
                        Err(code) => return Err(CairnError::Store(code)),
                    }
                }
            } else if info.deleted {
                missing.remove(&info.blob_id);
                trace!(
                    target: "cairn::replication",
                    remote_replica = %state.remote_replica(),
                    blob = %info.blob_id,
                    "Key tombstoned remotely, skipping fetch"
                );
                self.notify_deleted(&info.blob_id);
            } else if info.expired {
                missing.remove(&info.blob_id);
                trace!(
                    target: "cairn::replication",
                    remote_replica = %state.remote_replica(),
                    blob = %info.blob_id,
                    "Key expired remotely, skipping fetch"
                );
            }
        }

        Ok(missing)
    }

    fn notify_deleted(&self, blob_id: &BlobId) {
        crn_metrics::increment_deletes_replicated();
        self.notifier.on_blob_replica_deleted(
            &self.local_node.hostname,
            self.local_node.port,
            blob_id,
            BlobReplicaSource::Repaired,
        );
    }
}
