//! Per-pair replication state and peer grouping.

use crate::store::Store;
use crn_core::{CairnError, DataNodeId, FindToken, ReplicaId, Result};
use std::fmt;
use std::sync::{Arc, Mutex};

/// State for one (local replica, remote replica) pair.
///
/// Owns the progress token for the remote replica. The token is readable by
/// anyone holding the state (the manager persists it) but advances only
/// through [`advance_token`](Self::advance_token), which the writer calls
/// after confirmed progress.
pub struct RemoteReplicaState {
    remote_replica: ReplicaId,
    local_replica: ReplicaId,
    local_store: Arc<dyn Store>,
    token: Mutex<Arc<dyn FindToken>>,
}

impl RemoteReplicaState {
    /// Both replicas must be copies of the same partition.
    pub fn new(
        remote_replica: ReplicaId,
        local_replica: ReplicaId,
        local_store: Arc<dyn Store>,
        initial_token: Arc<dyn FindToken>,
    ) -> Result<Self> {
        if remote_replica.partition != local_replica.partition {
            return Err(CairnError::PartitionMismatch {
                expected: local_replica.partition.0,
                actual: remote_replica.partition.0,
            });
        }
        Ok(Self {
            remote_replica,
            local_replica,
            local_store,
            token: Mutex::new(initial_token),
        })
    }

    #[inline]
    #[must_use]
    pub fn remote_replica(&self) -> &ReplicaId {
        &self.remote_replica
    }

    #[inline]
    #[must_use]
    pub fn local_replica(&self) -> &ReplicaId {
        &self.local_replica
    }

    #[inline]
    #[must_use]
    pub fn local_store(&self) -> &Arc<dyn Store> {
        &self.local_store
    }

    /// Current progress token for this pair.
    #[must_use]
    pub fn token(&self) -> Arc<dyn FindToken> {
        match self.token.lock() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the token after confirmed progress. Writer-only.
    pub fn advance_token(&self, token: Arc<dyn FindToken>) {
        match self.token.lock() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }
}

impl fmt::Display for RemoteReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}", self.local_replica, self.remote_replica)
    }
}

impl fmt::Debug for RemoteReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteReplicaState")
            .field("remote_replica", &self.remote_replica)
            .field("local_replica", &self.local_replica)
            .field("token", &self.token())
            .finish_non_exhaustive()
    }
}

/// The remote replicas co-located on one remote node, exchanged in one
/// network round-trip.
#[derive(Debug, Clone)]
pub struct PeerBatch {
    pub remote_node: DataNodeId,
    pub replicas: Vec<Arc<RemoteReplicaState>>,
}

/// Group replica states by their remote node so one connection amortizes
/// over all partitions shared with that peer. Batch order follows first
/// appearance; order within a batch follows the input.
#[must_use]
pub fn group_by_remote_node(states: Vec<Arc<RemoteReplicaState>>) -> Vec<PeerBatch> {
    let mut batches: Vec<PeerBatch> = Vec::new();
    for state in states {
        let node = state.remote_replica().node.clone();
        match batches.iter_mut().find(|b| b.remote_node == node) {
            Some(batch) => batch.replicas.push(state),
            None => batches.push(PeerBatch {
                remote_node: node,
                replicas: vec![state],
            }),
        }
    }
    batches
}
