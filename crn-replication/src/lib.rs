#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod codec;
mod config;
mod exchange;
mod fetch;
mod pacer;
mod reconcile;
mod sieve;
mod state;
mod store;
mod worker;
mod write;

#[cfg(any(test, feature = "test-harness"))]
pub mod testutil;

pub use codec::{
    GET_FLAG_INCLUDE_DELETED, GET_FLAG_INCLUDE_EXPIRED, GetOptions, GetRequest, GetResponse,
    MessageInfo, PartitionRequestInfo, PartitionResponseInfo, ReplicaMetadataRequest,
    ReplicaMetadataRequestInfo, ReplicaMetadataResponse, ReplicaMetadataResponseInfo,
    ServerErrorCode, WireKind,
};
pub use config::ReplicationConfig;
pub use exchange::{ExchangeMetadataResult, MetadataExchanger};
pub use fetch::Fetcher;
pub use pacer::Pacer;
pub use reconcile::Reconciler;
pub use sieve::{SievedStream, sieve_blob_stream};
pub use state::{PeerBatch, RemoteReplicaState, group_by_remote_node};
pub use store::{BlobReplicaSource, BlobWriteSet, Notifier, NoopNotifier, Store, StoreResult};
pub use worker::{ReplicaWorker, WorkerHandle};
pub use write::Writer;

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide monotonic correlation id source. Every request on the wire
/// consumes one id.
static CORRELATION_ID_GENERATOR: AtomicU64 = AtomicU64::new(0);

#[inline]
pub(crate) fn next_correlation_id() -> u64 {
    CORRELATION_ID_GENERATOR.fetch_add(1, Ordering::Relaxed)
}
