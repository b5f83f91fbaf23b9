//! Test support: an in-memory store, a capturing notification sink, and a
//! scripted remote node that speaks the real wire protocol over loopback
//! TCP. Used by this crate's unit and integration tests; not part of the
//! replication engine. Compiled only under `cfg(test)` or the
//! `test-harness` feature.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use crate::codec::{
    GetRequest, GetResponse, MessageInfo, PartitionResponseInfo, ReplicaMetadataRequest,
    ReplicaMetadataResponse, ReplicaMetadataResponseInfo, ServerErrorCode, WireKind,
};
use crate::store::{BlobReplicaSource, BlobWriteSet, Notifier, Store, StoreResult};
use bytes::{BufMut, Bytes, BytesMut};
use crn_core::{BlobId, DataNodeId, OffsetToken, PartitionId, StoreErrorCode};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

// -- in-memory store --------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct StoredRecord {
    size: u64,
    deleted: bool,
}

/// Thread-safe in-memory [`Store`] with per-key state and failure
/// injection for put paths.
#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<BlobId, StoredRecord>>,
    put_calls: AtomicU64,
    delete_calls: AtomicU64,
    fail_puts: Mutex<Option<StoreErrorCode>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_live(&self, blob_id: BlobId, size: u64) {
        self.records.lock().unwrap().insert(
            blob_id,
            StoredRecord {
                size,
                deleted: false,
            },
        );
    }

    pub fn mark_deleted(&self, blob_id: &BlobId) {
        if let Some(record) = self.records.lock().unwrap().get_mut(blob_id) {
            record.deleted = true;
        }
    }

    #[must_use]
    pub fn contains(&self, blob_id: &BlobId) -> bool {
        self.records.lock().unwrap().contains_key(blob_id)
    }

    #[must_use]
    pub fn put_calls(&self) -> u64 {
        self.put_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::Relaxed)
    }

    /// Make every subsequent put fail with `code`.
    pub fn fail_puts_with(&self, code: StoreErrorCode) {
        *self.fail_puts.lock().unwrap() = Some(code);
    }
}

impl Store for InMemoryStore {
    fn find_missing_keys(&self, keys: &[BlobId]) -> StoreResult<HashSet<BlobId>> {
        let records = self.records.lock().unwrap();
        Ok(keys
            .iter()
            .filter(|key| !records.contains_key(key))
            .copied()
            .collect())
    }

    fn put(&self, write_set: BlobWriteSet) -> StoreResult<()> {
        self.put_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(code) = *self.fail_puts.lock().unwrap() {
            return Err(code);
        }

        let mut records = self.records.lock().unwrap();
        if write_set
            .message_infos
            .iter()
            .any(|info| records.contains_key(&info.blob_id))
        {
            return Err(StoreErrorCode::AlreadyExists);
        }
        for info in &write_set.message_infos {
            records.insert(
                info.blob_id,
                StoredRecord {
                    size: info.size_in_bytes,
                    deleted: info.deleted,
                },
            );
        }
        Ok(())
    }

    fn delete(&self, write_set: BlobWriteSet) -> StoreResult<()> {
        self.delete_calls.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.lock().unwrap();
        for info in &write_set.message_infos {
            match records.get_mut(&info.blob_id) {
                Some(record) if record.deleted => return Err(StoreErrorCode::AlreadyDeleted),
                Some(record) => record.deleted = true,
                None => {
                    records.insert(
                        info.blob_id,
                        StoredRecord {
                            size: info.size_in_bytes,
                            deleted: true,
                        },
                    );
                },
            }
        }
        Ok(())
    }

    fn is_key_deleted(&self, key: &BlobId) -> StoreResult<bool> {
        let records = self.records.lock().unwrap();
        Ok(records.get(key).is_some_and(|record| record.deleted))
    }
}

// -- capturing notifier -----------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierEvent {
    Created {
        blob_id: BlobId,
        host: String,
        port: u16,
    },
    Deleted {
        blob_id: BlobId,
        host: String,
        port: u16,
    },
}

/// Records every notification for later assertions.
#[derive(Default)]
pub struct CapturingNotifier {
    events: Mutex<Vec<NotifierEvent>>,
}

impl CapturingNotifier {
    #[must_use]
    pub fn events(&self) -> Vec<NotifierEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Notifier for CapturingNotifier {
    fn on_blob_replica_created(
        &self,
        host: &str,
        port: u16,
        blob_id: &BlobId,
        _source: BlobReplicaSource,
    ) {
        self.events.lock().unwrap().push(NotifierEvent::Created {
            blob_id: *blob_id,
            host: host.to_string(),
            port,
        });
    }

    fn on_blob_replica_deleted(
        &self,
        host: &str,
        port: u16,
        blob_id: &BlobId,
        _source: BlobReplicaSource,
    ) {
        self.events.lock().unwrap().push(NotifierEvent::Deleted {
            blob_id: *blob_id,
            host: host.to_string(),
            port,
        });
    }
}

// -- response builders ------------------------------------------------------

/// Wire bytes of an [`OffsetToken`] at `offset`.
#[must_use]
pub fn offset_token_bytes(offset: u64) -> Bytes {
    crn_core::FindToken::to_bytes(&OffsetToken::new(offset))
}

/// A healthy per-replica metadata entry.
#[must_use]
pub fn metadata_slot(
    token: Bytes,
    remote_replica_lag_in_bytes: u64,
    message_infos: Vec<MessageInfo>,
) -> ReplicaMetadataResponseInfo {
    ReplicaMetadataResponseInfo {
        error: ServerErrorCode::NoError,
        token,
        remote_replica_lag_in_bytes,
        message_infos,
    }
}

/// A healthy top-level metadata response with the given entries.
#[must_use]
pub fn metadata_response(replicas: Vec<ReplicaMetadataResponseInfo>) -> ReplicaMetadataResponse {
    ReplicaMetadataResponse {
        correlation_id: 0,
        error: ServerErrorCode::NoError,
        replicas,
    }
}

/// A healthy get response with empty per-partition payloads.
#[must_use]
pub fn empty_get_response(partitions: &[u64]) -> GetResponse {
    GetResponse {
        correlation_id: 0,
        error: ServerErrorCode::NoError,
        partitions: partitions
            .iter()
            .map(|&p| PartitionResponseInfo {
                partition: PartitionId(p),
                error: ServerErrorCode::NoError,
                message_infos: Vec::new(),
            })
            .collect(),
        blob_stream: Bytes::new(),
    }
}

/// A get response failed at the top level.
#[must_use]
pub fn error_get_response(error: ServerErrorCode) -> GetResponse {
    GetResponse {
        correlation_id: 0,
        error,
        partitions: Vec::new(),
        blob_stream: Bytes::new(),
    }
}

// -- scripted remote node ---------------------------------------------------

#[derive(Default)]
struct MockRemoteInner {
    metadata_responses: Mutex<VecDeque<ReplicaMetadataResponse>>,
    get_responses: Mutex<VecDeque<GetResponse>>,
    metadata_requests: Mutex<Vec<ReplicaMetadataRequest>>,
    get_requests: Mutex<Vec<GetRequest>>,
}

/// A fake peer node: serves scripted responses over real loopback TCP and
/// records every request it decodes. Responses are consumed in FIFO order;
/// an exhausted script answers with `UnknownError` so a runaway worker
/// degrades into per-iteration errors instead of hanging.
pub struct MockRemoteNode {
    addr: SocketAddr,
    inner: Arc<MockRemoteInner>,
}

impl MockRemoteNode {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let inner = Arc::new(MockRemoteInner::default());

        let accept_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let conn_inner = Arc::clone(&accept_inner);
                tokio::spawn(async move {
                    Self::serve_connection(socket, conn_inner).await;
                });
            }
        });

        Self { addr, inner }
    }

    async fn serve_connection(mut socket: tokio::net::TcpStream, inner: Arc<MockRemoteInner>) {
        loop {
            let mut len_buf = [0u8; 4];
            if socket.read_exact(&mut len_buf).await.is_err() {
                return;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut frame = vec![0u8; len];
            if socket.read_exact(&mut frame).await.is_err() {
                return;
            }

            let reply = match frame.first().copied().and_then(WireKind::from_u8) {
                Some(WireKind::MetadataRequest) => {
                    if let Some(request) = ReplicaMetadataRequest::decode(&frame) {
                        inner.metadata_requests.lock().unwrap().push(request);
                    }
                    let response = inner
                        .metadata_responses
                        .lock()
                        .unwrap()
                        .pop_front()
                        .unwrap_or_else(|| ReplicaMetadataResponse {
                            correlation_id: 0,
                            error: ServerErrorCode::UnknownError,
                            replicas: Vec::new(),
                        });
                    response.encode()
                },
                Some(WireKind::GetRequest) => {
                    if let Some(request) = GetRequest::decode(&frame) {
                        inner.get_requests.lock().unwrap().push(request);
                    }
                    let response = inner
                        .get_responses
                        .lock()
                        .unwrap()
                        .pop_front()
                        .unwrap_or_else(|| error_get_response(ServerErrorCode::UnknownError));
                    response.encode()
                },
                _ => return,
            };

            let mut envelope = BytesMut::with_capacity(4 + reply.len());
            envelope.put_u32_le(reply.len() as u32);
            envelope.put_slice(&reply);
            if socket.write_all(&envelope).await.is_err() {
                return;
            }
        }
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Identity of this mock as a cluster data node in `datacenter`.
    #[must_use]
    pub fn node(&self, datacenter: &str) -> DataNodeId {
        DataNodeId::new("127.0.0.1", self.addr.port(), datacenter)
    }

    pub fn push_metadata_response(&self, response: ReplicaMetadataResponse) {
        self.inner
            .metadata_responses
            .lock()
            .unwrap()
            .push_back(response);
    }

    pub fn push_get_response(&self, response: GetResponse) {
        self.inner.get_responses.lock().unwrap().push_back(response);
    }

    #[must_use]
    pub fn metadata_requests(&self) -> Vec<ReplicaMetadataRequest> {
        self.inner.metadata_requests.lock().unwrap().clone()
    }

    #[must_use]
    pub fn get_requests(&self) -> Vec<GetRequest> {
        self.inner.get_requests.lock().unwrap().clone()
    }
}
