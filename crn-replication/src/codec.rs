//! Wire codec for the replication protocol.
//!
//! Two request/response pairs travel between replication peers:
//!
//! 1. **Metadata exchange**: one batched request per peer carrying the
//!    current token for every shared partition; the response lists, per
//!    replica, the record metadata at/after that token plus a new token.
//! 2. **Blob fetch**: one batched get-request for the keys still missing
//!    locally; the response carries per-partition record metadata followed
//!    by the raw blob-frame stream, concatenated in request order.
//!
//! All integers are little-endian. Frame byte 0 is the [`WireKind`]
//! discriminant. `decode` returns `None` on any truncation or shape error;
//! the caller maps that to a protocol error for the peer.

use bytes::{BufMut, Bytes, BytesMut};
use crn_core::{BLOB_ID_WIRE_SIZE, BlobId, PartitionId};
use std::fmt;

/// Server-side error codes carried in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerErrorCode {
    NoError = 0,
    IoError = 1,
    BlobNotFound = 2,
    PartitionUnknown = 3,
    RetryAfterBackoff = 4,
    UnknownError = 255,
}

impl ServerErrorCode {
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Unrecognized codes from newer peers degrade to `UnknownError`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NoError,
            1 => Self::IoError,
            2 => Self::BlobNotFound,
            3 => Self::PartitionUnknown,
            4 => Self::RetryAfterBackoff,
            _ => Self::UnknownError,
        }
    }
}

impl fmt::Display for ServerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoError => write!(f, "NO_ERROR"),
            Self::IoError => write!(f, "IO_ERROR"),
            Self::BlobNotFound => write!(f, "BLOB_NOT_FOUND"),
            Self::PartitionUnknown => write!(f, "PARTITION_UNKNOWN"),
            Self::RetryAfterBackoff => write!(f, "RETRY_AFTER_BACKOFF"),
            Self::UnknownError => write!(f, "UNKNOWN_ERROR"),
        }
    }
}

/// Frame discriminant for wire messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireKind {
    MetadataRequest = 1,
    MetadataResponse = 2,
    GetRequest = 3,
    GetResponse = 4,
}

impl WireKind {
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::MetadataRequest),
            2 => Some(Self::MetadataResponse),
            3 => Some(Self::GetRequest),
            4 => Some(Self::GetResponse),
            _ => None,
        }
    }
}

/// Metadata for one record in a remote replica's log window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageInfo {
    pub blob_id: BlobId,
    /// Full frame size of the record, header and CRC included.
    pub size_in_bytes: u64,
    pub deleted: bool,
    pub expired: bool,
}

const INFO_FLAG_DELETED: u8 = 0x01;
const INFO_FLAG_EXPIRED: u8 = 0x02;

impl MessageInfo {
    fn put(&self, buf: &mut BytesMut) {
        self.blob_id.put(buf);
        buf.put_u64_le(self.size_in_bytes);
        let mut flags = 0u8;
        if self.deleted {
            flags |= INFO_FLAG_DELETED;
        }
        if self.expired {
            flags |= INFO_FLAG_EXPIRED;
        }
        buf.put_u8(flags);
    }

    fn read(data: &[u8], pos: &mut usize) -> Option<Self> {
        let blob_id = BlobId::from_bytes(data.get(*pos..*pos + BLOB_ID_WIRE_SIZE)?)?;
        *pos += BLOB_ID_WIRE_SIZE;
        let size_in_bytes = rd_u64(data, pos)?;
        let flags = rd_u8(data, pos)?;
        Some(Self {
            blob_id,
            size_in_bytes,
            deleted: flags & INFO_FLAG_DELETED != 0,
            expired: flags & INFO_FLAG_EXPIRED != 0,
        })
    }
}

// -- read helpers -----------------------------------------------------------

fn rd_u8(data: &[u8], pos: &mut usize) -> Option<u8> {
    let v = *data.get(*pos)?;
    *pos += 1;
    Some(v)
}

fn rd_u16(data: &[u8], pos: &mut usize) -> Option<u16> {
    let v = u16::from_le_bytes(data.get(*pos..*pos + 2)?.try_into().ok()?);
    *pos += 2;
    Some(v)
}

fn rd_u32(data: &[u8], pos: &mut usize) -> Option<u32> {
    let v = u32::from_le_bytes(data.get(*pos..*pos + 4)?.try_into().ok()?);
    *pos += 4;
    Some(v)
}

fn rd_u64(data: &[u8], pos: &mut usize) -> Option<u64> {
    let v = u64::from_le_bytes(data.get(*pos..*pos + 8)?.try_into().ok()?);
    *pos += 8;
    Some(v)
}

fn rd_string(data: &[u8], pos: &mut usize) -> Option<String> {
    let len = rd_u16(data, pos)? as usize;
    let s = std::str::from_utf8(data.get(*pos..*pos + len)?).ok()?;
    *pos += len;
    Some(s.to_string())
}

fn rd_bytes32(data: &[u8], pos: &mut usize) -> Option<Bytes> {
    let len = rd_u32(data, pos)? as usize;
    let b = Bytes::copy_from_slice(data.get(*pos..*pos + len)?);
    *pos += len;
    Some(b)
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_bytes32(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32_le(b.len() as u32);
    buf.put_slice(b);
}

// -- metadata exchange ------------------------------------------------------

/// Per-replica entry of a batched metadata request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaMetadataRequestInfo {
    pub partition: PartitionId,
    /// Opaque token bytes as previously minted by this remote replica.
    pub token: Bytes,
    pub requester_host: String,
    pub requester_replica_path: String,
}

/// Batched metadata request: one per peer per iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaMetadataRequest {
    pub correlation_id: u64,
    pub client_id: String,
    pub fetch_size_in_bytes: u64,
    pub replicas: Vec<ReplicaMetadataRequestInfo>,
}

impl ReplicaMetadataRequest {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.replicas.len() * 96);
        buf.put_u8(WireKind::MetadataRequest as u8);
        buf.put_u64_le(self.correlation_id);
        put_string(&mut buf, &self.client_id);
        buf.put_u64_le(self.fetch_size_in_bytes);
        buf.put_u32_le(self.replicas.len() as u32);
        for replica in &self.replicas {
            buf.put_u64_le(replica.partition.0);
            put_bytes32(&mut buf, &replica.token);
            put_string(&mut buf, &replica.requester_host);
            put_string(&mut buf, &replica.requester_replica_path);
        }
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut pos = 0;
        if rd_u8(data, &mut pos)? != WireKind::MetadataRequest as u8 {
            return None;
        }
        let correlation_id = rd_u64(data, &mut pos)?;
        let client_id = rd_string(data, &mut pos)?;
        let fetch_size_in_bytes = rd_u64(data, &mut pos)?;
        let count = rd_u32(data, &mut pos)? as usize;
        let mut replicas = Vec::with_capacity(count);
        for _ in 0..count {
            let partition = PartitionId(rd_u64(data, &mut pos)?);
            let token = rd_bytes32(data, &mut pos)?;
            let requester_host = rd_string(data, &mut pos)?;
            let requester_replica_path = rd_string(data, &mut pos)?;
            replicas.push(ReplicaMetadataRequestInfo {
                partition,
                token,
                requester_host,
                requester_replica_path,
            });
        }
        Some(Self {
            correlation_id,
            client_id,
            fetch_size_in_bytes,
            replicas,
        })
    }
}

/// Per-replica entry of a metadata response, aligned positionally with the
/// request. On a non-`NoError` entry the token is empty and the list absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaMetadataResponseInfo {
    pub error: ServerErrorCode,
    /// New token minted by the remote for this replica's next window.
    pub token: Bytes,
    /// How far this worker lags the remote replica, as the remote sees it.
    pub remote_replica_lag_in_bytes: u64,
    pub message_infos: Vec<MessageInfo>,
}

impl ReplicaMetadataResponseInfo {
    /// Entry for a replica the remote failed to serve.
    #[must_use]
    pub fn error(code: ServerErrorCode) -> Self {
        Self {
            error: code,
            token: Bytes::new(),
            remote_replica_lag_in_bytes: 0,
            message_infos: Vec::new(),
        }
    }
}

/// Batched metadata response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaMetadataResponse {
    pub correlation_id: u64,
    pub error: ServerErrorCode,
    pub replicas: Vec<ReplicaMetadataResponseInfo>,
}

impl ReplicaMetadataResponse {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.replicas.len() * 128);
        buf.put_u8(WireKind::MetadataResponse as u8);
        buf.put_u64_le(self.correlation_id);
        buf.put_u8(self.error.as_u8());
        buf.put_u32_le(self.replicas.len() as u32);
        for replica in &self.replicas {
            buf.put_u8(replica.error.as_u8());
            put_bytes32(&mut buf, &replica.token);
            buf.put_u64_le(replica.remote_replica_lag_in_bytes);
            buf.put_u32_le(replica.message_infos.len() as u32);
            for info in &replica.message_infos {
                info.put(&mut buf);
            }
        }
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut pos = 0;
        if rd_u8(data, &mut pos)? != WireKind::MetadataResponse as u8 {
            return None;
        }
        let correlation_id = rd_u64(data, &mut pos)?;
        let error = ServerErrorCode::from_u8(rd_u8(data, &mut pos)?);
        let count = rd_u32(data, &mut pos)? as usize;
        let mut replicas = Vec::with_capacity(count);
        for _ in 0..count {
            let entry_error = ServerErrorCode::from_u8(rd_u8(data, &mut pos)?);
            let token = rd_bytes32(data, &mut pos)?;
            let remote_replica_lag_in_bytes = rd_u64(data, &mut pos)?;
            let info_count = rd_u32(data, &mut pos)? as usize;
            let mut message_infos = Vec::with_capacity(info_count);
            for _ in 0..info_count {
                message_infos.push(MessageInfo::read(data, &mut pos)?);
            }
            replicas.push(ReplicaMetadataResponseInfo {
                error: entry_error,
                token,
                remote_replica_lag_in_bytes,
                message_infos,
            });
        }
        Some(Self {
            correlation_id,
            error,
            replicas,
        })
    }
}

// -- blob fetch -------------------------------------------------------------

/// Get-request flag: include records the remote has tombstoned.
pub const GET_FLAG_INCLUDE_DELETED: u8 = 0x01;
/// Get-request flag: include records past their expiry.
pub const GET_FLAG_INCLUDE_EXPIRED: u8 = 0x02;

/// Get-request options. Replication always uses `None`; other request paths
/// carry richer options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum GetOptions {
    #[default]
    None = 0,
}

impl GetOptions {
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            _ => None,
        }
    }
}

/// Keys requested from one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRequestInfo {
    pub partition: PartitionId,
    pub blob_ids: Vec<BlobId>,
}

/// Batched blob fetch for all still-missing keys across a peer's partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRequest {
    pub correlation_id: u64,
    pub client_id: String,
    pub flags: u8,
    pub partitions: Vec<PartitionRequestInfo>,
    pub options: GetOptions,
}

impl GetRequest {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.partitions.len() * 64);
        buf.put_u8(WireKind::GetRequest as u8);
        buf.put_u64_le(self.correlation_id);
        put_string(&mut buf, &self.client_id);
        buf.put_u8(self.flags);
        buf.put_u32_le(self.partitions.len() as u32);
        for partition in &self.partitions {
            buf.put_u64_le(partition.partition.0);
            buf.put_u32_le(partition.blob_ids.len() as u32);
            for blob_id in &partition.blob_ids {
                blob_id.put(&mut buf);
            }
        }
        buf.put_u8(self.options as u8);
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut pos = 0;
        if rd_u8(data, &mut pos)? != WireKind::GetRequest as u8 {
            return None;
        }
        let correlation_id = rd_u64(data, &mut pos)?;
        let client_id = rd_string(data, &mut pos)?;
        let flags = rd_u8(data, &mut pos)?;
        let count = rd_u32(data, &mut pos)? as usize;
        let mut partitions = Vec::with_capacity(count);
        for _ in 0..count {
            let partition = PartitionId(rd_u64(data, &mut pos)?);
            let id_count = rd_u32(data, &mut pos)? as usize;
            let mut blob_ids = Vec::with_capacity(id_count);
            for _ in 0..id_count {
                let id = BlobId::from_bytes(data.get(pos..pos + BLOB_ID_WIRE_SIZE)?)?;
                pos += BLOB_ID_WIRE_SIZE;
                blob_ids.push(id);
            }
            partitions.push(PartitionRequestInfo {
                partition,
                blob_ids,
            });
        }
        let options = GetOptions::from_u8(rd_u8(data, &mut pos)?)?;
        Some(Self {
            correlation_id,
            client_id,
            flags,
            partitions,
            options,
        })
    }
}

/// Per-partition entry of a get-response, in request order. Entries with a
/// non-`NoError` code contribute no bytes to the blob stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionResponseInfo {
    pub partition: PartitionId,
    pub error: ServerErrorCode,
    pub message_infos: Vec<MessageInfo>,
}

impl PartitionResponseInfo {
    /// Total bytes this entry occupies in the response blob stream.
    #[must_use]
    pub fn stream_len(&self) -> usize {
        if self.error != ServerErrorCode::NoError {
            return 0;
        }
        self.message_infos
            .iter()
            .map(|info| info.size_in_bytes as usize)
            .sum()
    }
}

/// Batched blob-fetch response: per-partition headers followed by the raw
/// blob-frame stream. The stream must be consumed in partition order: the
/// writer's cursor advancement has to match the request's partition list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResponse {
    pub correlation_id: u64,
    pub error: ServerErrorCode,
    pub partitions: Vec<PartitionResponseInfo>,
    /// Concatenated blob frames for every `NoError` partition, in order.
    pub blob_stream: Bytes,
}

impl GetResponse {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(64 + self.partitions.len() * 64 + self.blob_stream.len());
        buf.put_u8(WireKind::GetResponse as u8);
        buf.put_u64_le(self.correlation_id);
        buf.put_u8(self.error.as_u8());
        buf.put_u32_le(self.partitions.len() as u32);
        for partition in &self.partitions {
            buf.put_u64_le(partition.partition.0);
            buf.put_u8(partition.error.as_u8());
            buf.put_u32_le(partition.message_infos.len() as u32);
            for info in &partition.message_infos {
                info.put(&mut buf);
            }
        }
        buf.put_slice(&self.blob_stream);
        buf.freeze()
    }

    /// Decode from an owned frame so the blob stream stays a zero-copy slice.
    #[must_use]
    pub fn decode(data: Bytes) -> Option<Self> {
        let mut pos = 0;
        if rd_u8(&data, &mut pos)? != WireKind::GetResponse as u8 {
            return None;
        }
        let correlation_id = rd_u64(&data, &mut pos)?;
        let error = ServerErrorCode::from_u8(rd_u8(&data, &mut pos)?);
        let count = rd_u32(&data, &mut pos)? as usize;
        let mut partitions = Vec::with_capacity(count);
        for _ in 0..count {
            let partition = PartitionId(rd_u64(&data, &mut pos)?);
            let entry_error = ServerErrorCode::from_u8(rd_u8(&data, &mut pos)?);
            let info_count = rd_u32(&data, &mut pos)? as usize;
            let mut message_infos = Vec::with_capacity(info_count);
            for _ in 0..info_count {
                message_infos.push(MessageInfo::read(&data, &mut pos)?);
            }
            partitions.push(PartitionResponseInfo {
                partition,
                error: entry_error,
                message_infos,
            });
        }

        let expected: usize = partitions.iter().map(PartitionResponseInfo::stream_len).sum();
        if data.len() - pos < expected {
            return None;
        }
        let blob_stream = data.slice(pos..);

        Some(Self {
            correlation_id,
            error,
            partitions,
            blob_stream,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn blob(partition: u64, n: u128) -> BlobId {
        BlobId::new(PartitionId(partition), n)
    }

    fn sample_info(partition: u64, n: u128) -> MessageInfo {
        MessageInfo {
            blob_id: blob(partition, n),
            size_in_bytes: 100 + n as u64,
            deleted: n % 2 == 0,
            expired: n % 3 == 0,
        }
    }

    #[test]
    fn test_metadata_request_roundtrip() {
        let request = ReplicaMetadataRequest {
            correlation_id: 17,
            client_id: "replication-metadata-host1".into(),
            fetch_size_in_bytes: 1 << 20,
            replicas: vec![
                ReplicaMetadataRequestInfo {
                    partition: PartitionId(4),
                    token: Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 0]),
                    requester_host: "host1".into(),
                    requester_replica_path: "/mnt/0/partition-4".into(),
                },
                ReplicaMetadataRequestInfo {
                    partition: PartitionId(9),
                    token: Bytes::from_static(&[1, 2, 3]),
                    requester_host: "host1".into(),
                    requester_replica_path: "/mnt/1/partition-9".into(),
                },
            ],
        };
        let encoded = request.encode();
        assert_eq!(ReplicaMetadataRequest::decode(&encoded), Some(request));
    }

    #[test]
    fn test_metadata_response_roundtrip() {
        let response = ReplicaMetadataResponse {
            correlation_id: 18,
            error: ServerErrorCode::NoError,
            replicas: vec![
                ReplicaMetadataResponseInfo {
                    error: ServerErrorCode::NoError,
                    token: Bytes::from_static(&[9, 9, 9, 9, 9, 9, 9, 9]),
                    remote_replica_lag_in_bytes: 4096,
                    message_infos: vec![sample_info(4, 1), sample_info(4, 2)],
                },
                ReplicaMetadataResponseInfo::error(ServerErrorCode::IoError),
            ],
        };
        let encoded = response.encode();
        assert_eq!(ReplicaMetadataResponse::decode(&encoded), Some(response));
    }

    #[test]
    fn test_get_request_roundtrip() {
        let request = GetRequest {
            correlation_id: 19,
            client_id: "replication-fetch-host1".into(),
            flags: GET_FLAG_INCLUDE_DELETED | GET_FLAG_INCLUDE_EXPIRED,
            partitions: vec![PartitionRequestInfo {
                partition: PartitionId(4),
                blob_ids: vec![blob(4, 1), blob(4, 2)],
            }],
            options: GetOptions::None,
        };
        let encoded = request.encode();
        assert_eq!(GetRequest::decode(&encoded), Some(request));
    }

    #[test]
    fn test_get_response_roundtrip_and_stream_offsets() {
        let info_a = MessageInfo {
            blob_id: blob(4, 1),
            size_in_bytes: 10,
            deleted: false,
            expired: false,
        };
        let info_b = MessageInfo {
            blob_id: blob(9, 2),
            size_in_bytes: 6,
            deleted: false,
            expired: false,
        };
        let response = GetResponse {
            correlation_id: 20,
            error: ServerErrorCode::NoError,
            partitions: vec![
                PartitionResponseInfo {
                    partition: PartitionId(4),
                    error: ServerErrorCode::NoError,
                    message_infos: vec![info_a],
                },
                PartitionResponseInfo {
                    partition: PartitionId(7),
                    error: ServerErrorCode::IoError,
                    message_infos: Vec::new(),
                },
                PartitionResponseInfo {
                    partition: PartitionId(9),
                    error: ServerErrorCode::NoError,
                    message_infos: vec![info_b],
                },
            ],
            blob_stream: Bytes::from_static(b"0123456789abcdef"),
        };
        let decoded = GetResponse::decode(response.encode()).unwrap();
        assert_eq!(decoded, response);
        // An error partition occupies no stream bytes.
        assert_eq!(decoded.partitions[0].stream_len(), 10);
        assert_eq!(decoded.partitions[1].stream_len(), 0);
        assert_eq!(decoded.partitions[2].stream_len(), 6);
    }

    #[test]
    fn test_get_response_short_stream_rejected() {
        let response = GetResponse {
            correlation_id: 1,
            error: ServerErrorCode::NoError,
            partitions: vec![PartitionResponseInfo {
                partition: PartitionId(4),
                error: ServerErrorCode::NoError,
                message_infos: vec![MessageInfo {
                    blob_id: blob(4, 1),
                    size_in_bytes: 100,
                    deleted: false,
                    expired: false,
                }],
            }],
            blob_stream: Bytes::from_static(b"short"),
        };
        assert_eq!(GetResponse::decode(response.encode()), None);
    }

    #[test]
    fn test_truncated_frames_rejected() {
        let request = ReplicaMetadataRequest {
            correlation_id: 3,
            client_id: "c".into(),
            fetch_size_in_bytes: 1,
            replicas: vec![ReplicaMetadataRequestInfo {
                partition: PartitionId(1),
                token: Bytes::from_static(&[1]),
                requester_host: "h".into(),
                requester_replica_path: "p".into(),
            }],
        };
        let encoded = request.encode();
        for cut in [0, 1, 9, encoded.len() - 1] {
            assert_eq!(ReplicaMetadataRequest::decode(&encoded[..cut]), None);
        }
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let response = ReplicaMetadataResponse {
            correlation_id: 5,
            error: ServerErrorCode::NoError,
            replicas: Vec::new(),
        };
        assert_eq!(GetRequest::decode(&response.encode()), None);
    }

    #[test]
    fn test_unknown_error_code_degrades() {
        assert_eq!(ServerErrorCode::from_u8(42), ServerErrorCode::UnknownError);
        assert_eq!(ServerErrorCode::from_u8(0), ServerErrorCode::NoError);
    }
}
