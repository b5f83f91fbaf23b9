//! Identity types for the cairn cluster topology.
//!
//! The store is sharded into partitions; each partition has replicas placed
//! on data nodes, possibly across datacenters. These types carry just enough
//! identity for the replication protocol; the authoritative topology lives
//! in the cluster map, which is an external collaborator.

use crate::BLOB_ID_WIRE_SIZE;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Unit of sharding. A set of replicas of one partition holds the same
/// blob id-space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId(pub u64);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition-{}", self.0)
    }
}

/// Opaque blob identity. Carries its owning partition so any component can
/// route or validate a key without a topology lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobId {
    partition: PartitionId,
    id: u128,
}

impl BlobId {
    #[must_use]
    pub const fn new(partition: PartitionId, id: u128) -> Self {
        Self { partition, id }
    }

    /// The partition this blob belongs to. Stable for the life of the id.
    #[inline]
    #[must_use]
    pub const fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Encode to the fixed 24-byte wire form: partition (8) + id (16), LE.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(BLOB_ID_WIRE_SIZE);
        self.put(&mut buf);
        buf.freeze()
    }

    /// Append the wire form to an existing buffer.
    pub fn put(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.partition.0);
        buf.put_u128_le(self.id);
    }

    /// Decode from the fixed 24-byte wire form.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < BLOB_ID_WIRE_SIZE {
            return None;
        }
        let partition = u64::from_le_bytes(data[0..8].try_into().ok()?);
        let id = u128::from_le_bytes(data[8..24].try_into().ok()?);
        Some(Self {
            partition: PartitionId(partition),
            id,
        })
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blob-{}-{:032x}", self.partition.0, self.id)
    }
}

/// Connection kind for a peer endpoint. Which kind applies is a per-colo
/// policy decision made by the replication worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    Plaintext,
    Ssl,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plaintext => write!(f, "plaintext"),
            Self::Ssl => write!(f, "ssl"),
        }
    }
}

/// Identity of a data node: where to connect and which failure domain
/// (datacenter / "colo") it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataNodeId {
    pub hostname: String,
    pub port: u16,
    pub datacenter: String,
}

impl DataNodeId {
    #[must_use]
    pub fn new(
        hostname: impl Into<String>,
        port: u16,
        datacenter: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            datacenter: datacenter.into(),
        }
    }
}

impl fmt::Display for DataNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// One copy of a partition on a specific node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicaId {
    pub partition: PartitionId,
    pub node: DataNodeId,
    /// Filesystem path of the replica on its node. Sent with metadata
    /// requests so the remote can log which local replica is asking.
    pub replica_path: String,
}

impl ReplicaId {
    #[must_use]
    pub fn new(partition: PartitionId, node: DataNodeId, replica_path: impl Into<String>) -> Self {
        Self {
            partition,
            node,
            replica_path: replica_path.into(),
        }
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.partition)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_id_wire_roundtrip() {
        let id = BlobId::new(PartitionId(42), 0xDEAD_BEEF_CAFE);
        let bytes = id.to_bytes();
        assert_eq!(bytes.len(), BLOB_ID_WIRE_SIZE);
        assert_eq!(BlobId::from_bytes(&bytes), Some(id));
    }

    #[test]
    fn test_blob_id_truncated_decode() {
        let id = BlobId::new(PartitionId(7), 1);
        let bytes = id.to_bytes();
        assert_eq!(BlobId::from_bytes(&bytes[..23]), None);
        assert_eq!(BlobId::from_bytes(&[]), None);
    }

    #[test]
    fn test_blob_id_partition_is_stable() {
        let id = BlobId::new(PartitionId(3), 99);
        assert_eq!(id.partition(), PartitionId(3));
    }

    #[test]
    fn test_data_node_identity() {
        let a = DataNodeId::new("host1", 1992, "dc1");
        let b = DataNodeId::new("host1", 1992, "dc1");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "host1:1992");
    }
}
