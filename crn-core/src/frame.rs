//! Blob record frame: the at-rest and on-wire format of one store record.
//!
//! # Layout
//!
//! ```text
//! magic(4) + version(1) + flags(1) + blob_id(24) + payload_len(4) + payload(N) + crc32c(4)
//! ```
//!
//! The CRC covers everything after the magic through the end of the payload.
//! A delete tombstone is a frame with the tombstone flag set and an empty
//! payload; deletions propagate as a small frame, not a blob body.

use crate::{BLOB_ID_WIRE_SIZE, BlobId, CAIRN_MAGIC, CairnError, Result};
use bytes::{BufMut, Bytes, BytesMut};

pub const BLOB_FRAME_VERSION: u8 = 1;
/// magic + version + flags + blob id + payload length
pub const BLOB_FRAME_HEADER_SIZE: usize = 4 + 1 + 1 + BLOB_ID_WIRE_SIZE + 4;
/// Header plus the trailing CRC; a tombstone frame is exactly this size.
pub const BLOB_FRAME_OVERHEAD: usize = BLOB_FRAME_HEADER_SIZE + 4;

/// Frame flag: this record is a delete tombstone.
pub const FLAG_TOMBSTONE: u8 = 0x01;

/// One decoded store record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobFrame {
    pub blob_id: BlobId,
    pub tombstone: bool,
    pub payload: Bytes,
}

impl BlobFrame {
    /// A live blob record carrying content.
    #[must_use]
    pub fn data(blob_id: BlobId, payload: Bytes) -> Self {
        Self {
            blob_id,
            tombstone: false,
            payload,
        }
    }

    /// A delete tombstone. Payload is always empty.
    #[must_use]
    pub fn tombstone(blob_id: BlobId) -> Self {
        Self {
            blob_id,
            tombstone: true,
            payload: Bytes::new(),
        }
    }

    /// Total encoded size of this frame on the wire.
    #[inline]
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        BLOB_FRAME_OVERHEAD + self.payload.len()
    }

    /// Encode the full frame including the trailing CRC.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&CAIRN_MAGIC);
        buf.put_u8(BLOB_FRAME_VERSION);
        buf.put_u8(if self.tombstone { FLAG_TOMBSTONE } else { 0 });
        self.blob_id.put(&mut buf);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        let crc = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    /// Parse one frame from the front of `data`, validating magic, version
    /// and CRC. Returns the frame and the number of bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < BLOB_FRAME_OVERHEAD {
            return Err(CairnError::Protocol(format!(
                "Truncated blob frame: {} bytes, need at least {}",
                data.len(),
                BLOB_FRAME_OVERHEAD
            )));
        }
        if data[0..4] != CAIRN_MAGIC {
            return Err(CairnError::InvalidMagic);
        }
        let version = data[4];
        if version != BLOB_FRAME_VERSION {
            return Err(CairnError::Protocol(format!(
                "Unsupported blob frame version {version}"
            )));
        }
        let flags = data[5];
        let blob_id = BlobId::from_bytes(&data[6..6 + BLOB_ID_WIRE_SIZE])
            .ok_or_else(|| CairnError::Protocol("Truncated blob id".into()))?;

        let len_off = 6 + BLOB_ID_WIRE_SIZE;
        let payload_len = u32::from_le_bytes(
            data[len_off..len_off + 4]
                .try_into()
                .map_err(|_| CairnError::Protocol("Truncated payload length".into()))?,
        ) as usize;

        let total = BLOB_FRAME_OVERHEAD + payload_len;
        if data.len() < total {
            return Err(CairnError::Protocol(format!(
                "Truncated blob frame payload: have {} bytes, frame needs {}",
                data.len(),
                total
            )));
        }

        let payload_off = BLOB_FRAME_HEADER_SIZE;
        let crc_off = payload_off + payload_len;
        let expected = u32::from_le_bytes(
            data[crc_off..crc_off + 4]
                .try_into()
                .map_err(|_| CairnError::Protocol("Truncated frame CRC".into()))?,
        );
        let actual = crc32fast::hash(&data[4..crc_off]);
        if actual != expected {
            return Err(CairnError::CrcMismatch { expected, actual });
        }

        let payload = Bytes::copy_from_slice(&data[payload_off..payload_off + payload_len]);
        Ok((
            Self {
                blob_id,
                tombstone: flags & FLAG_TOMBSTONE != 0,
                payload,
            },
            total,
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::PartitionId;

    fn blob(n: u128) -> BlobId {
        BlobId::new(PartitionId(1), n)
    }

    #[test]
    fn test_data_frame_roundtrip() {
        let frame = BlobFrame::data(blob(7), Bytes::from_static(b"hello blob"));
        let encoded = frame.encode();
        assert_eq!(encoded.len(), frame.encoded_len());

        let (parsed, consumed) = BlobFrame::parse(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(parsed, frame);
        assert!(!parsed.tombstone);
    }

    #[test]
    fn test_tombstone_frame_is_minimal() {
        let frame = BlobFrame::tombstone(blob(9));
        let encoded = frame.encode();
        assert_eq!(encoded.len(), BLOB_FRAME_OVERHEAD);

        let (parsed, _) = BlobFrame::parse(&encoded).unwrap();
        assert!(parsed.tombstone);
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn test_corrupted_payload_fails_crc() {
        let frame = BlobFrame::data(blob(3), Bytes::from_static(b"payload"));
        let mut encoded = frame.encode().to_vec();
        let idx = BLOB_FRAME_HEADER_SIZE + 2;
        encoded[idx] ^= 0xFF;

        match BlobFrame::parse(&encoded) {
            Err(CairnError::CrcMismatch { .. }) => {},
            other => panic!("expected CRC mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let frame = BlobFrame::data(blob(3), Bytes::from_static(b"x"));
        let mut encoded = frame.encode().to_vec();
        encoded[0] = b'X';
        assert!(matches!(
            BlobFrame::parse(&encoded),
            Err(CairnError::InvalidMagic)
        ));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = BlobFrame::data(blob(3), Bytes::from_static(b"0123456789"));
        let encoded = frame.encode();
        for cut in [0, 10, BLOB_FRAME_OVERHEAD, encoded.len() - 1] {
            assert!(BlobFrame::parse(&encoded[..cut]).is_err());
        }
    }

    #[test]
    fn test_parse_consumes_exactly_one_frame() {
        let first = BlobFrame::data(blob(1), Bytes::from_static(b"aa"));
        let second = BlobFrame::tombstone(blob(2));
        let mut stream = first.encode().to_vec();
        stream.extend_from_slice(&second.encode());

        let (f, used) = BlobFrame::parse(&stream).unwrap();
        assert_eq!(f, first);
        let (s, _) = BlobFrame::parse(&stream[used..]).unwrap();
        assert_eq!(s, second);
    }
}
