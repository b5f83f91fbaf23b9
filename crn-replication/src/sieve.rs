//! Blob-stream sieve: frame-level validation of fetched streams.
//!
//! A misbehaving or corrupted peer can interleave garbage into the get
//! response. The sieve walks the stream using the sizes the metadata
//! declared, validates each record frame (magic, CRC, matching id and
//! tombstone flag), and rebuilds a stream containing only the valid
//! records. Invalid records are dropped and counted; the enclosing write
//! treats an all-invalid batch as nothing to write.

use crate::codec::MessageInfo;
use bytes::{BufMut, Bytes, BytesMut};
use crn_core::BlobFrame;
use tracing::warn;

/// Result of sieving one partition's stream.
#[derive(Debug)]
pub struct SievedStream {
    /// Concatenated valid frames, back-to-back in `valid_infos` order.
    pub stream: Bytes,
    /// Message infos of the surviving records.
    pub valid_infos: Vec<MessageInfo>,
    pub invalid_count: u64,
}

impl SievedStream {
    #[must_use]
    pub fn has_invalid_records(&self) -> bool {
        self.invalid_count > 0
    }
}

/// Sieve `stream` against the record metadata that described it. `expected`
/// drives the walk: each entry declares how many bytes its record occupies.
#[must_use]
pub fn sieve_blob_stream(stream: &Bytes, expected: &[MessageInfo]) -> SievedStream {
    let mut out = BytesMut::new();
    let mut valid_infos = Vec::with_capacity(expected.len());
    let mut invalid_count = 0u64;
    let mut offset = 0usize;

    for (idx, info) in expected.iter().enumerate() {
        let declared = info.size_in_bytes as usize;
        let end = offset.saturating_add(declared);
        if end > stream.len() {
            // Declared sizes overran the stream; everything from here on is
            // unusable.
            invalid_count += (expected.len() - idx) as u64;
            warn!(
                target: "cairn::replication",
                blob = %info.blob_id,
                declared,
                remaining = stream.len() - offset,
                "Blob stream shorter than declared record sizes"
            );
            break;
        }

        let record = &stream[offset..end];
        offset = end;

        match BlobFrame::parse(record) {
            Ok((frame, consumed))
                if consumed == declared
                    && frame.blob_id == info.blob_id
                    && frame.tombstone == info.deleted =>
            {
                out.put_slice(record);
                valid_infos.push(*info);
            },
            Ok(_) => {
                invalid_count += 1;
                warn!(
                    target: "cairn::replication",
                    blob = %info.blob_id,
                    "Record frame does not match its declared metadata"
                );
            },
            Err(e) => {
                invalid_count += 1;
                warn!(
                    target: "cairn::replication",
                    blob = %info.blob_id,
                    error = %e,
                    "Invalid record frame in blob stream"
                );
            },
        }
    }

    SievedStream {
        stream: out.freeze(),
        valid_infos,
        invalid_count,
    }
}
