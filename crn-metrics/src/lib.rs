#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod histogram;

pub use histogram::{LatencyHistogram, LatencySnapshot};

use std::sync::atomic::{AtomicU64, Ordering};

// Iteration outcome counters
pub static REPLICATION_ERRORS: AtomicU64 = AtomicU64::new(0);
pub static METADATA_REQUEST_ERRORS: AtomicU64 = AtomicU64::new(0);
pub static GET_REQUEST_ERRORS: AtomicU64 = AtomicU64::new(0);
pub static LOCAL_STORE_ERRORS: AtomicU64 = AtomicU64::new(0);
pub static INVALID_BLOB_FRAMES: AtomicU64 = AtomicU64::new(0);

// Progress counters, split by whether the peer shares the local datacenter
pub static INTRA_COLO_BLOBS_REPLICATED: AtomicU64 = AtomicU64::new(0);
pub static INTER_COLO_BLOBS_REPLICATED: AtomicU64 = AtomicU64::new(0);
pub static INTRA_COLO_BYTES_REPLICATED: AtomicU64 = AtomicU64::new(0);
pub static INTER_COLO_BYTES_REPLICATED: AtomicU64 = AtomicU64::new(0);
pub static INTRA_COLO_METADATA_EXCHANGES: AtomicU64 = AtomicU64::new(0);
pub static INTER_COLO_METADATA_EXCHANGES: AtomicU64 = AtomicU64::new(0);
pub static DELETES_REPLICATED: AtomicU64 = AtomicU64::new(0);

// Connection kind request rates
pub static SSL_CONNECTIONS_REQUESTED: AtomicU64 = AtomicU64::new(0);
pub static PLAINTEXT_CONNECTIONS_REQUESTED: AtomicU64 = AtomicU64::new(0);

// Per-peer-iteration phase timings, split by colo class
pub static INTRA_COLO_TOTAL_TIME: LatencyHistogram = LatencyHistogram::new();
pub static INTER_COLO_TOTAL_TIME: LatencyHistogram = LatencyHistogram::new();
pub static INTRA_COLO_EXCHANGE_TIME: LatencyHistogram = LatencyHistogram::new();
pub static INTER_COLO_EXCHANGE_TIME: LatencyHistogram = LatencyHistogram::new();
pub static INTRA_COLO_FIX_TIME: LatencyHistogram = LatencyHistogram::new();
pub static INTER_COLO_FIX_TIME: LatencyHistogram = LatencyHistogram::new();
pub static INTRA_COLO_WAIT_TIME: LatencyHistogram = LatencyHistogram::new();
pub static INTER_COLO_WAIT_TIME: LatencyHistogram = LatencyHistogram::new();

#[inline]
pub fn increment_replication_errors() {
    REPLICATION_ERRORS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_metadata_request_errors() {
    METADATA_REQUEST_ERRORS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_get_request_errors() {
    GET_REQUEST_ERRORS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_local_store_errors() {
    LOCAL_STORE_ERRORS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_invalid_blob_frames(count: u64) {
    INVALID_BLOB_FRAMES.fetch_add(count, Ordering::Relaxed);
}

#[inline]
pub fn increment_blobs_replicated(remote_colo: bool, count: u64) {
    if remote_colo {
        INTER_COLO_BLOBS_REPLICATED.fetch_add(count, Ordering::Relaxed);
    } else {
        INTRA_COLO_BLOBS_REPLICATED.fetch_add(count, Ordering::Relaxed);
    }
}

#[inline]
pub fn increment_bytes_replicated(remote_colo: bool, bytes: u64) {
    if remote_colo {
        INTER_COLO_BYTES_REPLICATED.fetch_add(bytes, Ordering::Relaxed);
    } else {
        INTRA_COLO_BYTES_REPLICATED.fetch_add(bytes, Ordering::Relaxed);
    }
}

#[inline]
pub fn increment_metadata_exchanges(remote_colo: bool) {
    if remote_colo {
        INTER_COLO_METADATA_EXCHANGES.fetch_add(1, Ordering::Relaxed);
    } else {
        INTRA_COLO_METADATA_EXCHANGES.fetch_add(1, Ordering::Relaxed);
    }
}

#[inline]
pub fn increment_deletes_replicated() {
    DELETES_REPLICATED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_ssl_connections_requested() {
    SSL_CONNECTIONS_REQUESTED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_plaintext_connections_requested() {
    PLAINTEXT_CONNECTIONS_REQUESTED.fetch_add(1, Ordering::Relaxed);
}

/// Record a full per-peer iteration duration into the right colo bucket.
#[inline]
pub fn record_total_replication_time(remote_colo: bool, duration: std::time::Duration) {
    if remote_colo {
        INTER_COLO_TOTAL_TIME.record(duration);
    } else {
        INTRA_COLO_TOTAL_TIME.record(duration);
    }
}

#[inline]
pub fn record_exchange_time(remote_colo: bool, duration: std::time::Duration) {
    if remote_colo {
        INTER_COLO_EXCHANGE_TIME.record(duration);
    } else {
        INTRA_COLO_EXCHANGE_TIME.record(duration);
    }
}

#[inline]
pub fn record_fix_time(remote_colo: bool, duration: std::time::Duration) {
    if remote_colo {
        INTER_COLO_FIX_TIME.record(duration);
    } else {
        INTRA_COLO_FIX_TIME.record(duration);
    }
}

#[inline]
pub fn record_wait_time(remote_colo: bool, duration: std::time::Duration) {
    if remote_colo {
        INTER_COLO_WAIT_TIME.record(duration);
    } else {
        INTRA_COLO_WAIT_TIME.record(duration);
    }
}

/// Install the process-wide tracing subscriber. Call once at startup;
/// subsequent calls are no-ops.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}
