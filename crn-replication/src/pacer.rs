//! Back-pressure against a just-caught-up peer.
//!
//! When an intra-colo peer reports almost no replication lag, client writes
//! that landed on it moments ago have not had time to reach this node yet.
//! Sleeping briefly before fetching smooths tail reads: the next metadata
//! window then includes those writes instead of racing them. Cross-colo
//! peers are never paced; their latency already provides the slack.

use crate::config::ReplicationConfig;
use std::time::{Duration, Instant};
use tracing::trace;

pub struct Pacer {
    max_lag_for_wait_in_bytes: u64,
    wait_time: Duration,
    need_to_wait: bool,
}

impl Pacer {
    #[must_use]
    pub fn new(config: &ReplicationConfig) -> Self {
        Self {
            max_lag_for_wait_in_bytes: config.max_lag_for_wait_time_in_bytes,
            wait_time: Duration::from_millis(config.wait_time_between_replicas_ms),
            need_to_wait: true,
        }
    }

    /// Re-arm at the start of every metadata exchange. Only the first
    /// qualifying slot of an exchange sleeps.
    pub fn reset(&mut self) {
        self.need_to_wait = true;
    }

    /// Sleep once per exchange if the peer is intra-colo and its reported
    /// lag is under the threshold. Returns whether a sleep happened.
    pub async fn maybe_wait(&mut self, remote_replica_lag_in_bytes: u64, remote_colo: bool) -> bool {
        let start = Instant::now();
        let slept = if !remote_colo
            && self.need_to_wait
            && remote_replica_lag_in_bytes < self.max_lag_for_wait_in_bytes
        {
            trace!(
                target: "cairn::replication",
                lag_bytes = remote_replica_lag_in_bytes,
                threshold_bytes = self.max_lag_for_wait_in_bytes,
                wait_ms = self.wait_time.as_millis() as u64,
                "Peer nearly caught up, pacing before fetch"
            );
            tokio::time::sleep(self.wait_time).await;
            self.need_to_wait = false;
            true
        } else {
            false
        };
        crn_metrics::record_wait_time(remote_colo, start.elapsed());
        slept
    }
}
