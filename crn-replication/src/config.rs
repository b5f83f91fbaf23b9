//! Replication worker configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Byte budget sent with each metadata request: how much log the remote
    /// may cover in one token window.
    #[serde(default = "default_fetch_size_in_bytes")]
    pub fetch_size_in_bytes: u64,
    /// Timeout for checking a connection out of the shared pool.
    #[serde(default = "default_connection_checkout_timeout_ms")]
    pub connection_pool_checkout_timeout_ms: u64,
    /// Pacing threshold: an intra-colo peer reporting less lag than this is
    /// considered caught-up, and the worker backs off once per exchange.
    #[serde(default = "default_max_lag_for_wait_time_in_bytes")]
    pub max_lag_for_wait_time_in_bytes: u64,
    /// Pacing duration applied when the threshold above is met.
    #[serde(default = "default_wait_time_between_replicas_ms")]
    pub wait_time_between_replicas_ms: u64,
    /// Datacenters reached over SSL; everything else is plaintext.
    #[serde(default)]
    pub ssl_enabled_colos: Vec<String>,
    /// Run fetched blob streams through the frame sieve before writing.
    #[serde(default)]
    pub validate_blob_stream: bool,
}

fn default_fetch_size_in_bytes() -> u64 {
    1024 * 1024
}

fn default_connection_checkout_timeout_ms() -> u64 {
    1000
}

fn default_max_lag_for_wait_time_in_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_wait_time_between_replicas_ms() -> u64 {
    100
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            fetch_size_in_bytes: default_fetch_size_in_bytes(),
            connection_pool_checkout_timeout_ms: default_connection_checkout_timeout_ms(),
            max_lag_for_wait_time_in_bytes: default_max_lag_for_wait_time_in_bytes(),
            wait_time_between_replicas_ms: default_wait_time_between_replicas_ms(),
            ssl_enabled_colos: Vec::new(),
            validate_blob_stream: false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplicationConfig::default();
        assert_eq!(config.fetch_size_in_bytes, 1024 * 1024);
        assert_eq!(config.connection_pool_checkout_timeout_ms, 1000);
        assert_eq!(config.max_lag_for_wait_time_in_bytes, 5 * 1024 * 1024);
        assert_eq!(config.wait_time_between_replicas_ms, 100);
        assert!(config.ssl_enabled_colos.is_empty());
        assert!(!config.validate_blob_stream);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: ReplicationConfig = serde_json::from_str(
            r#"{"ssl_enabled_colos": ["dc2"], "validate_blob_stream": true}"#,
        )
        .unwrap();
        assert_eq!(config.ssl_enabled_colos, vec!["dc2".to_string()]);
        assert!(config.validate_blob_stream);
        assert_eq!(config.wait_time_between_replicas_ms, 100);
    }
}
