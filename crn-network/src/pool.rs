//! Connection pool shared by all replication workers.
//!
//! Checkout hands out an idle channel for the endpoint if one exists,
//! otherwise dials a new one under the caller's timeout. The contract with
//! callers: exactly one of `check_in` / `destroy` per successful checkout.
//! Only clean channels may be checked back in; anything that saw an error is
//! poisoned and the pool refuses it.

use crate::connection::{ChannelConfig, ChannelStream, ConnectedChannel};
use crate::tls::TlsConnector;
use crn_core::{CairnError, PortKind, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Pool-wide settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Transport timeouts applied to every channel the pool creates.
    pub channel: ChannelConfig,
    /// Idle channels retained per (host, port, kind) endpoint; excess
    /// check-ins are dropped.
    pub max_idle_per_endpoint: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            max_idle_per_endpoint: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointKey {
    host: String,
    port: u16,
    kind: PortKind,
}

/// Pool of framed channels keyed by peer endpoint.
pub struct ConnectionPool {
    config: PoolConfig,
    idle: Mutex<HashMap<EndpointKey, VecDeque<ConnectedChannel>>>,
    /// Present when any peer requires an SSL connection.
    tls: Option<Arc<TlsConnector>>,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(HashMap::new()),
            tls: None,
        }
    }

    /// Pool that can also dial [`PortKind::Ssl`] endpoints.
    #[must_use]
    pub fn with_tls(config: PoolConfig, tls: Arc<TlsConnector>) -> Self {
        Self {
            config,
            idle: Mutex::new(HashMap::new()),
            tls: Some(tls),
        }
    }

    /// Check out a channel to `host:port`, dialing if no idle one exists.
    /// The whole operation (including TLS handshake) runs under
    /// `timeout_ms`.
    pub async fn check_out(
        &self,
        host: &str,
        port: u16,
        kind: PortKind,
        timeout_ms: u64,
    ) -> Result<ConnectedChannel> {
        let key = EndpointKey {
            host: host.to_string(),
            port,
            kind,
        };

        {
            let mut idle = self.idle.lock().await;
            if let Some(queue) = idle.get_mut(&key) {
                if let Some(channel) = queue.pop_front() {
                    debug!(
                        target: "cairn::network",
                        host, port, kind = %kind,
                        "Reusing idle connection"
                    );
                    return Ok(channel);
                }
            }
        }

        tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.dial(host, port, kind),
        )
        .await
        .map_err(|_| CairnError::CheckoutTimeout(timeout_ms))?
    }

    async fn dial(&self, host: &str, port: u16, kind: PortKind) -> Result<ConnectedChannel> {
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;

        let stream = match kind {
            PortKind::Plaintext => ChannelStream::Tcp(tcp),
            PortKind::Ssl => {
                let tls = self.tls.as_ref().ok_or_else(|| {
                    CairnError::Config(format!(
                        "SSL connection to {host}:{port} requested but pool has no TLS connector"
                    ))
                })?;
                tls.wrap(host, tcp).await.map_err(|e| {
                    CairnError::Protocol(format!("TLS handshake with {host}:{port} failed: {e}"))
                })?
            },
        };

        debug!(
            target: "cairn::network",
            host, port, kind = %kind,
            "Dialed new connection"
        );

        Ok(ConnectedChannel::new(
            host.to_string(),
            port,
            kind,
            self.config.channel.clone(),
            stream,
        ))
    }

    /// Return a clean channel for reuse. Poisoned channels are dropped with
    /// a warning; callers should have destroyed them instead.
    pub async fn check_in(&self, channel: ConnectedChannel) {
        if channel.is_poisoned() {
            warn!(
                target: "cairn::network",
                host = channel.host(),
                port = channel.port(),
                "Refusing to pool a poisoned channel"
            );
            return;
        }

        let key = EndpointKey {
            host: channel.host().to_string(),
            port: channel.port(),
            kind: channel.kind(),
        };

        let mut idle = self.idle.lock().await;
        let queue = idle.entry(key).or_default();
        if queue.len() < self.config.max_idle_per_endpoint {
            queue.push_back(channel);
        }
        // Over the cap the channel is simply dropped, closing the socket.
    }

    /// Tear down a channel. Dropping closes the underlying socket; this
    /// method exists so call sites read as the checkout/destroy pairing.
    pub fn destroy(&self, channel: ConnectedChannel) {
        debug!(
            target: "cairn::network",
            host = channel.host(),
            port = channel.port(),
            "Destroying connection"
        );
        drop(channel);
    }

    /// Number of idle channels currently pooled (all endpoints).
    pub async fn idle_count(&self) -> usize {
        let idle = self.idle.lock().await;
        idle.values().map(VecDeque::len).sum()
    }
}
