//! Client-side TLS for cross-colo replication connections.
//!
//! The replication worker only ever dials out, so this module carries just
//! the connector half. Requires the `tls` feature:
//!
//! ```toml
//! crn-network = { version = "0.3", features = ["tls"] }
//! ```

use crate::connection::ChannelStream;
use std::path::Path;
use thiserror::Error;

#[cfg(feature = "tls")]
use std::fs::File;
#[cfg(feature = "tls")]
use std::io::BufReader;
#[cfg(feature = "tls")]
use std::sync::Arc;
#[cfg(feature = "tls")]
use tokio::net::TcpStream;

/// TLS settings for peer connections.
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// Path to a CA bundle (PEM). When absent, the webpki system roots are
    /// used.
    pub ca_path: Option<String>,
    /// Override the SNI name presented during the handshake. When absent,
    /// the peer's hostname is used.
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    #[must_use]
    pub fn with_ca(ca_path: impl AsRef<Path>) -> Self {
        Self {
            ca_path: Some(ca_path.as_ref().to_string_lossy().into_owned()),
            server_name: None,
        }
    }

    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Error type for TLS operations
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("CA error: {0}")]
    Ca(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Covers bad settings and builds without the `tls` feature.
    #[error("Config error: {0}")]
    Config(String),
}

/// Result type for TLS operations
pub type TlsResult<T> = std::result::Result<T, TlsError>;

/// TLS connector for peer connections.
#[derive(Clone)]
pub struct TlsConnector {
    config: TlsClientConfig,
    #[cfg(feature = "tls")]
    inner: Arc<tokio_rustls::TlsConnector>,
}

impl TlsConnector {
    /// Create a new TLS connector with the given configuration.
    pub fn new(config: TlsClientConfig) -> TlsResult<Self> {
        #[cfg(feature = "tls")]
        {
            let inner = Self::build_connector(&config)?;
            Ok(Self {
                config,
                inner: Arc::new(inner),
            })
        }

        #[cfg(not(feature = "tls"))]
        {
            let _ = &config;
            Err(TlsError::Config(
                "crn-network built without the `tls` feature".into(),
            ))
        }
    }

    #[cfg(feature = "tls")]
    fn build_connector(config: &TlsClientConfig) -> TlsResult<tokio_rustls::TlsConnector> {
        use rustls::RootCertStore;
        use rustls::pki_types::CertificateDer;

        let mut root_store = RootCertStore::empty();

        if let Some(ref ca_path) = config.ca_path {
            let ca_file = File::open(ca_path)
                .map_err(|e| TlsError::Ca(format!("{}: {}", ca_path, e)))?;
            let mut ca_reader = BufReader::new(ca_file);
            let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut ca_reader)
                .filter_map(|r| r.ok())
                .collect();

            if certs.is_empty() {
                return Err(TlsError::Ca(format!("No CA certs in {ca_path}")));
            }
            for cert in certs {
                root_store
                    .add(cert)
                    .map_err(|e| TlsError::Ca(format!("Failed to add CA: {}", e)))?;
            }
        } else {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(tokio_rustls::TlsConnector::from(Arc::new(client_config)))
    }

    /// Get the TLS configuration.
    #[must_use]
    pub fn config(&self) -> &TlsClientConfig {
        &self.config
    }

    /// Wrap an established TCP stream in a TLS session to `host`.
    #[cfg(feature = "tls")]
    pub async fn wrap(&self, host: &str, tcp: TcpStream) -> TlsResult<ChannelStream> {
        use rustls::pki_types::ServerName;

        let sni = self.config.server_name.as_deref().unwrap_or(host);
        let name = ServerName::try_from(sni.to_string())
            .map_err(|e| TlsError::Config(format!("Invalid server name {sni}: {e}")))?;

        let stream = self
            .inner
            .connect(name, tcp)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))?;
        Ok(ChannelStream::Tls(Box::new(stream)))
    }

    #[cfg(not(feature = "tls"))]
    pub async fn wrap(
        &self,
        _host: &str,
        _tcp: tokio::net::TcpStream,
    ) -> TlsResult<ChannelStream> {
        Err(TlsError::Config(
            "crn-network built without the `tls` feature".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_with_ca() {
        let config = TlsClientConfig::with_ca("ca.pem");
        assert_eq!(config.ca_path, Some("ca.pem".to_string()));
        assert!(config.server_name.is_none());
    }

    #[test]
    fn test_server_name_override() {
        let config = TlsClientConfig::default().with_server_name("replica.internal");
        assert_eq!(config.server_name, Some("replica.internal".to_string()));
    }

    #[cfg(feature = "tls")]
    #[test]
    fn test_connector_builds_with_system_roots() {
        assert!(TlsConnector::new(TlsClientConfig::default()).is_ok());
    }
}
