//! Framed request/response channel to a peer node.
//!
//! Replication traffic is strictly request/response: the worker sends one
//! length-prefixed frame and reads one length-prefixed frame back. Any
//! failure mid-exchange leaves the stream in an unknown position, so the
//! channel is poisoned on error and must be destroyed by its owner, never
//! returned to the pool.

use bytes::{BufMut, Bytes, BytesMut};
use crn_core::{CairnError, PortKind, Result};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

#[cfg(feature = "tls")]
use tokio_rustls::client::TlsStream;

/// Upper bound on a single wire frame. A metadata or get response larger
/// than this indicates a corrupt length prefix, not a real payload.
pub const MAX_WIRE_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Abstraction over plaintext and TLS streams to a peer.
pub enum ChannelStream {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Transport-level timeouts applied to every send and receive.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// A checked-out connection to one peer endpoint.
pub struct ConnectedChannel {
    host: String,
    port: u16,
    kind: PortKind,
    config: ChannelConfig,
    stream: ChannelStream,
    poisoned: bool,
}

impl ConnectedChannel {
    pub(crate) fn new(
        host: String,
        port: u16,
        kind: PortKind,
        config: ChannelConfig,
        stream: ChannelStream,
    ) -> Self {
        Self {
            host,
            port,
            kind,
            config,
            stream,
            poisoned: false,
        }
    }

    #[inline]
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> PortKind {
        self.kind
    }

    /// A channel that saw any send/receive/decode failure must not be reused.
    #[inline]
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Send one request frame: u32 LE length prefix + payload.
    pub async fn send_request(&mut self, frame: &[u8]) -> Result<()> {
        let mut envelope = BytesMut::with_capacity(4 + frame.len());
        envelope.put_u32_le(frame.len() as u32);
        envelope.put_slice(frame);

        match tokio::time::timeout(
            self.config.write_timeout,
            self.stream.write_all(&envelope),
        )
        .await
        {
            Ok(Ok(())) => {
                match tokio::time::timeout(self.config.write_timeout, self.stream.flush()).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        self.poisoned = true;
                        Err(CairnError::Io(e))
                    },
                    Err(_) => {
                        self.poisoned = true;
                        Err(CairnError::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "Flush timeout",
                        )))
                    },
                }
            },
            Ok(Err(e)) => {
                self.poisoned = true;
                Err(CairnError::Io(e))
            },
            Err(_) => {
                self.poisoned = true;
                Err(CairnError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "Write timeout",
                )))
            },
        }
    }

    /// Receive one response frame.
    pub async fn receive_response(&mut self) -> Result<Bytes> {
        let mut len_buf = [0u8; 4];
        match tokio::time::timeout(
            self.config.read_timeout,
            self.stream.read_exact(&mut len_buf),
        )
        .await
        {
            Ok(Ok(_)) => {},
            Ok(Err(e)) => {
                self.poisoned = true;
                return Err(CairnError::Io(e));
            },
            Err(_) => {
                self.poisoned = true;
                return Err(CairnError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "Read timeout",
                )));
            },
        }

        let length = u32::from_le_bytes(len_buf) as usize;
        if length > MAX_WIRE_FRAME_BYTES {
            self.poisoned = true;
            return Err(CairnError::Protocol(format!(
                "Response frame of {length} bytes exceeds limit"
            )));
        }

        let mut payload = vec![0u8; length];
        if length > 0 {
            match tokio::time::timeout(
                self.config.read_timeout,
                self.stream.read_exact(&mut payload),
            )
            .await
            {
                Ok(Ok(_)) => {},
                Ok(Err(e)) => {
                    self.poisoned = true;
                    return Err(CairnError::Io(e));
                },
                Err(_) => {
                    self.poisoned = true;
                    return Err(CairnError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "Read timeout",
                    )));
                },
            }
        }

        debug!(
            target: "cairn::network",
            host = %self.host,
            port = self.port,
            bytes = length,
            "Received response frame"
        );

        // Bytes::from(Vec) is zero-copy ownership transfer
        Ok(Bytes::from(payload))
    }
}
