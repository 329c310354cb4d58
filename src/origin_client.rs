//! Origin Client Module
//!
//! Fetches objects from the origin tier on cache miss. Each fetch opens one
//! new outbound TLS session, sends the bare object name, and reads until
//! the origin closes the stream; stream termination is the only length
//! signal. A configurable timeout bounds the whole fetch, and a hard fault
//! is reported to the caller as a fetch failure, never a process abort.

use crate::config::OriginConfig;
use crate::protocol::{ObjectName, NOT_FOUND_RESPONSE};
use crate::{ProxyError, Result};
use bytes::Bytes;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Per-attempt bound on establishing the TCP connection; the overall
/// fetch timeout still caps the sum.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of origin objects, abstracted so the request path can be
/// exercised without a live origin tier.
pub trait ObjectFetcher: Send + Sync + 'static {
    fn fetch(&self, name: &ObjectName) -> impl Future<Output = Result<Bytes>> + Send;
}

/// TLS client for the origin tier; one session per fetch.
pub struct OriginClient {
    host: String,
    port: u16,
    connector: TlsConnector,
    fetch_timeout: Duration,
    connect_retries: u32,
}

impl OriginClient {
    pub fn new(config: &OriginConfig, connector: TlsConnector) -> Result<Self> {
        let (host, port) = config.host_port()?;
        Ok(Self {
            host,
            port,
            connector,
            fetch_timeout: config.fetch_timeout,
            connect_retries: config.connect_retries,
        })
    }

    async fn fetch_inner(&self, name: &ObjectName) -> Result<Bytes> {
        let tcp = self.connect_with_retry().await?;
        if let Err(e) = tcp.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY for origin connection: {}", e);
        }

        let server_name = ServerName::try_from(self.host.clone()).map_err(|e| {
            ProxyError::TlsError(format!("invalid origin server name '{}': {}", self.host, e))
        })?;
        let mut stream = self.connector.connect(server_name, tcp).await.map_err(|e| {
            ProxyError::TlsError(format!(
                "TLS handshake with origin {}:{} failed: {}",
                self.host, self.port, e
            ))
        })?;

        stream
            .write_all(name.as_str().as_bytes())
            .await
            .map_err(|e| {
                ProxyError::FetchError(format!("failed to send request to origin: {}", e))
            })?;
        stream.flush().await.map_err(|e| {
            ProxyError::FetchError(format!("failed to flush request to origin: {}", e))
        })?;

        // Read until the origin closes the stream.
        let mut body = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => body.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(ProxyError::FetchError(format!(
                        "failed to read origin response: {}",
                        e
                    )));
                }
            }
        }

        debug!(
            "origin fetch complete: object={} ({} bytes)",
            name,
            body.len()
        );
        decode_fetch_response(name, body)
    }

    /// Connect to the origin with retry and exponential backoff.
    async fn connect_with_retry(&self) -> Result<TcpStream> {
        let mut last_error = None;

        for attempt in 1..=self.connect_retries {
            match tokio::time::timeout(
                CONNECT_ATTEMPT_TIMEOUT,
                TcpStream::connect((self.host.as_str(), self.port)),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    if attempt > 1 {
                        debug!(
                            "connected to origin {}:{} on attempt {}",
                            self.host, self.port, attempt
                        );
                    }
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    warn!(
                        "origin connection attempt {} to {}:{} failed: {}",
                        attempt, self.host, self.port, e
                    );
                    last_error = Some(e.to_string());
                }
                Err(_) => {
                    warn!(
                        "origin connection attempt {} to {}:{} timed out",
                        attempt, self.host, self.port
                    );
                    last_error = Some("connection timeout".to_string());
                }
            }

            if attempt < self.connect_retries {
                // 100ms, 200ms, 400ms, ...
                let delay = Duration::from_millis(100 * (1 << (attempt - 1)));
                tokio::time::sleep(delay).await;
            }
        }

        Err(ProxyError::ConnectionError(format!(
            "failed to connect to origin {}:{} after {} attempts: {}",
            self.host,
            self.port,
            self.connect_retries,
            last_error.unwrap_or_else(|| "unknown error".to_string())
        )))
    }
}

impl ObjectFetcher for OriginClient {
    /// Fetches `name` from the origin within the configured timeout.
    async fn fetch(&self, name: &ObjectName) -> Result<Bytes> {
        match tokio::time::timeout(self.fetch_timeout, self.fetch_inner(name)).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::TimeoutError(format!(
                "origin fetch for {} exceeded {:?}",
                name, self.fetch_timeout
            ))),
        }
    }
}

/// Maps the origin's in-band not-found marker onto the error taxonomy;
/// everything else is the object body.
fn decode_fetch_response(name: &ObjectName, body: Vec<u8>) -> Result<Bytes> {
    if body == NOT_FOUND_RESPONSE {
        return Err(ProxyError::NotFound(name.as_str().to_string()));
    }
    Ok(Bytes::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> ObjectName {
        ObjectName::parse(s).unwrap()
    }

    #[test]
    fn test_decode_not_found_marker() {
        let err = decode_fetch_response(&name("missing.txt"), NOT_FOUND_RESPONSE.to_vec())
            .unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }

    #[test]
    fn test_decode_body_passes_through() {
        let body = b"object contents".to_vec();
        let bytes = decode_fetch_response(&name("a.txt"), body.clone()).unwrap();
        assert_eq!(&bytes[..], &body[..]);
    }

    #[test]
    fn test_decode_empty_body_is_empty_object() {
        let bytes = decode_fetch_response(&name("empty"), Vec::new()).unwrap();
        assert!(bytes.is_empty());
    }
}
