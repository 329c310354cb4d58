//! Origin Server Module
//!
//! The origin tier: a TLS server over a flat file store keyed by object
//! name. Each connection carries one bare-name request; the response is the
//! object's bytes terminated by connection close, or the in-band not-found
//! marker when the store has no such object. A missing object is scoped to
//! its connection; it never takes the server down.

use crate::protocol::{
    parse_origin_request, BAD_REQUEST_RESPONSE, NOT_FOUND_RESPONSE, REQUEST_MAX_BYTES,
    UNAVAILABLE_RESPONSE,
};
use crate::shutdown::ShutdownSignal;
use crate::{ProxyError, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// TLS server for the origin tier's flat object store.
pub struct OriginServer {
    listen_addr: SocketAddr,
    tls_acceptor: TlsAcceptor,
    store_dir: PathBuf,
    drain_timeout: Duration,
}

impl OriginServer {
    pub fn new(
        listen_addr: SocketAddr,
        tls_acceptor: TlsAcceptor,
        store_dir: PathBuf,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            listen_addr,
            tls_acceptor,
            store_dir,
            drain_timeout,
        }
    }

    /// Runs the accept loop until shutdown, then drains the workers.
    pub async fn start(&self, mut shutdown_signal: ShutdownSignal) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await.map_err(|e| {
            ProxyError::ConfigError(format!("failed to bind {}: {}", self.listen_addr, e))
        })?;
        info!(
            "origin server listening on {} (store: {})",
            self.listen_addr,
            self.store_dir.display()
        );

        let mut workers: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((tcp_stream, peer_addr)) => {
                            debug!("connection from {}", peer_addr);
                            let acceptor = self.tls_acceptor.clone();
                            let store_dir = self.store_dir.clone();
                            workers.spawn(async move {
                                let mut stream = match acceptor.accept(tcp_stream).await {
                                    Ok(stream) => stream,
                                    Err(e) => {
                                        debug!("TLS handshake with {} failed: {}", peer_addr, e);
                                        return;
                                    }
                                };
                                if let Err(e) = serve_origin_request(&mut stream, &store_dir).await {
                                    error!("connection from {} failed: {}", peer_addr, e);
                                }
                                if let Err(e) = stream.shutdown().await {
                                    debug!("close of connection from {} failed: {}", peer_addr, e);
                                }
                            });
                            while workers.try_join_next().is_some() {}
                        }
                        Err(e) => {
                            error!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("origin server received shutdown signal, stopping accept loop");
                    break;
                }
            }
        }

        let open = workers.len();
        if open > 0 {
            info!("draining {} in-flight connections", open);
            let drained = tokio::time::timeout(self.drain_timeout, async {
                while workers.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("drain timed out, aborting {} connections", workers.len());
                workers.shutdown().await;
            }
        }

        info!("origin server stopped");
        Ok(())
    }
}

/// Serves one bare-name request from the flat store.
///
/// Validation happens here as well as at the proxy: the origin never trusts
/// the peer to have rejected traversal sequences.
pub async fn serve_origin_request<S>(stream: &mut S, store_dir: &Path) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; REQUEST_MAX_BYTES];
    let n = loop {
        match stream.read(&mut buf).await {
            Ok(n) => break n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(ProxyError::ConnectionError(format!(
                    "failed to read request: {}",
                    e
                )));
            }
        }
    };
    if n == 0 {
        debug!("peer closed before sending a request");
        return Ok(());
    }

    let name = match parse_origin_request(&buf[..n]) {
        Ok(name) => name,
        Err(e) => {
            debug!("rejecting malformed request: {}", e);
            return send(stream, BAD_REQUEST_RESPONSE).await;
        }
    };

    let path = store_dir.join(name.as_str());
    match std::fs::read(&path) {
        Ok(body) => {
            debug!("serving {} ({} bytes)", name, body.len());
            send(stream, &body).await
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("requested object {} is not in the store", name);
            send(stream, NOT_FOUND_RESPONSE).await
        }
        Err(e) => {
            warn!("failed to read {}: {}", path.display(), e);
            send(stream, UNAVAILABLE_RESPONSE).await
        }
    }
}

async fn send<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> Result<()> {
    stream.write_all(bytes).await.map_err(|e| {
        ProxyError::ConnectionError(format!("failed to write response: {}", e))
    })?;
    stream.flush().await.map_err(|e| {
        ProxyError::ConnectionError(format!("failed to flush response: {}", e))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::duplex;

    async fn roundtrip(store_dir: &Path, request: &[u8]) -> Vec<u8> {
        let (mut client, mut server) = duplex(64 * 1024);
        let store_dir = store_dir.to_path_buf();
        let task = tokio::spawn(async move {
            serve_origin_request(&mut server, &store_dir).await.unwrap();
            server.shutdown().await.unwrap();
        });

        client.write_all(request).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        task.await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serves_stored_object() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), b"<html>57 bytes</html>").unwrap();

        let response = roundtrip(dir.path(), b"index.html").await;
        assert_eq!(&response[..], b"<html>57 bytes</html>");
    }

    #[tokio::test]
    async fn test_missing_object_yields_marker_not_crash() {
        let dir = TempDir::new().unwrap();

        let response = roundtrip(dir.path(), b"missing.txt").await;
        assert_eq!(&response[..], NOT_FOUND_RESPONSE);

        // The store keeps serving after a miss; the fault was scoped to
        // the one connection.
        std::fs::write(dir.path().join("present.txt"), b"still here").unwrap();
        let response = roundtrip(dir.path(), b"present.txt").await;
        assert_eq!(&response[..], b"still here");
    }

    #[tokio::test]
    async fn test_traversal_is_rejected() {
        let dir = TempDir::new().unwrap();
        let response = roundtrip(dir.path(), b"../etc/passwd").await;
        assert_eq!(&response[..], BAD_REQUEST_RESPONSE);
    }

    #[tokio::test]
    async fn test_empty_request_is_rejected() {
        let dir = TempDir::new().unwrap();
        let response = roundtrip(dir.path(), b"   \n").await;
        assert_eq!(&response[..], BAD_REQUEST_RESPONSE);
    }
}
