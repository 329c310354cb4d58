//! Proxy Server Module
//!
//! The client-facing tier: terminates one TLS session per connection,
//! decodes the `"<shard> <object>"` request, and walks the per-connection
//! state machine: resolve shard → blacklist check → cache check → origin
//! fetch and cache populate → stream response → flush → close.
//!
//! Every accepted connection runs in its own spawned task tracked by a
//! `JoinSet`; workers share only the read-only shard set and blacklist
//! filters, the filesystem-backed cache store, and the flight tracker.
//! A transport fault terminates only its own connection. On shutdown the
//! accept loop stops, in-flight workers drain within the configured bound,
//! and stragglers are aborted.

use crate::bloom::{BlacklistIndex, BloomLookup};
use crate::cache_store::ObjectCacheStore;
use crate::inflight::{FetchRole, FlightTracker};
use crate::origin_client::ObjectFetcher;
use crate::protocol::{
    ObjectName, Request, BAD_REQUEST_RESPONSE, BLACKLISTED_RESPONSE, NOT_FOUND_RESPONSE,
    REQUEST_MAX_BYTES, UNAVAILABLE_RESPONSE,
};
use crate::rendezvous::ShardSet;
use crate::shutdown::ShutdownSignal;
use crate::{ProxyError, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// How many times a miss re-registers with the flight tracker after its
/// fetcher was abandoned before giving up.
const MISS_ATTEMPTS: usize = 3;

/// State shared by every connection worker.
pub struct ProxyState<F: ObjectFetcher> {
    pub shards: ShardSet,
    pub blacklist: BlacklistIndex,
    pub cache: ObjectCacheStore,
    pub origin: F,
    pub inflight: FlightTracker,
}

/// Client-facing TLS listener.
pub struct ProxyServer<F: ObjectFetcher> {
    listen_addr: SocketAddr,
    tls_acceptor: TlsAcceptor,
    drain_timeout: Duration,
    state: Arc<ProxyState<F>>,
}

impl<F: ObjectFetcher> ProxyServer<F> {
    pub fn new(
        listen_addr: SocketAddr,
        tls_acceptor: TlsAcceptor,
        state: Arc<ProxyState<F>>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            listen_addr,
            tls_acceptor,
            drain_timeout,
            state,
        }
    }

    /// Runs the accept loop until shutdown, then drains the workers.
    pub async fn start(&self, mut shutdown_signal: ShutdownSignal) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await.map_err(|e| {
            ProxyError::ConfigError(format!("failed to bind {}: {}", self.listen_addr, e))
        })?;
        info!("proxy listening on {}", self.listen_addr);

        let mut workers: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((tcp_stream, peer_addr)) => {
                            debug!("connection from {}", peer_addr);
                            let acceptor = self.tls_acceptor.clone();
                            let state = Arc::clone(&self.state);
                            workers.spawn(async move {
                                handle_connection(acceptor, tcp_stream, peer_addr, state).await;
                            });
                            // Opportunistically reclaim finished workers so the
                            // set doesn't grow with connection count.
                            while workers.try_join_next().is_some() {}
                        }
                        Err(e) => {
                            error!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("proxy received shutdown signal, stopping accept loop");
                    break;
                }
            }
        }

        self.drain(workers).await;
        info!("proxy stopped");
        Ok(())
    }

    /// Waits for in-flight connections up to the drain bound, then aborts
    /// whatever is left.
    async fn drain(&self, mut workers: JoinSet<()>) {
        let open = workers.len();
        if open == 0 {
            return;
        }
        info!("draining {} in-flight connections", open);
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "drain timed out after {:?}, aborting {} connections",
                self.drain_timeout,
                workers.len()
            );
            workers.shutdown().await;
        }
    }
}

/// TLS handshake plus request service for one accepted connection.
async fn handle_connection<F: ObjectFetcher>(
    acceptor: TlsAcceptor,
    tcp_stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ProxyState<F>>,
) {
    let mut stream = match acceptor.accept(tcp_stream).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("TLS handshake with {} failed: {}", peer_addr, e);
            return;
        }
    };

    let result = serve_connection(&mut stream, &state).await;

    // The whole response must be flushed before close; shutdown also sends
    // the TLS close_notify so the client sees a clean end of stream.
    if let Err(e) = stream.shutdown().await {
        debug!("close of connection from {} failed: {}", peer_addr, e);
    }

    if let Err(e) = result {
        let err_str = e.to_string();
        if err_str.contains("connection closed")
            || err_str.contains("broken pipe")
            || err_str.contains("reset by peer")
        {
            debug!("client {} disconnected: {}", peer_addr, e);
        } else {
            error!("connection from {} failed: {}", peer_addr, e);
        }
    }
}

/// Serves exactly one request on an established session.
///
/// Protocol faults are answered in-band and return `Ok`; only transport
/// faults surface as errors, and those terminate just this connection.
pub async fn serve_connection<S, F>(stream: &mut S, state: &ProxyState<F>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: ObjectFetcher,
{
    // The transport message boundary is the message boundary: one bounded
    // read yields the whole request.
    let mut buf = [0u8; REQUEST_MAX_BYTES];
    let n = read_request(stream, &mut buf).await?;
    if n == 0 {
        debug!("client closed before sending a request");
        return Ok(());
    }

    let request = match Request::parse(&buf[..n]) {
        Ok(request) => request,
        Err(e) => {
            debug!("rejecting malformed request: {}", e);
            return send_response(stream, BAD_REQUEST_RESPONSE).await;
        }
    };

    let shard_idx = match state.shards.resolve(&request.shard_label) {
        Some(idx) => idx,
        None => {
            debug!("rejecting request for unknown shard {}", request.shard_label);
            return send_response(stream, BAD_REQUEST_RESPONSE).await;
        }
    };
    let shard = state.shards.label(shard_idx);
    debug!("request: shard={} object={}", shard, request.object);

    // Deny before any I/O: possibly-present is a deny.
    if state.blacklist.lookup(shard_idx, request.object.as_str()) == BloomLookup::PossiblyPresent {
        info!("denied blacklisted object {} on shard {}", request.object, shard);
        return send_response(stream, BLACKLISTED_RESPONSE).await;
    }

    match state.cache.get(shard, &request.object).await {
        Ok(Some(bytes)) => {
            debug!(
                "serving {} from shard {} cache ({} bytes)",
                request.object,
                shard,
                bytes.len()
            );
            return send_response(stream, &bytes).await;
        }
        Ok(None) => {}
        Err(e) => {
            warn!("cache read for {} failed: {}", request.object, e);
            return send_response(stream, UNAVAILABLE_RESPONSE).await;
        }
    }

    match fetch_coalesced(state, shard, &request.object).await {
        Ok(bytes) => {
            debug!(
                "serving {} fetched from origin ({} bytes)",
                request.object,
                bytes.len()
            );
            send_response(stream, &bytes).await
        }
        Err(ProxyError::NotFound(_)) => {
            info!("origin does not hold {}", request.object);
            send_response(stream, NOT_FOUND_RESPONSE).await
        }
        Err(e) => {
            warn!("fetch for {} failed: {}", request.object, e);
            send_response(stream, UNAVAILABLE_RESPONSE).await
        }
    }
}

/// Resolves a cache miss with at most one outstanding origin fetch per
/// `(shard, object)` key.
///
/// The first miss becomes the Fetcher: it fetches, publishes the entry to
/// the cache, and serves by re-reading the durable entry (read-after-write).
/// Concurrent misses wait for the Fetcher's notification and then read the
/// same entry. If a fetcher is abandoned mid-flight its waiters re-register
/// and one of them takes over.
async fn fetch_coalesced<F: ObjectFetcher>(
    state: &ProxyState<F>,
    shard: &str,
    name: &ObjectName,
) -> Result<Bytes> {
    let key = FlightTracker::flight_key(shard, name);

    for _ in 0..MISS_ATTEMPTS {
        match state.inflight.register(&key) {
            FetchRole::Fetcher(guard) => {
                debug!("cache miss, fetching {} from origin", name);
                let bytes = match state.origin.fetch(name).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        guard.complete_err(e.clone());
                        return Err(e);
                    }
                };
                if let Err(e) = state.cache.put(shard, name, &bytes).await {
                    guard.complete_err(e.clone());
                    return Err(e);
                }
                guard.complete_ok();

                return state.cache.get(shard, name).await?.ok_or_else(|| {
                    ProxyError::CacheError(format!(
                        "cache entry for {} vanished after write",
                        name
                    ))
                });
            }
            FetchRole::Waiter(mut rx) => {
                debug!("awaiting in-flight fetch of {}", name);
                match rx.recv().await {
                    Ok(Ok(())) => {
                        if let Some(bytes) = state.cache.get(shard, name).await? {
                            return Ok(bytes);
                        }
                        // Entry is missing despite a success signal; take
                        // over the fetch on the next attempt.
                        warn!("fetched entry for {} not readable, retrying", name);
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        debug!("fetcher for {} was abandoned, retrying", name);
                    }
                }
            }
        }
    }

    Err(ProxyError::FetchError(format!(
        "fetch for {} abandoned {} times",
        name, MISS_ATTEMPTS
    )))
}

/// One bounded request read, retrying the resumable interruption case.
async fn read_request<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut [u8]) -> Result<usize> {
    loop {
        match stream.read(buf).await {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(ProxyError::ConnectionError(format!(
                    "failed to read request: {}",
                    e
                )));
            }
        }
    }
}

/// Writes and flushes the entire response before the caller closes.
async fn send_response<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> Result<()> {
    stream.write_all(bytes).await.map_err(|e| {
        ProxyError::ConnectionError(format!("failed to write response: {}", e))
    })?;
    stream.flush().await.map_err(|e| {
        ProxyError::ConnectionError(format!("failed to flush response: {}", e))
    })?;
    Ok(())
}
