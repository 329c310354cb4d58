use object_proxy::{
    bloom::BlacklistIndex,
    cache_store::ObjectCacheStore,
    config::Config,
    inflight::FlightTracker,
    logging,
    origin_client::OriginClient,
    proxy::{ProxyServer, ProxyState},
    rendezvous::ShardSet,
    shutdown::{ShutdownCoordinator, ShutdownSignal},
    tls, Result,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration faults are fatal here, before any listener opens.
    let config = Config::load()?;
    logging::init(&config.logging)?;

    info!(
        "starting object proxy v{} (built: {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP")
    );

    tls::install_crypto_provider();

    let shards = ShardSet::new(config.shards.clone())?;
    info!("shard set: {:?}", shards.labels());

    // The blacklist filters must exist before the first connection is
    // accepted; they are immutable afterwards and refresh needs a restart.
    let blacklist = BlacklistIndex::load(
        &config.blacklist.path,
        &shards,
        config.blacklist.expected_items,
        config.blacklist.false_positive_rate,
    )?;

    let cache = ObjectCacheStore::new(config.cache.cache_dir.clone());
    cache.initialize()?;

    let connector = tls::client_connector(&config.tls.ca_path)?;
    let origin = OriginClient::new(&config.origin, connector)?;
    let acceptor = tls::server_acceptor(&config.tls.cert_path, &config.tls.key_path)?;

    info!(
        "upstream origin: {} (fetch timeout {:?})",
        config.origin.address, config.origin.fetch_timeout
    );

    let state = Arc::new(ProxyState {
        shards,
        blacklist,
        cache,
        origin,
        inflight: FlightTracker::new(),
    });

    let listen_addr = SocketAddr::from(([0, 0, 0, 0], config.server.listen_port));
    let server = ProxyServer::new(listen_addr, acceptor, state, config.server.drain_timeout);

    let shutdown_coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
    let server_shutdown = ShutdownSignal::new(shutdown_coordinator.subscribe());

    let server_task = tokio::spawn(async move {
        if let Err(e) = server.start(server_shutdown).await {
            error!("proxy server failed: {}", e);
        }
    });

    shutdown_coordinator.listen_for_shutdown().await?;

    match tokio::time::timeout(shutdown_coordinator.shutdown_timeout(), server_task).await {
        Ok(_) => info!("object proxy shutdown complete"),
        Err(_) => warn!("shutdown timed out waiting for the server task"),
    }
    Ok(())
}
