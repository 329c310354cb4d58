use clap::{Arg, Command};
use object_proxy::{
    config::Config, logging, origin_server::OriginServer, shutdown::ShutdownCoordinator,
    shutdown::ShutdownSignal, tls, Result,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

fn build_cli() -> Command {
    Command::new("origin-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Origin tier: flat object store behind TLS")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Listening port (default: 4434)"),
        )
        .arg(
            Arg::new("store-dir")
                .long("store-dir")
                .value_name("DIR")
                .help("Object store directory"),
        )
        .arg(
            Arg::new("cert")
                .long("cert")
                .value_name("FILE")
                .help("Server certificate (PEM)"),
        )
        .arg(
            Arg::new("key")
                .long("key")
                .value_name("FILE")
                .help("Server private key (PEM)"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (default: info)"),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    config.apply_env_overrides();
    if let Some(port) = matches.get_one::<String>("port") {
        if let Ok(port) = port.parse() {
            config.origin_store.listen_port = port;
        }
    }
    if let Some(dir) = matches.get_one::<String>("store-dir") {
        config.origin_store.store_dir = PathBuf::from(dir);
    }
    if let Some(path) = matches.get_one::<String>("cert") {
        config.tls.cert_path = PathBuf::from(path);
    }
    if let Some(path) = matches.get_one::<String>("key") {
        config.tls.key_path = PathBuf::from(path);
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.log_level = level.clone();
    }

    logging::init(&config.logging)?;
    info!(
        "starting origin server v{} (built: {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP")
    );

    tls::install_crypto_provider();
    let acceptor = tls::server_acceptor(&config.tls.cert_path, &config.tls.key_path)?;

    let listen_addr = SocketAddr::from(([0, 0, 0, 0], config.origin_store.listen_port));
    let server = OriginServer::new(
        listen_addr,
        acceptor,
        config.origin_store.store_dir.clone(),
        config.server.drain_timeout,
    );

    let shutdown_coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
    let server_shutdown = ShutdownSignal::new(shutdown_coordinator.subscribe());

    let server_task = tokio::spawn(async move {
        if let Err(e) = server.start(server_shutdown).await {
            error!("origin server failed: {}", e);
        }
    });

    shutdown_coordinator.listen_for_shutdown().await?;

    match tokio::time::timeout(shutdown_coordinator.shutdown_timeout(), server_task).await {
        Ok(_) => info!("origin server shutdown complete"),
        Err(_) => warn!("shutdown timed out waiting for the server task"),
    }
    Ok(())
}
