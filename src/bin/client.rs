use clap::{Arg, Command};
use object_proxy::{
    config::Config, logging, protocol::ObjectName, rendezvous::ShardSet, tls, ProxyError, Result,
};
use rustls::pki_types::ServerName;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

fn build_cli() -> Command {
    Command::new("object-client")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Requests objects through the sharded proxy tier")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (shard list and trust root)"),
        )
        .arg(
            Arg::new("proxy")
                .long("proxy")
                .value_name("HOST:PORT")
                .default_value("localhost:4433")
                .help("Proxy address"),
        )
        .arg(
            Arg::new("ca")
                .long("ca")
                .value_name("FILE")
                .help("Trusted root certificate (PEM)"),
        )
        .arg(
            Arg::new("requests")
                .value_name("FILE")
                .required(true)
                .help("File of whitespace-separated object names to request"),
        )
}

/// One TLS session per requested object, mirroring the proxy's
/// connection-per-request protocol.
async fn request_object(
    connector: &TlsConnector,
    host: &str,
    port: u16,
    shard: &str,
    name: &ObjectName,
) -> Result<Vec<u8>> {
    let tcp = TcpStream::connect((host, port)).await.map_err(|e| {
        ProxyError::ConnectionError(format!("failed to connect to proxy {}:{}: {}", host, port, e))
    })?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ProxyError::TlsError(format!("invalid proxy server name '{}': {}", host, e)))?;
    let mut stream = connector.connect(server_name, tcp).await.map_err(|e| {
        ProxyError::TlsError(format!("TLS handshake with proxy failed: {}", e))
    })?;

    let request = format!("{} {}", shard, name);
    stream.write_all(request.as_bytes()).await.map_err(|e| {
        ProxyError::ConnectionError(format!("failed to send request: {}", e))
    })?;
    stream.flush().await.map_err(|e| {
        ProxyError::ConnectionError(format!("failed to flush request: {}", e))
    })?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.map_err(|e| {
        ProxyError::ConnectionError(format!("failed to read response: {}", e))
    })?;
    Ok(response)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    if let Some(path) = matches.get_one::<String>("ca") {
        config.tls.ca_path = PathBuf::from(path);
    }

    logging::init(&config.logging)?;
    tls::install_crypto_provider();

    let proxy_addr = matches
        .get_one::<String>("proxy")
        .expect("proxy has a default value");
    let (host, port) = proxy_addr.rsplit_once(':').ok_or_else(|| {
        ProxyError::ConfigError(format!("proxy address must be host:port, got {}", proxy_addr))
    })?;
    let port: u16 = port.parse().map_err(|_| {
        ProxyError::ConfigError(format!("proxy address has an invalid port: {}", proxy_addr))
    })?;

    // The client runs the identical routing computation as the proxy; both
    // sides agree on ownership without communicating.
    let shards = ShardSet::new(config.shards.clone())?;
    let connector = tls::client_connector(&config.tls.ca_path)?;

    let request_file = matches
        .get_one::<String>("requests")
        .expect("requests is required");
    let request_list = std::fs::read_to_string(request_file).map_err(|e| {
        ProxyError::ConfigError(format!(
            "failed to read request file {}: {}",
            request_file, e
        ))
    })?;

    let stdout = std::io::stdout();
    for raw_name in request_list.split_whitespace() {
        let name = match ObjectName::parse(raw_name) {
            Ok(name) => name,
            Err(e) => {
                warn!("skipping invalid object name {:?}: {}", raw_name, e);
                continue;
            }
        };
        let shard = shards.select_label(name.as_str());
        info!("requesting {} from shard {}", name, shard);

        match request_object(&connector, host, port, shard, &name).await {
            Ok(response) => {
                let mut out = stdout.lock();
                out.write_all(&response)
                    .and_then(|_| out.flush())
                    .map_err(|e| {
                        ProxyError::IoError(format!("failed to write response: {}", e))
                    })?;
            }
            Err(e) => {
                warn!("request for {} failed: {}", name, e);
            }
        }
    }

    Ok(())
}
