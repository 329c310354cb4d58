//! Configuration Module
//!
//! Handles configuration loading from a YAML file, environment variables,
//! and command-line arguments, in that override order. Every section
//! carries serde defaults and a `validate()` that runs before the process
//! opens any listener; configuration faults are fatal at startup.

use crate::{ProxyError, Result};
use clap::{Arg, Command};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Custom deserializer for Duration from string format like "30s", "5m"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration string".to_string());
        }

        let mut num_end = 0;
        for (i, c) in s.chars().enumerate() {
            if c.is_ascii_digit() || c == '.' {
                num_end = i + 1;
            } else {
                break;
            }
        }
        if num_end == 0 {
            return Err(format!("no number found in duration string: {}", s));
        }

        let value: f64 = s[..num_end]
            .parse()
            .map_err(|e| format!("failed to parse number '{}': {}", &s[..num_end], e))?;

        let duration = match s[num_end..].trim() {
            "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            "ms" | "millis" | "millisecond" | "milliseconds" => {
                Duration::from_secs_f64(value / 1000.0)
            }
            "" => Duration::from_secs_f64(value),
            unit => return Err(format!("unknown duration unit: {}", unit)),
        };
        Ok(duration)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub origin: OriginConfig,
    /// Ordered shard labels; the order is part of the routing contract and
    /// must match on every client and proxy instance.
    #[serde(default = "default_shards")]
    pub shards: Vec<String>,
    #[serde(default)]
    pub blacklist: BlacklistConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub origin_store: OriginStoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Proxy listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Bound on waiting for in-flight connections after the accept loop
    /// stops; stragglers are aborted once it elapses.
    #[serde(
        deserialize_with = "duration_serde::deserialize",
        default = "default_drain_timeout"
    )]
    pub drain_timeout: Duration,
}

fn default_listen_port() -> u16 {
    4433
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

/// Upstream origin configuration, from the proxy's point of view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    /// Upstream address as a `host:port` token.
    #[serde(default = "default_origin_address")]
    pub address: String,
    /// Overall budget for one fetch (connect, handshake, read to EOF);
    /// expiry cancels the fetch and the waiting client gets a defined
    /// failure instead of hanging on a stalled origin.
    #[serde(
        deserialize_with = "duration_serde::deserialize",
        default = "default_fetch_timeout"
    )]
    pub fetch_timeout: Duration,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
}

fn default_origin_address() -> String {
    "localhost:4434".to_string()
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_retries() -> u32 {
    3
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            address: default_origin_address(),
            fetch_timeout: default_fetch_timeout(),
            connect_retries: default_connect_retries(),
        }
    }
}

impl OriginConfig {
    /// Splits the configured `host:port` token.
    pub fn host_port(&self) -> Result<(String, u16)> {
        let (host, port) = self.address.rsplit_once(':').ok_or_else(|| {
            ProxyError::ConfigError(format!(
                "origin address must be host:port, got {}",
                self.address
            ))
        })?;
        if host.is_empty() {
            return Err(ProxyError::ConfigError(format!(
                "origin address has an empty host: {}",
                self.address
            )));
        }
        let port: u16 = port.parse().map_err(|_| {
            ProxyError::ConfigError(format!("origin address has an invalid port: {}", self.address))
        })?;
        Ok((host.to_string(), port))
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.host_port().map_err(|e| e.to_string())?;
        if self.fetch_timeout.is_zero() {
            return Err("origin fetch_timeout must be positive".to_string());
        }
        if self.connect_retries == 0 {
            return Err("origin connect_retries must be at least 1".to_string());
        }
        Ok(())
    }
}

fn default_shards() -> Vec<String> {
    ["one", "two", "three", "four", "five", "six"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Blacklist source and filter sizing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistConfig {
    #[serde(default = "default_blacklist_path")]
    pub path: PathBuf,
    /// Sizing inputs for each per-shard bloom filter.
    #[serde(default = "default_blacklist_expected_items")]
    pub expected_items: usize,
    #[serde(default = "default_blacklist_false_positive_rate")]
    pub false_positive_rate: f64,
}

fn default_blacklist_path() -> PathBuf {
    PathBuf::from("./proxy_files/blacklisted_objects")
}

fn default_blacklist_expected_items() -> usize {
    10_000
}

fn default_blacklist_false_positive_rate() -> f64 {
    0.01
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            path: default_blacklist_path(),
            expected_items: default_blacklist_expected_items(),
            false_positive_rate: default_blacklist_false_positive_rate(),
        }
    }
}

impl BlacklistConfig {
    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.expected_items == 0 {
            return Err("blacklist expected_items must be positive".to_string());
        }
        if !(self.false_positive_rate > 0.0 && self.false_positive_rate < 1.0) {
            return Err(format!(
                "blacklist false_positive_rate must be in (0, 1), got {}",
                self.false_positive_rate
            ));
        }
        Ok(())
    }
}

/// Cache storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./proxy_cache")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
        }
    }
}

/// TLS material paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    /// Trust root used for outbound sessions (proxy→origin, client→proxy).
    #[serde(default = "default_ca_path")]
    pub ca_path: PathBuf,
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("./certs/server.crt")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("./certs/server.key")
}

fn default_ca_path() -> PathBuf {
    PathBuf::from("./certs/root.pem")
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            ca_path: default_ca_path(),
        }
    }
}

/// Origin-server tier configuration (used by the origin-server binary)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginStoreConfig {
    #[serde(default = "default_origin_listen_port")]
    pub listen_port: u16,
    /// Flat file store keyed by object name.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

fn default_origin_listen_port() -> u16 {
    4434
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("./origin_files")
}

impl Default for OriginStoreConfig {
    fn default() -> Self {
        Self {
            listen_port: default_origin_listen_port(),
            store_dir: default_store_dir(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// When set, application logs also go to a daily-rolling file here.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            origin: OriginConfig::default(),
            shards: default_shards(),
            blacklist: BlacklistConfig::default(),
            cache: CacheConfig::default(),
            tls: TlsConfig::default(),
            origin_store: OriginStoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration for the proxy binary: file, then environment,
    /// then CLI flags.
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();

        let mut config = Self::default();
        if let Some(config_path) = matches.get_one::<String>("config") {
            config = Self::load_from_file(config_path)?;
        }

        config.apply_env_overrides();
        config.apply_cli_overrides(&matches);
        config.validate()?;

        info!("configuration loaded");
        Ok(config)
    }

    /// Validates every section; any failure is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if let Err(e) = self.origin.validate() {
            return Err(ProxyError::ConfigError(format!(
                "invalid origin configuration: {}",
                e
            )));
        }
        if let Err(e) = self.blacklist.validate() {
            return Err(ProxyError::ConfigError(format!(
                "invalid blacklist configuration: {}",
                e
            )));
        }
        if self.shards.is_empty() {
            return Err(ProxyError::ConfigError(
                "shard list must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Build CLI argument parser
    fn build_cli() -> Command {
        Command::new("object-proxy")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Sharded caching TLS proxy for named-object delivery")
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
                    .help("Listening port (default: 4433)"),
            )
            .arg(
                Arg::new("origin")
                    .long("origin")
                    .value_name("HOST:PORT")
                    .help("Upstream origin address"),
            )
            .arg(
                Arg::new("blacklist")
                    .long("blacklist")
                    .value_name("FILE")
                    .help("Blacklist source file"),
            )
            .arg(
                Arg::new("cache-dir")
                    .long("cache-dir")
                    .value_name("DIR")
                    .help("Cache directory path"),
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
                Arg::new("ca")
                    .long("ca")
                    .value_name("FILE")
                    .help("Trusted root certificate (PEM)"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (default: info)"),
            )
    }

    /// Load configuration from YAML file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigError(format!("failed to read config file {}: {}", path, e))
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            ProxyError::ConfigError(format!("failed to parse config file {}: {}", path, e))
        })?;
        info!("configuration loaded from file: {}", path);
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("OBJECT_PROXY_PORT") {
            if let Ok(port) = port.parse() {
                self.server.listen_port = port;
            }
        }
        if let Ok(origin) = std::env::var("OBJECT_PROXY_ORIGIN") {
            self.origin.address = origin;
        }
        if let Ok(dir) = std::env::var("OBJECT_PROXY_CACHE_DIR") {
            self.cache.cache_dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("OBJECT_PROXY_LOG_LEVEL") {
            self.logging.log_level = level;
        }
    }

    fn apply_cli_overrides(&mut self, matches: &clap::ArgMatches) {
        if let Some(port) = matches.get_one::<String>("port") {
            if let Ok(port) = port.parse() {
                self.server.listen_port = port;
            }
        }
        if let Some(origin) = matches.get_one::<String>("origin") {
            self.origin.address = origin.clone();
        }
        if let Some(path) = matches.get_one::<String>("blacklist") {
            self.blacklist.path = PathBuf::from(path);
        }
        if let Some(dir) = matches.get_one::<String>("cache-dir") {
            self.cache.cache_dir = PathBuf::from(dir);
        }
        if let Some(path) = matches.get_one::<String>("cert") {
            self.tls.cert_path = PathBuf::from(path);
        }
        if let Some(path) = matches.get_one::<String>("key") {
            self.tls.key_path = PathBuf::from(path);
        }
        if let Some(path) = matches.get_one::<String>("ca") {
            self.tls.ca_path = PathBuf::from(path);
        }
        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = level.clone();
        }
    }
}
