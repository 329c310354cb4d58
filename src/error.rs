//! Error Module
//!
//! Defines error types and result types used throughout the object proxy.

use thiserror::Error;

/// Main error type for the object proxy
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    /// Fatal at startup; the process must not begin accepting connections.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    /// Transport fault scoped to a single connection.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Malformed request or unknown shard name.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The origin does not hold the requested object.
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Cache storage fault; surfaced to the requester as transient.
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Origin fetch failed after retries.
    #[error("Fetch error: {0}")]
    FetchError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::ConfigError(err.to_string())
    }
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::TlsError(err.to_string())
    }
}

/// Result type alias for the object proxy
pub type Result<T> = std::result::Result<T, ProxyError>;
