//! Object Proxy - Sharded caching TLS proxy for named-object delivery
//!
//! This library provides the core functionality of the proxy tier
//! (rendezvous shard routing, per-shard bloom-filter blacklisting,
//! cache-on-miss object delivery) together with the origin tier it fetches
//! from and the request client that shares its routing.

pub mod bloom;
pub mod cache_store;
pub mod config;
pub mod error;
pub mod inflight;
pub mod logging;
pub mod origin_client;
pub mod origin_server;
pub mod protocol;
pub mod proxy;
pub mod rendezvous;
pub mod shutdown;
pub mod tls;

pub use error::{ProxyError, Result};
