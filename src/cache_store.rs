//! Object Cache Store Module
//!
//! Durable per-shard key→bytes store backed by the filesystem. One file per
//! object under `cache_dir/<shard>/<object>`. Entries are created on first
//! successful origin fetch and are immutable thereafter; there is no
//! deletion or refresh path short of clearing the directory and restarting.
//!
//! Writes go to a temp file inside the shard's `.tmp` directory and are
//! renamed into place, so a reader racing a first write either sees the
//! complete entry or no entry at all.

use crate::protocol::ObjectName;
use crate::{ProxyError, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the staging directory inside each shard directory. Object names
/// may not start with `.`, so no object can collide with it.
const TMP_DIR: &str = ".tmp";

/// Filesystem-backed cache of origin objects, one namespace per shard.
pub struct ObjectCacheStore {
    cache_dir: PathBuf,
}

impl ObjectCacheStore {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    /// Creates the cache directory. Called once at startup.
    pub fn initialize(&self) -> Result<()> {
        std::fs::create_dir_all(&self.cache_dir).map_err(|e| {
            ProxyError::CacheError(format!(
                "failed to create cache directory {}: {}",
                self.cache_dir.display(),
                e
            ))
        })?;
        info!("object cache store ready at {}", self.cache_dir.display());
        Ok(())
    }

    /// Reads the cached bytes for `(shard, name)`, or `None` on a miss.
    pub async fn get(&self, shard: &str, name: &ObjectName) -> Result<Option<Bytes>> {
        let path = self.entry_path(shard, name);
        match std::fs::read(&path) {
            Ok(data) => {
                debug!(
                    "cache hit: shard={} object={} ({} bytes)",
                    shard,
                    name,
                    data.len()
                );
                Ok(Some(Bytes::from(data)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("cache miss: shard={} object={}", shard, name);
                Ok(None)
            }
            Err(e) => Err(ProxyError::CacheError(format!(
                "failed to read cache entry {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Durably stores `bytes` under `(shard, name)`.
    ///
    /// The bytes land in a staging file first and become visible only via
    /// the final rename; a concurrent `get` never observes a partial entry.
    /// Concurrent writers to the same key are excluded upstream by the
    /// flight tracker; if one slips through, the last rename wins whole.
    pub async fn put(&self, shard: &str, name: &ObjectName, bytes: &[u8]) -> Result<()> {
        let tmp_dir = self.cache_dir.join(shard).join(TMP_DIR);
        std::fs::create_dir_all(&tmp_dir).map_err(|e| {
            ProxyError::CacheError(format!(
                "failed to create staging directory {}: {}",
                tmp_dir.display(),
                e
            ))
        })?;

        let tmp_path = tmp_dir.join(name.as_str());
        let final_path = self.entry_path(shard, name);

        std::fs::write(&tmp_path, bytes).map_err(|e| {
            ProxyError::CacheError(format!(
                "failed to write staging file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        if let Err(e) = std::fs::rename(&tmp_path, &final_path) {
            // Don't leave the staging file behind on failure.
            let _ = std::fs::remove_file(&tmp_path);
            return Err(ProxyError::CacheError(format!(
                "failed to publish cache entry {}: {}",
                final_path.display(),
                e
            )));
        }

        debug!(
            "cache populate: shard={} object={} ({} bytes)",
            shard,
            name,
            bytes.len()
        );
        Ok(())
    }

    /// Root directory of the store.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry_path(&self, shard: &str, name: &ObjectName) -> PathBuf {
        self.cache_dir.join(shard).join(name.as_str())
    }
}
