//! Blacklist Filter Module
//!
//! Per-shard probabilistic membership filters for the object blacklist.
//!
//! Each shard owns one bloom filter. At startup every name in the blacklist
//! source is routed through the rendezvous `ShardSet` and inserted into the
//! winning shard's filter; afterwards the filters are read-only and shared
//! across connection workers without synchronization. A lookup answers
//! `DefinitelyAbsent` or `PossiblyPresent`; the request path treats
//! `PossiblyPresent` as a deny, so false positives over-block but a
//! blacklisted object is never served.

use crate::rendezvous::ShardSet;
use crate::{ProxyError, Result};
use std::io::BufRead;
use std::path::Path;
use tracing::{debug, info};
use xxhash_rust::xxh32::xxh32;

/// Base seed for the bloom hash schedule; hash `i` uses `BLOOM_SEED_BASE + i`.
/// Insert and lookup share this schedule; it is not part of the wire contract.
pub const BLOOM_SEED_BASE: u32 = 46;

/// Outcome of a bloom filter lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomLookup {
    /// The name was never inserted.
    DefinitelyAbsent,
    /// The name may have been inserted; callers deny on this answer.
    PossiblyPresent,
}

/// Fixed-size bit array with K independently seeded hash functions.
///
/// Sized from `(expected_items, false_positive_rate)` rather than fixed
/// constants: `m = -n * ln(p) / ln(2)^2` bits and `k = (m / n) * ln(2)`
/// hashes, both rounded up to at least one.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: u32,
    items: usize,
}

impl BloomFilter {
    /// Creates an empty filter sized for `expected_items` at
    /// `false_positive_rate`.
    pub fn with_capacity(expected_items: usize, false_positive_rate: f64) -> Result<Self> {
        if expected_items == 0 {
            return Err(ProxyError::ConfigError(
                "bloom filter expected_items must be positive".to_string(),
            ));
        }
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(ProxyError::ConfigError(format!(
                "bloom filter false_positive_rate must be in (0, 1), got {}",
                false_positive_rate
            )));
        }

        let n = expected_items as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-(n * false_positive_rate.ln()) / (ln2 * ln2)).ceil() as usize;
        let num_bits = num_bits.max(1);
        let num_hashes = ((num_bits as f64 / n) * ln2).round() as u32;
        let num_hashes = num_hashes.max(1);

        Ok(Self {
            bits: vec![0u64; num_bits.div_ceil(64)],
            num_bits,
            num_hashes,
            items: 0,
        })
    }

    /// Sets the K addressed bits for `name`.
    pub fn insert(&mut self, name: &str) {
        for i in 0..self.num_hashes {
            let idx = self.bit_index(name, i);
            self.bits[idx / 64] |= 1u64 << (idx % 64);
        }
        self.items += 1;
    }

    /// Tests the K addressed bits for `name`.
    ///
    /// Never returns `DefinitelyAbsent` for an inserted name.
    pub fn lookup(&self, name: &str) -> BloomLookup {
        for i in 0..self.num_hashes {
            let idx = self.bit_index(name, i);
            if self.bits[idx / 64] & (1u64 << (idx % 64)) == 0 {
                return BloomLookup::DefinitelyAbsent;
            }
        }
        BloomLookup::PossiblyPresent
    }

    fn bit_index(&self, name: &str, hash_no: u32) -> usize {
        xxh32(name.as_bytes(), BLOOM_SEED_BASE + hash_no) as usize % self.num_bits
    }

    /// Number of bits in the filter.
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// Number of hash functions.
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Number of inserted items.
    pub fn items(&self) -> usize {
        self.items
    }
}

/// One bloom filter per shard, built once before the proxy accepts
/// connections and read-only thereafter. Refreshing the blacklist requires
/// a restart.
#[derive(Debug)]
pub struct BlacklistIndex {
    filters: Vec<BloomFilter>,
    entries: usize,
}

impl BlacklistIndex {
    /// Builds per-shard filters from a whitespace/newline-delimited name
    /// source, routing each entry to its rendezvous winner.
    pub fn build<R: BufRead>(
        source: R,
        shards: &ShardSet,
        expected_items: usize,
        false_positive_rate: f64,
    ) -> Result<Self> {
        let mut filters = Vec::with_capacity(shards.len());
        for _ in 0..shards.len() {
            filters.push(BloomFilter::with_capacity(
                expected_items,
                false_positive_rate,
            )?);
        }

        let mut entries = 0usize;
        for line in source.lines() {
            let line = line
                .map_err(|e| ProxyError::IoError(format!("failed to read blacklist: {}", e)))?;
            for name in line.split_whitespace() {
                let winner = shards.select(name);
                filters[winner].insert(name);
                entries += 1;
                debug!(
                    "blacklisted {} on shard {} ({} hashes over {} bits)",
                    name,
                    shards.label(winner),
                    filters[winner].num_hashes(),
                    filters[winner].num_bits()
                );
            }
        }

        info!(
            "blacklist index built: {} entries across {} shards",
            entries,
            shards.len()
        );
        Ok(Self { filters, entries })
    }

    /// Builds the index from the blacklist file at `path`.
    pub fn load(
        path: &Path,
        shards: &ShardSet,
        expected_items: usize,
        false_positive_rate: f64,
    ) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            ProxyError::ConfigError(format!(
                "failed to open blacklist file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::build(
            std::io::BufReader::new(file),
            shards,
            expected_items,
            false_positive_rate,
        )
    }

    /// Looks up `name` in the filter belonging to the shard at `shard_idx`.
    pub fn lookup(&self, shard_idx: usize, name: &str) -> BloomLookup {
        self.filters[shard_idx].lookup(name)
    }

    /// Total number of blacklist entries inserted at build time.
    pub fn entries(&self) -> usize {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn shards() -> ShardSet {
        ShardSet::new(
            ["one", "two", "three", "four", "five", "six"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_sizing_from_capacity_and_rate() {
        let filter = BloomFilter::with_capacity(10_000, 0.01).unwrap();
        // ~9.6 bits per item and ~7 hashes at a 1% target rate.
        assert!(filter.num_bits() > 90_000 && filter.num_bits() < 100_000);
        assert_eq!(filter.num_hashes(), 7);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(BloomFilter::with_capacity(0, 0.01).is_err());
        assert!(BloomFilter::with_capacity(100, 0.0).is_err());
        assert!(BloomFilter::with_capacity(100, 1.0).is_err());
    }

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::with_capacity(1000, 0.01).unwrap();
        let names: Vec<String> = (0..1000).map(|i| format!("blocked-{}.txt", i)).collect();
        for name in &names {
            filter.insert(name);
        }
        for name in &names {
            assert_eq!(filter.lookup(name), BloomLookup::PossiblyPresent);
        }
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let mut filter = BloomFilter::with_capacity(1000, 0.01).unwrap();
        for i in 0..1000 {
            filter.insert(&format!("blocked-{}", i));
        }
        let false_positives = (0..10_000)
            .map(|i| format!("never-inserted-{}", i))
            .filter(|name| filter.lookup(name) == BloomLookup::PossiblyPresent)
            .count();
        // Target rate is 1%; allow generous slack over 10k queries.
        assert!(
            false_positives < 500,
            "false positive count {} exceeds bound",
            false_positives
        );
    }

    #[test]
    fn test_empty_filter_is_definitely_absent() {
        let filter = BloomFilter::with_capacity(100, 0.01).unwrap();
        assert_eq!(filter.lookup("anything"), BloomLookup::DefinitelyAbsent);
    }

    #[test]
    fn test_index_routes_to_winning_shard() {
        let shards = shards();
        let source = "forbidden.txt\nsecret.dat blocked.bin\n";
        let index = BlacklistIndex::build(Cursor::new(source), &shards, 100, 0.01).unwrap();

        assert_eq!(index.entries(), 3);
        for name in ["forbidden.txt", "secret.dat", "blocked.bin"] {
            let winner = shards.select(name);
            assert_eq!(index.lookup(winner, name), BloomLookup::PossiblyPresent);
        }
    }

    #[test]
    fn test_index_other_shards_mostly_absent() {
        let shards = shards();
        let names: Vec<String> = (0..200).map(|i| format!("deny-{}.obj", i)).collect();
        let source = names.join("\n");
        let index = BlacklistIndex::build(Cursor::new(source), &shards, 200, 0.01).unwrap();

        // A name only occupies its winning shard's filter; the other five
        // shards should answer absent for all but the rare false positive.
        let mut stray_hits = 0;
        let mut queries = 0;
        for name in &names {
            let winner = shards.select(name);
            for idx in 0..shards.len() {
                if idx == winner {
                    continue;
                }
                queries += 1;
                if index.lookup(idx, name) == BloomLookup::PossiblyPresent {
                    stray_hits += 1;
                }
            }
        }
        assert!(
            stray_hits * 10 < queries,
            "{} stray hits out of {} cross-shard queries",
            stray_hits,
            queries
        );
    }

    #[test]
    fn test_missing_blacklist_file_is_config_error() {
        let err = BlacklistIndex::load(
            Path::new("/nonexistent/blacklist"),
            &shards(),
            100,
            0.01,
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::ConfigError(_)));
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;

    /// For any set of inserted names, lookup never answers absent.
    #[quickcheck]
    fn prop_inserted_names_always_possibly_present(names: Vec<String>) -> TestResult {
        if names.is_empty() || names.len() > 256 {
            return TestResult::discard();
        }
        let mut filter = match BloomFilter::with_capacity(names.len(), 0.01) {
            Ok(f) => f,
            Err(_) => return TestResult::discard(),
        };
        for name in &names {
            filter.insert(name);
        }
        for name in &names {
            if filter.lookup(name) != BloomLookup::PossiblyPresent {
                return TestResult::failed();
            }
        }
        TestResult::passed()
    }
}
