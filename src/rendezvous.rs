//! Rendezvous Routing Module
//!
//! Maps object names to shards with highest-random-weight (rendezvous)
//! hashing: every participant hashes `objectName ++ shardLabel` for each
//! shard and picks the shard with the maximum value. Client and proxy run
//! the identical computation, so both sides agree on ownership without any
//! coordination, and removing a shard only remaps the objects that shard
//! owned.

use crate::{ProxyError, Result};
use xxhash_rust::xxh32::xxh32;

/// Hash seed shared by every participant computing shard ownership.
/// Changing it remaps the entire keyspace; it must match on client and proxy.
pub const RENDEZVOUS_SEED: u32 = 42;

/// Computes the rendezvous weight of `shard_label` for `object_name`.
pub fn weight(object_name: &str, shard_label: &str) -> u32 {
    let mut keyed = Vec::with_capacity(object_name.len() + shard_label.len());
    keyed.extend_from_slice(object_name.as_bytes());
    keyed.extend_from_slice(shard_label.as_bytes());
    xxh32(&keyed, RENDEZVOUS_SEED)
}

/// Fixed, ordered set of shard labels, immutable for the process lifetime.
///
/// The order matters: ties between equal weights are broken by the lowest
/// index, so two participants only agree if they share the same ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSet {
    labels: Vec<String>,
}

impl ShardSet {
    /// Builds a shard set from configured labels.
    ///
    /// Rejects an empty set, empty labels, and duplicate labels, all of
    /// which would make routing ambiguous.
    pub fn new(labels: Vec<String>) -> Result<Self> {
        if labels.is_empty() {
            return Err(ProxyError::ConfigError(
                "shard set must contain at least one shard".to_string(),
            ));
        }
        for (idx, label) in labels.iter().enumerate() {
            if label.is_empty() {
                return Err(ProxyError::ConfigError(format!(
                    "shard label at index {} is empty",
                    idx
                )));
            }
            if labels[..idx].contains(label) {
                return Err(ProxyError::ConfigError(format!(
                    "duplicate shard label: {}",
                    label
                )));
            }
        }
        Ok(Self { labels })
    }

    /// Number of shards in the set.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// All labels in configured order.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Label of the shard at `idx`.
    pub fn label(&self, idx: usize) -> &str {
        &self.labels[idx]
    }

    /// Resolves a shard label named by a client to its index.
    pub fn resolve(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    /// Selects the owning shard for `object_name`.
    ///
    /// Returns the index of the shard whose weight is maximal; equal
    /// weights keep the earlier shard. Deterministic across independent
    /// callers sharing the seed and shard order.
    pub fn select(&self, object_name: &str) -> usize {
        let mut winner = 0;
        let mut best = weight(object_name, &self.labels[0]);
        for (idx, label) in self.labels.iter().enumerate().skip(1) {
            let w = weight(object_name, label);
            if w > best {
                best = w;
                winner = idx;
            }
        }
        winner
    }

    /// Label of the owning shard for `object_name`.
    pub fn select_label(&self, object_name: &str) -> &str {
        &self.labels[self.select(object_name)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn six_shards() -> ShardSet {
        ShardSet::new(
            ["one", "two", "three", "four", "five", "six"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_set_rejected() {
        assert!(ShardSet::new(Vec::new()).is_err());
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let labels = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert!(ShardSet::new(labels).is_err());
    }

    #[test]
    fn test_empty_label_rejected() {
        let labels = vec!["a".to_string(), String::new()];
        assert!(ShardSet::new(labels).is_err());
    }

    #[test]
    fn test_resolve() {
        let shards = six_shards();
        assert_eq!(shards.resolve("one"), Some(0));
        assert_eq!(shards.resolve("six"), Some(5));
        assert_eq!(shards.resolve("seven"), None);
    }

    #[test]
    fn test_select_is_deterministic_across_callers() {
        // Two independently constructed sets with the same labels must agree
        // on every object; this is what lets client and proxy skip any
        // ownership handshake.
        let a = six_shards();
        let b = six_shards();
        for i in 0..500 {
            let name = format!("object-{}.html", i);
            assert_eq!(a.select(&name), b.select(&name));
        }
    }

    #[test]
    fn test_select_matches_max_weight() {
        let shards = six_shards();
        for i in 0..200 {
            let name = format!("file-{}", i);
            let picked = shards.select(&name);
            let picked_weight = weight(&name, shards.label(picked));
            for (idx, label) in shards.labels().iter().enumerate() {
                let w = weight(&name, label);
                assert!(w <= picked_weight);
                // Lowest index wins ties.
                if w == picked_weight {
                    assert!(picked <= idx);
                }
            }
        }
    }

    #[test]
    fn test_removing_loser_keeps_winner() {
        let shards = six_shards();
        for i in 0..300 {
            let name = format!("asset-{}.bin", i);
            let winner_label = shards.select_label(&name).to_string();

            // Drop one shard that is not the winner; the object must keep
            // its owner.
            let survivor_labels: Vec<String> = shards
                .labels()
                .iter()
                .filter(|l| **l != winner_label)
                .cloned()
                .collect();
            for removed in survivor_labels {
                let reduced: Vec<String> = shards
                    .labels()
                    .iter()
                    .filter(|l| **l != removed)
                    .cloned()
                    .collect();
                let reduced = ShardSet::new(reduced).unwrap();
                assert_eq!(reduced.select_label(&name), winner_label);
            }
        }
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;

    /// Removing one shard remaps only the objects that shard owned; every
    /// other object keeps its prior winner.
    #[quickcheck]
    fn prop_minimal_remap_on_shard_removal(names: Vec<String>, removed_idx: usize) -> TestResult {
        let labels: Vec<String> = ["alpha", "beta", "gamma", "delta"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let removed = labels[removed_idx % labels.len()].clone();
        let full = ShardSet::new(labels.clone()).unwrap();
        let reduced = ShardSet::new(
            labels.iter().filter(|l| **l != removed).cloned().collect(),
        )
        .unwrap();

        for name in names.iter().take(64) {
            let before = full.select_label(name);
            if before != removed && reduced.select_label(name) != before {
                return TestResult::failed();
            }
        }
        TestResult::passed()
    }

    /// The winning weight never depends on how many other shards exist.
    #[quickcheck]
    fn prop_weight_is_pairwise(name: String) -> bool {
        let w1 = weight(&name, "alpha");
        let w2 = weight(&name, "alpha");
        w1 == w2
    }
}
