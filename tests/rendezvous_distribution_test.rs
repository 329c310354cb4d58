//! Distribution quality tests for the rendezvous router.
//!
//! These verify that shard selection spreads a large keyspace evenly and
//! that removing a shard remaps only the keys that shard owned.

use object_proxy::rendezvous::ShardSet;
use std::collections::HashMap;

fn shards(labels: &[&str]) -> ShardSet {
    ShardSet::new(labels.iter().map(|s| s.to_string()).collect()).unwrap()
}

#[test]
fn test_uniform_distribution_across_shards() {
    const NUM_KEYS: usize = 60_000;
    const TOLERANCE_PERCENT: f64 = 20.0;

    let set = shards(&["one", "two", "three", "four", "five", "six"]);
    let expected_per_shard = NUM_KEYS as f64 / set.len() as f64;

    let mut counts: HashMap<String, usize> = HashMap::new();
    for i in 0..NUM_KEYS {
        // Diverse key shapes, as a real object namespace would have.
        let name = match i % 4 {
            0 => format!("images/photo-{}.jpg", i),
            1 => format!("doc-{}.pdf", i),
            2 => format!("build/artifact-{}-{}.tar.gz", i, i * 7),
            _ => format!("{}", i),
        };
        *counts.entry(set.select_label(&name).to_string()).or_insert(0) += 1;
    }

    assert_eq!(counts.len(), set.len(), "every shard should own some keys");
    for (label, count) in &counts {
        let deviation = (*count as f64 - expected_per_shard).abs() / expected_per_shard * 100.0;
        assert!(
            deviation < TOLERANCE_PERCENT,
            "shard {} owns {} keys, expected ~{} (deviation {:.1}%)",
            label,
            count,
            expected_per_shard,
            deviation
        );
    }
}

#[test]
fn test_removal_remaps_only_the_removed_shards_keys() {
    const NUM_KEYS: usize = 10_000;

    let full = shards(&["one", "two", "three", "four", "five", "six"]);
    let removed = "three";
    let reduced = shards(&["one", "two", "four", "five", "six"]);

    let mut remapped = 0usize;
    let mut owned_by_removed = 0usize;

    for i in 0..NUM_KEYS {
        let name = format!("object-{}.dat", i);
        let before = full.select_label(&name);
        let after = reduced.select_label(&name);

        if before == removed {
            owned_by_removed += 1;
            remapped += 1;
            assert_ne!(after, removed);
        } else {
            assert_eq!(
                before, after,
                "key {} moved from {} to {} though its shard was not removed",
                name, before, after
            );
        }
    }

    // Exactly the removed shard's keys moved, and that shard owned roughly
    // a sixth of the keyspace.
    assert_eq!(remapped, owned_by_removed);
    let fraction = owned_by_removed as f64 / NUM_KEYS as f64;
    assert!(
        fraction > 0.10 && fraction < 0.24,
        "removed shard owned {:.1}% of keys, expected around 16.7%",
        fraction * 100.0
    );
}

#[test]
fn test_client_and_proxy_instances_agree() {
    // Simulates the deployed split: the client computes the winner with its
    // own ShardSet instance and the proxy resolves the named label with
    // another. They must never disagree.
    let client_side = shards(&["one", "two", "three", "four", "five", "six"]);
    let proxy_side = shards(&["one", "two", "three", "four", "five", "six"]);

    for i in 0..5_000 {
        let name = format!("handshake-free-{}.obj", i);
        let picked = client_side.select_label(&name);
        let resolved = proxy_side.resolve(picked).unwrap();
        assert_eq!(proxy_side.label(resolved), picked);
        assert_eq!(proxy_side.select_label(&name), picked);
    }
}
