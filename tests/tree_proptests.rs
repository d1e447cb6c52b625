//! Property-based tests for `Tree`.
//!
//! Differential testing against `BTreeMap` as an oracle, over every leaf
//! layout: sorted leaves, eager hash leaves, linked hash leaves, and hash
//! leaves that convert under scan pressure.

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

use blinkhash::{LeafKind, Tree, TreeConfig};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Keys are drawn from a narrow range so operations collide.
const KEY_SPACE: u64 = 256;

// ============================================================================
//  Configurations
// ============================================================================

/// Tiny nodes: a few dozen keys already build three levels.
fn sorted_config() -> TreeConfig {
    TreeConfig::default()
        .with_initial_leaf(LeafKind::Sorted)
        .with_leaf_cardinality(3)
        .with_inner_cardinality(4)
}

fn hashed_config() -> TreeConfig {
    TreeConfig::default()
        .with_initial_leaf(LeafKind::Hashed)
        .with_hash_buckets(4)
        .with_bucket_slots(4)
        .with_hash_funcs(2)
        .with_leaf_cardinality(6)
        .with_inner_cardinality(4)
        .with_convert_threshold(0)
}

fn linked_config() -> TreeConfig {
    hashed_config().with_linked_migration(true)
}

/// Every scan of a hash leaf converts it.
fn converting_config() -> TreeConfig {
    hashed_config().with_convert_threshold(1)
}

fn no_fingerprint_config() -> TreeConfig {
    hashed_config().with_fingerprint(false).with_hash_funcs(1)
}

fn all_configs() -> Vec<(&'static str, TreeConfig)> {
    vec![
        ("sorted", sorted_config()),
        ("hashed", hashed_config()),
        ("linked", linked_config()),
        ("converting", converting_config()),
        ("no_fingerprint", no_fingerprint_config()),
    ]
}

// ============================================================================
//  Strategies
// ============================================================================

fn key() -> impl Strategy<Value = u64> {
    0..KEY_SPACE
}

/// Operations for random testing.
#[derive(Debug, Clone)]
enum Op {
    Insert(u64, u64),
    Lookup(u64),
    Update(u64, u64),
    Remove(u64),
    Scan(u64, usize),
    Convert(u64),
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            6 => (key(), any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
            2 => key().prop_map(Op::Lookup),
            1 => (key(), any::<u64>()).prop_map(|(k, v)| Op::Update(k, v)),
            2 => key().prop_map(Op::Remove),
            1 => (key(), 0usize..40).prop_map(|(k, n)| Op::Scan(k, n)),
            1 => key().prop_map(Op::Convert),
        ],
        0..=max_ops,
    )
}

/// Apply `ops` to a fresh tree and an oracle, comparing every result.
fn check_against_oracle(config: TreeConfig, ops: &[Op]) -> Result<(), TestCaseError> {
    let tree: Tree<u64, u64> = Tree::with_config(config).unwrap();
    let ti = tree.thread_info();
    let mut oracle: BTreeMap<u64, u64> = BTreeMap::new();

    for op in ops {
        match *op {
            Op::Insert(k, v) => {
                prop_assert_eq!(tree.insert(k, v, &ti), oracle.insert(k, v), "insert {}", k);
            }

            Op::Lookup(k) => {
                prop_assert_eq!(tree.lookup(k, &ti), oracle.get(&k).copied(), "lookup {}", k);
            }

            Op::Update(k, v) => {
                let expected: bool = oracle.get_mut(&k).map(|slot| *slot = v).is_some();
                prop_assert_eq!(tree.update(k, v, &ti), expected, "update {}", k);
            }

            Op::Remove(k) => {
                prop_assert_eq!(tree.remove(k, &ti), oracle.remove(&k).is_some(), "remove {}", k);
            }

            Op::Scan(k, n) => {
                let expected: Vec<(u64, u64)> =
                    oracle.range(k..).take(n).map(|(&k, &v)| (k, v)).collect();
                prop_assert_eq!(tree.scan(k, n, &ti), expected, "scan {} {}", k, n);
            }

            Op::Convert(k) => {
                let _ = tree.convert(k, &ti);
            }
        }
    }

    prop_assert_eq!(tree.len(), oracle.len());
    prop_assert!(tree.sanity_check(&ti).is_ok(), "{:?}", tree.sanity_check(&ti));

    for (&k, &v) in &oracle {
        prop_assert_eq!(tree.lookup(k, &ti), Some(v), "final lookup {}", k);
    }

    let all: Vec<(u64, u64)> = oracle.iter().map(|(&k, &v)| (k, v)).collect();
    prop_assert_eq!(tree.scan(0, usize::MAX, &ti), all);

    Ok(())
}

// ============================================================================
//  Differential Testing Against BTreeMap
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn sorted_leaves_match_btreemap(ops in operations(400)) {
        check_against_oracle(sorted_config(), &ops)?;
    }

    #[test]
    fn hashed_leaves_match_btreemap(ops in operations(400)) {
        check_against_oracle(hashed_config(), &ops)?;
    }

    #[test]
    fn linked_hashed_leaves_match_btreemap(ops in operations(400)) {
        check_against_oracle(linked_config(), &ops)?;
    }

    #[test]
    fn converting_leaves_match_btreemap(ops in operations(400)) {
        check_against_oracle(converting_config(), &ops)?;
    }

    #[test]
    fn unfingerprinted_leaves_match_btreemap(ops in operations(200)) {
        check_against_oracle(no_fingerprint_config(), &ops)?;
    }
}

// ============================================================================
//  Insert/Lookup Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Every inserted key is found, whatever the insertion order.
    #[test]
    fn inserted_keys_are_found(keys in prop::collection::vec(any::<u64>(), 0..300)) {
        for (name, config) in all_configs() {
            let tree: Tree<u64, u64> = Tree::with_config(config).unwrap();
            let ti = tree.thread_info();

            for &k in &keys {
                tree.insert(k, k ^ 0xABCD, &ti);
            }

            for &k in &keys {
                prop_assert_eq!(tree.lookup(k, &ti), Some(k ^ 0xABCD), "{}: key {}", name, k);
            }
            prop_assert!(tree.sanity_check(&ti).is_ok(), "{}", name);
        }
    }

    /// A scan returns exactly `min(limit, keys >= start)` keys, ascending.
    #[test]
    fn scan_is_sorted_and_bounded(
        keys in prop::collection::btree_set(key(), 0..200),
        start in key(),
        limit in 0usize..64,
    ) {
        for (name, config) in all_configs() {
            let tree: Tree<u64, u64> = Tree::with_config(config).unwrap();
            let ti = tree.thread_info();

            for &k in &keys {
                tree.insert(k, k, &ti);
            }

            let got: Vec<u64> = tree.range_lookup(start, limit, &ti);
            let expected: Vec<u64> = keys.range(start..).take(limit).copied().collect();
            prop_assert_eq!(got, expected, "{}", name);
        }
    }

    /// Removing everything leaves an empty but well-formed tree.
    #[test]
    fn remove_all_leaves_tree_empty(keys in prop::collection::btree_set(any::<u64>(), 0..200)) {
        for (name, config) in all_configs() {
            let tree: Tree<u64, u64> = Tree::with_config(config).unwrap();
            let ti = tree.thread_info();

            for &k in &keys {
                tree.insert(k, 1, &ti);
            }
            for &k in &keys {
                prop_assert!(tree.remove(k, &ti), "{}: remove {}", name, k);
            }

            prop_assert!(tree.is_empty(), "{}", name);
            prop_assert!(tree.scan(0, usize::MAX, &ti).is_empty(), "{}", name);
            prop_assert!(tree.sanity_check(&ti).is_ok(), "{}", name);
        }
    }

    /// Signed keys order negatives first.
    #[test]
    fn signed_keys_scan_in_order(keys in prop::collection::btree_set(any::<i64>(), 0..150)) {
        let tree: Tree<i64, u64> = Tree::with_config(hashed_config()).unwrap();
        let ti = tree.thread_info();

        for &k in &keys {
            tree.insert(k, 0, &ti);
        }

        let got: Vec<i64> = tree.scan(i64::MIN, usize::MAX, &ti).into_iter().map(|(k, _)| k).collect();
        let expected: Vec<i64> = keys.iter().copied().collect();
        prop_assert_eq!(got, expected);
    }
}

// ============================================================================
//  Conversion Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Converting every hash leaf keeps every entry and leaves only sorted
    /// leaves behind.
    #[test]
    fn converting_everything_preserves_entries(keys in prop::collection::btree_set(key(), 1..200)) {
        let tree: Tree<u64, u64> = Tree::with_config(hashed_config()).unwrap();
        let ti = tree.thread_info();

        for &k in &keys {
            tree.insert(k, k * 3, &ti);
        }

        for &k in &keys {
            let _ = tree.convert(k, &ti);
        }

        for &k in &keys {
            prop_assert!(!tree.convert(k, &ti), "leaf covering {} still hashed", k);
            prop_assert_eq!(tree.lookup(k, &ti), Some(k * 3));
        }

        prop_assert_eq!(tree.len(), keys.len());
        prop_assert!(tree.sanity_check(&ti).is_ok(), "{:?}", tree.sanity_check(&ti));
    }
}

// ============================================================================
//  Edge Cases
// ============================================================================

#[test]
fn scan_with_zero_limit_is_empty() {
    let tree: Tree<u64, u64> = Tree::new();
    let ti = tree.thread_info();
    tree.insert(1, 1, &ti);

    assert!(tree.scan(0, 0, &ti).is_empty());
    assert!(tree.range_lookup(0, 0, &ti).is_empty());
}

#[test]
fn scan_past_last_key_is_empty() {
    let tree: Tree<u64, u64> = Tree::with_config(sorted_config()).unwrap();
    let ti = tree.thread_info();

    for k in 0..50 {
        tree.insert(k, k, &ti);
    }

    assert!(tree.scan(50, 10, &ti).is_empty());
    assert_eq!(tree.range_lookup(49, 10, &ti), vec![49]);
}

#[test]
fn extreme_keys_round_trip() {
    for (name, config) in all_configs() {
        let tree: Tree<u64, u64> = Tree::with_config(config).unwrap();
        let ti = tree.thread_info();

        for k in [0, 1, u64::MAX - 1, u64::MAX] {
            assert_eq!(tree.insert(k, k, &ti), None, "{name}");
        }
        for k in 2..100 {
            tree.insert(k, k, &ti);
        }

        assert_eq!(tree.lookup(u64::MAX, &ti), Some(u64::MAX), "{name}");
        assert_eq!(tree.range_lookup(u64::MAX - 1, 5, &ti), vec![u64::MAX - 1, u64::MAX], "{name}");
        assert_eq!(tree.scan(0, 1, &ti), vec![(0, 0)], "{name}");
        tree.sanity_check(&ti).unwrap();
    }
}

#[test]
fn convert_on_sorted_tree_is_noop() {
    let tree: Tree<u64, u64> = Tree::with_config(sorted_config()).unwrap();
    let ti = tree.thread_info();

    for k in 0..20 {
        tree.insert(k, k, &ti);
    }

    assert!(!tree.convert(7, &ti));
    assert_eq!(tree.stats().conversions, 0);
}

#[test]
fn update_missing_key_inserts_nothing() {
    let tree: Tree<u64, u64> = Tree::with_config(hashed_config()).unwrap();
    let ti = tree.thread_info();

    assert!(!tree.update(5, 50, &ti));
    assert!(!tree.remove(5, &ti));
    assert_eq!(tree.lookup(5, &ti), None);
    assert!(tree.is_empty());
}
