//! Property-based tests for bucketsync
//!
//! These tests verify invariants that must hold for all inputs:
//! - Diff sets respect membership in source and destination
//! - Prefix normalization is idempotent
//! - Summaries do not depend on merge order
//!
//! Run with: cargo test --test property_tests

use std::collections::BTreeMap;

use proptest::prelude::*;

use bucketsync::sync::{diff, Tally};
use bucketsync::types::{DirectorySnapshot, ObjectRecord, Operation, Scope};

fn snapshot(bucket: &str, entries: &BTreeMap<String, (u64, u8)>) -> DirectorySnapshot {
    let records = entries.iter().map(|(key, (size, hash))| {
        ObjectRecord::new(key.clone(), *size).with_fingerprint(format!("h{}", hash))
    });
    DirectorySnapshot::from_records(Scope::new(bucket, "public").unwrap(), records)
}

fn entries() -> impl Strategy<Value = BTreeMap<String, (u64, u8)>> {
    prop::collection::btree_map("[a-e]{1,3}", (0u64..50, 0u8..3), 0..20)
}

// ============================================================================
// DIFF INVARIANTS
// ============================================================================

mod diff_tests {
    use super::*;

    proptest! {
        /// Invariant: every copy key exists in source, exactly once
        #[test]
        fn copy_set_drawn_from_source(src in entries(), dest in entries(), delete in any::<bool>()) {
            let result = diff(&snapshot("src-env", &src), &snapshot("dest-env", &dest), delete);

            let mut seen = std::collections::HashSet::new();
            for record in &result.to_copy {
                prop_assert!(src.contains_key(&record.relative_key));
                prop_assert!(seen.insert(record.relative_key.clone()));
            }
        }

        /// Invariant: source-only keys are always copied
        #[test]
        fn source_only_keys_copied(src in entries(), dest in entries()) {
            let result = diff(&snapshot("src-env", &src), &snapshot("dest-env", &dest), false);

            for key in src.keys().filter(|k| !dest.contains_key(*k)) {
                prop_assert!(result.to_copy.iter().any(|r| &r.relative_key == key));
            }
        }

        /// Invariant: delete set is exactly dest minus source, and empty without the flag
        #[test]
        fn delete_set_is_dest_minus_source(src in entries(), dest in entries()) {
            let source = snapshot("src-env", &src);
            let destination = snapshot("dest-env", &dest);

            let keep = diff(&source, &destination, false);
            prop_assert!(keep.to_delete.is_empty());

            let prune = diff(&source, &destination, true);
            let deleted: Vec<&String> = prune.to_delete.iter().map(|r| &r.relative_key).collect();
            let expected: Vec<&String> = dest.keys().filter(|k| !src.contains_key(*k)).collect();
            prop_assert_eq!(deleted, expected);
        }

        /// Invariant: diffing a snapshot against itself plans nothing
        #[test]
        fn identical_snapshots_are_in_sync(src in entries()) {
            let result = diff(&snapshot("src-env", &src), &snapshot("dest-env", &src), true);
            prop_assert!(result.is_empty());
        }
    }
}

// ============================================================================
// SCOPE NORMALIZATION
// ============================================================================

mod scope_tests {
    use super::*;

    proptest! {
        /// Invariant: normalizing an already normalized prefix changes nothing
        #[test]
        fn prefix_normalization_idempotent(prefix in "/?[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,3}/?") {
            let once = Scope::new("site-prod", &prefix).unwrap();
            let twice = Scope::new("site-prod", once.prefix()).unwrap();
            prop_assert_eq!(once.prefix(), twice.prefix());
            prop_assert!(once.prefix().ends_with('/'));
            prop_assert!(!once.prefix().starts_with('/'));
        }

        /// Invariant: full_key and relative_key are inverse
        #[test]
        fn relative_key_inverts_full_key(prefix in "[a-z]{1,6}", key in "[a-z0-9./]{1,20}") {
            let scope = Scope::new("site-prod", &prefix).unwrap();
            let full = scope.full_key(&key);
            prop_assert_eq!(scope.relative_key(&full), Some(key.as_str()));
        }
    }
}

// ============================================================================
// AGGREGATION
// ============================================================================

mod aggregate_tests {
    use super::*;

    fn tally(sizes: &[u64], failed: &[String]) -> Tally {
        let mut t = Tally::default();
        for (i, size) in sizes.iter().enumerate() {
            t.record_copy(ObjectRecord::new(format!("k{}", i), *size));
        }
        for key in failed {
            t.record_failure(key, Operation::Delete, "denied");
        }
        t
    }

    proptest! {
        /// Invariant: merge order does not change the summary
        #[test]
        fn merge_is_commutative(
            a in prop::collection::vec(0u64..1000, 0..10),
            b in prop::collection::vec(0u64..1000, 0..10),
            fa in prop::collection::vec("[a-z]{1,4}", 0..4),
            fb in prop::collection::vec("[a-z]{1,4}", 0..4),
        ) {
            let left = tally(&a, &fa).merge(tally(&b, &fb)).into_summary(false);
            let right = tally(&b, &fb).merge(tally(&a, &fa)).into_summary(false);

            prop_assert_eq!(left.bytes_add, a.iter().sum::<u64>() + b.iter().sum::<u64>());
            prop_assert_eq!(left.count_add, right.count_add);
            prop_assert_eq!(left.bytes_add, right.bytes_add);
            prop_assert_eq!(left.failures, right.failures);
        }
    }
}
