//! B+Tree integration tests.
//!
//! Exercises the tree through the public surface against a real disk-backed
//! buffer pool: point lookups, cascading splits, redistribution and
//! coalescing, root collapse, ordered iteration, persistence of the root
//! through the header page, and multi-threaded workloads.

use granite_buffer::{BufferPool, BufferPoolConfig, DiskManager, DiskManagerConfig};
use granite_common::page::PageId;
use granite_index::{BPlusTree, GenericKey, RecordId};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

type Key = GenericKey<8>;
type Tree = BPlusTree<Key, RecordId>;

/// Small orders so a handful of keys already builds a multi-level tree.
const LEAF_MAX: usize = 4;
const INTERNAL_MAX: usize = 5;

fn key(v: u64) -> Key {
    Key::from_u64(v)
}

fn rid(v: u64) -> RecordId {
    RecordId::new(v as u32, (v >> 32) as u32)
}

fn create_pool(dir: &tempfile::TempDir, num_frames: usize) -> Arc<BufferPool> {
    let disk = Arc::new(
        DiskManager::new(DiskManagerConfig {
            db_path: dir.path().join("btree.db"),
            fsync_enabled: false,
        })
        .unwrap(),
    );
    Arc::new(BufferPool::new(BufferPoolConfig { num_frames }, disk))
}

fn create_tree(pool: &Arc<BufferPool>) -> Tree {
    Tree::new("test_index", Arc::clone(pool), LEAF_MAX, INTERNAL_MAX).unwrap()
}

fn insert_all(tree: &Tree, values: impl IntoIterator<Item = u64>) {
    for v in values {
        assert!(tree.insert(&key(v), &rid(v)).unwrap(), "insert {} failed", v);
    }
}

fn collect_keys(tree: &Tree) -> Vec<u64> {
    tree.iter()
        .unwrap()
        .collect_entries()
        .unwrap()
        .into_iter()
        .map(|(k, _)| k.to_u64())
        .collect()
}

#[test]
fn test_empty_tree() {
    let dir = tempdir().unwrap();
    let pool = create_pool(&dir, 64);
    let tree = create_tree(&pool);

    assert!(tree.is_empty());
    assert_eq!(tree.root_page_id(), PageId::INVALID);
    assert_eq!(tree.get_value(&key(1)).unwrap(), None);
    tree.remove(&key(1)).unwrap(); // silent no-op
    assert!(tree.iter().unwrap().is_end());
    tree.check_integrity().unwrap();
}

#[test]
fn test_single_leaf_root() {
    let dir = tempdir().unwrap();
    let pool = create_pool(&dir, 64);
    let tree = create_tree(&pool);

    insert_all(&tree, [1, 2, 3]);

    assert!(!tree.is_empty());
    assert!(tree.root_page_id().is_valid());
    assert_eq!(tree.get_value(&key(2)).unwrap(), Some(rid(2)));
    assert_eq!(tree.get_value(&key(4)).unwrap(), None);
    assert_eq!(collect_keys(&tree), vec![1, 2, 3]);
    tree.check_integrity().unwrap();
}

#[test]
fn test_duplicate_insert_is_rejected() {
    let dir = tempdir().unwrap();
    let pool = create_pool(&dir, 64);
    let tree = create_tree(&pool);

    assert!(tree.insert(&key(7), &rid(7)).unwrap());
    assert!(!tree.insert(&key(7), &rid(999)).unwrap());

    // The original value survives.
    assert_eq!(tree.get_value(&key(7)).unwrap(), Some(rid(7)));
    assert_eq!(collect_keys(&tree), vec![7]);
}

#[test]
fn test_sequential_inserts_cascade_splits() {
    let dir = tempdir().unwrap();
    let pool = create_pool(&dir, 64);
    let tree = create_tree(&pool);

    insert_all(&tree, 1..=10);

    assert_eq!(collect_keys(&tree), (1..=10).collect::<Vec<_>>());
    for v in 1..=10 {
        assert_eq!(tree.get_value(&key(v)).unwrap(), Some(rid(v)), "key {}", v);
    }
    // Ten keys at order four cannot fit a single leaf, so the root split.
    tree.check_integrity().unwrap();
}

#[test]
fn test_remove_triggers_rebalance() {
    let dir = tempdir().unwrap();
    let pool = create_pool(&dir, 64);
    let tree = create_tree(&pool);

    insert_all(&tree, 1..=10);
    tree.remove(&key(5)).unwrap();

    assert_eq!(tree.get_value(&key(5)).unwrap(), None);
    assert_eq!(collect_keys(&tree), vec![1, 2, 3, 4, 6, 7, 8, 9, 10]);
    tree.check_integrity().unwrap();
}

#[test]
fn test_remove_even_keys() {
    let dir = tempdir().unwrap();
    let pool = create_pool(&dir, 64);
    let tree = create_tree(&pool);

    insert_all(&tree, 1..=20);
    for v in (2..=20).step_by(2) {
        tree.remove(&key(v)).unwrap();
        tree.check_integrity().unwrap();
    }

    assert_eq!(collect_keys(&tree), (1..=20).step_by(2).collect::<Vec<_>>());
}

#[test]
fn test_remove_all_reverse_empties_tree() {
    let dir = tempdir().unwrap();
    let pool = create_pool(&dir, 64);
    let tree = create_tree(&pool);

    insert_all(&tree, 1..=20);
    for v in (1..=20).rev() {
        tree.remove(&key(v)).unwrap();
        tree.check_integrity().unwrap();
    }

    assert!(tree.is_empty());
    assert_eq!(tree.root_page_id(), PageId::INVALID);
    assert!(tree.iter().unwrap().is_end());

    // The header record reflects the empty tree: a fresh handle opened on
    // the same name sees no root.
    let reopened = create_tree(&pool);
    assert!(reopened.is_empty());
}

#[test]
fn test_shuffled_insert_remove_roundtrip() {
    let dir = tempdir().unwrap();
    let pool = create_pool(&dir, 256);
    let tree = create_tree(&pool);
    let mut rng = rand::thread_rng();

    let mut values: Vec<u64> = (1..=200).collect();
    values.shuffle(&mut rng);
    insert_all(&tree, values.iter().copied());

    assert_eq!(collect_keys(&tree), (1..=200).collect::<Vec<_>>());
    tree.check_integrity().unwrap();

    // Remove a shuffled half, then the rest.
    values.shuffle(&mut rng);
    let (first_half, second_half) = values.split_at(100);
    for v in first_half {
        tree.remove(&key(*v)).unwrap();
    }
    tree.check_integrity().unwrap();

    let mut expected: Vec<u64> = second_half.to_vec();
    expected.sort_unstable();
    assert_eq!(collect_keys(&tree), expected);

    for v in second_half {
        tree.remove(&key(*v)).unwrap();
    }
    assert!(tree.is_empty());
}

#[test]
fn test_iter_from_positions_at_lower_bound() {
    let dir = tempdir().unwrap();
    let pool = create_pool(&dir, 64);
    let tree = create_tree(&pool);

    insert_all(&tree, (10..=100).step_by(10));

    // Exact key.
    let entries = tree.iter_from(&key(50)).unwrap().collect_entries().unwrap();
    assert_eq!(entries[0].0.to_u64(), 50);
    assert_eq!(entries.len(), 6);

    // Between keys: lands on the next greater.
    let entries = tree.iter_from(&key(55)).unwrap().collect_entries().unwrap();
    assert_eq!(entries[0].0.to_u64(), 60);

    // Before the smallest: full scan.
    let entries = tree.iter_from(&key(1)).unwrap().collect_entries().unwrap();
    assert_eq!(entries.len(), 10);

    // Past the largest: empty.
    let entries = tree.iter_from(&key(999)).unwrap().collect_entries().unwrap();
    assert!(entries.is_empty());
}

#[test]
fn test_iterator_equality_and_end_sentinel() {
    let dir = tempdir().unwrap();
    let pool = create_pool(&dir, 64);
    let tree = create_tree(&pool);

    insert_all(&tree, [1, 2, 3]);

    let a = tree.iter().unwrap();
    let b = tree.iter().unwrap();
    assert!(a == b);

    let mut c = tree.iter().unwrap();
    c.next_entry().unwrap();
    assert!(a != c);

    let mut d = tree.iter().unwrap();
    while d.next_entry().unwrap().is_some() {}
    assert!(d.is_end());
    assert!(d == tree.end());
}

#[test]
fn test_values_are_preserved() {
    let dir = tempdir().unwrap();
    let pool = create_pool(&dir, 64);
    let tree = create_tree(&pool);

    // Record ids with nontrivial page and slot parts.
    for v in 1..=50u64 {
        let value = RecordId::new(v as u32 * 3, v as u32 + 7);
        assert!(tree.insert(&key(v), &value).unwrap());
    }
    for v in 1..=50u64 {
        let expected = RecordId::new(v as u32 * 3, v as u32 + 7);
        assert_eq!(tree.get_value(&key(v)).unwrap(), Some(expected));
    }
}

#[test]
fn test_eviction_pressure_with_tiny_pool() {
    let dir = tempdir().unwrap();
    // Far fewer frames than tree pages: operations continuously evict and
    // reload node pages through the disk manager.
    let pool = create_pool(&dir, 16);
    let tree = create_tree(&pool);

    insert_all(&tree, 1..=500);

    assert_eq!(collect_keys(&tree), (1..=500).collect::<Vec<_>>());
    tree.check_integrity().unwrap();

    for v in 1..=250 {
        tree.remove(&key(v)).unwrap();
    }
    assert_eq!(collect_keys(&tree), (251..=500).collect::<Vec<_>>());
    tree.check_integrity().unwrap();
}

#[test]
fn test_root_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("btree.db");

    {
        let disk = Arc::new(
            DiskManager::new(DiskManagerConfig {
                db_path: db_path.clone(),
                fsync_enabled: false,
            })
            .unwrap(),
        );
        let pool = Arc::new(BufferPool::new(BufferPoolConfig { num_frames: 64 }, disk));
        let tree = Tree::new("persistent", Arc::clone(&pool), LEAF_MAX, INTERNAL_MAX).unwrap();
        insert_all(&tree, 1..=50);
        pool.flush_all().unwrap();
    }

    {
        let disk = Arc::new(
            DiskManager::new(DiskManagerConfig {
                db_path,
                fsync_enabled: false,
            })
            .unwrap(),
        );
        let pool = Arc::new(BufferPool::new(BufferPoolConfig { num_frames: 64 }, disk));
        let tree = Tree::new("persistent", Arc::clone(&pool), LEAF_MAX, INTERNAL_MAX).unwrap();

        assert!(!tree.is_empty());
        assert_eq!(collect_keys(&tree), (1..=50).collect::<Vec<_>>());
        tree.check_integrity().unwrap();

        // The reopened tree keeps growing without clobbering old pages.
        insert_all(&tree, 51..=60);
        assert_eq!(collect_keys(&tree), (1..=60).collect::<Vec<_>>());
        tree.check_integrity().unwrap();
    }
}

#[test]
fn test_invalid_orders_are_rejected() {
    let dir = tempdir().unwrap();
    let pool = create_pool(&dir, 64);

    assert!(Tree::new("bad_leaf", Arc::clone(&pool), 1, INTERNAL_MAX).is_err());
    assert!(Tree::new("bad_internal", Arc::clone(&pool), LEAF_MAX, 2).is_err());
    assert!(Tree::new("huge_leaf", Arc::clone(&pool), 100_000, INTERNAL_MAX).is_err());
}

#[test]
fn test_default_orders_build_a_working_tree() {
    let dir = tempdir().unwrap();
    let pool = create_pool(&dir, 64);
    let tree = Tree::new(
        "default_orders",
        Arc::clone(&pool),
        Tree::default_leaf_max_size(),
        Tree::default_internal_max_size(),
    )
    .unwrap();

    insert_all(&tree, 1..=1000);
    assert_eq!(collect_keys(&tree), (1..=1000).collect::<Vec<_>>());
    tree.check_integrity().unwrap();
}

#[test]
fn test_concurrent_disjoint_inserts() {
    let dir = tempdir().unwrap();
    let pool = create_pool(&dir, 256);
    let tree = Arc::new(create_tree(&pool));

    let mut handles = Vec::new();
    for range in [1..=1000u64, 1001..=2000u64] {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            for v in range {
                assert!(tree.insert(&key(v), &rid(v)).unwrap());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(collect_keys(&tree), (1..=2000).collect::<Vec<_>>());
    tree.check_integrity().unwrap();
}

#[test]
fn test_concurrent_interleaved_inserts() {
    let dir = tempdir().unwrap();
    let pool = create_pool(&dir, 256);
    let tree = Arc::new(create_tree(&pool));

    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 500;

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            // Thread t owns keys congruent to t mod THREADS, so inserts
            // interleave across the whole key space.
            for i in 0..PER_THREAD {
                let v = 1 + t + i * THREADS;
                assert!(tree.insert(&key(v), &rid(v)).unwrap());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let total = THREADS * PER_THREAD;
    assert_eq!(collect_keys(&tree), (1..=total).collect::<Vec<_>>());
    tree.check_integrity().unwrap();
}

#[test]
fn test_concurrent_disjoint_removes() {
    let dir = tempdir().unwrap();
    let pool = create_pool(&dir, 256);
    let tree = Arc::new(create_tree(&pool));

    insert_all(&tree, 1..=2000);

    let mut handles = Vec::new();
    for range in [1..=1000u64, 1001..=2000u64] {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            for v in range {
                tree.remove(&key(v)).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(tree.is_empty());
    assert_eq!(tree.root_page_id(), PageId::INVALID);
}

#[test]
fn test_concurrent_readers_never_miss_committed_keys() {
    let dir = tempdir().unwrap();
    let pool = create_pool(&dir, 256);
    let tree = Arc::new(create_tree(&pool));
    let watermark = Arc::new(AtomicU64::new(0));

    const TOTAL: u64 = 1000;

    let writer = {
        let tree = Arc::clone(&tree);
        let watermark = Arc::clone(&watermark);
        thread::spawn(move || {
            for v in 1..=TOTAL {
                assert!(tree.insert(&key(v), &rid(v)).unwrap());
                watermark.store(v, Ordering::Release);
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..3 {
        let tree = Arc::clone(&tree);
        let watermark = Arc::clone(&watermark);
        readers.push(thread::spawn(move || {
            let mut rng = rand::thread_rng();
            loop {
                let committed = watermark.load(Ordering::Acquire);
                if committed >= TOTAL {
                    break;
                }
                if committed == 0 {
                    continue;
                }
                let probe = rng.gen_range(1..=committed);
                // A committed key must always be visible.
                assert_eq!(
                    tree.get_value(&key(probe)).unwrap(),
                    Some(rid(probe)),
                    "committed key {} missing",
                    probe
                );
                // A key beyond the writer's progress must not exist yet;
                // re-read the watermark to avoid racing the writer.
                let ahead = TOTAL + 1;
                assert_eq!(tree.get_value(&key(ahead)).unwrap(), None);
            }
        }));
    }

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    tree.check_integrity().unwrap();
}

#[test]
fn test_mixed_concurrent_inserts_and_removes() {
    let dir = tempdir().unwrap();
    let pool = create_pool(&dir, 256);
    let tree = Arc::new(create_tree(&pool));

    // Seed the lower range; one thread deletes it while another inserts the
    // upper range.
    insert_all(&tree, 1..=1000);

    let inserter = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            for v in 1001..=2000u64 {
                assert!(tree.insert(&key(v), &rid(v)).unwrap());
            }
        })
    };
    let remover = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            for v in 1..=1000u64 {
                tree.remove(&key(v)).unwrap();
            }
        })
    };

    inserter.join().unwrap();
    remover.join().unwrap();

    assert_eq!(collect_keys(&tree), (1001..=2000).collect::<Vec<_>>());
    tree.check_integrity().unwrap();
}
