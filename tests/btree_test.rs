use std::collections::BTreeMap;
use std::sync::Arc;

use birchdb::buffer::BufferPoolManager;
use birchdb::common::{BTreeConfig, BirchError, PageId, RecordId, SlotId, INVALID_PAGE_ID};
use birchdb::index::{
    BPlusTree, BytewiseComparator, GenericKey, IntegerComparator, OrdComparator,
};
use birchdb::storage::disk::DiskManager;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tempfile::NamedTempFile;

fn create_bpm(pool_size: usize) -> (Arc<BufferPoolManager>, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let disk_manager = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    let bpm = Arc::new(BufferPoolManager::new(pool_size, disk_manager));
    (bpm, temp_file)
}

fn rid(i: i64) -> RecordId {
    RecordId::new(PageId::new(i as u32 / 100), SlotId::new((i % 100) as u16))
}

fn collect_keys<V: birchdb::index::Storable>(tree: &BPlusTree<i64, V, OrdComparator>) -> Vec<i64> {
    tree.begin().unwrap().map(|entry| entry.unwrap().0).collect()
}

#[test]
fn test_btree_create() {
    let (bpm, _temp) = create_bpm(10);
    let tree = BPlusTree::<i64, RecordId, _>::new("idx", bpm.clone(), OrdComparator, BTreeConfig::default())
        .unwrap();

    assert!(tree.is_empty());
    assert_eq!(tree.root_page_id(), INVALID_PAGE_ID);
    assert_eq!(tree.name(), "idx");
    // Page 0 was claimed for the header
    assert_eq!(bpm.disk_manager().get_num_pages(), 1);
}

#[test]
fn test_btree_insert_and_search() {
    let (bpm, _temp) = create_bpm(10);
    let tree = BPlusTree::new("idx", bpm, OrdComparator, BTreeConfig::default()).unwrap();

    let record1 = RecordId::new(PageId::new(100), SlotId::new(0));
    let record2 = RecordId::new(PageId::new(100), SlotId::new(1));
    let record3 = RecordId::new(PageId::new(101), SlotId::new(0));

    assert!(tree.insert(10i64, record1).unwrap());
    assert!(tree.insert(20, record2).unwrap());
    assert!(tree.insert(30, record3).unwrap());

    assert_eq!(tree.get(&10).unwrap(), Some(record1));
    assert_eq!(tree.get(&20).unwrap(), Some(record2));
    assert_eq!(tree.get(&30).unwrap(), Some(record3));
    assert_eq!(tree.get(&40).unwrap(), None);
}

#[test]
fn test_btree_insert_many_sequential() {
    let (bpm, _temp) = create_bpm(64);
    let tree = BPlusTree::new("idx", bpm, OrdComparator, BTreeConfig::new(16, 16)).unwrap();

    for i in 0..1000i64 {
        assert!(tree.insert(i, rid(i)).unwrap());
    }
    for i in 0..1000i64 {
        assert_eq!(tree.get(&i).unwrap(), Some(rid(i)), "key {}", i);
    }

    let stats = tree.check_integrity().unwrap();
    assert_eq!(stats.entries, 1000);
    assert!(stats.height >= 3);
}

#[test]
fn test_btree_insert_many_descending() {
    let (bpm, _temp) = create_bpm(64);
    let tree = BPlusTree::new("idx", bpm, OrdComparator, BTreeConfig::new(4, 5)).unwrap();

    for i in (0..500i64).rev() {
        tree.insert(i, i * 2).unwrap();
    }
    tree.check_integrity().unwrap();
    assert_eq!(collect_keys(&tree), (0..500).collect::<Vec<_>>());
}

#[test]
fn test_btree_random_insert_and_remove() {
    let (bpm, _temp) = create_bpm(64);
    let tree = BPlusTree::new("idx", bpm, OrdComparator, BTreeConfig::new(5, 4)).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let mut keys: Vec<i64> = (0..2000).collect();
    keys.shuffle(&mut rng);
    for &key in &keys {
        assert!(tree.insert(key, key + 1).unwrap());
    }
    assert_eq!(tree.check_integrity().unwrap().entries, 2000);

    keys.shuffle(&mut rng);
    let (removed, kept) = keys.split_at(1000);
    for (i, key) in removed.iter().enumerate() {
        assert!(tree.remove(key).unwrap());
        if i % 100 == 0 {
            tree.check_integrity().unwrap();
        }
    }

    let stats = tree.check_integrity().unwrap();
    assert_eq!(stats.entries, 1000);
    for key in removed {
        assert_eq!(tree.get(key).unwrap(), None);
        assert!(!tree.remove(key).unwrap());
    }
    for key in kept {
        assert_eq!(tree.get(key).unwrap(), Some(key + 1));
    }

    let mut expected = kept.to_vec();
    expected.sort();
    assert_eq!(collect_keys(&tree), expected);
}

#[test]
fn test_btree_reinsert_after_emptying() {
    let (bpm, _temp) = create_bpm(32);
    let tree = BPlusTree::new("idx", bpm.clone(), OrdComparator, BTreeConfig::new(3, 3)).unwrap();

    for round in 0..3i64 {
        for key in 0..60i64 {
            tree.insert(key, round).unwrap();
        }
        tree.check_integrity().unwrap();
        for key in 0..60i64 {
            tree.remove(&key).unwrap();
        }
        assert!(tree.is_empty());
    }

    // Freed pages were reused rather than growing the file each round
    let pages = bpm.disk_manager().get_num_pages();
    for key in 0..60i64 {
        tree.insert(key, 9).unwrap();
    }
    assert!(bpm.disk_manager().get_num_pages() <= pages + 1);
}

#[test]
fn test_btree_range_scan() {
    let (bpm, _temp) = create_bpm(32);
    let tree = BPlusTree::new("idx", bpm, OrdComparator, BTreeConfig::new(4, 4)).unwrap();

    for i in (0..200i64).step_by(5) {
        tree.insert(i, rid(i)).unwrap();
    }

    let results = tree.range(&23, &51).unwrap();
    let keys: Vec<i64> = results.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![25, 30, 35, 40, 45, 50]);
    assert_eq!(results[0].1, rid(25));

    // Bounds that are present are included
    let keys: Vec<i64> = tree.range(&25, &50).unwrap().into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![25, 30, 35, 40, 45, 50]);

    assert_eq!(tree.range(&196, &1000).unwrap().len(), 0);
    assert_eq!(tree.range(&-10, &0).unwrap(), vec![(0, rid(0))]);
}

#[test]
fn test_btree_begin_at_past_end() {
    let (bpm, _temp) = create_bpm(16);
    let tree = BPlusTree::new("idx", bpm, OrdComparator, BTreeConfig::new(4, 4)).unwrap();
    for i in 0..20i64 {
        tree.insert(i, i).unwrap();
    }

    assert_eq!(tree.begin_at(&100).unwrap().count(), 0);
    let tail: Vec<i64> = tree.begin_at(&17).unwrap().map(|e| e.unwrap().0).collect();
    assert_eq!(tail, vec![17, 18, 19]);
}

#[test]
fn test_btree_generic_keys_with_integer_comparator() {
    let (bpm, _temp) = create_bpm(32);
    let tree = BPlusTree::<GenericKey<16>, RecordId, _>::new(
        "generic",
        bpm,
        IntegerComparator,
        BTreeConfig::new(4, 4),
    )
    .unwrap();

    for i in -50..50i64 {
        tree.insert(GenericKey::from_i64(i), rid(i + 50)).unwrap();
    }
    tree.check_integrity().unwrap();

    let keys: Vec<i64> = tree
        .begin()
        .unwrap()
        .map(|entry| entry.unwrap().0.to_i64())
        .collect();
    assert_eq!(keys, (-50..50).collect::<Vec<_>>());
    assert_eq!(tree.get(&GenericKey::from_i64(-7)).unwrap(), Some(rid(43)));
}

#[test]
fn test_btree_bytewise_keys() {
    let (bpm, _temp) = create_bpm(16);
    let tree = BPlusTree::<GenericKey<8>, u32, _>::new(
        "names",
        bpm,
        BytewiseComparator,
        BTreeConfig::new(3, 3),
    )
    .unwrap();

    let names = ["pear", "apple", "fig", "banana", "kiwi", "cherry", "date"];
    for (i, name) in names.iter().enumerate() {
        tree.insert(GenericKey::from_bytes(name.as_bytes()), i as u32).unwrap();
    }

    let mut sorted = names.to_vec();
    sorted.sort();
    let keys: Vec<GenericKey<8>> = tree.begin().unwrap().map(|e| e.unwrap().0).collect();
    let expected: Vec<GenericKey<8>> = sorted
        .iter()
        .map(|name| GenericKey::from_bytes(name.as_bytes()))
        .collect();
    assert_eq!(keys, expected);
}

#[test]
fn test_btree_persistence_by_name() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_path_buf();
    let root;

    {
        let dm = Arc::new(DiskManager::new(&path).unwrap());
        let bpm = Arc::new(BufferPoolManager::new(16, dm));
        let tree = BPlusTree::new("accounts", bpm.clone(), OrdComparator, BTreeConfig::new(8, 8))
            .unwrap();
        for i in 0..500i64 {
            tree.insert(i, rid(i)).unwrap();
        }
        for i in (0..500i64).step_by(3) {
            tree.remove(&i).unwrap();
        }
        root = tree.root_page_id();
        bpm.flush_all_pages().unwrap();
    }

    let dm = Arc::new(DiskManager::new(&path).unwrap());
    let bpm = Arc::new(BufferPoolManager::new(16, dm));
    let tree = BPlusTree::<i64, RecordId, _>::new("accounts", bpm, OrdComparator, BTreeConfig::new(8, 8))
        .unwrap();

    assert_eq!(tree.root_page_id(), root);
    for i in 0..500i64 {
        let expected = if i % 3 == 0 { None } else { Some(rid(i)) };
        assert_eq!(tree.get(&i).unwrap(), expected);
    }
    assert_eq!(tree.check_integrity().unwrap().entries, 333);
}

#[test]
fn test_btree_multiple_indexes_share_file() {
    let (bpm, _temp) = create_bpm(32);
    let evens = BPlusTree::new("evens", bpm.clone(), OrdComparator, BTreeConfig::new(4, 4)).unwrap();
    let odds = BPlusTree::new("odds", bpm.clone(), OrdComparator, BTreeConfig::new(4, 4)).unwrap();

    for i in 0..100i64 {
        let tree = if i % 2 == 0 { &evens } else { &odds };
        tree.insert(i, i).unwrap();
    }
    assert_ne!(evens.root_page_id(), odds.root_page_id());
    assert_eq!(evens.check_integrity().unwrap().entries, 50);
    assert_eq!(odds.check_integrity().unwrap().entries, 50);
    assert_eq!(evens.get(&3).unwrap(), None);
    assert_eq!(odds.get(&3).unwrap(), Some(3));

    // A second handle on the same name sees the same tree
    let again = BPlusTree::<i64, i64, _>::new("odds", bpm, OrdComparator, BTreeConfig::new(4, 4))
        .unwrap();
    assert_eq!(again.root_page_id(), odds.root_page_id());
}

#[test]
fn test_btree_invalid_config() {
    let (bpm, _temp) = create_bpm(8);
    let result = BPlusTree::<i64, i64, _>::new("idx", bpm.clone(), OrdComparator, BTreeConfig::new(1, 4));
    assert!(matches!(result, Err(BirchError::InvalidConfig(_))));

    let result = BPlusTree::<i64, i64, _>::new("idx", bpm.clone(), OrdComparator, BTreeConfig::new(4, 2));
    assert!(matches!(result, Err(BirchError::InvalidConfig(_))));

    let result = BPlusTree::<i64, i64, _>::new("idx", bpm, OrdComparator, BTreeConfig::new(100_000, 4));
    assert!(matches!(result, Err(BirchError::InvalidConfig(_))));
}

#[test]
fn test_btree_pool_exhaustion_leaves_tree_intact() {
    let mut exhausted = 0;

    for pool_size in 6..=12 {
        for seed in 0..4u64 {
            let (bpm, _temp) = create_bpm(pool_size);
            let tree = BPlusTree::new("tight", bpm, OrdComparator, BTreeConfig::new(4, 3)).unwrap();
            let mut model = BTreeMap::new();
            let mut rng = StdRng::seed_from_u64(seed);

            for _ in 0..800 {
                let key: i64 = rng.gen_range(0..300);
                let inserting = rng.gen_bool(0.6);
                let outcome = if inserting {
                    tree.insert(key, key * 7)
                } else {
                    tree.remove(&key)
                };

                match outcome {
                    Ok(changed) => {
                        let expected = if inserting {
                            model.insert(key, key * 7).is_none()
                        } else {
                            model.remove(&key).is_some()
                        };
                        assert_eq!(changed, expected);
                    }
                    Err(BirchError::BufferPoolFull) => {
                        // A failed operation changes nothing
                        exhausted += 1;
                        if let Err(e) = tree.check_integrity() {
                            panic!("pool {} seed {} key {}: {}", pool_size, seed, key, e);
                        }
                        assert_eq!(tree.get(&key).unwrap(), model.get(&key).copied());
                    }
                    Err(e) => panic!("pool {} seed {}: unexpected error {}", pool_size, seed, e),
                }
            }

            assert_eq!(tree.check_integrity().unwrap().entries, model.len());
            assert_eq!(collect_keys(&tree), model.keys().copied().collect::<Vec<_>>());
        }
    }

    assert!(exhausted > 0);
}

#[derive(Debug, Clone)]
enum TreeOp {
    Insert(i64),
    Remove(i64),
}

fn tree_op() -> impl Strategy<Value = TreeOp> {
    prop_oneof![
        3 => (0i64..300).prop_map(TreeOp::Insert),
        2 => (0i64..300).prop_map(TreeOp::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_btree_matches_btree_map(
        ops in prop::collection::vec(tree_op(), 1..400),
        leaf_max in 2usize..6,
        internal_max in 3usize..6,
    ) {
        let (bpm, _temp) = create_bpm(64);
        let tree = BPlusTree::new(
            "prop",
            bpm,
            OrdComparator,
            BTreeConfig::new(leaf_max, internal_max),
        )
        .unwrap();
        let mut model = BTreeMap::new();

        for op in ops {
            match op {
                TreeOp::Insert(key) => {
                    let fresh = !model.contains_key(&key);
                    if fresh {
                        model.insert(key, key * 3);
                    }
                    prop_assert_eq!(tree.insert(key, key * 3).unwrap(), fresh);
                }
                TreeOp::Remove(key) => {
                    prop_assert_eq!(tree.remove(&key).unwrap(), model.remove(&key).is_some());
                }
            }
        }

        let stats = tree.check_integrity().unwrap();
        prop_assert_eq!(stats.entries, model.len());
        let entries: Vec<(i64, i64)> = tree.begin().unwrap().map(|e| e.unwrap()).collect();
        let expected: Vec<(i64, i64)> = model.into_iter().collect();
        prop_assert_eq!(entries, expected);
    }
}
