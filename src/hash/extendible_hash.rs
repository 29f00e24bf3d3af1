use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common::MAX_GLOBAL_DEPTH;

/// A bucket holds at most `bucket_capacity` entries, all of which agree on
/// the low `local_depth` bits of their hash.
#[derive(Debug)]
struct Bucket<K, V> {
    local_depth: u32,
    items: Vec<(K, V)>,
}

impl<K, V> Bucket<K, V> {
    fn new(local_depth: u32, capacity: usize) -> Self {
        Self {
            local_depth,
            items: Vec::with_capacity(capacity),
        }
    }
}

/// Directory state, guarded as a whole by the table's mutex.
#[derive(Debug)]
struct Directory<K, V> {
    global_depth: u32,
    bucket_capacity: usize,
    /// `2^global_depth` slots, each holding a bucket id
    slots: Vec<usize>,
    /// Indexed by bucket id; ids that were never split into are `None`
    buckets: Vec<Option<Bucket<K, V>>>,
    /// Bucket count target: starts at 2 and doubles with the directory
    num_buckets: usize,
    len: usize,
}

impl<K, V> Directory<K, V> {
    fn new(bucket_capacity: usize) -> Self {
        Self {
            global_depth: 1,
            bucket_capacity,
            slots: vec![0, 1],
            buckets: vec![
                Some(Bucket::new(1, bucket_capacity)),
                Some(Bucket::new(1, bucket_capacity)),
            ],
            num_buckets: 2,
            len: 0,
        }
    }

    fn bucket_id(&self, hash: u64) -> usize {
        let mask = (1u64 << self.global_depth) - 1;
        self.slots[(hash & mask) as usize]
    }

    fn bucket(&self, id: usize) -> &Bucket<K, V> {
        self.buckets[id]
            .as_ref()
            .expect("directory slot points at a live bucket")
    }

    fn bucket_mut(&mut self, id: usize) -> &mut Bucket<K, V> {
        self.buckets[id]
            .as_mut()
            .expect("directory slot points at a live bucket")
    }

    /// Doubles the directory; the upper half mirrors the lower half.
    fn grow(&mut self) {
        self.slots.extend_from_within(..);
        self.global_depth += 1;
        self.num_buckets *= 2;
        self.buckets.resize_with(self.slots.len(), || None);
        debug!(global_depth = self.global_depth, "extendible hash directory doubled");
    }

    /// Splits bucket `id` (whose local depth must be below the global depth)
    /// and redistributes its entries between the two halves.
    fn split(&mut self, id: usize, hash_of: impl Fn(&K) -> u64) {
        let capacity = self.bucket_capacity;
        let bucket = self.bucket_mut(id);
        let old_depth = bucket.local_depth;
        let new_depth = old_depth + 1;
        bucket.local_depth = new_depth;
        let items = std::mem::take(&mut bucket.items);

        let new_id = id + (1usize << old_depth);
        self.buckets[new_id] = Some(Bucket::new(new_depth, capacity));

        let mask = (1usize << new_depth) - 1;
        for (slot, target) in self.slots.iter_mut().enumerate() {
            if slot & mask == new_id {
                *target = new_id;
            }
        }

        for (key, value) in items {
            let dest = self.bucket_id(hash_of(&key));
            self.bucket_mut(dest).items.push((key, value));
        }

        debug!(bucket = id, new_bucket = new_id, local_depth = new_depth, "bucket split");
    }
}

/// Extendible hash table.
///
/// The directory doubles when a full bucket already uses every directory bit;
/// otherwise the full bucket is split in two. The directory never shrinks.
///
/// All operations are serialized by one table-wide lock. Duplicate keys are
/// not rejected; `find` returns the value inserted last for a key.
pub struct ExtendibleHashTable<K, V, S = RandomState> {
    hasher: S,
    directory: Mutex<Directory<K, V>>,
}

impl<K, V> ExtendibleHashTable<K, V, RandomState>
where
    K: Hash + Eq,
    V: Clone,
{
    /// Creates a table whose buckets hold `bucket_capacity` entries each.
    pub fn new(bucket_capacity: usize) -> Self {
        Self::with_hasher(bucket_capacity, RandomState::new())
    }
}

impl<K, V, S> ExtendibleHashTable<K, V, S>
where
    K: Hash + Eq,
    V: Clone,
    S: BuildHasher,
{
    /// Creates a table that hashes keys with `hasher`.
    pub fn with_hasher(bucket_capacity: usize, hasher: S) -> Self {
        assert!(bucket_capacity > 0, "bucket capacity must be positive");
        Self {
            hasher,
            directory: Mutex::new(Directory::new(bucket_capacity)),
        }
    }

    fn hash_of(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    /// Looks up the value most recently inserted for `key`.
    pub fn find(&self, key: &K) -> Option<V> {
        let hash = self.hash_of(key);
        let directory = self.directory.lock();
        let bucket = directory.bucket(directory.bucket_id(hash));

        bucket
            .items
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Removes every entry for `key`. Returns whether anything was removed.
    pub fn remove(&self, key: &K) -> bool {
        let hash = self.hash_of(key);
        let mut directory = self.directory.lock();
        let id = directory.bucket_id(hash);
        let bucket = directory.bucket_mut(id);

        let before = bucket.items.len();
        bucket.items.retain(|(k, _)| k != key);
        let removed = before - bucket.items.len();

        directory.len -= removed;
        removed > 0
    }

    /// Appends `(key, value)`, splitting buckets and growing the directory
    /// until the target bucket has room.
    pub fn insert(&self, key: K, value: V) {
        let hash = self.hash_of(&key);
        let mut directory = self.directory.lock();

        loop {
            let id = directory.bucket_id(hash);
            let bucket = directory.bucket(id);
            if bucket.items.len() < directory.bucket_capacity {
                break;
            }

            // Entries sharing the full hash can never be told apart by a split
            let inseparable = bucket
                .items
                .iter()
                .all(|(k, _)| self.hash_of(k) == hash);
            let exhausted =
                bucket.local_depth == directory.global_depth && directory.global_depth >= MAX_GLOBAL_DEPTH;
            if inseparable || exhausted {
                warn!(
                    bucket = id,
                    entries = bucket.items.len(),
                    "bucket overflows its capacity"
                );
                break;
            }

            if bucket.local_depth < directory.global_depth {
                directory.split(id, |k| self.hash_of(k));
            } else {
                directory.grow();
            }
        }

        let id = directory.bucket_id(hash);
        directory.bucket_mut(id).items.push((key, value));
        directory.len += 1;
    }

    /// Number of directory bits in use.
    pub fn global_depth(&self) -> u32 {
        self.directory.lock().global_depth
    }

    /// Local depth of bucket `bucket_id`, or None if no such bucket exists.
    pub fn local_depth(&self, bucket_id: usize) -> Option<u32> {
        let directory = self.directory.lock();
        directory
            .buckets
            .get(bucket_id)
            .and_then(|b| b.as_ref())
            .map(|b| b.local_depth)
    }

    /// Bucket count target. Doubles whenever the directory doubles and is
    /// unchanged by a local split.
    pub fn num_buckets(&self) -> usize {
        self.directory.lock().num_buckets
    }

    /// Number of buckets actually allocated. Slots that share a bucket count
    /// it once.
    pub fn live_buckets(&self) -> usize {
        self.directory.lock().buckets.iter().filter(|b| b.is_some()).count()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.directory.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bucket capacity fixed at construction.
    pub fn bucket_capacity(&self) -> usize {
        self.directory.lock().bucket_capacity
    }

    /// Id of the bucket `key` currently resolves to.
    pub fn bucket_of(&self, key: &K) -> usize {
        let hash = self.hash_of(key);
        self.directory.lock().bucket_id(hash)
    }
}
