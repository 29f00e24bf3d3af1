use std::cmp::Ordering;

use super::storable::GenericKey;

/// Total order over index keys.
pub trait KeyComparator<K>: Send + Sync {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Orders keys by their `Ord` implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrdComparator;

impl<K: Ord> KeyComparator<K> for OrdComparator {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Orders keys lexicographically by their raw bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl<K: AsRef<[u8]>> KeyComparator<K> for BytewiseComparator {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.as_ref().cmp(b.as_ref())
    }
}

/// Orders generic keys by the signed integer in their leading eight bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntegerComparator;

impl<const N: usize> KeyComparator<GenericKey<N>> for IntegerComparator {
    fn compare(&self, a: &GenericKey<N>, b: &GenericKey<N>) -> Ordering {
        a.to_i64().cmp(&b.to_i64())
    }
}
