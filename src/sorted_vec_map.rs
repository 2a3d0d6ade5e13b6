use smallvec::SmallVec;
use std::fmt::Debug;

/// A map that keeps entries sorted by key, optimized for small collections.
///
/// Entities carry a handful of attributes, so attribute tables use a sorted
/// `SmallVec` instead of a hash map: entries stay on the stack up to `N`
/// elements and iteration order is deterministic (key sort order), which
/// keeps export rows and snapshot freezes stable across runs.
///
/// Lookups are `O(log n)` binary searches; insertion is `O(n)` to maintain
/// order. For large collections prefer `BTreeMap`.
#[derive(Clone, Debug, Default)]
pub struct SortedVecMap<K, V, const N: usize = 8> {
    inner: SmallVec<[(K, V); N]>,
}

impl<K: Ord, V> SortedVecMap<K, V> {
    /// Creates an empty `SortedVecMap`.
    #[inline]
    pub const fn new() -> Self {
        Self {
            inner: SmallVec::new_const(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: SmallVec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Inserts a key-value pair, replacing and returning any previous value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        match self.inner.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(idx) => Some(std::mem::replace(&mut self.inner[idx].1, value)),
            Err(idx) => {
                self.inner.insert(idx, (key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|idx| &self.inner[idx].1)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        match self.inner.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(idx) => Some(&mut self.inner[idx].1),
            Err(_) => None,
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|idx| self.inner.remove(idx).1)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.binary_search_by(|(k, _)| k.cmp(key)).is_ok()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.iter().map(|(_, v)| v)
    }

    /// Iterates entries in key sort order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter().map(|(k, v)| (k, v))
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for SortedVecMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_insert_keeps_sort_order() {
        let mut map = SortedVecMap::new();
        map.insert("height", 3);
        map.insert("age", 1);
        map.insert("carbon", 2);

        let keys: Vec<_> = map.keys().copied().collect();
        assert_eq!(keys, vec!["age", "carbon", "height"]);
    }

    #[test]
    fn test_insert_replaces_existing() {
        let mut map = SortedVecMap::new();
        assert_eq!(map.insert("age", 1), None);
        assert_eq!(map.insert("age", 2), Some(1));
        assert_eq!(map.get(&"age"), Some(&2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_remove_and_contains() {
        let mut map = SortedVecMap::new();
        map.insert(10, "a");
        map.insert(20, "b");

        assert_eq!(map.remove(&10), Some("a"));
        assert!(!map.contains_key(&10));
        assert!(map.contains_key(&20));
        assert_eq!(map.remove(&10), None);
    }

    #[test]
    fn test_from_iterator_dedupes_last_write_wins() {
        let map: SortedVecMap<&str, i32> =
            [("x", 1), ("y", 2), ("x", 3)].into_iter().collect();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&"x"), Some(&3));
    }
}
