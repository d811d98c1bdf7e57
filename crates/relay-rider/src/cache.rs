use std::collections::HashMap;
use std::hash::Hash;

/// Read-through cache owned by the adapter layer. Entries are loaded on
/// demand and replaced only by explicit refresh or invalidation. No
/// implicit global state, no background refresh.
pub struct ReadThroughCache<K, V> {
    entries: HashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V> ReadThroughCache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn get_or_load(&mut self, key: &K, loader: impl FnOnce() -> V) -> &V {
        self.entries.entry(key.clone()).or_insert_with(loader)
    }

    pub fn refresh(&mut self, key: K, value: V) {
        self.entries.insert(key, value);
    }

    /// Used by list-invalidation hints: the next read goes to the server.
    pub fn invalidate(&mut self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash + Clone, V> Default for ReadThroughCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn loads_once_until_invalidated() {
        let loads = Cell::new(0);
        let mut cache: ReadThroughCache<u64, String> = ReadThroughCache::new();

        let load = || {
            loads.set(loads.get() + 1);
            "order #4".to_string()
        };
        assert_eq!(cache.get_or_load(&4, load), "order #4");
        assert_eq!(
            cache.get_or_load(&4, || {
                loads.set(loads.get() + 1);
                "should not run".to_string()
            }),
            "order #4"
        );
        assert_eq!(loads.get(), 1);

        cache.invalidate(&4);
        assert!(cache.get(&4).is_none());
        cache.get_or_load(&4, || {
            loads.set(loads.get() + 1);
            "order #4 v2".to_string()
        });
        assert_eq!(loads.get(), 2);
    }

    #[test]
    fn refresh_replaces_in_place() {
        let mut cache = ReadThroughCache::new();
        cache.refresh(1u64, "a");
        cache.refresh(1u64, "b");
        assert_eq!(cache.get(&1), Some(&"b"));
        assert_eq!(cache.len(), 1);
    }
}
