use std::hash::Hash;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;

/// A copy-on-write map for read-mostly data: reads are a lock-free snapshot load, and updates
///  clone the map and install the copy with a compare-and-swap, retrying on contention.
///
/// NB: Update closures may run several times and must not have side effects.
pub struct AtomicMap<K,V> {
    map: ArcSwap<FxHashMap<K,V>>,
}
impl <K: Hash+Eq+Clone+Sync+Send, V: Clone+Sync+Send> Default for AtomicMap<K,V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash+Eq+Clone+Sync+Send, V: Clone+Sync+Send> AtomicMap<K,V> {
    pub fn new() -> AtomicMap<K,V> {
        AtomicMap {
            map: ArcSwap::from_pointee(FxHashMap::default()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.load()
            .get(key)
            .cloned()
    }

    pub fn update<R>(&self, f: impl Fn(&mut FxHashMap<K,V>) -> R) -> R {
        loop {
            let old = self.map.load_full();

            let mut map: FxHashMap<K,V> = (*old).clone();
            let result = f(&mut map);

            let prev = self.map.compare_and_swap(&old, Arc::new(map));
            if Arc::ptr_eq(&*prev, &old) {
                return result;
            }
        }
    }

    /// Inserts the value unless there is an entry for the key that `is_live` accepts, in which
    ///  case that entry is returned as `Err`.
    pub fn insert_if_absent_or(&self, key: K, value: V, is_live: impl Fn(&V) -> bool) -> Result<(), V> {
        self.update(|m| {
            if let Some(existing) = m.get(&key) {
                if is_live(existing) {
                    return Err(existing.clone());
                }
            }
            m.insert(key.clone(), value.clone());
            Ok(())
        })
    }

    pub fn insert_if_absent(&self, key: K, value: V) -> Result<(), V> {
        self.insert_if_absent_or(key, value, |_| true)
    }

    /// returns the previous value
    pub fn replace(&self, key: K, value: V) -> Option<V> {
        self.update(|m| m.insert(key.clone(), value.clone()))
    }

    /// Removes the key's entry if the predicate matches it, returning whether it was removed.
    pub fn remove_if(&self, key: &K, pred: impl Fn(&V) -> bool) -> bool {
        self.update(|m| {
            match m.get(key) {
                Some(v) if pred(v) => {
                    m.remove(key);
                    true
                }
                _ => false,
            }
        })
    }

    pub fn values(&self) -> Vec<V> {
        self.map.load()
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
