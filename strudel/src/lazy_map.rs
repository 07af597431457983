//! A map which creates its values on first access.

use std::{collections::HashMap, fmt, hash::Hash, sync::Arc};

use parking_lot::Mutex;

type Factory<K, V> = Arc<dyn Fn(&K) -> V + Send + Sync + 'static>;

/// Maps keys to values created by a factory on first access.
///
/// The factory runs at most once per key, even when several tasks ask for the same missing
/// key at the same time.  Values are never evicted.
///
/// Cloning returns a handle to the same map.
pub struct KeyedLazyMap<K, V> {
    entries: Arc<Mutex<HashMap<K, V>>>,
    factory: Factory<K, V>,
}

impl<K, V> Clone for KeyedLazyMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            factory: self.factory.clone(),
        }
    }
}

impl<K, V> fmt::Debug for KeyedLazyMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLazyMap")
            .field("len", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl<K, V> KeyedLazyMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty map using `factory` to create missing values.
    pub fn new(factory: impl Fn(&K) -> V + Send + Sync + 'static) -> Self {
        Self {
            entries: Default::default(),
            factory: Arc::new(factory),
        }
    }

    /// Returns the value for `key`, creating it if needed.
    pub fn get(&self, key: &K) -> V {
        // The factory runs under the lock, it must not access this map.
        let mut entries = self.entries.lock();
        if let Some(value) = entries.get(key) {
            return value.clone();
        }
        let value = (self.factory)(key);
        entries.insert(key.clone(), value.clone());
        value
    }

    /// Returns the value for `key` without creating it.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.entries.lock().get(key).cloned()
    }

    /// Number of created values.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no value was created yet.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Keys of all created values.
    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }
}

impl<K, V> KeyedLazyMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Default,
{
    /// Creates an empty map filled with `V::default()` on access.
    pub fn with_default() -> Self {
        Self::new(|_| V::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_get_creates_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let map = {
            let calls = calls.clone();
            KeyedLazyMap::new(move |k: &String| {
                calls.fetch_add(1, Ordering::SeqCst);
                Arc::new(k.len())
            })
        };
        assert!(map.is_empty());
        assert_eq!(map.peek(&"abc".to_string()), None);
        let a = map.get(&"abc".to_string());
        let b = map.get(&"abc".to_string());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*a, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        map.get(&"x".to_string());
        assert_eq!(map.len(), 2);
        let mut keys = map.keys();
        keys.sort();
        assert_eq!(keys, vec!["abc".to_string(), "x".to_string()]);
    }

    #[test]
    fn test_concurrent_first_access() {
        let calls = Arc::new(AtomicUsize::new(0));
        let map = {
            let calls = calls.clone();
            KeyedLazyMap::new(move |_: &u32| {
                calls.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(5));
                Arc::new(Mutex::new(0u32))
            })
        };
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = map.clone();
                std::thread::spawn(move || map.get(&7))
            })
            .collect();
        let values: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_with_default() {
        let map: KeyedLazyMap<u8, Option<u8>> = KeyedLazyMap::with_default();
        assert_eq!(map.get(&1), None);
        assert_eq!(map.len(), 1);
    }
}
