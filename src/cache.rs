//! Generic reference-counted resource cache.
//!
//! Every long-lived resource in the storage core (pages, data items) is
//! admitted through one of these caches rather than held directly. The cache
//! guarantees that a resource is not evicted while any caller holds a
//! reference to it, and that a resource key is only ever loaded once even
//! when multiple threads request it concurrently.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Condvar, Mutex};

use crate::error::{QuarryError, Result};

/// How a resource is created and destroyed by the cache's owner.
pub trait CacheSource<K, R> {
    /// Load the resource identified by `key` from its backing store.
    fn load(&self, key: K) -> Result<R>;

    /// Release a resource back to its backing store once its reference
    /// count has dropped to zero.
    fn evict(&self, key: K, resource: R);
}

struct Inner<K, R> {
    entries: HashMap<K, R>,
    refs: HashMap<K, usize>,
    loading: HashMap<K, bool>,
    count: usize,
}

/// A reference-counted cache admitting resources of type `R` keyed by `K`.
///
/// The cache itself only tracks admission and reference counts; loading and
/// eviction are delegated to a [`CacheSource`] supplied by the owner.
pub struct ResourceCache<K, R> {
    max: usize,
    mu: Mutex<Inner<K, R>>,
    loaded: Condvar,
}

impl<K, R> ResourceCache<K, R>
where
    K: Eq + Hash + Copy,
    R: Clone,
{
    pub fn new(max: usize) -> Result<Self> {
        if max < 10 {
            return Err(QuarryError::MemTooSmall);
        }
        Ok(Self {
            max,
            mu: Mutex::new(Inner {
                entries: HashMap::new(),
                refs: HashMap::new(),
                loading: HashMap::new(),
                count: 0,
            }),
            loaded: Condvar::new(),
        })
    }

    /// Acquire the resource identified by `key`, loading it through `source`
    /// if it is not already resident. Blocks on `loaded` if another thread
    /// is concurrently loading the same key, waking as soon as that load
    /// publishes or fails rather than polling.
    pub fn acquire(&self, key: K, source: &dyn CacheSource<K, R>) -> Result<R> {
        let mut guard = self.mu.lock().map_err(|_| poisoned())?;
        loop {
            if let Some(resource) = guard.entries.get(&key) {
                let resource = resource.clone();
                *guard.refs.entry(key).or_insert(0) += 1;
                return Ok(resource);
            }

            if *guard.loading.get(&key).unwrap_or(&false) {
                guard = self.loaded.wait(guard).map_err(|_| poisoned())?;
                continue;
            }

            if guard.count >= self.max {
                return Err(QuarryError::CacheFull);
            }

            guard.count += 1;
            guard.loading.insert(key, true);
            drop(guard);

            let loaded = source.load(key);

            guard = self.mu.lock().map_err(|_| poisoned())?;
            guard.loading.remove(&key);
            match loaded {
                Ok(resource) => {
                    guard.entries.insert(key, resource.clone());
                    guard.refs.insert(key, 1);
                    self.loaded.notify_all();
                    return Ok(resource);
                }
                Err(e) => {
                    guard.count -= 1;
                    self.loaded.notify_all();
                    return Err(e);
                }
            }
        }
    }

    /// Release a previously acquired resource. When the reference count
    /// reaches zero the resource is evicted through `source`.
    pub fn release(&self, key: K, source: &dyn CacheSource<K, R>) -> Result<()> {
        let evicted = {
            let mut guard = self.mu.lock().map_err(|_| poisoned())?;
            let refs = guard.refs.get_mut(&key).ok_or(QuarryError::NullEntry)?;
            *refs -= 1;
            if *refs == 0 {
                guard.refs.remove(&key);
                guard.count -= 1;
                guard.entries.remove(&key)
            } else {
                None
            }
        };
        if let Some(resource) = evicted {
            source.evict(key, resource);
        }
        Ok(())
    }

    /// Evict every resident entry, regardless of reference count. Used only
    /// at shutdown.
    pub fn close(&self, source: &dyn CacheSource<K, R>) -> Result<()> {
        let entries = {
            let mut guard = self.mu.lock().map_err(|_| poisoned())?;
            let entries: Vec<(K, R)> = guard.entries.drain().collect();
            guard.refs.clear();
            guard.count = 0;
            entries
        };
        for (key, resource) in entries {
            source.evict(key, resource);
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn resident_count(&self) -> usize {
        self.mu.lock().unwrap().count
    }
}

fn poisoned() -> QuarryError {
    QuarryError::Internal("cache mutex poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        loads: AtomicUsize,
    }

    impl CacheSource<u64, u64> for CountingSource {
        fn load(&self, key: u64) -> Result<u64> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(key * 10)
        }

        fn evict(&self, _key: u64, _resource: u64) {}
    }

    #[test]
    fn acquire_loads_once_and_caches() {
        let cache: ResourceCache<u64, u64> = ResourceCache::new(16).unwrap();
        let source = CountingSource { loads: AtomicUsize::new(0) };

        let a = cache.acquire(1, &source).unwrap();
        let b = cache.acquire(1, &source).unwrap();
        assert_eq!(a, 10);
        assert_eq!(b, 10);
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        cache.release(1, &source).unwrap();
        cache.release(1, &source).unwrap();
        assert_eq!(cache.resident_count(), 0);
    }

    #[test]
    fn cache_full_when_at_capacity() {
        let cache: ResourceCache<u64, u64> = ResourceCache::new(10).unwrap();
        let source = CountingSource { loads: AtomicUsize::new(0) };
        for i in 0..10 {
            cache.acquire(i, &source).unwrap();
        }
        match cache.acquire(999, &source) {
            Err(QuarryError::CacheFull) => {}
            other => panic!("expected CacheFull, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn mem_too_small_rejected() {
        let result: Result<ResourceCache<u64, u64>> = ResourceCache::new(4);
        assert!(matches!(result, Err(QuarryError::MemTooSmall)));
    }
}
