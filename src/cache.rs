use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Entry stored in the DashMap with an expiry timestamp.
#[derive(Clone)]
pub(crate) struct CacheEntry<V> {
    value: V,
    pub(crate) expires_at: Instant,
}

/// Process-local TTL cache.
///
/// Entries are checked on read and evicted lazily. A background sweep can be
/// triggered with `evict_expired()`. Reads and writes on a key are serialized
/// by the DashMap shard lock.
#[derive(Clone)]
pub struct TtlCache<K, V> {
    pub(crate) local: Arc<DashMap<K, CacheEntry<V>>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(entry) = self.local.get(key) {
            if Instant::now() < entry.expires_at {
                return Some(entry.value.clone());
            }
            // expired, drop the ref before removing
            drop(entry);
            self.local.remove_if(key, |_, e| Instant::now() >= e.expires_at);
        }
        None
    }

    pub fn insert(&self, key: K, value: V) {
        self.local.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        self.local.remove(key);
    }

    /// Remove all expired entries and return how many were dropped.
    ///
    /// Counted inside `retain` so concurrent inserts never skew the result.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        self.local.retain(|_, entry| {
            let keep = entry.expires_at > now;
            if !keep {
                evicted += 1;
            }
            keep
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }
}

/// Periodically sweep a cache so idle keys don't accumulate.
pub fn spawn_sweeper<K, V>(cache: TtlCache<K, V>, every: Duration)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let evicted = cache.evict_expired();
            if evicted > 0 {
                tracing::debug!(evicted, "cache sweep");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_insert_invalidate() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        assert!(cache.get(&"a".to_string()).is_none());

        cache.insert("a".into(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));

        cache.invalidate(&"a".to_string());
        assert!(cache.get(&"a".to_string()).is_none());
    }

    #[test]
    fn test_expired_entries_are_evicted() {
        let cache: TtlCache<u8, u8> = TtlCache::new(Duration::ZERO);
        cache.insert(1, 1);
        cache.insert(2, 2);
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evict_while_inserting_concurrently() {
        let cache: TtlCache<u32, u32> = TtlCache::new(Duration::from_secs(60));
        let writer = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for i in 0..200_000 {
                    cache.insert(i, i);
                }
            })
        };

        // Nothing is expired, so every sweep must report zero.
        while !writer.is_finished() {
            assert_eq!(cache.evict_expired(), 0);
        }
        writer.join().unwrap();
        assert_eq!(cache.evict_expired(), 0);
        assert_eq!(cache.len(), 200_000);
    }
}
