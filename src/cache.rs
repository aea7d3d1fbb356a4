use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::util::lock_unpoisoned;

pub(crate) const DEFAULT_CACHE_CAPACITY: usize = 4096;

#[derive(Clone, Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// A last-writer-wins cache whose entries vanish once their TTL runs out.
///
/// Expired entries are evicted when they are read. Once `capacity` is reached,
/// an insert first purges everything already expired and then drops the
/// entries closest to expiry.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    capacity: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = lock_unpoisoned(&self.entries);
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut entries = lock_unpoisoned(&self.entries);
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            entries.retain(|_, entry| entry.expires_at > now);
            if entries.len() >= self.capacity {
                let mut by_expiry = entries
                    .iter()
                    .map(|(key, entry)| (entry.expires_at, key.clone()))
                    .collect::<Vec<_>>();
                by_expiry.sort_by_key(|(expires_at, _)| *expires_at);
                let overflow = entries.len() + 1 - self.capacity;
                for (_, key) in by_expiry.into_iter().take(overflow) {
                    entries.remove(&key);
                }
            }
        }
        entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    /// Remaining lifetime of a live entry.
    pub fn expires_in(&self, key: &K) -> Option<Duration> {
        let entries = lock_unpoisoned(&self.entries);
        let entry = entries.get(key)?;
        let remaining = entry.expires_at.checked_duration_since(Instant::now())?;
        (!remaining.is_zero()).then_some(remaining)
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
    }
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_live_entries() {
        let cache = TtlCache::new(4);
        cache.insert("example.com".to_owned(), 1_u8, Duration::from_secs(60));
        assert_eq!(cache.get(&"example.com".to_owned()), Some(1));
    }

    #[test]
    fn evicts_expired_entry_on_read() {
        let cache = TtlCache::new(4);
        cache.insert("example.com".to_owned(), 1_u8, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"example.com".to_owned()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_ttl_is_not_stored() {
        let cache = TtlCache::new(4);
        cache.insert("example.com".to_owned(), 1_u8, Duration::ZERO);
        assert!(cache.is_empty());
    }

    #[test]
    fn overflow_drops_entry_closest_to_expiry() {
        let cache = TtlCache::new(2);
        cache.insert("short", 1_u8, Duration::from_secs(5));
        cache.insert("long", 2_u8, Duration::from_secs(500));
        cache.insert("new", 3_u8, Duration::from_secs(50));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"short"), None);
        assert_eq!(cache.get(&"long"), Some(2));
        assert_eq!(cache.get(&"new"), Some(3));
    }

    #[test]
    fn expires_in_reports_remaining_ttl() {
        let cache = TtlCache::new(2);
        cache.insert("host", 1_u8, Duration::from_secs(30));
        let remaining = cache.expires_in(&"host").expect("entry should be live");
        assert!(remaining <= Duration::from_secs(30));
        assert!(remaining > Duration::from_secs(25));
    }
}
