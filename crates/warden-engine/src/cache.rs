use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Expiring map keyed by cache key. Times are unix seconds supplied by the caller,
/// so expiry follows whatever clock the engine was built with.
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
}

struct CacheEntry<V> {
    value: V,
    expires_at: i64,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str, now: i64) -> Option<V> {
        self.entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone())
    }

    pub fn contains(&self, key: &str, now: i64) -> bool {
        self.get(key, now).is_some()
    }

    /// Live entries are never overwritten; returns whether `value` was stored.
    pub fn insert_if_absent(&self, key: String, value: V, expires_at: i64, now: i64) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return false;
                }
                occupied.insert(CacheEntry { value, expires_at });
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry { value, expires_at });
                true
            }
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn sweep_expired(&self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
