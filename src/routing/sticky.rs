//! TTL + LRU sticky-session cache mapping a per-client key to a chosen
//! provider name.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::model::StickyEntry;

/// Which caller attribute the sticky key is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Key on the caller's user id.
    User,
    /// Key on the caller's API-key id.
    ApiKey,
    /// Key on the caller's session id.
    Session,
    /// Prefix with the first available of user, API-key, session.
    Composite,
}

/// Derive a sticky-cache key for one request per the configured [`KeyType`].
#[must_use]
pub fn derive_key(key_type: KeyType, user: &str, api_key_id: &str, session_id: Option<&str>) -> String {
    match key_type {
        KeyType::User => format!("user:{user}"),
        KeyType::ApiKey => format!("api_key:{api_key_id}"),
        KeyType::Session => format!("session:{}", session_id.unwrap_or_default()),
        KeyType::Composite => {
            if !user.is_empty() {
                format!("user:{user}")
            } else if !api_key_id.is_empty() {
                format!("api_key:{api_key_id}")
            } else {
                format!("session:{}", session_id.unwrap_or_default())
            }
        }
    }
}

struct Inner {
    /// Insertion/access order preserved for LRU eviction: the front is least
    /// recently used, the back is most recently used.
    entries: IndexMap<String, StickyEntry>,
}

/// TTL + LRU cache of sticky provider assignments.
pub struct StickyCache {
    capacity: usize,
    ttl: Option<Duration>,
    key_type: KeyType,
    inner: Mutex<Inner>,
}

impl StickyCache {
    /// Construct a sticky cache with the given capacity, optional TTL
    /// (`None` = entries never expire), and key derivation strategy.
    #[must_use]
    pub fn new(capacity: usize, ttl: Option<Duration>, key_type: KeyType) -> Self {
        Self {
            capacity,
            ttl,
            key_type,
            inner: Mutex::new(Inner {
                entries: IndexMap::new(),
            }),
        }
    }

    /// The configured key derivation strategy.
    #[must_use]
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Look up `key`. Returns `None` if absent or expired; a hit refreshes
    /// `last_accessed_at`, increments `access_count`, and moves the entry to
    /// the most-recently-used position.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<StickyEntry> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        let expired = inner
            .entries
            .get(key)
            .is_some_and(|e| e.expires_at.is_some_and(|exp| now >= exp));

        if expired {
            inner.entries.shift_remove(key);
            return None;
        }

        let entry = inner.entries.get_mut(key)?;
        entry.last_accessed_at = now;
        entry.access_count = entry.access_count.saturating_add(1);
        let updated = entry.clone();
        inner.entries.shift_remove(key);
        inner.entries.insert(key.to_owned(), updated.clone());
        Some(updated)
    }

    /// Upsert `key -> provider`. Inserting a new key at capacity evicts the
    /// least-recently-used entry; updating an existing key never evicts.
    pub fn set(&self, key: &str, provider: String) {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let expires_at = self.ttl.map(|ttl| now + chrono::Duration::from_std(ttl).unwrap_or_default());

        if let Some(existing) = inner.entries.get_mut(key) {
            existing.provider = provider;
            existing.last_accessed_at = now;
            existing.expires_at = expires_at;
            existing.access_count = existing.access_count.saturating_add(1);
            let updated = existing.clone();
            inner.entries.shift_remove(key);
            inner.entries.insert(key.to_owned(), updated);
            return;
        }

        if inner.entries.len() >= self.capacity && self.capacity > 0 {
            inner.entries.shift_remove_index(0);
        }

        inner.entries.insert(
            key.to_owned(),
            StickyEntry {
                provider,
                created_at: now,
                last_accessed_at: now,
                expires_at,
                access_count: 1,
            },
        );
    }

    /// Remove `key` unconditionally.
    pub fn delete(&self, key: &str) {
        self.inner.lock().entries.shift_remove(key);
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Current number of entries, including any not-yet-swept expired ones.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Drop expired entries. Intended to be called periodically by a
    /// background sweeper task.
    pub fn sweep_expired(&self) {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        inner.entries.retain(|_, e| match e.expires_at {
            None => true,
            Some(exp) => now < exp,
        });
    }
}

/// Spawn a background task that sweeps expired entries every `interval`
/// until the returned handle is aborted.
pub fn spawn_sweeper(cache: std::sync::Arc<StickyCache>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            cache.sweep_expired();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_none_for_missing_key() {
        let cache = StickyCache::new(4, None, KeyType::User);
        assert!(cache.get("user:u1").is_none());
    }

    #[test]
    fn set_then_get_roundtrips() {
        let cache = StickyCache::new(4, None, KeyType::User);
        cache.set("user:u1", "openai".to_owned());
        let entry = cache.get("user:u1").expect("entry should be cached");
        assert_eq!(entry.provider, "openai");
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = StickyCache::new(2, None, KeyType::User);
        cache.set("a", "p1".to_owned());
        cache.set("b", "p2".to_owned());
        cache.set("c", "p3".to_owned());
        assert_eq!(cache.size(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn expired_entry_is_not_returned() {
        let cache = StickyCache::new(4, Some(Duration::from_millis(1)), KeyType::User);
        cache.set("a", "p1".to_owned());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn access_count_is_monotonic() {
        let cache = StickyCache::new(4, None, KeyType::User);
        cache.set("a", "p1".to_owned());
        let first = cache.get("a").expect("entry should be cached").access_count;
        let second = cache.get("a").expect("entry should be cached").access_count;
        assert!(second > first);
    }

    #[test]
    fn composite_key_prefers_user_then_api_key_then_session() {
        assert_eq!(derive_key(KeyType::Composite, "u1", "k1", Some("s1")), "user:u1");
        assert_eq!(derive_key(KeyType::Composite, "", "k1", Some("s1")), "api_key:k1");
        assert_eq!(derive_key(KeyType::Composite, "", "", Some("s1")), "session:s1");
    }
}
