//! Read-through cache of permission decisions.
//!
//! Entries map one (resource, subject, subject type, permission bit) to the
//! store's answer at the time it was read. They are populated only after a
//! committed store read, so a rolled-back grant can never be cached.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::permission::Permission;
use crate::settings::CacheSettings;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub resource_id: String,
    pub subject_id: String,
    pub subject_type: String,
    pub permission: Permission,
}

impl CacheKey {
    pub fn new(
        resource_id: &str,
        subject_id: &str,
        subject_type: &str,
        permission: Permission,
    ) -> Self {
        CacheKey {
            resource_id: resource_id.to_string(),
            subject_id: subject_id.to_string(),
            subject_type: subject_type.to_string(),
            permission,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "acl:{}:{}:{}:{}",
            self.resource_id,
            self.subject_type,
            self.subject_id,
            self.permission.bits()
        )
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// Failure reported by an external cache backend (a network cache, for
    /// instance). [`MemoryPermissionCache`] never fails.
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Key/TTL cache in front of the store's permission lookups.
///
/// No transactional semantics: values are eventually consistent with the
/// store. Implementations are shared by every unit of work in the process
/// and synchronize internally.
#[async_trait]
pub trait PermissionCache: Send + Sync + 'static {
    async fn get(&self, key: &CacheKey) -> Result<Option<bool>, CacheError>;

    async fn set(&self, key: CacheKey, allowed: bool, ttl: Duration) -> Result<(), CacheError>;

    /// Drop `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError>;
}

#[derive(Debug, Clone, Copy)]
struct CachedDecision {
    allowed: bool,
    expires_at: Instant,
}

impl CachedDecision {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
struct CacheInner {
    entries: RwLock<HashMap<CacheKey, CachedDecision>>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Process-local [`PermissionCache`]. Clones share the same entries.
///
/// When full, expired entries are purged first; if that frees nothing the
/// entry closest to expiry is evicted.
#[derive(Debug, Clone)]
pub struct MemoryPermissionCache {
    inner: Arc<CacheInner>,
}

impl Default for MemoryPermissionCache {
    fn default() -> Self {
        MemoryPermissionCache::from_settings(&CacheSettings::default())
    }
}

impl MemoryPermissionCache {
    pub fn new(max_entries: usize) -> Self {
        MemoryPermissionCache {
            inner: Arc::new(CacheInner {
                entries: RwLock::new(HashMap::new()),
                max_entries: max_entries.max(1),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        MemoryPermissionCache::new(settings.max_entries)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.inner.entries.read().len(),
            capacity: self.inner.max_entries,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        self.inner.entries.write().clear();
    }

    fn make_room(entries: &mut HashMap<CacheKey, CachedDecision>, max: usize, now: Instant) {
        if entries.len() < max {
            return;
        }
        entries.retain(|_, cached| !cached.is_expired(now));
        if entries.len() < max {
            return;
        }
        let oldest = entries
            .iter()
            .min_by_key(|(_, cached)| cached.expires_at)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            entries.remove(&key);
        }
    }
}

#[async_trait]
impl PermissionCache for MemoryPermissionCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<bool>, CacheError> {
        let now = Instant::now();
        let found = {
            let entries = self.inner.entries.read();
            entries.get(key).copied()
        };
        let allowed = match found {
            Some(cached) if !cached.is_expired(now) => Some(cached.allowed),
            Some(_) => {
                self.inner.entries.write().remove(key);
                None
            }
            None => None,
        };
        let counter = if allowed.is_some() {
            &self.inner.hits
        } else {
            &self.inner.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(allowed)
    }

    async fn set(&self, key: CacheKey, allowed: bool, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.inner.entries.write();
        if !entries.contains_key(&key) {
            Self::make_room(&mut entries, self.inner.max_entries, now);
        }
        entries.insert(
            key,
            CachedDecision {
                allowed,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.inner.entries.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(subject: &str) -> CacheKey {
        CacheKey::new("doc-1", subject, "user", Permission::READ)
    }

    #[tokio::test]
    async fn set_then_get() {
        let cache = MemoryPermissionCache::new(16);
        assert_eq!(cache.get(&key("a")).await.unwrap(), None);
        cache
            .set(key("a"), true, Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .set(key("b"), false, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get(&key("a")).await.unwrap(), Some(true));
        assert_eq!(cache.get(&key("b")).await.unwrap(), Some(false));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (2, 1, 2));
    }

    #[tokio::test]
    async fn permission_bit_is_part_of_the_key() {
        let cache = MemoryPermissionCache::new(16);
        cache
            .set(key("a"), true, Duration::from_secs(60))
            .await
            .unwrap();
        let write = CacheKey::new("doc-1", "a", "user", Permission::WRITE);
        assert_eq!(cache.get(&write).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = MemoryPermissionCache::new(16);
        cache
            .set(key("a"), true, Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(cache.get(&key("a")).await.unwrap(), Some(true));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get(&key("a")).await.unwrap(), None);
        assert_eq!(cache.stats().size, 0);
    }

    #[tokio::test]
    async fn remove_evicts_entry() {
        let cache = MemoryPermissionCache::new(16);
        cache
            .set(key("a"), true, Duration::from_secs(60))
            .await
            .unwrap();
        cache.remove(&key("a")).await.unwrap();
        cache.remove(&key("missing")).await.unwrap();
        assert_eq!(cache.get(&key("a")).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_evicts_soonest_expiry() {
        let cache = MemoryPermissionCache::new(2);
        cache
            .set(key("short"), true, Duration::from_secs(10))
            .await
            .unwrap();
        cache
            .set(key("long"), true, Duration::from_secs(100))
            .await
            .unwrap();
        cache
            .set(key("new"), true, Duration::from_secs(50))
            .await
            .unwrap();

        assert_eq!(cache.stats().size, 2);
        assert_eq!(cache.get(&key("short")).await.unwrap(), None);
        assert_eq!(cache.get(&key("long")).await.unwrap(), Some(true));
        assert_eq!(cache.get(&key("new")).await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn clones_share_entries() {
        let cache = MemoryPermissionCache::default();
        let other = cache.clone();
        cache
            .set(key("a"), true, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(other.get(&key("a")).await.unwrap(), Some(true));
        other.clear();
        assert_eq!(cache.stats().size, 0);
    }
}
