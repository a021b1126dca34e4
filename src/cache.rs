//! Revocation-aware key cache.
//!
//! The cache lets many callers share a few expensive keys (system and
//! intermediate keys) while bounding how long a key revoked in the
//! metastore can stay trusted in-process.
//!
//! Ownership rules:
//! - The cache is the sole owner of every key stored in it.
//! - Callers only ever receive shared views, which are always safe to close.
//! - `put_and_get_usable` returns something the caller must close, whichever
//!   branch it takes.
//!
//! Ids are expected to sort lexicographically in creation order (for
//! example `"_IK_partition_service_product" + created`). `get_last` relies
//! on that; the cache does not check it.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::key::CryptoKey;
use crate::policy::CryptoPolicy;

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A cached key and the last time its revocation state was confirmed.
#[derive(Debug)]
struct KeyCacheEntry {
    /// The key as inserted. Closed once when the cache closes.
    key: CryptoKey,
    cached_time_millis: AtomicI64,
}

impl KeyCacheEntry {
    /// Revoked keys are final. Others are usable until the revoke check
    /// period has elapsed since they were cached or refreshed.
    fn usable(&self, now: i64, revoke_check_period_millis: i64) -> Option<CryptoKey> {
        if self.key.is_revoked()
            || now - self.cached_time_millis.load(Ordering::Acquire) < revoke_check_period_millis
        {
            return Some(self.key.share());
        }
        None
    }
}

/// A concurrent map from key id to cached key.
#[derive(Debug)]
pub struct KeyCache {
    entries: RwLock<BTreeMap<String, KeyCacheEntry>>,
    closed: AtomicBool,
    revoke_check_period_millis: i64,
}

impl KeyCache {
    pub fn new(revoke_check_period: Duration) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
            revoke_check_period_millis: i64::try_from(revoke_check_period.as_millis())
                .unwrap_or(i64::MAX),
        }
    }

    /// A cache using the policy's revoke check period.
    pub fn from_policy(policy: &dyn CryptoPolicy) -> Self {
        let millis = policy.revoke_check_period_millis().max(0) as u64;
        Self::new(Duration::from_millis(millis))
    }

    pub fn revoke_check_period_millis(&self) -> i64 {
        self.revoke_check_period_millis
    }

    fn ensure_open(&self, message: &'static str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidState(message));
        }
        Ok(())
    }

    /// A shared view of the key cached under `id`, or `None` if there is no
    /// entry or the entry is stale.
    ///
    /// Stale entries are not evicted; re-inserting the id refreshes them.
    pub fn get(&self, id: &str) -> Result<Option<CryptoKey>> {
        self.ensure_open("attempted to get key after cache close")?;
        let entries = self.entries.read();
        self.ensure_open("attempted to get key after cache close")?;

        let key = entries
            .get(id)
            .and_then(|entry| entry.usable(now_millis(), self.revoke_check_period_millis));
        if key.is_none() && entries.contains_key(id) {
            debug!(id, "cached key stale");
        }
        Ok(key)
    }

    /// Like [`KeyCache::get`] for the greatest id in the cache.
    pub fn get_last(&self) -> Result<Option<CryptoKey>> {
        self.ensure_open("attempted to get key after cache close")?;
        let entries = self.entries.read();
        self.ensure_open("attempted to get key after cache close")?;

        Ok(entries
            .last_key_value()
            .and_then(|(_, entry)| entry.usable(now_millis(), self.revoke_check_period_millis)))
    }

    /// Cache `key` under `id` and return the key the caller should use.
    ///
    /// - If `id` was absent the cache takes ownership of `key` and returns a
    ///   shared view of it.
    /// - If `id` was present `key` is not stored. A revoked `key` marks the
    ///   cached key revoked; otherwise the cached entry's timestamp is
    ///   refreshed. `key` itself is handed back for the caller to close.
    ///
    /// Either way, closing the returned key is always correct.
    pub fn put_and_get_usable(&self, id: &str, key: CryptoKey) -> Result<CryptoKey> {
        self.ensure_open("attempted to store key after cache close")?;
        let mut entries = self.entries.write();
        self.ensure_open("attempted to store key after cache close")?;

        match entries.entry(id.to_string()) {
            Entry::Vacant(vacant) => {
                let shared = key.share();
                vacant.insert(KeyCacheEntry {
                    key,
                    cached_time_millis: AtomicI64::new(now_millis()),
                });
                debug!(id, "cached key");
                Ok(shared)
            }
            Entry::Occupied(occupied) => {
                let cached = occupied.get();
                if key.is_revoked() {
                    warn!(id, "marking cached key revoked");
                    cached.key.mark_revoked();
                } else {
                    cached
                        .cached_time_millis
                        .store(now_millis(), Ordering::Release);
                }
                Ok(key)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every cached key once and empty the cache. Only the first call
    /// does anything; later calls return `Ok(())`.
    pub fn close(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        // Keys are closed after the map lock is released. Closing waits for
        // in-flight readers, and those may call back into the cache.
        let entries = std::mem::take(&mut *self.entries.write());
        debug!(count = entries.len(), "closing key cache");
        let mut first = None;
        for (_, entry) in entries {
            if let Err(err) = entry.key.close() {
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl Drop for KeyCache {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::error!(error = %err, "failed to close key cache on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::SecretFactory;

    fn key(revoked: bool) -> CryptoKey {
        let factory = SecretFactory::new().unwrap();
        CryptoKey::new(factory.create(&mut [3u8; 32]).unwrap(), Utc::now(), revoked)
    }

    #[test]
    fn test_get_missing_is_none() {
        let cache = KeyCache::new(Duration::from_secs(60));
        assert!(cache.get("nope").unwrap().is_none());
        assert!(cache.get_last().unwrap().is_none());
    }

    #[test]
    fn test_put_returns_shared_view() {
        let cache = KeyCache::new(Duration::from_secs(60));
        let usable = cache.put_and_get_usable("a", key(false)).unwrap();

        assert!(usable.is_shared());
        usable.close().unwrap();
        // Closing the view leaves the cached key intact.
        let cached = cache.get("a").unwrap().unwrap();
        assert!(!cached.is_closed());
    }

    #[test]
    fn test_stale_entry_refreshed_by_put() {
        let cache = KeyCache::new(Duration::from_millis(0));
        cache.put_and_get_usable("a", key(false)).unwrap();
        assert!(cache.get("a").unwrap().is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_entry_time_refreshes_on_duplicate_put() {
        let cache = KeyCache::new(Duration::from_secs(60));
        cache.put_and_get_usable("a", key(false)).unwrap();
        let before = cache.entries.read()["a"].cached_time_millis.load(Ordering::Acquire);
        std::thread::sleep(Duration::from_millis(5));

        let returned = cache.put_and_get_usable("a", key(false)).unwrap();
        returned.close().unwrap();

        let after = cache.entries.read()["a"].cached_time_millis.load(Ordering::Acquire);
        assert!(after > before);
    }

    #[test]
    fn test_operations_after_close_fail() {
        let cache = KeyCache::new(Duration::from_secs(60));
        cache.close().unwrap();
        assert!(cache.is_closed());
        assert!(matches!(cache.get("a"), Err(Error::InvalidState(_))));
        assert!(matches!(cache.get_last(), Err(Error::InvalidState(_))));
        assert!(matches!(
            cache.put_and_get_usable("a", key(false)),
            Err(Error::InvalidState(_))
        ));
    }
}
