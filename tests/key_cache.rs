use std::thread;
use std::time::Duration;

use chrono::Utc;
use lockbox::{BasicExpiringCryptoPolicy, CryptoKey, Error, KeyCache, SecretFactory};

fn key(fill: u8, revoked: bool) -> CryptoKey {
    let factory = SecretFactory::new().unwrap();
    let secret = factory.create(&mut [fill; 32]).unwrap();
    CryptoKey::new(secret, Utc::now(), revoked)
}

fn first_byte(key: &CryptoKey) -> u8 {
    key.with_key(|bytes| Ok(bytes[0])).unwrap()
}

#[test]
fn test_revoked_key_stays_usable_and_revoked() {
    // Revocation is terminal: a revoked entry is returned regardless of age.
    let cache = KeyCache::new(Duration::from_millis(0));
    cache.put_and_get_usable("revoked", key(1, true)).unwrap();

    thread::sleep(Duration::from_millis(5));
    let got = cache.get("revoked").unwrap().expect("revoked key is final");
    assert!(got.is_revoked());
}

#[test]
fn test_ttl_staleness_and_refresh() {
    let cache = KeyCache::new(Duration::from_millis(50));
    let usable = cache.put_and_get_usable("ik", key(1, false)).unwrap();
    usable.close().unwrap();

    assert!(cache.get("ik").unwrap().is_some());

    thread::sleep(Duration::from_millis(100));
    assert!(cache.get("ik").unwrap().is_none());

    // Re-inserting refreshes the entry but keeps the original key.
    let returned = cache.put_and_get_usable("ik", key(2, false)).unwrap();
    assert!(!returned.is_shared());
    returned.close().unwrap();

    let refreshed = cache.get("ik").unwrap().expect("refreshed");
    assert_eq!(first_byte(&refreshed), 1);
}

#[test]
fn test_duplicate_insert_returns_callers_key() {
    let cache = KeyCache::new(Duration::from_secs(60));
    let first = cache.put_and_get_usable("dup", key(1, false)).unwrap();
    assert!(first.is_shared());

    let second = cache.put_and_get_usable("dup", key(2, false)).unwrap();
    assert!(!second.is_shared());
    assert_eq!(first_byte(&second), 2);

    // Closing the returned duplicate must not touch the cached entry.
    second.close().unwrap();
    assert_eq!(cache.len(), 1);
    assert_eq!(first_byte(&cache.get("dup").unwrap().unwrap()), 1);
}

#[test]
fn test_revoked_duplicate_marks_cached_key() {
    let cache = KeyCache::new(Duration::from_secs(60));
    let view = cache.put_and_get_usable("rk", key(1, false)).unwrap();
    assert!(!view.is_revoked());

    let returned = cache.put_and_get_usable("rk", key(2, true)).unwrap();
    returned.close().unwrap();

    assert!(view.is_revoked());
    assert!(cache.get("rk").unwrap().unwrap().is_revoked());
}

#[test]
fn test_get_last_returns_greatest_id() {
    let cache = KeyCache::new(Duration::from_secs(60));
    for (i, id) in ["aaaaaaaa", "ghtew", "zzzzzzzz", "asdfasdfasdf", "klhjasdffghs"]
        .into_iter()
        .enumerate()
    {
        cache.put_and_get_usable(id, key(i as u8, false)).unwrap();
    }

    let last = cache.get_last().unwrap().unwrap();
    // "zzzzzzzz" was the third insert.
    assert_eq!(first_byte(&last), 2);
}

#[test]
fn test_cache_from_policy() {
    let policy = BasicExpiringCryptoPolicy::builder(90, 2).build();
    let cache = KeyCache::from_policy(&policy);
    assert_eq!(cache.revoke_check_period_millis(), 2 * 60 * 1000);
}

#[test]
fn test_close_closes_owned_keys_once() {
    let cache = KeyCache::new(Duration::from_secs(60));
    let views: Vec<_> = (0..3)
        .map(|i| {
            cache
                .put_and_get_usable(&format!("k{i}"), key(i, false))
                .unwrap()
        })
        .collect();

    cache.close().unwrap();
    assert!(cache.is_closed());
    assert!(cache.is_empty());
    for view in &views {
        assert!(view.is_closed());
        assert!(matches!(view.with_key(|_| Ok(())), Err(Error::InvalidState(_))));
    }

    // Second close is a no-op.
    cache.close().unwrap();
    assert!(matches!(cache.get("k0"), Err(Error::InvalidState(_))));
}
