use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use lockbox::{AeadCrypto, AeadEnvelopeCrypto, Aes256GcmCrypto, CryptoKey, KeyCache, SecretFactory};

const THREADS: usize = 100;

#[test]
fn test_concurrent_access_to_shared_secret() {
    let factory = SecretFactory::new().unwrap();
    let secret = Arc::new(factory.create(&mut vec![0, 1, 2, 3]).unwrap());
    let completed = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let secret = Arc::clone(&secret);
            let completed = Arc::clone(&completed);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..10 {
                    secret
                        .with_bytes(|bytes| {
                            assert_eq!(bytes, [0, 1, 2, 3]);
                            Ok(())
                        })
                        .unwrap();
                }
                completed.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), THREADS);

    // The last reader out must have restored NoAccess; a fresh read still
    // sees the original bytes.
    let sum = secret
        .with_bytes(|b| Ok(b.iter().map(|&x| usize::from(x)).sum::<usize>()))
        .unwrap();
    assert_eq!(sum, 6);
}

#[test]
fn test_close_waits_for_readers() {
    let factory = SecretFactory::new().unwrap();
    let secret = Arc::new(factory.create(&mut vec![7; 16]).unwrap());
    let barrier = Arc::new(Barrier::new(2));

    let reader = {
        let secret = Arc::clone(&secret);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            secret
                .with_bytes(|bytes| {
                    barrier.wait();
                    thread::sleep(Duration::from_millis(50));
                    Ok(bytes.iter().all(|&b| b == 7))
                })
                .unwrap()
        })
    };

    barrier.wait();
    secret.close().unwrap();
    assert!(reader.join().unwrap());
    assert!(secret.is_closed());
}

#[test]
fn test_concurrent_cache_inserts_keep_one_entry() {
    let cache = Arc::new(KeyCache::new(Duration::from_secs(60)));
    let factory = SecretFactory::new().unwrap();
    let barrier = Arc::new(Barrier::new(16));

    let handles: Vec<_> = (0..16u8)
        .map(|i| {
            let cache = Arc::clone(&cache);
            let factory = factory.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let key = CryptoKey::new(factory.create(&mut [i; 32]).unwrap(), Utc::now(), false);
                barrier.wait();
                let usable = cache.put_and_get_usable("contended", key).unwrap();
                let len = usable.with_key(|b| Ok(b.len())).unwrap();
                usable.close().unwrap();
                len
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 32);
    }
    assert_eq!(cache.len(), 1);
    let cached = cache.get("contended").unwrap().unwrap();
    assert!(!cached.is_closed());
}

#[test]
fn test_cache_close_while_reader_calls_back_into_cache() {
    let cache = Arc::new(KeyCache::new(Duration::from_secs(60)));
    let factory = SecretFactory::new().unwrap();
    let key = CryptoKey::new(factory.create(&mut [4; 32]).unwrap(), Utc::now(), false);
    let view = cache.put_and_get_usable("sk", key).unwrap();
    let (tx, rx) = mpsc::channel();
    let (entered_tx, entered_rx) = mpsc::channel();

    let reader = {
        let cache = Arc::clone(&cache);
        let view = view.share();
        let tx = tx.clone();
        thread::spawn(move || {
            let result = view.with_key(|_| {
                entered_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(100));
                Ok(cache.len())
            });
            tx.send(("reader", result.is_ok())).unwrap();
        })
    };

    let closer = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            entered_rx.recv().unwrap();
            thread::sleep(Duration::from_millis(20));
            let result = cache.close();
            tx.send(("closer", result.is_ok())).unwrap();
        })
    };

    let mut done = Vec::new();
    for _ in 0..2 {
        let (who, ok) = rx
            .recv_timeout(Duration::from_secs(3))
            .expect("cache close deadlocked against an in-flight reader");
        assert!(ok, "{who} failed");
        done.push(who);
    }
    reader.join().unwrap();
    closer.join().unwrap();

    assert!(done.contains(&"reader") && done.contains(&"closer"));
    assert!(cache.is_closed());
    assert!(cache.is_empty());
    assert!(view.is_closed());
}

#[test]
fn test_parallel_envelope_operations_share_kek() {
    let crypto = Arc::new(Aes256GcmCrypto::new().unwrap());
    let kek = Arc::new(crypto.generate_key().unwrap());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let crypto = Arc::clone(&crypto);
            let kek = Arc::clone(&kek);
            thread::spawn(move || {
                let payload = format!("payload-{i}").into_bytes();
                for _ in 0..20 {
                    let result = crypto.envelope_encrypt(&payload, &kek).unwrap();
                    let back = crypto
                        .envelope_decrypt(&result.cipher_text, &result.encrypted_key, kek.created(), &kek)
                        .unwrap();
                    assert_eq!(back, payload);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}
