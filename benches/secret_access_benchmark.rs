//! Cost of protected-memory primitives: creating a secret, one scoped read
//! (two protection changes), and a cache hit.
//!
//! Run with: `cargo bench --bench secret_access_benchmark`

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lockbox::{AeadCrypto, Aes256GcmCrypto, KeyCache, RegionLayout, SecretFactory};

fn benchmark_secret(c: &mut Criterion) {
    let mut group = c.benchmark_group("secret");

    for (name, layout) in [
        ("standard", RegionLayout::Standard),
        ("guarded", RegionLayout::Guarded),
    ] {
        let factory = SecretFactory::with_layout(layout).unwrap();

        group.bench_function(format!("create_close_32b_{name}"), |b| {
            b.iter(|| {
                let secret = factory.create(&mut [7u8; 32]).unwrap();
                secret.close().unwrap();
            });
        });

        let secret = factory.create(&mut [7u8; 32]).unwrap();
        group.bench_function(format!("with_bytes_32b_{name}"), |b| {
            b.iter(|| secret.with_bytes(|bytes| Ok(black_box(bytes[0]))).unwrap());
        });
    }
    group.finish();
}

fn benchmark_cache_hit(c: &mut Criterion) {
    let crypto = Aes256GcmCrypto::new().unwrap();
    let cache = KeyCache::new(Duration::from_secs(3600));
    for i in 0..100 {
        cache
            .put_and_get_usable(&format!("_IK_partition_{i:03}"), crypto.generate_key().unwrap())
            .unwrap();
    }

    c.bench_function("key_cache_get", |b| {
        b.iter(|| cache.get(black_box("_IK_partition_050")).unwrap().unwrap());
    });
}

criterion_group!(benches, benchmark_secret, benchmark_cache_hit);
criterion_main!(benches);
