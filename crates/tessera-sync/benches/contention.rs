//! Microbenchmarks for the sync primitives under uncontended and
//! lightly-contended access patterns.

use std::sync::Arc;
use std::thread;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tessera_sync::{SharedTreemap, TxRwLock};

fn bench_rwlock_uncontended(c: &mut Criterion) {
    let lock = TxRwLock::new();
    c.bench_function("rwlock_rdlock_unlock", |b| {
        b.iter(|| {
            lock.try_rdlock().unwrap();
            lock.unlock();
        });
    });
    c.bench_function("rwlock_wrlock_unlock", |b| {
        b.iter(|| {
            lock.try_wrlock(false).unwrap();
            lock.unlock();
        });
    });
}

fn bench_treemap_lookup(c: &mut Criterion) {
    let map: SharedTreemap<u64> = SharedTreemap::new(48, 10).unwrap();
    for key in 0..1024_u64 {
        map.find_or_create(key * 64, |k| Ok(k)).unwrap();
    }
    c.bench_function("treemap_find_hit", |b| {
        let mut key = 0_u64;
        b.iter(|| {
            key = (key + 64) % (1024 * 64);
            black_box(map.find(key));
        });
    });
}

fn bench_treemap_concurrent_create(c: &mut Criterion) {
    c.bench_function("treemap_find_or_create_4_threads", |b| {
        b.iter(|| {
            let map: Arc<SharedTreemap<u64>> = Arc::new(SharedTreemap::new(32, 10).unwrap());
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let map = Arc::clone(&map);
                    thread::spawn(move || {
                        for key in 0..256_u64 {
                            map.find_or_create(key, |k| Ok(k)).unwrap();
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });
    });
}

criterion_group!(
    benches,
    bench_rwlock_uncontended,
    bench_treemap_lookup,
    bench_treemap_concurrent_create
);
criterion_main!(benches);
