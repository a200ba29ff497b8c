use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use entitycache::{CacheConfig, EntityKey, Gateway, MemoryDatabase};
use std::hint::black_box;
use std::sync::Arc;

fn setup(entries: i64) -> Gateway {
    let db = Arc::new(MemoryDatabase::new());
    let mut config = CacheConfig::for_read_heavy();
    config.max_entries = entries as usize * 2;
    let gateway = Gateway::new(db, config).expect("build gateway");

    for id in 0..entries {
        let key = EntityKey::new("User", id);
        gateway
            .write(&key, move |_: Option<String>| Ok(format!("user-{}", id)))
            .expect("seed");
    }
    gateway
}

fn bench_read_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("gateway/read_hit");
    for entries in [1_000i64, 10_000] {
        let gateway = setup(entries);
        group.bench_with_input(BenchmarkId::from_parameter(entries), &entries, |b, &entries| {
            let mut id = 0;
            b.iter(|| {
                id = (id + 7919) % entries;
                let key = EntityKey::new("User", id);
                black_box(gateway.get::<String>(&key).expect("read"));
            });
        });
    }
    group.finish();
}

fn bench_write_through(c: &mut Criterion) {
    let gateway = setup(1_000);
    let mut id = 0i64;

    c.bench_function("gateway/write_through", |b| {
        b.iter(|| {
            id = (id + 1) % 1_000;
            let key = EntityKey::new("User", id);
            black_box(
                gateway
                    .write(&key, |current: Option<String>| Ok(current.unwrap_or_default()))
                    .expect("write"),
            );
        });
    });
}

criterion_group!(benches, bench_read_hit, bench_write_through);
criterion_main!(benches);
