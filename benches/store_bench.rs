//! Benchmarks for StrataKV store operations

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use stratakv::{Config, CursorOp, Db, DbFlags, PutFlags, Store};
use tempfile::tempdir;

const N_KEYS: usize = 10_000;
const VALUE_SIZE: usize = 100;

fn open_store(path: &std::path::Path) -> Store {
    let config = Config::builder().path(path).rng_seed(0xbe).build();
    Store::open(config).unwrap()
}

fn fill(db: &Db) {
    let value = vec![b'x'; VALUE_SIZE];
    for i in 0..N_KEYS {
        let key = format!("key{i:06}");
        db.put(key.as_bytes(), &value, PutFlags::default()).unwrap();
    }
}

fn put_benchmark(c: &mut Criterion) {
    c.bench_function("put_sequential_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let store = open_store(&dir.path().join("bench.db"));
                let db = store.db(1, DbFlags::default()).unwrap();
                (dir, store, db)
            },
            |(_dir, _store, db)| {
                fill(&db);
            },
            BatchSize::PerIteration,
        );
    });
}

fn get_benchmark(c: &mut Criterion) {
    c.bench_function("get_hit_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let store = open_store(&dir.path().join("bench.db"));
                let db = store.db(1, DbFlags::default()).unwrap();
                fill(&db);
                (dir, store, db)
            },
            |(_dir, _store, db)| {
                for i in 0..N_KEYS {
                    let key = format!("key{i:06}");
                    let v = db.get(key.as_bytes()).unwrap();
                    assert_eq!(v.len(), VALUE_SIZE);
                }
            },
            BatchSize::LargeInput,
        );
    });
}

fn scan_benchmark(c: &mut Criterion) {
    c.bench_function("cursor_scan_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let store = open_store(&dir.path().join("bench.db"));
                let db = store.db(1, DbFlags::default()).unwrap();
                fill(&db);
                (dir, store, db)
            },
            |(_dir, _store, db)| {
                let mut cur = db.cursor(CursorOp::BeforeFirst, None).unwrap();
                let mut n = 0usize;
                while cur.to(CursorOp::Next).is_ok() {
                    n += 1;
                }
                assert_eq!(n, N_KEYS);
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, put_benchmark, get_benchmark, scan_benchmark);
criterion_main!(benches);
