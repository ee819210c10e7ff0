use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use engine::{Db, Options, ReadOptions, WriteBatch, WriteOptions};
use tempfile::tempdir;

const N_KEYS: usize = 10_000;
const VALUE_SIZE: usize = 100;

fn options() -> Options {
    Options {
        create_if_missing: true,
        write_buffer_size: 256 * 1024,
        ..Options::default()
    }
}

fn key(i: usize) -> Vec<u8> {
    format!("key{:08}", i).into_bytes()
}

fn filled_db(dir: &std::path::Path) -> Db {
    let db = Db::open(options(), dir).unwrap();
    let value = vec![b'x'; VALUE_SIZE];
    for i in 0..N_KEYS {
        db.put(&WriteOptions::default(), &key(i), &value).unwrap();
    }
    db.compact_range(None, None).unwrap();
    db
}

fn put_benchmark(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = Db::open(options(), dir.path()).unwrap();
    let value = vec![b'x'; VALUE_SIZE];
    let mut i = 0usize;

    c.bench_function("db_put", |b| {
        b.iter(|| {
            db.put(&WriteOptions::default(), &key(i), &value).unwrap();
            i += 1;
        })
    });
}

fn batch_benchmark(c: &mut Criterion) {
    c.bench_function("db_write_batch_100", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let db = Db::open(options(), dir.path()).unwrap();
                let mut batch = WriteBatch::new();
                for i in 0..100 {
                    batch.put(&key(i), &[b'x'; VALUE_SIZE]);
                }
                (dir, db, batch)
            },
            |(_dir, db, batch)| {
                db.write(&WriteOptions::default(), batch).unwrap();
            },
            BatchSize::SmallInput,
        );
    });
}

fn get_hit_benchmark(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = filled_db(dir.path());
    let mut i = 0usize;

    c.bench_function("db_get_hit_10k", |b| {
        b.iter(|| {
            let v = db.get(&ReadOptions::default(), &key(i % N_KEYS)).unwrap();
            assert!(v.is_some());
            i += 7;
        })
    });
}

fn get_miss_benchmark(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = filled_db(dir.path());
    let mut i = 0usize;

    c.bench_function("db_get_miss_10k", |b| {
        b.iter(|| {
            let missing = format!("missing{}", i).into_bytes();
            let v = db.get(&ReadOptions::default(), &missing).unwrap();
            assert!(v.is_none());
            i += 1;
        })
    });
}

fn scan_benchmark(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = filled_db(dir.path());

    c.bench_function("db_full_scan_10k", |b| {
        b.iter(|| {
            let mut it = db.iter(&ReadOptions::default()).unwrap();
            let mut n = 0;
            it.seek_to_first();
            while it.valid() {
                n += 1;
                it.next();
            }
            assert_eq!(n, N_KEYS);
        })
    });
}

criterion_group!(
    benches,
    put_benchmark,
    batch_benchmark,
    get_hit_benchmark,
    get_miss_benchmark,
    scan_benchmark
);
criterion_main!(benches);
