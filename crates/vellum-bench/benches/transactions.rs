//! Transaction benchmarks.
//!
//! - Write transactions of growing size
//! - Integrating a remote changeset
//! - Opening read snapshots

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vellum_bench::utils::object_changeset;
use vellum_common::config::DbConfig;
use vellum_common::types::{ColumnAttrs, ColumnType, ObjKey};
use vellum_txn::{apply_changeset, Db};

fn bench_write_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("txn/write_commit");

    for objects in [10, 100, 1_000] {
        group.throughput(Throughput::Elements(objects as u64));
        group.bench_with_input(BenchmarkId::from_parameter(objects), &objects, |b, &n| {
            let db = Db::open(DbConfig::new()).unwrap();
            let (table, col) = {
                let mut w = db.start_write().unwrap();
                let t = w.add_table("items").unwrap();
                let col = w
                    .add_column(t, ColumnType::Int, "value", ColumnAttrs::NONE)
                    .unwrap();
                w.commit().unwrap();
                (t, col)
            };
            let mut next = 0i64;
            b.iter(|| {
                let mut w = db.start_write().unwrap();
                for _ in 0..n {
                    w.create_object_with_key(table, ObjKey::new(next)).unwrap();
                    w.set(table, col, ObjKey::new(next), next).unwrap();
                    next += 1;
                }
                black_box(w.commit().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_integrate_changeset(c: &mut Criterion) {
    let mut group = c.benchmark_group("txn/integrate_changeset");

    for objects in [10, 100, 1_000] {
        let changeset = object_changeset(objects);
        group.throughput(Throughput::Bytes(changeset.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(objects),
            &changeset,
            |b, changeset| {
                b.iter_batched(
                    || Db::open(DbConfig::new()).unwrap(),
                    |db| {
                        let mut w = db.start_write().unwrap();
                        apply_changeset(&mut w, changeset).unwrap();
                        black_box(w.commit().unwrap())
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

fn bench_start_read(c: &mut Criterion) {
    let db = Db::open(DbConfig::new()).unwrap();
    {
        let mut w = db.start_write().unwrap();
        apply_changeset(&mut w, &object_changeset(1_000)).unwrap();
        w.commit().unwrap();
    }

    c.bench_function("txn/start_read", |b| {
        b.iter(|| {
            let r = db.start_read(None).unwrap();
            black_box(r.version())
        });
    });
}

criterion_group!(
    benches,
    bench_write_commit,
    bench_integrate_changeset,
    bench_start_read,
);
criterion_main!(benches);
