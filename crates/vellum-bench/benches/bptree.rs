//! B+Tree benchmarks.
//!
//! - Appends and random-position inserts
//! - Indexed lookups and full scans
//! - Aggregates over integer trees
//! - String leaves

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vellum_bench::utils::{random_ints, random_strings};
use vellum_storage::{BPlusTree, SlabAlloc, TreeConfig};

const SIZES: [usize; 3] = [1_000, 10_000, 50_000];

fn filled_tree(values: &[i64]) -> (SlabAlloc, BPlusTree<i64>) {
    let mut alloc = SlabAlloc::new_writable();
    let mut tree = BPlusTree::<i64>::create(&mut alloc, TreeConfig::default()).unwrap();
    for v in values {
        tree.add(&mut alloc, v).unwrap();
    }
    (alloc, tree)
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("bptree/append");

    for size in SIZES {
        let values = random_ints(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &values, |b, values| {
            b.iter(|| {
                let (alloc, tree) = filled_tree(values);
                black_box(tree.size(&alloc).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_insert_random_position(c: &mut Criterion) {
    let mut group = c.benchmark_group("bptree/insert_random_position");

    for size in [1_000, 10_000] {
        let mut rng = StdRng::seed_from_u64(42);
        let positions: Vec<usize> = (0..size).map(|i| rng.gen_range(0..=i)).collect();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &positions, |b, positions| {
            b.iter(|| {
                let mut alloc = SlabAlloc::new_writable();
                let mut tree =
                    BPlusTree::<i64>::create(&mut alloc, TreeConfig::default()).unwrap();
                for (v, &ndx) in positions.iter().enumerate() {
                    tree.insert(&mut alloc, ndx, &(v as i64)).unwrap();
                }
                black_box(tree.size(&alloc).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("bptree/get");

    for size in SIZES {
        let (alloc, tree) = filled_tree(&random_ints(size));
        let mut rng = StdRng::seed_from_u64(9);
        let lookups: Vec<usize> = (0..1_000).map(|_| rng.gen_range(0..size)).collect();

        group.throughput(Throughput::Elements(lookups.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &lookups, |b, lookups| {
            b.iter(|| {
                let mut sum = 0i64;
                for &ndx in lookups {
                    sum = sum.wrapping_add(tree.get(&alloc, ndx).unwrap());
                }
                black_box(sum)
            });
        });
    }

    group.finish();
}

fn bench_scan_and_aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("bptree/scan");
    let size = 50_000;
    let (alloc, tree) = filled_tree(&random_ints(size));
    group.throughput(Throughput::Elements(size as u64));

    group.bench_function("for_each", |b| {
        b.iter(|| {
            let mut count = 0usize;
            tree.for_each(&alloc, |_, _| count += 1).unwrap();
            black_box(count)
        });
    });
    group.bench_function("sum", |b| b.iter(|| black_box(tree.sum(&alloc).unwrap())));
    group.bench_function("max", |b| b.iter(|| black_box(tree.max(&alloc).unwrap())));
    group.bench_function("find_first_missing", |b| {
        b.iter(|| black_box(tree.find_first(&alloc, &i64::MAX).unwrap()))
    });

    group.finish();
}

fn bench_erase_from_front(c: &mut Criterion) {
    let mut group = c.benchmark_group("bptree/erase_front");
    let size = 10_000;
    let values = random_ints(size);
    group.throughput(Throughput::Elements(size as u64));

    group.bench_function(BenchmarkId::from_parameter(size), |b| {
        b.iter_batched(
            || filled_tree(&values),
            |(mut alloc, mut tree)| {
                while !tree.is_empty(&alloc).unwrap() {
                    tree.erase(&mut alloc, 0).unwrap();
                }
                black_box(tree.size(&alloc).unwrap())
            },
            criterion::BatchSize::LargeInput,
        );
    });

    group.finish();
}

fn bench_string_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("bptree/string_append");

    for len in [8, 64, 256] {
        let values = random_strings(10_000, len);
        group.throughput(Throughput::Bytes((10_000 * len) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &values, |b, values| {
            b.iter(|| {
                let mut alloc = SlabAlloc::new_writable();
                let mut tree =
                    BPlusTree::<String>::create(&mut alloc, TreeConfig::default()).unwrap();
                for v in values {
                    tree.add(&mut alloc, v).unwrap();
                }
                black_box(tree.size(&alloc).unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_append,
    bench_insert_random_position,
    bench_get,
    bench_scan_and_aggregate,
    bench_erase_from_front,
    bench_string_append,
);
criterion_main!(benches);
