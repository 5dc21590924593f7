// Read performance benchmarks for the krati storage core

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use krati::{Store, StoreConfig};
use std::hint::black_box;
use tempfile::TempDir;

fn populated_store(capacity: u32) -> (TempDir, Store) {
    let temp_dir = TempDir::new().unwrap();
    let config = StoreConfig::new(capacity).segment_file_size_mb(32);
    let store = Store::open(temp_dir.path(), config).unwrap();
    for i in 0..capacity {
        let value = format!("value{:08}", i);
        store.set(i, value.as_bytes(), 1 + i as u64).unwrap();
    }
    store.sync().unwrap();
    (temp_dir, store)
}

fn benchmark_sequential_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_read");

    for size in [100, 1000, 10000].iter() {
        let (_dir, store) = populated_store(*size as u32);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                for i in 0..size {
                    black_box(store.get(i as u32).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn benchmark_read_into_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_into_buffer");

    let (_dir, store) = populated_store(1000);
    group.throughput(Throughput::Elements(1000));
    group.bench_function("get_into_1000", |b| {
        let mut dst = [0u8; 64];
        b.iter(|| {
            for i in 0..1000u32 {
                black_box(store.get_into(i, &mut dst, 0).unwrap());
            }
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_sequential_read, benchmark_read_into_buffer);
criterion_main!(benches);
