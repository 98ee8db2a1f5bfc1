//! Buffer strategy benchmarks.

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use tempfile::TempDir;
use tessera_bench::random_data;
use tessera_storage::{open_strategy, BufferMode, StoreOptions};

const RECORDS_PER_BATCH: usize = 64;

/// Benchmark WORM appends to a transient store.
fn bench_transient_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("transient_write");

    for size in [64, 256, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes((*size * RECORDS_PER_BATCH) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let data = random_data(size);
            b.iter_batched(
                || open_strategy(&StoreOptions::transient().initial_extent(1024 * 1024)).unwrap(),
                |mut store| {
                    for _ in 0..RECORDS_PER_BATCH {
                        black_box(store.write(black_box(&data)).unwrap());
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark reads of committed records.
fn bench_transient_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("transient_read");

    for size in [64, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut store = open_strategy(&StoreOptions::transient()).unwrap();
            let addr = store.write(&random_data(size)).unwrap();
            store.commit().unwrap();

            b.iter(|| black_box(store.read(black_box(addr)).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark a write followed by a durable root-block commit on disk.
fn bench_disk_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("disk_commit");
    group.sample_size(20);

    for mode in [BufferMode::DiskWorm, BufferMode::DiskRw, BufferMode::Direct] {
        group.bench_function(BenchmarkId::from_parameter(mode), |b| {
            let temp_dir = TempDir::new().unwrap();
            let options = StoreOptions::file(temp_dir.path().join("bench.tsr"), mode);
            let mut store = open_strategy(&options).unwrap();
            let data = random_data(512);
            let mut commit_time = 0u64;

            b.iter(|| {
                let addr = store.write(&data).unwrap();
                store.commit().unwrap();
                store.force(false).unwrap();
                commit_time += 1;
                let next = store.root_block().advance(tessera_storage::CommitPoint {
                    next_offset: store.next_offset(),
                    commit_record_addr: addr,
                    meta_bits_addr: store.meta_bits_addr(),
                    meta_start_addr: store.meta_start_addr(),
                    commit_time,
                });
                store.write_root_block(&next, true).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_transient_write,
    bench_transient_read,
    bench_disk_commit
);
criterion_main!(benches);
