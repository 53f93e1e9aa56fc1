// Block-buffer cache performance benchmarks.
// Exercises hold/read/dirty/sync throughput against the in-memory
// collaborator doubles, the same surface the hot foreground and syncer
// paths drive in production.

use std::collections::VecDeque;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rusty_dbuf::collab::{BlockPointer, ReadFlags};
use rusty_dbuf::common::BufferKey;
use rusty_dbuf::testutil::test_cache;

fn bench_hold_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("hold_release");

    for capacity in [64usize, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, &capacity| {
            let (cache, _arc, _objects, _txmgr) = test_cache(capacity);
            let mut blkid = 0u64;
            b.iter(|| {
                let key = BufferKey::new(1, 1, 0, black_box(blkid % capacity as u64));
                blkid += 1;
                let buf = cache.hold(key, 4096);
                cache.release(&buf);
            });
        });
    }

    group.finish();
}

fn bench_hole_read(c: &mut Criterion) {
    c.bench_function("hole_read", |b| {
        let (cache, _arc, _objects, _txmgr) = test_cache(1024);
        let mut blkid = 0u64;
        b.iter(|| {
            let key = BufferKey::new(1, 1, 0, black_box(blkid % 1024));
            blkid += 1;
            let buf = cache.hold(key, 4096);
            cache.read(&buf, ReadFlags::default()).unwrap();
            cache.release(&buf);
        });
    });
}

fn bench_cached_read(c: &mut Criterion) {
    c.bench_function("cached_read", |b| {
        let (cache, _arc, _objects, _txmgr) = test_cache(1024);
        let key = BufferKey::new(1, 1, 0, 0);
        let buf = cache.hold(key, 4096);
        cache.read(&buf, ReadFlags::default()).unwrap();
        b.iter(|| {
            cache.read(black_box(&buf), ReadFlags::default()).unwrap();
        });
        cache.release(&buf);
    });
}

fn bench_dirty_full_block(c: &mut Criterion) {
    c.bench_function("dirty_full_block", |b| {
        let (cache, _arc, objects, _txmgr) = test_cache(4096);
        objects.set_block_pointer(1, 1, 0, 0, BlockPointer::materialized(1));
        let key = BufferKey::new(1, 1, 0, 0);
        let mut txg = 1u64;
        b.iter(|| {
            txg += 1;
            let buf = cache.hold(key, 4096);
            cache.will_dirty(&buf, black_box(txg)).unwrap();
            cache.fill_done(&buf, txg).unwrap();
            cache.release(&buf);
        });
    });
}

fn bench_sync_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_throughput");

    for batch in [16usize, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let (cache, _arc, objects, _txmgr) = test_cache(4096);
            for blkid in 0..batch as u64 {
                objects.set_block_pointer(1, 1, 0, blkid, BlockPointer::materialized(1));
            }

            b.iter(|| {
                let txg = 5;
                let mut records = VecDeque::new();
                let mut bufs = Vec::with_capacity(batch);
                for blkid in 0..batch as u64 {
                    let key = BufferKey::new(1, 1, 0, blkid);
                    let buf = cache.hold(key, 4096);
                    cache.will_dirty(&buf, txg).unwrap();
                    cache.fill_done(&buf, txg).unwrap();
                    let dr = buf.lock().dirty_record_for_txg(txg).unwrap().clone();
                    records.push_back(dr);
                    bufs.push(buf);
                }
                cache.sync_list(black_box(&mut records), txg).unwrap();
                for buf in bufs {
                    cache.release(&buf);
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_hold_release,
    bench_hole_read,
    bench_cached_read,
    bench_dirty_full_block,
    bench_sync_throughput,
);
criterion_main!(benches);
