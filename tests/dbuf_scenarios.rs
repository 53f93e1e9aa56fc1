//! End-to-end scenarios from `spec.md` §8, run against the in-memory
//! collaborator doubles in `rusty_dbuf::testutil`. Block size is 512
//! throughout, matching the spec's literal examples.

use std::collections::VecDeque;
use std::sync::Arc;

use rusty_dbuf::buffer::BufferState;
use rusty_dbuf::collab::{BlockPointer, ReadFlags};
use rusty_dbuf::common::BufferKey;
use rusty_dbuf::testutil::test_cache;

const BLOCK_SIZE: u64 = 512;

fn key(blkid: u64) -> BufferKey {
    BufferKey::new(1, 1, 0, blkid)
}

/// Scenario 1: hole read. A freshly created Buffer with no block pointer
/// and no dirty records resolves to an all-zero `CACHED` buffer.
#[test]
fn scenario1_hole_read() {
    let (cache, _arc, _objects, _txmgr) = test_cache(64);
    let buf = cache.hold(key(0), BLOCK_SIZE);

    cache.read(&buf, ReadFlags::default()).expect("hole read never fails");

    let inner = buf.lock();
    assert!(inner.state.contains(BufferState::CACHED));
    let data = inner.data.as_ref().expect("cached buffer must carry data");
    assert!(data.read().iter().all(|&b| b == 0), "hole read must be all zeros");
}

/// Scenario 2: partial write then read. An existing on-disk block (all
/// 0xAA) gets a 50-byte interior write at offset 100; the complement must
/// come from disk, and the dirty record's range bookkeeping is fully
/// resolved by `fill_done`.
#[test]
fn scenario2_partial_write_then_read() {
    let (cache, arc, objects, _txmgr) = test_cache(64);
    let bp = BlockPointer::materialized(1);
    objects.set_block_pointer(1, 1, 0, 0, bp);
    arc.seed_disk(bp, vec![0xAAu8; BLOCK_SIZE as usize]);

    let buf = cache.hold(key(0), BLOCK_SIZE);
    cache.will_dirty_range(&buf, 5, 100, 50).unwrap();

    {
        let inner = buf.lock();
        let data = inner.data.as_ref().unwrap();
        data.write()[100..150].fill(0xBB);
    }

    // A second reader racing the writer observes the buffer already
    // resolved and must not disturb it.
    cache.read(&buf, ReadFlags::default()).unwrap();

    cache.fill_done(&buf, 5).unwrap();

    let inner = buf.lock();
    assert!(inner.state.contains(BufferState::CACHED));
    let data = inner.data.as_ref().unwrap();
    let bytes = data.read();
    assert!(bytes[0..100].iter().all(|&b| b == 0xAA));
    assert!(bytes[100..150].iter().all(|&b| b == 0xBB));
    assert!(bytes[150..512].iter().all(|&b| b == 0xAA));
    drop(bytes);

    let dr = inner.dirty_record_for_txg(5).expect("dirty record for txg 5 must survive");
    let write_ranges_empty = dr.payload.as_leaf().map(|l| l.lock().write_ranges.is_empty()).unwrap_or(false);
    assert!(write_ranges_empty, "ranges must be fully merged after fill_done");
}

/// Scenario 3: two-TXG overlap through the syncer. TXG 5 writes `0xAA` over
/// `[0,256)` on a zeroed disk block and closes without syncing; TXG 6 then
/// writes `0xBB` over `[128,384)` on the same (still-open) buffer. Syncing
/// TXG 5 must write `[0,256)=0xAA, [256,512)=0x00`; syncing TXG 6 afterward
/// must write `[0,128)=0xAA, [128,384)=0xBB, [384,512)=0x00`.
#[test]
fn scenario3_two_txg_overlap() {
    let (cache, arc, objects, _txmgr) = test_cache(64);
    let bp = BlockPointer::materialized(1);
    objects.set_block_pointer(1, 1, 0, 0, bp);
    arc.seed_disk(bp, vec![0u8; BLOCK_SIZE as usize]);

    let buf = cache.hold(key(0), BLOCK_SIZE);

    cache.will_dirty_range(&buf, 5, 0, 256).unwrap();
    buf.lock().data.as_ref().unwrap().write()[0..256].fill(0xAA);
    cache.fill_done(&buf, 5).unwrap();

    cache.will_dirty_range(&buf, 6, 128, 256).unwrap();
    buf.lock().data.as_ref().unwrap().write()[128..384].fill(0xBB);
    cache.fill_done(&buf, 6).unwrap();

    let dr5 = buf.lock().dirty_record_for_txg(5).unwrap().clone();
    let mut list5: VecDeque<Arc<rusty_dbuf::dirty::DirtyRecord>> = VecDeque::new();
    list5.push_back(dr5);
    cache.sync_list(&mut list5, 5).unwrap();

    let writes = arc.recorded_writes();
    assert_eq!(writes.len(), 1, "txg 5 sync should issue exactly one write");
    assert!(writes[0].1[0..256].iter().all(|&b| b == 0xAA));
    assert!(writes[0].1[256..512].iter().all(|&b| b == 0x00));

    let dr6 = buf.lock().dirty_record_for_txg(6).unwrap().clone();
    let mut list6: VecDeque<Arc<rusty_dbuf::dirty::DirtyRecord>> = VecDeque::new();
    list6.push_back(dr6);
    cache.sync_list(&mut list6, 6).unwrap();

    let writes = arc.recorded_writes();
    assert_eq!(writes.len(), 2, "txg 6 sync should add one more write");
    let second = &writes[1].1;
    assert!(second[0..128].iter().all(|&b| b == 0xAA));
    assert!(second[128..384].iter().all(|&b| b == 0xBB));
    assert!(second[384..512].iter().all(|&b| b == 0x00));
}

/// Scenario 4: free during fill. A buffer in `FILL` for TXG 5 receives a
/// `free_range` before the client calls `fill_done`; the free must defer
/// (`freed_in_flight`) rather than act immediately, and `fill_done` must
/// then zero the result, land in `CACHED` with an empty range list, and
/// dispatch any deferred override write.
#[test]
fn scenario4_free_during_fill() {
    let (cache, _arc, objects, _txmgr) = test_cache(64);
    objects.set_block_pointer(1, 1, 0, 0, BlockPointer::materialized(1));

    let buf = cache.hold(key(0), BLOCK_SIZE);
    cache.will_dirty(&buf, 5).unwrap();
    {
        let inner = buf.lock();
        assert!(inner.state.contains(BufferState::FILL), "will_dirty of a whole block must enter FILL");
        inner.data.as_ref().unwrap().write().fill(0xEE);
    }

    cache.free_range(1, 1, 0, 1, 5).unwrap();
    assert!(buf.lock().freed_in_flight, "a free arriving mid-fill must defer via freed_in_flight");

    cache.fill_done(&buf, 5).unwrap();

    let inner = buf.lock();
    assert!(inner.state.contains(BufferState::CACHED));
    assert!(!inner.freed_in_flight, "fill_done must clear the deferred-free flag");
    let data = inner.data.as_ref().unwrap();
    assert!(data.read().iter().all(|&b| b == 0), "freed-during-fill data must end up zeroed");

    let dr = inner.dirty_record_for_txg(5).expect("dirty record for txg 5 must survive the free");
    let write_ranges_empty = dr.payload.as_leaf().map(|l| l.lock().write_ranges.is_empty()).unwrap_or(false);
    assert!(write_ranges_empty, "ranges must be empty once the fill lands");
}

/// CoW fault handler, cached-only hit branch (§4.4.1): a fresh `UNCACHED`
/// buffer receiving a non-interior partial write (`off == 0`, not covering
/// the whole block) first tries a cached-only read; if the adaptive cache
/// already holds the block's prior contents (from an earlier buffer over
/// the same block pointer), those bytes must be adopted as the frontend
/// rather than a zeroed scratch allocation, and the skipped bookkeeping
/// must not leave a stale write range behind.
#[test]
fn cow_fault_handler_adopts_cached_only_hit() {
    let (cache, _arc, objects, _txmgr) = test_cache(64);
    let bp = BlockPointer::materialized(1);
    objects.set_block_pointer(1, 1, 0, 0, bp);

    // Warm the adaptive cache's directory for this block pointer via an
    // unrelated buffer, then let it drop out of the hash index.
    let warm = cache.hold(key(0), BLOCK_SIZE);
    cache.read(&warm, ReadFlags::default()).unwrap();
    {
        let inner = warm.lock();
        inner.data.as_ref().unwrap().write().fill(0xCD);
    }
    cache.release(&warm);
    assert!(!cache.contains_key(&key(0)), "the warm-up buffer must not linger in the hash index");

    let buf = cache.hold(key(0), BLOCK_SIZE);
    assert!(buf.lock().state.contains(BufferState::UNCACHED));

    cache.will_dirty_range(&buf, 5, 0, 128).unwrap();

    let inner = buf.lock();
    let data = inner.data.as_ref().expect("cached-only hit must adopt the prior contents as the frontend");
    assert!(data.read()[128..512].iter().all(|&b| b == 0xCD), "bytes outside the fault handler's own write must come from the cache hit, not a zero scratch buffer");
}

/// Scenario 5: read failure with pending writes. A racing background read
/// (e.g. a prefetch) completes with an error while a TXG's dirty record is
/// still attached to the buffer; the failure must be masked — counted via
/// `dirty_writes_lost`, never propagated — and the buffer's already-cached,
/// already-dirtied contents must survive untouched.
#[test]
fn scenario5_read_failure_with_pending_writes() {
    let (cache, _arc, objects, _txmgr) = test_cache(64);
    objects.set_block_pointer(1, 1, 0, 0, BlockPointer::materialized(1));

    let buf = cache.hold(key(0), BLOCK_SIZE);
    cache.will_dirty(&buf, 5).unwrap();
    {
        let inner = buf.lock();
        inner.data.as_ref().unwrap().write().fill(0xDD);
    }
    cache.fill_done(&buf, 5).unwrap();
    assert!(buf.lock().state.contains(BufferState::CACHED));

    rusty_dbuf::read_path::read_done(&cache, &buf, Err("simulated disk I/O failure".to_string()), false);

    let inner = buf.lock();
    assert!(inner.state.contains(BufferState::CACHED), "a masked failure must not disturb an already-cached buffer");
    let data = inner.data.as_ref().unwrap();
    assert!(data.read().iter().all(|&b| b == 0xDD), "the prior fill's bytes must survive the masked failure");
    drop(inner);

    assert_eq!(cache.stats().dirty_writes_lost, 1);
}

/// Scenario 6: syncer split. With `holds > 1` and the dirty record's data
/// aliasing the frontend, `sync_list` must clone the record's snapshot
/// away from the frontend before writing, leaving the open TXG's view
/// untouched on the original allocation.
#[test]
fn scenario6_syncer_split() {
    let (cache, _arc, objects, _txmgr) = test_cache(64);
    objects.set_block_pointer(1, 1, 0, 0, BlockPointer::materialized(1));

    let buf = cache.hold(key(0), BLOCK_SIZE);
    cache.will_dirty(&buf, 5).unwrap();
    {
        let inner = buf.lock();
        inner.data.as_ref().unwrap().write().fill(0x42);
    }
    cache.fill_done(&buf, 5).unwrap();

    // A second client takes its own hold, simulating an open-TXG reader
    // that still references the frontend while the syncer drains txg 5.
    let second_hold = cache.hold(key(0), BLOCK_SIZE);

    let frontend_before = buf.lock().data.clone().unwrap();
    let dr = buf.lock().dirty_record_for_txg(5).unwrap().clone();

    let mut list: VecDeque<Arc<rusty_dbuf::dirty::DirtyRecord>> = VecDeque::new();
    list.push_back(dr.clone());
    cache.sync_list(&mut list, 5).unwrap();

    assert_eq!(cache.stats().syncer_splits, 1);

    let frontend_after = buf.lock().data.clone().unwrap();
    assert!(
        rusty_dbuf::collab::ArcBuf::same_allocation(&frontend_before, &frontend_after),
        "the open TXG's frontend must stay on its original allocation"
    );

    let writes = _arc.recorded_writes();
    assert_eq!(writes.len(), 1);
    assert!(writes[0].1.iter().all(|&b| b == 0x42));

    cache.release(&second_hold);
}

/// P8 hold discipline: releasing the last hold on a clean, dirty-record-free
/// Buffer destroys it and removes it from the hash index.
#[test]
fn hold_discipline_destroys_on_last_release() {
    let (cache, _arc, _objects, _txmgr) = test_cache(64);
    let buf = cache.hold(key(7), BLOCK_SIZE);
    cache.read(&buf, ReadFlags::default()).unwrap();
    cache.release(&buf);

    assert!(!cache.contains_key(&key(7)), "buffer with no holds/dirty records must be evicted");
}

/// User eviction data: `set_user`/`get_user`/`replace_user`/`remove_user`
/// round-trip, and the eviction callback fires when the buffer is cleared.
#[test]
fn user_data_eviction_callback_fires_on_destroy() {
    use rusty_dbuf::buffer::UserData;
    use std::sync::atomic::{AtomicBool, Ordering};

    let (cache, _arc, _objects, _txmgr) = test_cache(64);
    let buf = cache.hold(key(9), BLOCK_SIZE);
    cache.read(&buf, ReadFlags::default()).unwrap();

    let fired = Arc::new(AtomicBool::new(false));
    let fired_cb = fired.clone();
    cache.set_user(
        &buf,
        UserData {
            tag: "test",
            ptr: Box::new(42u64),
            evict_fn: Some(Box::new(move |_| fired_cb.store(true, Ordering::SeqCst))),
        },
    );

    let seen = cache.get_user(&buf, |u| u.and_then(|u| u.ptr.downcast_ref::<u64>().copied()));
    assert_eq!(seen, Some(42));

    let replaced = cache.replace_user(
        &buf,
        UserData { tag: "test2", ptr: Box::new(99u64), evict_fn: None },
    );
    assert!(replaced.is_some(), "replace_user must return the previous attachment");

    let removed = cache.remove_user(&buf);
    assert!(removed.is_some());
    assert!(cache.get_user(&buf, |u| u.is_none()));

    cache.set_user(
        &buf,
        UserData { tag: "test3", ptr: Box::new(0u64), evict_fn: Some(Box::new(move |_| fired.store(true, Ordering::SeqCst))) },
    );
    cache.release(&buf);

    assert!(!cache.contains_key(&key(9)));
}
