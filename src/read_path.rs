//! The read path (§4.2, C5).
//!
//! `read()` drives a Buffer to `CACHED` (or a typed error). Completion
//! (`read_done`) runs under the Buffer mutex from whatever thread the
//! collaborator's `arc_read` callback fires on — in this single-process
//! model that is either the calling thread (synchronous cache hit) or a
//! background thread the test/bench doubles spawn to simulate I/O
//! latency.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{instrument, trace, warn};

use crate::buffer::{Buffer, BufferState};
use crate::cache::DbufCache;
use crate::collab::{ArcBuf, ArcReadAflags, BlockPointer, IoPriority, ReadFlags};
use crate::common::BufferKind;
use crate::error::{DbufError, Result};

#[instrument(level = "debug", skip(cache, buf), fields(key = %buf.key))]
pub fn read(cache: &Arc<DbufCache>, buf: &Arc<Buffer>, flags: ReadFlags) -> Result<()> {
    let mut inner = buf.lock();

    // Step 1: NOFILL always fails EIO by design (§4.2, §7).
    if inner.state.contains(BufferState::NOFILL) {
        return Err(DbufError::NofillRead(buf.key.to_string()));
    }

    // Step 2: already resolved.
    if inner.state.contains(BufferState::CACHED) {
        drop(inner);
        cache.prefetch(buf.key.obj_set, buf.key.object, buf.key.blkid);
        return Ok(());
    }

    // Step 3: bonus block — materialize from the object's inline bonus
    // region into a fresh scratch allocation.
    if buf.key.is_bonus() {
        let len = cache.objects.bonus_len(buf.key.obj_set, buf.key.object).min(inner.size as usize);
        let data = cache.arc.arc_buf_alloc(inner.size as usize);
        let _ = len; // the object layer owns the actual bonus bytes; out of scope here beyond sizing.
        inner.data = Some(data);
        inner.state = BufferState::CACHED;
        drop(inner);
        buf.notify_changed();
        return Ok(());
    }

    let is_hole = inner.blkptr.map(|bp| bp.is_hole).unwrap_or(true)
        || cache.objects.is_freed_in_txg(buf.key.obj_set, buf.key.object, buf.key.level, buf.key.blkid, cache.txmgr.current_txg());

    // Step 4: hole / freed block — synthesize a zero image.
    if is_hole {
        inner.state = BufferState::READ.union(BufferState::FILL);
        drop(inner);
        cache.stats.hole_reads.fetch_add(1, Ordering::Relaxed);
        let size = buf.lock().size as usize;
        let zero = ArcBuf::zeroed(size);
        read_done(cache, buf, Ok(zero), true);
        return finish(cache, buf, flags);
    }

    // Step 5: CACHED_ONLY — query the adaptive cache without issuing I/O;
    // on a hit, adopt the result and transition CACHED; on a miss, return
    // without disturbing the buffer's current state.
    if flags.cached_only {
        let bp = inner.blkptr.unwrap_or(BlockPointer::HOLE);
        drop(inner);
        if let crate::collab::CachedOnlyOutcome::Hit(data) = cache.arc.arc_lookup_cached(bp) {
            let mut inner = buf.lock();
            inner.data = Some(data);
            inner.state = BufferState::CACHED;
            drop(inner);
            buf.notify_changed();
        }
        return Ok(());
    }

    // Step 6: issue an asynchronous read, unless one is already in flight.
    let already_in_flight = inner.state.contains(BufferState::READ) || inner.state.contains(BufferState::FILL);
    if already_in_flight {
        if flags.neverwait {
            drop(inner);
            return Ok(());
        }
        let inner2 = buf.wait_while(inner, |i| {
            !i.state.contains(BufferState::CACHED) && !i.state.contains(BufferState::UNCACHED)
        });
        drop(inner2);
        return finish(cache, buf, flags);
    }

    inner.state = BufferState::READ.union(BufferState::FILL);
    let bp = inner.blkptr.unwrap_or(BlockPointer::HOLE);
    let size = inner.size as usize;
    drop(inner);

    // pin across the async gap; this buffer is already held by our caller,
    // so it cannot have raced to EVICTING here.
    debug_assert!(crate::buffer::hold::add_ref(buf), "add_ref during async read pin raced with eviction");
    cache.stats.reads_issued.fetch_add(1, Ordering::Relaxed);

    let buf_for_cb = buf.clone();
    let cache_for_cb = cache.clone();
    let priority = if flags.noprefetch { IoPriority::Sync } else { IoPriority::Async };
    cache.arc.arc_read(
        bp,
        size,
        priority,
        flags,
        Box::new(move |result: std::result::Result<ArcBuf, String>, _aflags: ArcReadAflags| {
            read_done(&cache_for_cb, &buf_for_cb, result, false);
            crate::buffer::hold::release(&buf_for_cb, &cache_for_cb.hash, cache_for_cb.arc.as_ref());
        }),
    );

    if flags.neverwait {
        return Ok(());
    }
    finish(cache, buf, flags)
}

fn finish(cache: &DbufCache, buf: &Arc<Buffer>, flags: ReadFlags) -> Result<()> {
    let inner = buf.lock();
    let inner = buf.wait_while(inner, |i| {
        !i.state.contains(BufferState::CACHED) && !i.state.contains(BufferState::UNCACHED)
    });
    let failed = inner.state.contains(BufferState::UNCACHED) && inner.dirty_records.is_empty();
    drop(inner);
    if failed {
        if flags.canfail {
            return Err(DbufError::Eio(buf.key.to_string()));
        }
        panic!("read of {} failed and CANFAIL was not set", buf.key);
    }
    Ok(())
}

/// `read_done` (§4.2 "Read completion").
#[instrument(level = "debug", skip(cache, buf, result), fields(key = %buf.key))]
pub fn read_done(cache: &DbufCache, buf: &Arc<Buffer>, result: std::result::Result<ArcBuf, String>, is_hole_read: bool) {
    let mut inner = buf.lock();
    let dirty_count = inner.dirty_count();

    let data = match result {
        Err(err) => {
            if dirty_count > 0 {
                warn!(key = %buf.key, %err, "read failed with pending writes; synthesizing zero base");
                cache.stats.dirty_writes_lost.fetch_add(1, Ordering::Relaxed);
                ArcBuf::zeroed(inner.size as usize)
            } else {
                inner.state = BufferState::UNCACHED;
                drop(inner);
                buf.notify_changed();
                return;
            }
        }
        Ok(data) => data,
    };

    if dirty_count == 0 {
        inner.data = Some(data);
        inner.state = BufferState::CACHED;
        drop(inner);
        buf.notify_changed();
        return;
    }

    if is_hole_read {
        // §4.2 "Hole-read distinction": the synthesized zero image must
        // not be merged into records belonging to older TXGs.
        inner.state = BufferState::PARTIAL.union(BufferState::FILL);
        drop(inner);
        buf.notify_changed();
        return;
    }

    let has_pending_ranges = inner
        .oldest_dirty()
        .and_then(|dr| dr.payload.as_leaf())
        .map(|l| !l.lock().write_ranges.is_empty())
        .unwrap_or(false);

    if !has_pending_ranges {
        drop(inner);
        buf.notify_changed();
        return;
    }

    let base = data.read().clone();
    let deferred_zio = inner.data_pending.as_ref().and_then(|dr| dr.zio.lock().take());
    drop(inner);

    crate::resolve::resolve_dirty_chain(buf, &base, cache.arc.as_ref());

    let mut inner = buf.lock();
    inner.state.remove(BufferState::READ);
    inner.state.insert(BufferState::PARTIAL);
    drop(inner);
    buf.notify_changed();

    if let Some(zio) = deferred_zio {
        trace!(key = %buf.key, "dispatching deferred syncer write after resolve");
        zio.complete(None);
    }
}

/// Helper used by [`crate::dirty_path`]'s copy-on-write fault handler to
/// classify a fresh key's buffer kind by identity alone (size/level aren't
/// known yet at `hold()` time).
pub(crate) fn classify_from_level(level: u8) -> BufferKind {
    if level > 0 {
        BufferKind::Indirect
    } else {
        BufferKind::Regular
    }
}
