//! `free_range`: mark `[start, end)` level-0 blocks of an object as freed
//! within a TXG, undoing in-memory dirty state where possible and otherwise
//! tagging it to resolve to zero once the in-flight operation settles.

use std::sync::Arc;

use tracing::{instrument, trace};

use crate::buffer::{Buffer, BufferState};
use crate::collab::ArcBuf;
use crate::common::{BufferKey, Txg};
use crate::error::Result;

/// Free every level-0 block of `object` in `[start, end)`, plus the level-1
/// indirects that cover them (so a subsequent read sees a hole rather than
/// stale metadata).
#[instrument(level = "debug", skip(cache))]
pub fn free_range(cache: &crate::cache::DbufCache, obj_set: u64, object: u64, start: u64, end: u64, txg: Txg) -> Result<()> {
    let block_size = cache.config.average_block_size.max(1) as u64;

    for blkid in start..end {
        let key = BufferKey::new(obj_set, object, 0, blkid);
        if let Some(buf) = cache.hash.find(&key) {
            free_one_buffer(cache, &buf, txg);
        }
        let _ = block_size;
    }

    // Cover indirects at level 1 so reads above a freed range don't trust
    // a stale block pointer; out-of-scope collaborators (the object layer)
    // own the actual block-pointer rewrite, this only dirties the shadow.
    if let Some(parent_buf) = level1_covering(cache, obj_set, object, start) {
        let _ = crate::dirty_path::dirty_full(cache, &parent_buf, txg);
        cache.release(&parent_buf);
    }
    Ok(())
}

fn level1_covering(cache: &crate::cache::DbufCache, obj_set: u64, object: u64, blkid: u64) -> Option<Arc<Buffer>> {
    let (parent_level, parent_blkid) = cache.objects.parent_slot(obj_set, object, 0, blkid);
    if parent_level == 0 {
        return None;
    }
    let key = BufferKey::new(obj_set, object, parent_level, parent_blkid);
    Some(cache.hold(key, cache.config.average_block_size as u64))
}

/// Per-buffer decision tree for freeing one level-0 block.
fn free_one_buffer(cache: &crate::cache::DbufCache, buf: &Arc<Buffer>, txg: Txg) {
    let mut inner = buf.lock();

    if inner.state.contains(BufferState::UNCACHED)
        || inner.state.contains(BufferState::NOFILL)
        || inner.state.contains(BufferState::EVICTING)
    {
        return;
    }

    if inner.state.contains(BufferState::FILL) {
        inner.freed_in_flight = true;
        trace!(key = %buf.key, "free_range: marked in-flight fill for zero-fill on completion");
        return;
    }

    // Try to undirty the current TXG's record outright: if this TXG hasn't
    // reached the syncer yet, freeing collapses it to nothing.
    if let Some(current) = inner.dirty_record_for_txg(txg).cloned() {
        let is_head = inner.newest_dirty().map(|d| Arc::ptr_eq(d, &current)).unwrap_or(false);
        let not_dispatched = !current.has_dispatched();
        if is_head && not_dispatched {
            inner.dirty_records.retain(|dr| !Arc::ptr_eq(dr, &current));
            inner.holds = inner.holds.saturating_sub(1);
            if inner.dirty_records.is_empty() && inner.holds == 0 {
                drop(inner);
                crate::buffer::hold::clear_and_destroy(buf, &cache.hash);
                return;
            }
        }
    }

    if inner.holds == 0 {
        drop(inner);
        crate::buffer::hold::clear_and_destroy(buf, &cache.hash);
        return;
    }

    // §4.5 step 6: the frontend may still be aliased into an older TXG's
    // dirty record. If so it must be disassociated before we can safely
    // zero it, exactly as re-dirtying does (§4.4.2) — unless another
    // holder or a waiting reader means the frontend must stay intact and
    // only the *next* read/dirty resolves this.
    let frontend = inner.data.clone();
    let other_referents = inner.dirty_records.iter().any(|dr| {
        dr.payload
            .as_leaf()
            .and_then(|l| l.lock().data.clone())
            .map(|d| frontend.as_ref().map(|f| ArcBuf::same_allocation(f, &d)).unwrap_or(false))
            .unwrap_or(false)
    });
    let waiters = inner.buf_set_waiters > 0;

    if other_referents || waiters {
        trace!(key = %buf.key, "free_range: frontend shared or awaited, deferring zero-fill");
        drop(inner);
        buf.notify_changed();
        return;
    }

    if let Some(data) = &frontend {
        data.write().fill(0);
        cache.arc.arc_buf_freeze(data);
    }
    inner.state.remove(BufferState::PARTIAL);
    inner.state.remove(BufferState::READ);
    inner.state.remove(BufferState::FILL);
    inner.state.insert(BufferState::CACHED);
    let deferred = inner.data_pending.as_ref().and_then(|dr| dr.zio.lock().take());
    drop(inner);
    buf.notify_changed();
    if let Some(zio) = deferred {
        zio.complete(None);
    }
}
