//! The syncer / writeback path.
//!
//! `sync_list` drains a TXG's dirty-record worklist leaf-first, dispatching
//! one [`Zio`](crate::collab::Zio) per record via the adaptive cache's
//! `arc_write`, recursing into indirect children, and reconciling block
//! pointers once each write completes.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{instrument, trace};

use crate::buffer::BufferState;
use crate::cache::DbufCache;
use crate::collab::{ArcBuf, BlockPointer, Zio};
use crate::common::Txg;
use crate::dirty::{DirtyRecord, OverrideState};
use crate::error::Result;

/// Drain `list`, syncing each record. Records that already have a `zio`
/// dispatched (the meta-dnode re-queue case) are skipped — they're waiting
/// on their own children, not on us.
#[instrument(level = "debug", skip(cache, list))]
pub fn sync_list(cache: &Arc<DbufCache>, list: &mut VecDeque<Arc<DirtyRecord>>, txg: Txg) -> Result<()> {
    while let Some(dr) = list.pop_front() {
        if dr.has_dispatched() {
            trace!(txg, "sync_list: record already dispatched, skipping re-queue");
            continue;
        }
        if dr.is_leaf() {
            sync_leaf(cache, &dr, txg)?;
        } else {
            sync_indirect(cache, &dr, txg)?;
        }
    }
    Ok(())
}

fn sync_indirect(cache: &Arc<DbufCache>, dr: &Arc<DirtyRecord>, txg: Txg) -> Result<()> {
    let Some(buf) = dr.dbuf.upgrade() else { return Ok(()) };

    if buf.lock().state.contains(crate::buffer::BufferState::UNCACHED) {
        cache.read(&buf, crate::collab::ReadFlags::default())?;
    }

    let (data, bp) = {
        let mut inner = buf.lock();
        inner.data_pending = Some(dr.clone());
        let data = inner.data.clone().unwrap_or_else(|| ArcBuf::zeroed(inner.size as usize));
        let bp = inner.blkptr.unwrap_or(BlockPointer::HOLE);
        (data, bp)
    };

    let zio = cache.arc.arc_write(bp, data, txg);
    *dr.zio.lock() = Some(zio.clone());

    if let Some(indirect) = dr.payload.as_indirect() {
        let children: Vec<_> = indirect.children.lock().clone();
        for child in children {
            if child.is_leaf() {
                sync_leaf(cache, &child, txg)?;
            } else {
                sync_indirect(cache, &child, txg)?;
            }
        }
    }

    // zio_nowait: the cache does not block the syncer thread on this
    // write; completion is reconciled in `write_done` whenever the
    // collaborator's `Zio` resolves (polled here since there's no
    // dedicated completion thread in this model).
    let error = zio.wait();
    write_done(cache, &buf, dr, txg, bp, error);
    Ok(())
}

fn sync_leaf(cache: &Arc<DbufCache>, dr: &Arc<DirtyRecord>, txg: Txg) -> Result<()> {
    let Some(buf) = dr.dbuf.upgrade() else { return Ok(()) };
    let Some(leaf_mtx) = dr.payload.as_leaf() else { return Ok(()) };

    // PARTIAL means this record's data was never reconciled against the
    // on-disk image (no read ever happened for this TXG) — force one now
    // so the syncer writes a complete block, not a patchwork of holes.
    let needs_transition_read = buf.lock().state.contains(BufferState::PARTIAL)
        && !leaf_mtx.lock().write_ranges.is_empty();
    if needs_transition_read {
        cache.read(&buf, crate::collab::ReadFlags { noprefetch: true, ..Default::default() })?;
    }

    if buf.key.is_bonus() {
        // Bonus data is copied inline into the object's bonus region by
        // the object layer; there is no block write to issue.
        undirty_write(cache, &buf, dr, txg, None, None);
        return Ok(());
    }

    {
        let inner = buf.lock();
        if inner.dirty_records.is_empty() {
            // Already reaped by a racing free_range.
            return Ok(());
        }
    }

    // A write with no record of ever being dirtied should never reach
    // here; the object layer's parent slot is the authority on the
    // allocated block pointer, reconciled in `write_done` once the write
    // completes.

    // Wait out a concurrent `dmu_sync` override before committing to our
    // own write.
    let dr_for_wait = dr.clone();
    let guard = buf.lock();
    let guard = buf.wait_while(guard, move |_| {
        dr_for_wait
            .payload
            .as_leaf()
            .map(|l| l.lock().override_state == OverrideState::InSync)
            .unwrap_or(false)
    });
    drop(guard);

    let resolve_pending = !leaf_mtx.lock().write_ranges.is_empty();

    let (mut data, bp, override_bp) = {
        let leaf = leaf_mtx.lock();
        let data = leaf.data.clone().unwrap_or_else(|| ArcBuf::zeroed(buf.lock().size as usize));
        (data, buf.lock().blkptr.unwrap_or(BlockPointer::HOLE), leaf.override_bp)
    };

    {
        let mut inner = buf.lock();
        // Syncer split: if the open TXG's frontend and this record's
        // data are still the same allocation and other holders are
        // watching the frontend, clone before writing so the syncer's
        // bytes can't be mutated by a concurrent re-dirty of the open
        // TXG underneath us.
        let is_syncer_split = inner.holds > 1
            && inner.data.as_ref().map(|f| ArcBuf::same_allocation(f, &data)).unwrap_or(false);
        if is_syncer_split {
            cache.stats.syncer_splits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            trace!(key = %buf.key, "sync_leaf: syncer split, cloning snapshot away from the live frontend");
            let cloned = data.deep_clone();
            leaf_mtx.lock().data = Some(cloned.clone());
            data = cloned;
        }
        inner.data_pending = Some(dr.clone());
    }

    if let Some(bp) = override_bp {
        // `dmu_sync` already wrote this data; nothing left to dispatch.
        write_done(cache, &buf, dr, txg, bp, None);
        return Ok(());
    }

    let zio = cache.arc.arc_write(bp, data, txg);

    if resolve_pending {
        // The data isn't final yet (a foreground resolve is still
        // in-flight) — park the zio and let `read_done`/`fill_done`
        // dispatch it once the resolve finishes.
        *dr.zio.lock() = Some(zio);
        return Ok(());
    }

    *dr.zio.lock() = Some(zio.clone());
    let error = zio.wait();
    write_done(cache, &buf, dr, txg, bp, error);
    Ok(())
}

/// `write_done`: account the block's birth, unlink the completed record,
/// and release every hold taken on its behalf.
fn write_done(
    cache: &Arc<DbufCache>,
    buf: &Arc<crate::buffer::Buffer>,
    dr: &Arc<DirtyRecord>,
    txg: Txg,
    bp: BlockPointer,
    error: Option<String>,
) {
    if let Some(err) = error {
        trace!(key = %buf.key, %err, "write_done: write failed");
    }

    cache.objects.willuse_space(buf.key.obj_set, buf.key.object, 0, txg);

    let mut inner = buf.lock();
    inner.blkptr = Some(BlockPointer::materialized(txg));
    inner.dirty_records.retain(|r| !Arc::ptr_eq(r, dr));
    inner.holds = inner.holds.saturating_sub(1);
    if inner.data_pending.as_ref().map(|p| Arc::ptr_eq(p, dr)).unwrap_or(false) {
        inner.data_pending = None;
    }
    drop(inner);
    buf.notify_changed();

    if let Some(parent_buf) = dr.parent_buf.lock().take() {
        cache.release(&parent_buf);
    }
    if let Some(parent) = dr.parent.lock().take() {
        if let Some(indirect) = parent.payload.as_indirect() {
            indirect.children.lock().retain(|c| !Arc::ptr_eq(c, dr));
        }
    }
}
