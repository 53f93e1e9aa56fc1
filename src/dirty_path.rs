//! The dirty path (§4.4, C6).
//!
//! Dirtying produces or updates the per-TXG snapshot for a Buffer.
//! Dispatch is by [`BufferKind`]: bonus/spill blocks dirty the owning
//! object's list directly, indirect and meta-dnode blocks are always
//! rewritten whole, nofill blocks need no payload at all, and regular
//! leaves support arbitrary `[offset, size)` partial writes.

use std::sync::Arc;

use tracing::{instrument, trace};

use crate::buffer::{Buffer, BufferState};
use crate::cache::DbufCache;
use crate::collab::{ArcBuf, ReadFlags};
use crate::common::{BufferKey, BufferKind, ObjectId, Txg, BONUS_BLKID, SPILL_BLKID};
use crate::dirty::{DirtyRecord, OverrideState};
use crate::error::{DbufError, Result};

/// Sentinel object id used by [`classify`] to recognize meta-dnode blocks,
/// since spec.md's object layer has no dedicated "is meta-dnode" query and
/// SPEC_FULL.md folds meta-dnode dispatch into the dirty path's existing
/// kind-based switch.
pub const META_DNODE_OBJECT: ObjectId = ObjectId::MAX - 1;

/// Classify a fresh key into a [`BufferKind`] at `hold()` time, before any
/// I/O has told us more. `NoFill` buffers are never produced here — a
/// client must ask for one explicitly via [`DbufCache::will_not_fill`]'s
/// first call on an as-yet-`UNCACHED` key, which is why `will_not_fill`
/// re-keys through [`crate::cache::DbufCache::hold`] rather than this
/// function when it needs a fresh `NoFill` buffer.
pub fn classify(key: &BufferKey) -> BufferKind {
    if key.is_bonus() {
        BufferKind::Bonus
    } else if key.is_spill() {
        BufferKind::Spill
    } else if key.object == META_DNODE_OBJECT && key.level == 0 {
        BufferKind::MetaDnode
    } else if key.level > 0 {
        BufferKind::Indirect
    } else {
        BufferKind::Regular
    }
}

/// `will_dirty_range` / `will_dirty` entry point for leaf kinds that
/// support partial ranges (`Regular`, `Spill`). Other kinds delegate to
/// the appropriate always-whole-block helper.
#[instrument(level = "debug", skip(cache, buf), fields(key = %buf.key))]
pub fn dirty_range(cache: &Arc<DbufCache>, buf: &Arc<Buffer>, txg: Txg, off: u64, sz: u64) -> Result<()> {
    match buf.kind {
        BufferKind::Bonus => return dirty_bonus(cache, buf, txg),
        BufferKind::Indirect | BufferKind::MetaDnode => return dirty_full(cache, buf, txg),
        BufferKind::NoFill => {
            return Err(DbufError::NotSupported(format!("partial dirty on NOFILL buffer {}", buf.key)))
        }
        BufferKind::Regular | BufferKind::Spill => {}
    }

    cow_fault_handler(cache, buf, txg, off, sz)?;

    let mut inner = buf.lock();
    inner = buf.wait_while(inner, |i| {
        i.state.contains(BufferState::FILL) && i.newest_dirty().map(|d| d.txg) != Some(txg)
    });

    let was_uncached = inner.state.contains(BufferState::UNCACHED);
    let existing = inner.dirty_record_for_txg(txg).cloned();
    let newly_dirty;

    let record = if let Some(existing) = existing {
        newly_dirty = false;
        reassociate_frontend_on_redirty(&mut inner, buf, &existing);
        existing
    } else {
        newly_dirty = true;
        let data = if was_uncached {
            let fresh = cache.arc.arc_loan_buf(inner.size as usize);
            inner.data = Some(fresh.clone());
            inner.state = BufferState::PARTIAL.union(BufferState::FILL);
            Some(fresh)
        } else {
            inner.data.clone()
        };
        let dr = DirtyRecord::new_leaf(txg, Arc::downgrade(buf), data);
        insert_dirty_record(&mut inner.dirty_records, dr.clone());
        inner.holds += 1;
        dr
    };

    if let Some(leaf_mtx) = record.payload.as_leaf() {
        let mut leaf = leaf_mtx.lock();
        leaf.write_ranges.insert(off, off + sz);
        if leaf.write_ranges.is_complete(inner.size) {
            leaf.write_ranges.clear();
            if inner.state.contains(BufferState::READ) || inner.state.contains(BufferState::PARTIAL) {
                inner.state.insert(BufferState::FILL);
            }
        }
    }
    drop(inner);
    buf.notify_changed();

    if newly_dirty {
        dirty_parent_propagation(cache, buf, &record, txg);
    }
    buf.verify();
    Ok(())
}

/// §4.4.1 copy-on-write fault handler, run before the state machine for
/// regular/spill leaves.
fn cow_fault_handler(cache: &Arc<DbufCache>, buf: &Arc<Buffer>, txg: Txg, off: u64, sz: u64) -> Result<()> {
    let (should_transition_read, try_cached_only) = {
        let inner = buf.lock();
        if inner.state.contains(BufferState::PARTIAL) {
            let stale = inner.newest_dirty().map(|d| d.txg != txg).unwrap_or(false);
            (stale, false)
        } else if inner.state.contains(BufferState::UNCACHED) {
            let interior = off != 0 && off + sz != inner.size;
            let covers_whole = off == 0 && off + sz == inner.size;
            if interior {
                (true, false)
            } else if !covers_whole {
                (false, true)
            } else {
                (false, false)
            }
        } else {
            (false, false)
        }
    };

    if should_transition_read {
        trace!(key = %buf.key, "fault handler: starting async transition to READ");
        let _ = cache.read(buf, ReadFlags { neverwait: true, ..Default::default() });
    } else if try_cached_only {
        trace!(key = %buf.key, "fault handler: trying cached-only read");
        let _ = cache.read(buf, ReadFlags { cached_only: true, ..Default::default() });
    }
    Ok(())
}

/// §4.4.2 "Frontend handling on re-dirty", invoked while already holding
/// `inner`'s lock for the buffer being re-dirtied in the same or an older
/// TXG.
fn reassociate_frontend_on_redirty(
    inner: &mut crate::buffer::BufferInner,
    buf: &Arc<Buffer>,
    record: &Arc<DirtyRecord>,
) {
    let Some(leaf_mtx) = record.payload.as_leaf() else { return };
    let mut leaf = leaf_mtx.lock();

    if leaf.override_state != OverrideState::NotOverridden {
        leaf.override_state = OverrideState::NotOverridden;
        leaf.override_bp = None;
        leaf.override_zio = None;
    }

    // Find the newest record *older* than `record`.
    let older = inner
        .dirty_records
        .iter()
        .skip_while(|dr| !Arc::ptr_eq(dr, record))
        .nth(1)
        .cloned();

    if let (Some(older), Some(frontend)) = (older, inner.data.clone()) {
        if let Some(older_leaf_mtx) = older.payload.as_leaf() {
            let mut older_leaf = older_leaf_mtx.lock();
            let older_owns_frontend =
                older_leaf.data.as_ref().map(|d| ArcBuf::same_allocation(d, &frontend)).unwrap_or(false);
            if older_owns_frontend {
                let is_pending = inner.data_pending.as_ref().map(|dp| Arc::ptr_eq(dp, &older)).unwrap_or(false);
                if is_pending {
                    // Syncer owns `older`'s snapshot mid-write; give the
                    // frontend a fresh clone instead of touching it.
                    inner.data = Some(frontend.deep_clone());
                } else {
                    let cloned = frontend.deep_clone();
                    older_leaf.data = Some(cloned);
                }
            }
        }
    }

    let _ = buf;
}

/// §4.4.3: insert `record` at the position that keeps `dirty_records`
/// strictly TXG-descending (I1).
fn insert_dirty_record(list: &mut std::collections::VecDeque<Arc<DirtyRecord>>, record: Arc<DirtyRecord>) {
    let pos = list.iter().position(|dr| dr.txg <= record.txg).unwrap_or(list.len());
    list.insert(pos, record);
}

/// Bonus blocks: no ARC buffer; the snapshot is a scratch allocation of
/// the object's bonus region, copied from the frontend on first dirty.
#[instrument(level = "debug", skip(cache, buf), fields(key = %buf.key))]
fn dirty_bonus(cache: &DbufCache, buf: &Arc<Buffer>, txg: Txg) -> Result<()> {
    let mut inner = buf.lock();
    if inner.dirty_record_for_txg(txg).is_some() {
        return Ok(());
    }
    let len = cache.config.max_bonus_len.min(inner.size as usize);
    let snapshot = cache.arc.arc_buf_alloc(len);
    if let Some(frontend) = &inner.data {
        let src = frontend.read();
        let mut dst = snapshot.write();
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
    }
    let dr = DirtyRecord::new_leaf(txg, Arc::downgrade(buf), Some(snapshot));
    insert_dirty_record(&mut inner.dirty_records, dr.clone());
    inner.holds += 1;
    if inner.state.contains(BufferState::UNCACHED) {
        inner.state = BufferState::CACHED;
    }
    drop(inner);
    buf.notify_changed();
    // Bonus/spill dirty records attach directly to the object's per-TXG
    // dirty list rather than to a parent indirect (§4.4.3).
    let _ = dr;
    Ok(())
}

/// Indirect and meta-dnode leaf blocks: always rewritten whole, no range
/// bookkeeping.
#[instrument(level = "debug", skip(cache, buf), fields(key = %buf.key))]
pub fn dirty_full(cache: &DbufCache, buf: &Arc<Buffer>, txg: Txg) -> Result<Arc<DirtyRecord>> {
    let mut inner = buf.lock();
    if let Some(existing) = inner.dirty_record_for_txg(txg) {
        return Ok(existing.clone());
    }

    let newly_dirty = true;
    let record = if buf.kind == BufferKind::Indirect {
        DirtyRecord::new_indirect(txg, Arc::downgrade(buf))
    } else {
        let data = if inner.data.is_some() {
            inner.data.clone()
        } else {
            let fresh = cache.arc.arc_loan_buf(inner.size as usize);
            inner.data = Some(fresh.clone());
            Some(fresh)
        };
        DirtyRecord::new_leaf(txg, Arc::downgrade(buf), data)
    };
    insert_dirty_record(&mut inner.dirty_records, record.clone());
    inner.holds += 1;
    if inner.state.contains(BufferState::UNCACHED) {
        inner.state = BufferState::CACHED;
    }
    drop(inner);
    buf.notify_changed();

    if newly_dirty && buf.kind != BufferKind::MetaDnode {
        dirty_parent_propagation(cache, buf, &record, txg);
    }
    Ok(record)
}

/// `will_not_fill`: allocate a record without any payload bytes.
#[instrument(level = "debug", skip(cache, buf), fields(key = %buf.key))]
pub fn dirty_nofill(cache: &DbufCache, buf: &Arc<Buffer>, txg: Txg) -> Result<()> {
    if buf.kind != BufferKind::NoFill {
        return Err(DbufError::NotSupported(format!("will_not_fill on non-NOFILL buffer {}", buf.key)));
    }
    let mut inner = buf.lock();
    if inner.dirty_record_for_txg(txg).is_some() {
        return Ok(());
    }
    let dr = DirtyRecord::new_leaf(txg, Arc::downgrade(buf), None);
    insert_dirty_record(&mut inner.dirty_records, dr.clone());
    inner.holds += 1;
    drop(inner);
    buf.notify_changed();
    dirty_parent_propagation(cache, buf, &dr, txg);
    Ok(())
}

/// §4.4.3 "Dirty-parent propagation".
fn dirty_parent_propagation(cache: &DbufCache, buf: &Arc<Buffer>, record: &Arc<DirtyRecord>, txg: Txg) {
    if matches!(buf.kind, BufferKind::Bonus | BufferKind::Spill) {
        // Attaches directly to the object's per-TXG dirty list; the
        // object layer owns that list and is out of scope for THE CORE.
        return;
    }

    let (parent_level, parent_blkid) =
        cache.objects.parent_slot(buf.key.obj_set, buf.key.object, buf.key.level, buf.key.blkid);
    if parent_level == buf.key.level {
        // Already at the root; nothing above us to dirty.
        return;
    }
    let parent_key = BufferKey::new(buf.key.obj_set, buf.key.object, parent_level, parent_blkid);
    let parent_size = buf.lock().size;
    let parent_buf = cache.hold(parent_key, parent_size);

    let parent_record = match dirty_full(cache, &parent_buf, txg) {
        Ok(dr) => dr,
        Err(_) => {
            cache.release(&parent_buf);
            return;
        }
    };

    {
        let inner = buf.lock();
        let still_head = inner.newest_dirty().map(|d| Arc::ptr_eq(d, record)).unwrap_or(false);
        if !still_head && buf.key.object != META_DNODE_OBJECT {
            drop(inner);
            cache.release(&parent_buf);
            return;
        }
    }

    if let Some(indirect) = parent_record.payload.as_indirect() {
        indirect.children.lock().push(record.clone());
    }
    *record.parent.lock() = Some(parent_record);
    *record.parent_buf.lock() = Some(parent_buf);
}

/// `assign_arcbuf`: donate a pre-filled buffer as the TXG's frontend data.
#[instrument(level = "debug", skip(cache, buf, arcbuf), fields(key = %buf.key))]
pub fn assign_arcbuf(cache: &Arc<DbufCache>, buf: &Arc<Buffer>, arcbuf: ArcBuf, txg: Txg) -> Result<()> {
    dirty_range(cache, buf, txg, 0, buf.lock().size)?;
    let mut inner = buf.lock();
    cache.arc.arc_return_buf(&arcbuf);
    inner.data = Some(arcbuf.clone());
    if let Some(dr) = inner.dirty_record_for_txg(txg) {
        if let Some(leaf_mtx) = dr.payload.as_leaf() {
            leaf_mtx.lock().data = Some(arcbuf);
        }
    }
    Ok(())
}

/// `fill_done(buf, tx)`: client signals the current fill is complete. This
/// is the counterpart to the `PARTIAL|FILL`/`READ|FILL` transitions in
/// §4.2/§4.4: it clears the filler bits, resolves any outstanding holes
/// against a zero base (a filled buffer has no "disk" to merge against —
/// every byte not explicitly ranged is, by construction, zero, matching
/// `will_fill`'s "will overwrite entire block" contract) and adopts the
/// result as `CACHED`.
#[instrument(level = "debug", skip(cache, buf), fields(key = %buf.key))]
pub fn fill_done(cache: &DbufCache, buf: &Arc<Buffer>, txg: Txg) -> Result<()> {
    let (needs_zero_resolve, needs_range_clear_only, freed) = {
        let inner = buf.lock();
        let is_filling = inner.state.contains(BufferState::FILL);
        let has_ranges = inner
            .dirty_record_for_txg(txg)
            .and_then(|dr| dr.payload.as_leaf())
            .map(|l| !l.lock().write_ranges.is_empty())
            .unwrap_or(false);
        (is_filling && has_ranges, !is_filling && has_ranges, inner.freed_in_flight)
    };

    if needs_zero_resolve {
        let size = buf.lock().size as usize;
        let zero_base = vec![0u8; size];
        crate::resolve::resolve_dirty_chain(buf, &zero_base, cache.arc.as_ref());
    } else if needs_range_clear_only {
        // The buffer reached its current contents through a real read
        // (e.g. the copy-on-write fault handler's interior-write
        // transition, §4.4.1) rather than through an in-progress fill, so
        // there is no hole to merge: the record's snapshot is already
        // complete. Only the now-superfluous range bookkeeping needs
        // clearing (I7).
        if let Some(dr) = buf.lock().dirty_record_for_txg(txg).cloned() {
            if let Some(leaf_mtx) = dr.payload.as_leaf() {
                leaf_mtx.lock().write_ranges.clear();
            }
        }
    }

    let deferred_zio = {
        let mut inner = buf.lock();
        inner.state.remove(BufferState::PARTIAL);
        inner.state.remove(BufferState::READ);
        inner.state.remove(BufferState::FILL);
        inner.state.insert(BufferState::CACHED);

        if freed {
            inner.freed_in_flight = false;
            if let Some(data) = &inner.data {
                data.write().fill(0);
            }
        }
        if let Some(data) = &inner.data {
            cache.arc.arc_buf_freeze(data);
        }
        inner.data_pending.as_ref().and_then(|dr| dr.zio.lock().take())
    };
    buf.notify_changed();
    if let Some(zio) = deferred_zio {
        zio.complete(None);
    }
    buf.verify();
    Ok(())
}
