//! The range-merge resolver.
//!
//! Reconciles a base image (freshly read from disk, or a synthetic zero
//! fill) with every dirty record's [`WriteRanges`](crate::dirty::WriteRanges),
//! oldest TXG first, so each record ends up holding a complete snapshot:
//! client-supplied bytes inside its own ranges, and either the next-newer
//! record's bytes or the base image outside them.

use tracing::trace;

use crate::buffer::{Buffer, BufferState};
use crate::collab::{AdaptiveCache, ArcBuf};

/// Runs the resolver over every leaf dirty record currently on `buf`,
/// oldest TXG first, using `base` as the foundation for the oldest record.
/// Indirect/bonus records have no write ranges and are left untouched.
///
/// Must be called with `buf`'s mutex **not** held; it takes the lock
/// itself for the duration of the merge.
pub fn resolve_dirty_chain(buf: &Buffer, base: &[u8], arc: &dyn AdaptiveCache) {
    let mut inner = buf.lock();
    let frontend_in_fill = inner.state.contains(BufferState::FILL);
    let frontend = inner.data.clone();

    // dirty_records is newest-first; walk it oldest-to-newest, carrying
    // the previous record's resolved bytes forward as the next record's
    // base.
    let mut prior: Option<Vec<u8>> = None;
    let mut leaves: Vec<_> = inner.dirty_records.iter().rev().cloned().collect();
    drop(inner);

    for dr in leaves.drain(..) {
        let Some(leaf_mtx) = dr.payload.as_leaf() else {
            // Indirect records carry no snapshot to resolve.
            prior = None;
            continue;
        };
        let mut leaf = leaf_mtx.lock();
        let Some(snapshot) = leaf.data.clone() else {
            prior = None;
            continue;
        };
        let base_image: &[u8] = match &prior {
            Some(p) => p.as_slice(),
            None => base,
        };
        let max_offset = (base_image.len() as u64).min(snapshot.len() as u64);
        let holes = leaf.write_ranges.holes(max_offset);
        if !holes.is_empty() {
            let mut bytes = snapshot.write();
            for hole in holes {
                let start = hole.offset as usize;
                let end = (hole.offset + hole.size) as usize;
                if end <= base_image.len() && end <= bytes.len() {
                    bytes[start..end].copy_from_slice(&base_image[start..end]);
                }
            }
        }
        leaf.write_ranges.clear();

        // Freeze unless this snapshot *is* the frontend and the frontend
        // is currently being filled — in that case the filler
        // (fill_done) owns freezing it.
        let is_frontend = frontend.as_ref().map(|f| ArcBuf::same_allocation(f, &snapshot)).unwrap_or(false);
        if !(is_frontend && frontend_in_fill) {
            arc.arc_buf_freeze(&snapshot);
        }
        trace!(txg = dr.txg, "resolved dirty record snapshot");
        prior = Some(snapshot.read().clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::BlockPointer;
    use crate::common::{BufferKey, BufferKind};
    use crate::dirty::DirtyRecord;
    use std::sync::Arc;

    struct NullArc;
    impl AdaptiveCache for NullArc {
        fn arc_read(
            &self,
            _bp: BlockPointer,
            _size: usize,
            _priority: crate::collab::IoPriority,
            _flags: crate::collab::ReadFlags,
            _done: Box<dyn FnOnce(Result<ArcBuf, String>, crate::collab::ArcReadAflags) + Send>,
        ) {
        }
        fn arc_write(&self, _bp: BlockPointer, _buf: ArcBuf, _txg: u64) -> crate::collab::Zio {
            crate::collab::Zio::new_pending()
        }
    }

    #[test]
    fn two_txg_overlap_resolves_oldest_to_newest() {
        // Two overlapping partial writes across two open TXGs, block size 512.
        let key = BufferKey::new(1, 1, 0, 0);
        let buf = Buffer::new_uncached(key, BufferKind::Regular, 512, None);

        let snap5 = ArcBuf::zeroed(512);
        {
            let mut b = snap5.write();
            b[0..256].fill(0xAA);
        }
        let dr5 = DirtyRecord::new_leaf(5, Arc::downgrade(&buf), Some(snap5.clone()));
        dr5.payload.as_leaf().unwrap().lock().write_ranges.insert(0, 256);

        let snap6 = ArcBuf::zeroed(512);
        {
            let mut b = snap6.write();
            b[128..384].fill(0xBB);
        }
        let dr6 = DirtyRecord::new_leaf(6, Arc::downgrade(&buf), Some(snap6.clone()));
        dr6.payload.as_leaf().unwrap().lock().write_ranges.insert(128, 384);

        {
            let mut inner = buf.lock();
            // dirty_records is newest-first; push the older record first so
            // dr6 (txg 6) ends up at the front.
            inner.dirty_records.push_front(dr5);
            inner.dirty_records.push_front(dr6);
        }

        let base = vec![0u8; 512];
        resolve_dirty_chain(&buf, &base, &NullArc);

        let r5 = snap5.read();
        assert_eq!(&r5[0..256], vec![0xAAu8; 256].as_slice());
        assert_eq!(&r5[256..512], vec![0u8; 256].as_slice());

        let r6 = snap6.read();
        assert_eq!(&r6[0..128], vec![0xAAu8; 128].as_slice());
        assert_eq!(&r6[128..384], vec![0xBBu8; 256].as_slice());
        assert_eq!(&r6[384..512], vec![0u8; 128].as_slice());
    }
}
