//! The per-block Buffer state machine (§3 "Buffer", C2).
//!
//! A `Buffer` is the cache's unit of identity: `(object_set, object, level,
//! block_id)`. It coordinates the frontend payload visible to the open
//! TXG, the dirty-record chain of in-flight per-TXG mutations, and the
//! state bits that serialize concurrent readers/writers/the syncer against
//! each other. Every field that participates in the state machine lives
//! behind [`Buffer`]'s own mutex (`db_mtx` in spec.md's lock-order table);
//! the struct itself only exposes the identity and the mutex/condvar pair.

pub mod hold;
pub mod state;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::collab::{ArcBuf, BlockPointer};
use crate::common::{BufferKey, BufferKind};
use crate::dirty::DirtyRecord;

pub use state::BufferState;

/// Opaque client-attached pointer plus its eviction callback (§3 `user`,
/// §4.7 "invoke the user eviction callback").
pub struct UserData {
    pub tag: &'static str,
    pub ptr: Box<dyn std::any::Any + Send + Sync>,
    pub evict_fn: Option<Box<dyn FnOnce(&dyn std::any::Any) + Send>>,
}

/// Everything protected by the Buffer mutex.
pub struct BufferInner {
    pub size: u64,
    pub state: BufferState,
    /// The frontend: bytes the open TXG sees. Absent for `UNCACHED`/`NOFILL`.
    pub data: Option<ArcBuf>,
    pub blkptr: Option<BlockPointer>,
    /// Newest-first, strictly TXG-descending (I1).
    pub dirty_records: VecDeque<Arc<DirtyRecord>>,
    pub data_pending: Option<Arc<DirtyRecord>>,
    pub freed_in_flight: bool,
    pub holds: u32,
    pub parent: Option<Weak<Buffer>>,
    pub user: Option<UserData>,
    pub immediate_evict: bool,
    /// Count of outstanding multi-buffer read waiters (`buf_sets`); the
    /// actual wake-up is modeled by the shared condvar, this is only kept
    /// for `Buffer::verify` bookkeeping and tests.
    pub buf_set_waiters: u32,
}

impl BufferInner {
    pub fn dirty_count(&self) -> u32 {
        self.dirty_records.len() as u32
    }

    /// Newest dirty record (head of the TXG-descending list), if any.
    pub fn newest_dirty(&self) -> Option<&Arc<DirtyRecord>> {
        self.dirty_records.front()
    }

    /// Oldest dirty record (tail of the list) — the one `data_pending`
    /// must equal per I5.
    pub fn oldest_dirty(&self) -> Option<&Arc<DirtyRecord>> {
        self.dirty_records.back()
    }

    pub fn dirty_record_for_txg(&self, txg: crate::common::Txg) -> Option<&Arc<DirtyRecord>> {
        self.dirty_records.iter().find(|dr| dr.txg == txg)
    }
}

pub struct Buffer {
    pub key: BufferKey,
    pub kind: BufferKind,
    inner: Mutex<BufferInner>,
    /// `db_changed`: broadcast on every state transition, dirty-record
    /// insertion/removal, and hold-count change that a waiter might care
    /// about.
    changed: Condvar,
}

impl Buffer {
    pub fn new_uncached(key: BufferKey, kind: BufferKind, size: u64, blkptr: Option<BlockPointer>) -> Arc<Self> {
        let initial_state = if kind == BufferKind::NoFill { BufferState::NOFILL } else { BufferState::UNCACHED };
        Arc::new(Self {
            key,
            kind,
            inner: Mutex::new(BufferInner {
                size,
                state: initial_state,
                data: None,
                blkptr,
                dirty_records: VecDeque::new(),
                data_pending: None,
                freed_in_flight: false,
                holds: 0,
                parent: None,
                user: None,
                immediate_evict: false,
                buf_set_waiters: 0,
            }),
            changed: Condvar::new(),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, BufferInner> {
        self.inner.lock()
    }

    pub fn notify_changed(&self) {
        self.changed.notify_all();
    }

    /// Wait on `db_changed` until `pred` holds, re-acquiring the Buffer
    /// mutex before returning. Mirrors the `cv_wait` loops throughout
    /// spec.md §4 (e.g. "waits on the Buffer's condition variable until
    /// state becomes CACHED or UNCACHED").
    pub fn wait_while<'a>(
        &'a self,
        mut guard: MutexGuard<'a, BufferInner>,
        mut pred: impl FnMut(&BufferInner) -> bool,
    ) -> MutexGuard<'a, BufferInner> {
        while pred(&guard) {
            self.changed.wait(&mut guard);
        }
        guard
    }

    /// `dbuf_verify`-style assertions (§9 Design Notes). Gated on
    /// `debug_assertions`, as spec.md §7 requires for "contract violations".
    #[cfg(debug_assertions)]
    pub fn verify(&self) {
        let inner = self.inner.lock();
        assert!(inner.state.is_legal(), "{}: illegal state {:?}", self.key, inner.state);
        assert!(
            !inner.state.contains(BufferState::PARTIAL) || inner.dirty_count() == 1,
            "{}: I2 violated, PARTIAL with dirty_count={}",
            self.key,
            inner.dirty_count()
        );
        let mut last_txg = u64::MAX;
        for dr in inner.dirty_records.iter() {
            assert!(dr.txg < last_txg, "{}: I1 violated, dirty records not TXG-descending", self.key);
            last_txg = dr.txg;
        }
        let arcbuf_owners = inner
            .dirty_records
            .iter()
            .filter(|dr| {
                dr.leaf_data()
                    .flatten()
                    .zip(inner.data.clone())
                    .map(|(d, frontend)| ArcBuf::same_allocation(&d, &frontend))
                    .unwrap_or(false)
            })
            .count();
        assert!(arcbuf_owners <= 1, "{}: I4 violated, multiple records own the frontend", self.key);
        if let (Some(pending), Some(oldest)) = (&inner.data_pending, inner.oldest_dirty()) {
            assert!(Arc::ptr_eq(pending, oldest), "{}: I5 violated, data_pending is not the oldest dirty record", self.key);
        }
    }

    #[cfg(not(debug_assertions))]
    pub fn verify(&self) {}
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Buffer")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("state", &inner.state)
            .field("holds", &inner.holds)
            .field("dirty_count", &inner.dirty_count())
            .finish()
    }
}
