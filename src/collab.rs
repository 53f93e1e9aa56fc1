//! Collaborator contracts (§6 of the spec, "External Interfaces").
//!
//! THE CORE mediates between a block namespace and four collaborators that
//! spec.md explicitly places out of scope: the adaptive block cache (ARC),
//! the object/dnode layer, the transaction manager, and the storage I/O
//! pipeline. Each gets a narrow trait here so the cache core can be built,
//! tested, and benchmarked without a real implementation of any of them.
//!
//! Test/bench doubles for all four live in [`crate::testutil`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::common::{BlockId, ObjSetId, ObjectId, Txg};

/// Priority hint passed through to `arc_read`/`arc_write`. Opaque to the
/// cache core; collaborators may use it for I/O scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPriority {
    Sync,
    Async,
    Prefetch,
    Scrub,
}

/// A parent's block-pointer slot. `None` / `is_hole` distinguishes an
/// unallocated block from a materialized one; `birth_txg` records when the
/// block pointer was last written, used by the object layer's
/// "freed in this TXG" predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPointer {
    pub is_hole: bool,
    pub birth_txg: Txg,
}

impl BlockPointer {
    pub const HOLE: BlockPointer = BlockPointer { is_hole: true, birth_txg: 0 };

    pub fn materialized(birth_txg: Txg) -> Self {
        Self { is_hole: false, birth_txg }
    }
}

static NEXT_ARCBUF_ID: AtomicU64 = AtomicU64::new(1);

/// A handle to an ARC-backed payload buffer (`arc_buf_t` in spec.md's
/// external interfaces). Identity is by `Arc` pointer equality
/// ([`ArcBuf::same_allocation`]), matching invariant I4's "equal to the
/// Buffer's `arc_buf`" comparisons: dbuf.c compares `arc_buf_t *` pointers,
/// never buffer contents, to decide ownership of the frontend.
#[derive(Clone)]
pub struct ArcBuf(Arc<ArcBufInner>);

struct ArcBufInner {
    id: u64,
    data: parking_lot::RwLock<Vec<u8>>,
    frozen: AtomicBool,
    /// Set once the buffer has been handed to `arc_release`: it is now
    /// "anonymous" and mutable again without going through freeze/thaw.
    anonymous: AtomicBool,
}

impl ArcBuf {
    pub fn zeroed(size: usize) -> Self {
        Self(Arc::new(ArcBufInner {
            id: NEXT_ARCBUF_ID.fetch_add(1, Ordering::Relaxed),
            data: parking_lot::RwLock::new(vec![0u8; size]),
            frozen: AtomicBool::new(false),
            anonymous: AtomicBool::new(true),
        }))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(Arc::new(ArcBufInner {
            id: NEXT_ARCBUF_ID.fetch_add(1, Ordering::Relaxed),
            data: parking_lot::RwLock::new(bytes),
            frozen: AtomicBool::new(false),
            anonymous: AtomicBool::new(true),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn len(&self) -> usize {
        self.0.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// §4.3/§3: identity comparison used by invariant I4 and the
    /// disassociation logic in §4.4.2/§4.5 ("the newest older record's
    /// `data` equals the frontend").
    pub fn same_allocation(a: &ArcBuf, b: &ArcBuf) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, Vec<u8>> {
        self.0.data.read()
    }

    /// Mutates in place. Panics in debug builds if the buffer is frozen and
    /// not anonymous, mirroring `arc_buf_thaw`'s ASSERT in dbuf.c/arc.c:
    /// legitimate mutation requires thawing (or anonymity) first.
    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, Vec<u8>> {
        debug_assert!(
            !self.is_frozen() || self.is_anonymous(),
            "mutating a frozen, non-anonymous arc_buf without thawing"
        );
        self.0.data.write()
    }

    pub fn is_frozen(&self) -> bool {
        self.0.frozen.load(Ordering::Acquire)
    }

    pub fn freeze(&self) {
        self.0.frozen.store(true, Ordering::Release);
    }

    pub fn thaw(&self) {
        self.0.frozen.store(false, Ordering::Release);
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.anonymous.load(Ordering::Acquire)
    }

    pub fn mark_anonymous(&self) {
        self.0.anonymous.store(true, Ordering::Release);
    }

    /// Clone the bytes into a brand-new, independent allocation. Used
    /// throughout §4.4.2/§4.5/§4.6 whenever a record must stop sharing the
    /// frontend's storage ("copy the frontend into a new buffer").
    pub fn deep_clone(&self) -> ArcBuf {
        ArcBuf::from_bytes(self.0.data.read().clone())
    }
}

impl fmt::Debug for ArcBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArcBuf")
            .field("id", &self.0.id)
            .field("len", &self.len())
            .field("frozen", &self.is_frozen())
            .field("anonymous", &self.is_anonymous())
            .finish()
    }
}

/// Flags accepted by [`AdaptiveCache::arc_read`], mirroring `ARC_FLAG_*` as
/// surfaced through `read()` in spec.md §4.2. Only one bit is meaningful to
/// the cache core today; kept as a struct rather than a bare `bool` so a
/// future ARC flag can be added without changing the callback signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArcReadAflags {
    pub cached: bool,
}

/// Flags accepted by the cache's public `read()` operation, per the table
/// in spec.md §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadFlags {
    pub canfail: bool,
    pub noprefetch: bool,
    pub cached_only: bool,
    pub neverwait: bool,
    pub havestruct: bool,
}

/// A pending or completed write operation handle (`zio_t *` in spec.md).
/// Cloned freely; completion is reported once via [`Zio::wait`] or by
/// registering a callback with the issuing collaborator.
#[derive(Clone)]
pub struct Zio(Arc<ZioInner>);

struct ZioInner {
    id: u64,
    done: parking_lot::Mutex<bool>,
    cvar: parking_lot::Condvar,
    error: parking_lot::Mutex<Option<String>>,
}

impl Zio {
    pub fn new_pending() -> Self {
        Self(Arc::new(ZioInner {
            id: NEXT_ARCBUF_ID.fetch_add(1, Ordering::Relaxed),
            done: parking_lot::Mutex::new(false),
            cvar: parking_lot::Condvar::new(),
            error: parking_lot::Mutex::new(None),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn complete(&self, error: Option<String>) {
        *self.0.error.lock() = error;
        *self.0.done.lock() = true;
        self.0.cvar.notify_all();
    }

    /// `zio_wait`: block until completion, returning the terminal error if
    /// any. Only ever invoked by the syncer (§4.6) and by tests.
    pub fn wait(&self) -> Option<String> {
        let mut done = self.0.done.lock();
        while !*done {
            self.0.cvar.wait(&mut done);
        }
        self.0.error.lock().clone()
    }

    pub fn is_done(&self) -> bool {
        *self.0.done.lock()
    }
}

impl fmt::Debug for Zio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zio").field("id", &self.0.id).field("done", &self.is_done()).finish()
    }
}

/// Outcome of `arc_read` when the caller only wants to know about a cache
/// hit (`CACHED_ONLY`, spec.md §4.2 step 5) rather than issue real I/O.
pub enum CachedOnlyOutcome {
    Hit(ArcBuf),
    Miss,
}

/// The adaptive block cache collaborator (§6 "From the cache to the
/// adaptive-cache collaborator"). `done` is invoked exactly once, either
/// synchronously (cache hit) or from whatever thread completes the
/// simulated I/O — callers must not assume either.
pub trait AdaptiveCache: Send + Sync {
    fn arc_read(
        &self,
        bp: BlockPointer,
        size: usize,
        priority: IoPriority,
        flags: ReadFlags,
        done: Box<dyn FnOnce(Result<ArcBuf, String>, ArcReadAflags) + Send>,
    );

    fn arc_buf_alloc(&self, size: usize) -> ArcBuf {
        ArcBuf::zeroed(size)
    }

    /// Query the cache for `bp` without issuing I/O on a miss (§4.2 step 5,
    /// and the CoW fault handler's "try a cached-only read" branch in
    /// §4.4.1). Default: always miss, for collaborators with no concept of
    /// a standalone directory lookup.
    fn arc_lookup_cached(&self, _bp: BlockPointer) -> CachedOnlyOutcome {
        CachedOnlyOutcome::Miss
    }

    fn arc_loan_buf(&self, size: usize) -> ArcBuf {
        ArcBuf::zeroed(size)
    }

    fn arc_return_buf(&self, _buf: &ArcBuf) {}

    /// Release the buffer from ARC's management, making it anonymous.
    fn arc_release(&self, buf: &ArcBuf) {
        buf.mark_anonymous();
    }

    fn arc_buf_freeze(&self, buf: &ArcBuf) {
        buf.freeze();
    }

    fn arc_buf_thaw(&self, buf: &ArcBuf) {
        buf.thaw();
    }

    fn arc_buf_remove_ref(&self, _buf: ArcBuf) {}

    fn arc_buf_evict(&self, _buf: ArcBuf) {}

    fn arc_write(&self, bp: BlockPointer, buf: ArcBuf, txg: Txg) -> Zio;

    fn arc_discard_buf(&self, _buf: ArcBuf) {}
}

/// The object/dnode layer collaborator (§6 "From the cache to the object
/// layer").
pub trait ObjectLayer: Send + Sync {
    /// Current block pointer for `(object, level, blkid)`, or `None` if the
    /// object has never allocated that slot.
    fn block_pointer(
        &self,
        obj_set: ObjSetId,
        object: ObjectId,
        level: u8,
        blkid: BlockId,
    ) -> Option<BlockPointer>;

    /// §4.2 step 4 / §4.5: has this block been logically freed in `txg`
    /// (by a prior `free_range`) even though a stale block pointer might
    /// still be visible to a racing reader?
    fn is_freed_in_txg(
        &self,
        obj_set: ObjSetId,
        object: ObjectId,
        level: u8,
        blkid: BlockId,
        txg: Txg,
    ) -> bool;

    /// Inform the object layer of a pending space delta for `tx`.
    fn willuse_space(&self, obj_set: ObjSetId, object: ObjectId, delta: i64, txg: Txg);

    fn set_maxblkid(&self, obj_set: ObjSetId, object: ObjectId, blkid: BlockId);

    /// Parent block-pointer slot for the indirect block one level above
    /// `(level, blkid)`, used by `check_blkptr` (§4.6 step 5) and by
    /// dirty-parent propagation (§4.4.3) to find/allocate the parent.
    fn parent_slot(
        &self,
        obj_set: ObjSetId,
        object: ObjectId,
        level: u8,
        blkid: BlockId,
    ) -> (u8, BlockId);

    fn object_level0_size(&self, obj_set: ObjSetId, object: ObjectId) -> usize;

    fn bonus_len(&self, obj_set: ObjSetId, object: ObjectId) -> usize;
}

/// The transaction manager collaborator (§6 "From the cache to the
/// transaction manager").
pub trait TransactionManager: Send + Sync {
    fn current_txg(&self) -> Txg;

    fn is_syncing_context(&self, txg: Txg) -> bool;

    /// Per-TXG concurrency limit: bounds `dirty_count` (§3 invariant
    /// discussion, §6).
    fn max_concurrent_txgs(&self) -> u32;
}

/// The storage I/O pipeline collaborator (§6 "From the cache to the
/// storage I/O pipeline"). In practice `arc_write`'s returned [`Zio`]
/// already models issue/completion for the write path; this trait exists
/// as the seam a real implementation would use to route bytes to disk
/// once ARC evicts them, kept narrow since spec.md places persistent
/// format out of scope.
pub trait StorageIo: Send + Sync {
    fn issue_write(&self, bp: BlockPointer, buf: ArcBuf) -> Zio;
}
