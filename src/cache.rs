//! `DbufCache`: the crate's public entry point, wiring the hash index, the
//! collaborator trait objects, and the TXG-aware paths into one surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::instrument;

use crate::buffer::hold;
use crate::buffer::Buffer;
use crate::collab::{AdaptiveCache, ObjectLayer, TransactionManager};
use crate::common::BufferKey;
use crate::config::DbufCacheConfig;
use crate::dirty::DirtyRecord;
use crate::error::{DbufError, Result};
use crate::hash_index::HashIndex;
use crate::{dirty_path, free_range, read_path, sync_path};

/// Counters the read and syncer paths maintain by hand: not a full
/// statistics subsystem, just the handful of numbers callers and tests
/// need to observe masked failures and syncer-split behavior.
#[derive(Default)]
pub struct CacheStats {
    pub dirty_writes_lost: AtomicU64,
    pub reads_issued: AtomicU64,
    pub hole_reads: AtomicU64,
    pub syncer_splits: AtomicU64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            dirty_writes_lost: self.dirty_writes_lost.load(Ordering::Relaxed),
            reads_issued: self.reads_issued.load(Ordering::Relaxed),
            hole_reads: self.hole_reads.load(Ordering::Relaxed),
            syncer_splits: self.syncer_splits.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStatsSnapshot {
    pub dirty_writes_lost: u64,
    pub reads_issued: u64,
    pub hole_reads: u64,
    pub syncer_splits: u64,
}

/// The transactional block-buffer cache. Mediates between foreground
/// readers/writers, the syncer, and the external adaptive cache, object
/// layer, and transaction manager collaborators.
pub struct DbufCache {
    pub(crate) hash: HashIndex,
    pub(crate) arc: Arc<dyn AdaptiveCache>,
    pub(crate) objects: Arc<dyn ObjectLayer>,
    pub(crate) txmgr: Arc<dyn TransactionManager>,
    pub(crate) config: DbufCacheConfig,
    pub(crate) stats: CacheStats,
}

impl DbufCache {
    pub fn new(
        config: DbufCacheConfig,
        arc: Arc<dyn AdaptiveCache>,
        objects: Arc<dyn ObjectLayer>,
        txmgr: Arc<dyn TransactionManager>,
    ) -> Arc<Self> {
        Arc::new(Self { hash: HashIndex::new(&config), arc, objects, txmgr, config, stats: CacheStats::default() })
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &DbufCacheConfig {
        &self.config
    }

    /// Whether a live Buffer for `key` is currently present in the hash
    /// index. Mainly useful to tests asserting on hold-discipline eviction;
    /// the cache core never needs to ask this of itself.
    pub fn contains_key(&self, key: &BufferKey) -> bool {
        self.hash.find(key).is_some()
    }

    /// `hold(object, level, blkid) -> Buffer`: looks the Buffer up (or
    /// creates it `UNCACHED`/`NOFILL`), takes a hold, and returns it.
    #[instrument(level = "debug", skip(self))]
    pub fn hold(&self, key: BufferKey, size: u64) -> Arc<Buffer> {
        // `find`/`insert` return a bare `Arc<Buffer>` with no lock held
        // across the gap to `add_ref`, so a concurrent `release` can tear
        // the Buffer down in between. `add_ref` rechecks `EVICTING` under
        // the Buffer mutex and reports the loss; retrying from `find`
        // picks up either the freshly re-created Buffer or an empty slot,
        // rather than resurrecting holds on a destroyed one (§4.1).
        loop {
            if let Some(existing) = self.hash.find(&key) {
                if hold::add_ref(&existing) {
                    return existing;
                }
                continue;
            }
            let kind = crate::dirty_path::classify(&key);
            let blkptr = self.objects.block_pointer(key.obj_set, key.object, key.level, key.blkid);
            let buf = Buffer::new_uncached(key, kind, size, blkptr);
            match self.hash.insert(buf.clone()) {
                Some(existing) => {
                    if hold::add_ref(&existing) {
                        return existing;
                    }
                }
                None => {
                    if hold::add_ref(&buf) {
                        return buf;
                    }
                }
            }
        }
    }

    pub fn hold_level0(&self, obj_set: u64, object: u64, blkid: u64, size: u64) -> Arc<Buffer> {
        self.hold(BufferKey::new(obj_set, object, 0, blkid), size)
    }

    /// `release(buf, tag)`: drop a hold, possibly destroying the Buffer.
    #[instrument(level = "debug", skip(self, buf), fields(key = %buf.key))]
    pub fn release(&self, buf: &Arc<Buffer>) {
        hold::release(buf, &self.hash, self.arc.as_ref());
    }

    /// `read(buf, flags)`: drive `buf` to `CACHED` or fail.
    ///
    /// Takes `self` as an `Arc` because the async read it may issue
    /// outlives this call: the collaborator's completion callback needs
    /// its own owned handle to the cache to run `read_done` and release
    /// the pinning hold, regardless of which thread fires it.
    #[instrument(level = "debug", skip(self, buf), fields(key = %buf.key))]
    pub fn read(self: &Arc<Self>, buf: &Arc<Buffer>, flags: crate::collab::ReadFlags) -> Result<()> {
        read_path::read(self, buf, flags)
    }

    /// Takes `self` as an `Arc` because dirtying a never-before-touched
    /// interior range may kick off an async copy-on-write read, which
    /// needs the same owned cache handle [`Self::read`] does.
    #[instrument(level = "debug", skip(self, buf), fields(key = %buf.key))]
    pub fn will_dirty(self: &Arc<Self>, buf: &Arc<Buffer>, txg: crate::common::Txg) -> Result<()> {
        let size = buf.lock().size;
        self.will_dirty_range(buf, txg, 0, size)
    }

    #[instrument(level = "debug", skip(self, buf), fields(key = %buf.key))]
    pub fn will_dirty_range(self: &Arc<Self>, buf: &Arc<Buffer>, txg: crate::common::Txg, off: u64, sz: u64) -> Result<()> {
        dirty_path::dirty_range(self, buf, txg, off, sz)
    }

    #[instrument(level = "debug", skip(self, buf), fields(key = %buf.key))]
    pub fn will_fill(self: &Arc<Self>, buf: &Arc<Buffer>, txg: crate::common::Txg) -> Result<()> {
        let size = buf.lock().size;
        dirty_path::dirty_range(self, buf, txg, 0, size)
    }

    #[instrument(level = "debug", skip(self, buf), fields(key = %buf.key))]
    pub fn will_not_fill(&self, buf: &Arc<Buffer>, txg: crate::common::Txg) -> Result<()> {
        dirty_path::dirty_nofill(self, buf, txg)
    }

    /// `fill_done(buf, tx)`: client signals fill complete.
    #[instrument(level = "debug", skip(self, buf), fields(key = %buf.key))]
    pub fn fill_done(&self, buf: &Arc<Buffer>, txg: crate::common::Txg) -> Result<()> {
        dirty_path::fill_done(self, buf, txg)
    }

    #[instrument(level = "debug", skip(self, buf, arcbuf), fields(key = %buf.key))]
    pub fn assign_arcbuf(self: &Arc<Self>, buf: &Arc<Buffer>, arcbuf: crate::collab::ArcBuf, txg: crate::common::Txg) -> Result<()> {
        dirty_path::assign_arcbuf(self, buf, arcbuf, txg)
    }

    /// `free_range(object, start, end, tx)`: release blocks in `[start, end)`.
    #[instrument(level = "debug", skip(self))]
    pub fn free_range(&self, obj_set: u64, object: u64, start: u64, end: u64, txg: crate::common::Txg) -> Result<()> {
        free_range::free_range(self, obj_set, object, start, end, txg)
    }

    /// `new_size(buf, size, tx)`: grow a level-0 block. Requires the
    /// caller to already hold the object's structural write lock (out of
    /// scope here; this operation assumes serialization has already
    /// happened).
    #[instrument(level = "debug", skip(self, buf), fields(key = %buf.key))]
    pub fn new_size(&self, buf: &Arc<Buffer>, new_size: u64, _txg: crate::common::Txg) -> Result<()> {
        let mut inner = buf.lock();
        if buf.kind != crate::common::BufferKind::Regular {
            return Err(DbufError::NotSupported(format!("new_size on non-regular buffer {}", buf.key)));
        }
        if new_size < inner.size {
            return Err(DbufError::InvalidState(format!("new_size may only grow a block ({} -> {})", inner.size, new_size)));
        }
        inner.size = new_size;
        if let Some(data) = &inner.data {
            if data.len() < new_size as usize {
                let mut bytes = data.write();
                bytes.resize(new_size as usize, 0);
            }
        }
        Ok(())
    }

    pub fn prefetch(&self, _obj_set: u64, _object: u64, _blkid: u64) {
        // Hint only; the read path does not depend on it. The actual
        // prefetch engine is an out-of-scope collaborator.
    }

    /// `set_user(buf, user)`: attach client eviction data. Debug-asserts
    /// the Buffer doesn't already carry user data; use [`Self::replace_user`]
    /// to overwrite unconditionally.
    pub fn set_user(&self, buf: &Arc<Buffer>, user: crate::buffer::UserData) {
        hold::set_user(buf, user);
    }

    /// `replace_user(buf, user)`: attach client eviction data, returning
    /// whatever was previously attached.
    pub fn replace_user(&self, buf: &Arc<Buffer>, user: crate::buffer::UserData) -> Option<crate::buffer::UserData> {
        hold::replace_user(buf, user)
    }

    /// `remove_user(buf)`: detach and return the client's user data.
    pub fn remove_user(&self, buf: &Arc<Buffer>) -> Option<crate::buffer::UserData> {
        hold::remove_user(buf)
    }

    /// `get_user(buf, f)`: run `f` against the currently attached user
    /// data under the Buffer mutex.
    pub fn get_user<R>(&self, buf: &Arc<Buffer>, f: impl FnOnce(Option<&crate::buffer::UserData>) -> R) -> R {
        hold::get_user(buf, f)
    }

    /// `sync_list(list, tx)`: writeback entry point for the syncer.
    #[instrument(level = "debug", skip(self, list))]
    pub fn sync_list(self: &Arc<Self>, list: &mut std::collections::VecDeque<Arc<DirtyRecord>>, txg: crate::common::Txg) -> Result<()> {
        sync_path::sync_list(self, list, txg)
    }
}
