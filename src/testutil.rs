//! Collaborator test/bench doubles (§6, `SPEC_FULL.md`'s "Test tooling").
//!
//! `InMemoryAdaptiveCache` is a genuine — if small — ARC implementation
//! (T1/T2/B1/B2 adaptive replacement, modeled on `buffer/arc.rs`'s
//! `ArcState`), because spec.md describes freeze/thaw/evict as part of the
//! contract this crate depends on, not an incidental detail a stub could
//! paper over. `InMemoryObjectLayer`, `InMemoryStorageIo`, and
//! `TestTxgClock` are thinner: they hold just enough state (a block-pointer
//! table, a per-object freed-ranges set, a TXG counter) to drive the six
//! end-to-end scenarios in spec.md §8 and the crate's own unit/integration
//! tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::collab::{
    AdaptiveCache, ArcBuf, ArcReadAflags, BlockPointer, IoPriority, ObjectLayer, ReadFlags, StorageIo,
    TransactionManager, Zio,
};
use crate::common::{BlockId, Level, ObjSetId, ObjectId, Txg};

/// Which of ARC's four lists an entry currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListType {
    T1,
    T2,
    B1,
    B2,
}

struct ArcEntry {
    list: ListType,
    data: Option<ArcBuf>,
}

struct ArcState {
    capacity: usize,
    target_t1: usize,
    t1: VecDeque<u64>,
    t2: VecDeque<u64>,
    b1: VecDeque<u64>,
    b2: VecDeque<u64>,
    directory: HashMap<u64, ArcEntry>,
    disk: HashMap<u64, Vec<u8>>,
    evictions: u64,
}

impl ArcState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            target_t1: capacity / 2,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            directory: HashMap::new(),
            disk: HashMap::new(),
            evictions: 0,
        }
    }

    fn cache_len(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    /// Record a hit/miss and run one step of ARC's adaptation + eviction
    /// dance. `key` is the caller's block-pointer identity (we use the
    /// `birth_txg` packed with a caller-supplied disk address — see
    /// `InMemoryAdaptiveCache::disk_key`).
    fn access(&mut self, key: u64, on_miss: impl FnOnce() -> Vec<u8>) -> ArcBuf {
        if let Some(entry) = self.directory.get(&key) {
            match entry.list {
                ListType::T1 | ListType::T2 => {
                    let data = entry.data.clone().expect("cached entry must carry data");
                    self.t1.retain(|k| *k != key);
                    self.t2.retain(|k| *k != key);
                    self.t2.push_back(key);
                    self.directory.insert(key, ArcEntry { list: ListType::T2, data: Some(data.clone()) });
                    return data;
                }
                ListType::B1 => {
                    self.target_t1 = (self.target_t1 + (self.b2.len().max(1).min(self.capacity) / self.b1.len().max(1))).min(self.capacity);
                    self.b1.retain(|k| *k != key);
                }
                ListType::B2 => {
                    self.target_t1 = self.target_t1.saturating_sub(self.b1.len().max(1).min(self.capacity) / self.b2.len().max(1));
                    self.b2.retain(|k| *k != key);
                }
            }
        }

        let bytes = self.disk.get(&key).cloned().unwrap_or_else(on_miss);
        let buf = ArcBuf::from_bytes(bytes.clone());
        self.disk.entry(key).or_insert(bytes);
        self.replace(key);
        self.t1.push_back(key);
        self.directory.insert(key, ArcEntry { list: ListType::T1, data: Some(buf.clone()) });
        buf
    }

    fn replace(&mut self, incoming: u64) {
        if self.cache_len() < self.capacity {
            return;
        }
        if !self.t1.is_empty() && (self.t1.len() > self.target_t1 || (self.b2.contains(&incoming) && self.t1.len() == self.target_t1)) {
            if let Some(evicted) = self.t1.pop_front() {
                self.directory.remove(&evicted);
                self.b1.push_back(evicted);
                self.evictions += 1;
            }
        } else if let Some(evicted) = self.t2.pop_front() {
            self.directory.remove(&evicted);
            self.b2.push_back(evicted);
            self.evictions += 1;
        }
        while self.b1.len() > self.capacity {
            self.b1.pop_front();
        }
        while self.b2.len() > self.capacity {
            self.b2.pop_front();
        }
    }

    fn lookup_cached(&self, key: u64) -> Option<ArcBuf> {
        self.directory.get(&key).and_then(|e| e.data.clone())
    }
}

/// A genuine ARC-policy adaptive cache, standing in for spec.md's external
/// "adaptive block cache" collaborator. Reads are synchronous on the
/// calling thread (no real I/O latency to simulate in tests), but the
/// completion is still delivered through the async `done` callback exactly
/// as the real contract requires, so callers can't accidentally rely on
/// synchronous-only behavior.
pub struct InMemoryAdaptiveCache {
    state: Mutex<ArcState>,
    writes: Mutex<Vec<(BlockPointer, Vec<u8>)>>,
    /// One-shot forced failure, for exercising the masked-read-failure path
    /// (spec.md §8 scenario 5). Consumed (reset to `None`) by the next
    /// `arc_read` call.
    fail_next_read: Mutex<Option<String>>,
}

impl InMemoryAdaptiveCache {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ArcState::new(capacity.max(1))),
            writes: Mutex::new(Vec::new()),
            fail_next_read: Mutex::new(None),
        })
    }

    /// Seed the simulated disk image a `bp` with `birth_txg == key` will
    /// read back, for tests that want to control what a read returns.
    pub fn seed_disk(&self, bp: BlockPointer, bytes: Vec<u8>) {
        self.state.lock().disk.insert(bp.birth_txg, bytes);
    }

    pub fn eviction_count(&self) -> u64 {
        self.state.lock().evictions
    }

    pub fn recorded_writes(&self) -> Vec<(BlockPointer, Vec<u8>)> {
        self.writes.lock().clone()
    }

    /// Make the next `arc_read` report `error` instead of returning data.
    pub fn fail_next_read(&self, error: impl Into<String>) {
        *self.fail_next_read.lock() = Some(error.into());
    }

    fn disk_key(bp: BlockPointer) -> u64 {
        bp.birth_txg
    }
}

impl AdaptiveCache for InMemoryAdaptiveCache {
    fn arc_read(
        &self,
        bp: BlockPointer,
        size: usize,
        _priority: IoPriority,
        _flags: ReadFlags,
        done: Box<dyn FnOnce(Result<ArcBuf, String>, ArcReadAflags) + Send>,
    ) {
        if let Some(err) = self.fail_next_read.lock().take() {
            done(Err(err), ArcReadAflags::default());
            return;
        }
        let key = Self::disk_key(bp);
        let mut state = self.state.lock();
        let was_cached = state.lookup_cached(key).is_some();
        let buf = state.access(key, || vec![0u8; size]);
        drop(state);
        done(Ok(buf), ArcReadAflags { cached: was_cached });
    }

    fn arc_write(&self, bp: BlockPointer, buf: ArcBuf, _txg: Txg) -> Zio {
        let zio = Zio::new_pending();
        self.writes.lock().push((bp, buf.read().clone()));
        let key = Self::disk_key(bp);
        self.state.lock().disk.insert(key, buf.read().clone());
        zio.complete(None);
        zio
    }

    fn arc_lookup_cached(&self, bp: BlockPointer) -> crate::collab::CachedOnlyOutcome {
        let key = Self::disk_key(bp);
        match self.state.lock().lookup_cached(key) {
            Some(data) => crate::collab::CachedOnlyOutcome::Hit(data),
            None => crate::collab::CachedOnlyOutcome::Miss,
        }
    }
}

/// A single object's in-memory metadata: its bonus region, its block
/// pointers keyed by `(level, blkid)`, its max level-0 block id, and the
/// set of blocks freed per TXG (so `is_freed_in_txg` can answer truthfully
/// for the duration of the owning `free_range` call).
#[derive(Default)]
struct ObjectMeta {
    bonus: Vec<u8>,
    block_pointers: HashMap<(Level, BlockId), BlockPointer>,
    freed: HashSet<(Level, BlockId, Txg)>,
    maxblkid: BlockId,
}

/// Stands in for spec.md's object/dnode layer collaborator: block-pointer
/// storage, freed-block bookkeeping, and the indirect-tree geometry
/// (`parent_slot`) needed by dirty-parent propagation and `check_blkptr`.
pub struct InMemoryObjectLayer {
    objects: Mutex<HashMap<(ObjSetId, ObjectId), ObjectMeta>>,
    /// Number of block pointers per indirect block; determines how blkid
    /// divides as we walk up a level, mirroring `dbuf`'s `epb` (entries per
    /// block) geometry.
    entries_per_indirect: u64,
}

impl InMemoryObjectLayer {
    pub fn new(entries_per_indirect: u64) -> Arc<Self> {
        Arc::new(Self { objects: Mutex::new(HashMap::new()), entries_per_indirect: entries_per_indirect.max(2) })
    }

    pub fn set_block_pointer(&self, obj_set: ObjSetId, object: ObjectId, level: Level, blkid: BlockId, bp: BlockPointer) {
        let mut objects = self.objects.lock();
        let meta = objects.entry((obj_set, object)).or_default();
        meta.block_pointers.insert((level, blkid), bp);
    }

    pub fn mark_freed(&self, obj_set: ObjSetId, object: ObjectId, level: Level, blkid: BlockId, txg: Txg) {
        let mut objects = self.objects.lock();
        let meta = objects.entry((obj_set, object)).or_default();
        meta.freed.insert((level, blkid, txg));
        meta.block_pointers.remove(&(level, blkid));
    }

    pub fn set_bonus(&self, obj_set: ObjSetId, object: ObjectId, bytes: Vec<u8>) {
        let mut objects = self.objects.lock();
        objects.entry((obj_set, object)).or_default().bonus = bytes;
    }
}

impl ObjectLayer for InMemoryObjectLayer {
    fn block_pointer(&self, obj_set: ObjSetId, object: ObjectId, level: Level, blkid: BlockId) -> Option<BlockPointer> {
        self.objects.lock().get(&(obj_set, object)).and_then(|m| m.block_pointers.get(&(level, blkid)).copied())
    }

    fn is_freed_in_txg(&self, obj_set: ObjSetId, object: ObjectId, level: Level, blkid: BlockId, txg: Txg) -> bool {
        self.objects
            .lock()
            .get(&(obj_set, object))
            .map(|m| m.freed.contains(&(level, blkid, txg)))
            .unwrap_or(false)
    }

    fn willuse_space(&self, _obj_set: ObjSetId, _object: ObjectId, _delta: i64, _txg: Txg) {}

    fn set_maxblkid(&self, obj_set: ObjSetId, object: ObjectId, blkid: BlockId) {
        let mut objects = self.objects.lock();
        let meta = objects.entry((obj_set, object)).or_default();
        meta.maxblkid = meta.maxblkid.max(blkid);
    }

    fn parent_slot(&self, _obj_set: ObjSetId, _object: ObjectId, level: Level, blkid: BlockId) -> (Level, BlockId) {
        if level >= 5 {
            // Cap indirection depth; the root is reached.
            return (level, blkid);
        }
        (level + 1, blkid / self.entries_per_indirect)
    }

    fn object_level0_size(&self, _obj_set: ObjSetId, _object: ObjectId) -> usize {
        crate::common::MAX_BONUS_LEN
    }

    fn bonus_len(&self, obj_set: ObjSetId, object: ObjectId) -> usize {
        self.objects.lock().get(&(obj_set, object)).map(|m| m.bonus.len()).unwrap_or(0)
    }
}

/// Stands in for spec.md's storage I/O pipeline collaborator. Writes are
/// applied synchronously and recorded for assertion by tests.
pub struct InMemoryStorageIo {
    written: Mutex<Vec<(BlockPointer, Vec<u8>)>>,
}

impl InMemoryStorageIo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { written: Mutex::new(Vec::new()) })
    }

    pub fn written(&self) -> Vec<(BlockPointer, Vec<u8>)> {
        self.written.lock().clone()
    }
}

impl Default for InMemoryStorageIo {
    fn default() -> Self {
        Self { written: Mutex::new(Vec::new()) }
    }
}

impl StorageIo for InMemoryStorageIo {
    fn issue_write(&self, bp: BlockPointer, buf: ArcBuf) -> Zio {
        let zio = Zio::new_pending();
        self.written.lock().push((bp, buf.read().clone()));
        zio.complete(None);
        zio
    }
}

/// A manually-advanced TXG clock, standing in for spec.md's transaction
/// manager collaborator. Tests drive `advance()`/`close()` explicitly
/// rather than relying on wall-clock timing.
pub struct TestTxgClock {
    current: AtomicU64,
    syncing: Mutex<HashSet<Txg>>,
    max_concurrent: u32,
}

impl TestTxgClock {
    pub fn new(start: Txg, max_concurrent: u32) -> Arc<Self> {
        Arc::new(Self { current: AtomicU64::new(start), syncing: Mutex::new(HashSet::new()), max_concurrent })
    }

    /// Open the next TXG, returning its number.
    pub fn advance(&self) -> Txg {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Mark `txg` as handed to the syncer (closed, now syncing).
    pub fn begin_sync(&self, txg: Txg) {
        self.syncing.lock().insert(txg);
    }

    pub fn end_sync(&self, txg: Txg) {
        self.syncing.lock().remove(&txg);
    }
}

impl TransactionManager for TestTxgClock {
    fn current_txg(&self) -> Txg {
        self.current.load(Ordering::SeqCst)
    }

    fn is_syncing_context(&self, txg: Txg) -> bool {
        self.syncing.lock().contains(&txg)
    }

    fn max_concurrent_txgs(&self) -> u32 {
        self.max_concurrent
    }
}

/// Build a ready-to-use [`crate::cache::DbufCache`] over the three
/// in-memory collaborators above, for tests and benches. Returns the
/// concrete collaborator handles alongside the cache so callers can seed
/// disk state, inject read failures, or advance the TXG clock.
pub fn test_cache(
    capacity: usize,
) -> (Arc<crate::cache::DbufCache>, Arc<InMemoryAdaptiveCache>, Arc<InMemoryObjectLayer>, Arc<TestTxgClock>) {
    let arc = InMemoryAdaptiveCache::new(capacity);
    let objects = InMemoryObjectLayer::new(128);
    let txmgr = TestTxgClock::new(0, 3);
    let cache =
        crate::cache::DbufCache::new(crate::config::DbufCacheConfig::default(), arc.clone(), objects.clone(), txmgr.clone());
    (cache, arc, objects, txmgr)
}
