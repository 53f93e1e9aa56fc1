//! # Common Types and Identifiers
//!
//! Shared identifiers and small value types used across the cache core and
//! its collaborator traits. Mirrors the role the teacher project's
//! `common` module plays for the rest of RustyDB: the one place every other
//! module imports its IDs from, so a rename never has to ripple.

use std::fmt;

/// Transaction-group number. Monotonically increasing; the syncer drains
/// TXGs strictly in order.
pub type Txg = u64;

/// Identifies the object set (roughly: which dataset) a [`crate::buffer::Buffer`]
/// belongs to. Opaque to the cache core beyond equality/hashing.
pub type ObjSetId = u64;

/// Identifies an object (file/dnode analogue) within an object set.
pub type ObjectId = u64;

/// Indirection level: `0` is a leaf (data) block, `>0` is an indirect block
/// whose payload is an array of block pointers. Bonus and spill blocks are
/// level 0 by convention but carry a sentinel `block_id` (see [`BlockId`]).
pub type Level = u8;

/// Block identifier within an object at a given level.
pub type BlockId = u64;

/// Sentinel `block_id` for an object's inline bonus buffer.
pub const BONUS_BLKID: BlockId = BlockId::MAX;

/// Sentinel `block_id` for an object's spill block.
pub const SPILL_BLKID: BlockId = BlockId::MAX - 1;

/// Maximum length of a bonus-buffer scratch allocation.
pub const MAX_BONUS_LEN: usize = 320;

/// Identity tuple for a cached block: `(object_set, object, level, block_id)`.
///
/// Unique per §3 of the spec this crate implements; used as the hash index
/// key and as the `#[instrument]` key on every public operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub obj_set: ObjSetId,
    pub object: ObjectId,
    pub level: Level,
    pub blkid: BlockId,
}

impl BufferKey {
    pub fn new(obj_set: ObjSetId, object: ObjectId, level: Level, blkid: BlockId) -> Self {
        Self { obj_set, object, level, blkid }
    }

    pub fn is_bonus(&self) -> bool {
        self.blkid == BONUS_BLKID
    }

    pub fn is_spill(&self) -> bool {
        self.blkid == SPILL_BLKID
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{os={}, obj={}, lvl={}, blk={}}}",
            self.obj_set, self.object, self.level, self.blkid
        )
    }
}

/// What kind of block a [`crate::buffer::Buffer`] caches. Drives dispatch in
/// the dirty path (§4.4) and the writeback path (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Ordinary level-0 data block: partial writes, range tracking, holes.
    Regular,
    /// Inline bonus payload stored alongside object metadata. No `arc_buf`;
    /// the snapshot is always a full-block scratch copy.
    Bonus,
    /// Object overflow block. Propagates to the object's dirty list like a
    /// bonus block, but is backed by a real block pointer and an `arc_buf`
    /// snapshot like a regular leaf (see `SPEC_FULL.md`).
    Spill,
    /// The meta-dnode's own leaf blocks: always rewritten whole, no range
    /// bookkeeping.
    MetaDnode,
    /// `level > 0`: an array of child block pointers.
    Indirect,
    /// Allocated with a promise that the caller will overwrite the entire
    /// block and never intends to read stale bytes.
    NoFill,
}

impl BufferKind {
    pub fn is_leaf(&self) -> bool {
        !matches!(self, BufferKind::Indirect)
    }
}
