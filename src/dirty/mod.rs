//! The dirty-record chain: each open transaction group's pending
//! modification to a buffer.
//!
//! Each [`Buffer`](crate::buffer::Buffer) owns an ordered, TXG-descending
//! list of [`DirtyRecord`]s. A leaf record carries a data snapshot plus its
//! [`WriteRanges`]; an indirect record carries a list of child dirty
//! records instead. Both variants share `txg`, a back-pointer to the
//! owning buffer, a link to the parent indirect's dirty record, and a
//! `zio` slot the syncer fills in once the write is issued.

pub mod ranges;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

pub use ranges::{Hole, WriteRange, WriteRanges};

use crate::buffer::Buffer;
use crate::collab::{ArcBuf, BlockPointer, Zio};
use crate::common::Txg;

/// Immediate-write (`dmu_sync`-style) override bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverrideState {
    #[default]
    NotOverridden,
    InSync,
    Overridden,
}

/// Leaf-specific dirty state, mutable over the record's life (the frontend
/// may be reassigned, ranges accumulate and then get cleared, the override
/// bookkeeping flips as `dmu_sync` races with ordinary dirtying).
pub struct LeafDirty {
    pub data: Option<ArcBuf>,
    pub write_ranges: WriteRanges,
    pub override_state: OverrideState,
    pub override_bp: Option<BlockPointer>,
    pub override_zio: Option<Zio>,
    pub nopwrite: bool,
    pub copies: u32,
}

impl LeafDirty {
    pub fn new(data: Option<ArcBuf>) -> Self {
        Self {
            data,
            write_ranges: WriteRanges::new(),
            override_state: OverrideState::NotOverridden,
            override_bp: None,
            override_zio: None,
            nopwrite: false,
            copies: 1,
        }
    }
}

/// Indirect-specific dirty state: the child dirty-record list, guarded by
/// its own mutex (lock order: `... > indirect_dr.mtx > ...`).
#[derive(Default)]
pub struct IndirectDirty {
    pub children: Mutex<Vec<Arc<DirtyRecord>>>,
}

/// Tagged dirty-record payload: a discriminated variant rather than an
/// untagged union, since leaf and indirect records carry disjoint data.
pub enum DirtyPayload {
    Leaf(Mutex<LeafDirty>),
    Indirect(IndirectDirty),
}

impl DirtyPayload {
    pub fn as_leaf(&self) -> Option<&Mutex<LeafDirty>> {
        match self {
            DirtyPayload::Leaf(l) => Some(l),
            DirtyPayload::Indirect(_) => None,
        }
    }

    pub fn as_indirect(&self) -> Option<&IndirectDirty> {
        match self {
            DirtyPayload::Indirect(i) => Some(i),
            DirtyPayload::Leaf(_) => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, DirtyPayload::Leaf(_))
    }
}

/// One TXG's pending modification to a [`Buffer`].
pub struct DirtyRecord {
    pub txg: Txg,
    pub dbuf: Weak<Buffer>,
    pub parent: Mutex<Option<Arc<DirtyRecord>>>,
    /// The parent indirect Buffer this record was linked under, held for
    /// the record's lifetime. Released when the record is undirtied, so
    /// the parent can in turn become collectible.
    pub parent_buf: Mutex<Option<Arc<Buffer>>>,
    pub zio: Mutex<Option<Zio>>,
    pub payload: DirtyPayload,
}

impl DirtyRecord {
    pub fn new_leaf(txg: Txg, dbuf: Weak<Buffer>, data: Option<ArcBuf>) -> Arc<Self> {
        Arc::new(Self {
            txg,
            dbuf,
            parent: Mutex::new(None),
            parent_buf: Mutex::new(None),
            zio: Mutex::new(None),
            payload: DirtyPayload::Leaf(Mutex::new(LeafDirty::new(data))),
        })
    }

    pub fn new_indirect(txg: Txg, dbuf: Weak<Buffer>) -> Arc<Self> {
        Arc::new(Self {
            txg,
            dbuf,
            parent: Mutex::new(None),
            parent_buf: Mutex::new(None),
            zio: Mutex::new(None),
            payload: DirtyPayload::Indirect(IndirectDirty::default()),
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.payload.is_leaf()
    }

    /// Snapshot of this record's data pointer, for leaf records. Returns
    /// `None` for indirect records (they have no single snapshot pointer;
    /// their payload is the children list).
    pub fn leaf_data(&self) -> Option<Option<ArcBuf>> {
        self.payload.as_leaf().map(|l| l.lock().data.clone())
    }

    /// `zio` is non-null once the syncer has dispatched the write for this
    /// record.
    pub fn has_dispatched(&self) -> bool {
        self.zio.lock().is_some()
    }
}
