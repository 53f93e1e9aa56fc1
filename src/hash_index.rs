//! The concurrent hash index mapping buffer identities to live buffers.
//!
//! Keyed by `(object_set, object, level, block_id)` ([`BufferKey`]),
//! striped for concurrency: each stripe owns an independent chain (here, a
//! `HashMap`, whose internal bucket chaining plays the role an open-chained
//! hash table would) guarded by its own mutex. Lock order is **stripe >
//! Buffer** throughout the crate; in particular [`HashIndex::remove`] must
//! never be called while the caller holds the Buffer's own mutex.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use tracing::{instrument, trace, warn};

use crate::buffer::{Buffer, BufferState};
use crate::common::BufferKey;
use crate::config::DbufCacheConfig;

/// `CachePadded` keeps each stripe's mutex on its own cache line so
/// threads hammering adjacent stripes don't false-share each other's
/// locks.
struct Stripe {
    chain: CachePadded<Mutex<HashMap<BufferKey, Weak<Buffer>>>>,
}

/// Striped concurrent map from [`BufferKey`] to [`Buffer`] (C1).
pub struct HashIndex {
    stripes: Vec<Stripe>,
}

fn stripe_hash(key: &BufferKey) -> u64 {
    // A 64-bit hash over the identity tuple. crc32c and crc32fast supply
    // two independent 32-bit CRCs over the same bytes; their concatenation
    // gives the full 64 bits without pulling in a second hashing crate.
    let mut bytes = [0u8; 25];
    bytes[0..8].copy_from_slice(&key.obj_set.to_le_bytes());
    bytes[8..16].copy_from_slice(&key.object.to_le_bytes());
    bytes[16..17].copy_from_slice(&[key.level]);
    bytes[17..25].copy_from_slice(&key.blkid.to_le_bytes());
    let lo = crc32c::crc32c(&bytes) as u64;
    let hi = crc32fast::hash(&bytes) as u64;
    (hi << 32) | lo
}

impl HashIndex {
    /// Picks the stripe count so the index scales with `config`, bounded
    /// below by `min_table_entries`. `Vec::with_capacity` never actually
    /// fails in safe Rust, so degenerate hints (e.g. zero) are handled by
    /// saturating-halving the requested count rather than a retry loop.
    pub fn new(config: &DbufCacheConfig) -> Self {
        let mut stripe_count = config.hash_stripes.max(1);
        while stripe_count > 1 && stripe_count > config.sized_table_entries().max(1) {
            stripe_count /= 2;
        }
        let stripes = (0..stripe_count)
            .map(|_| Stripe { chain: CachePadded::new(Mutex::new(HashMap::new())) })
            .collect();
        trace!(stripe_count, "hash index sized");
        Self { stripes }
    }

    fn stripe_for(&self, key: &BufferKey) -> &Stripe {
        let idx = (stripe_hash(key) as usize) % self.stripes.len();
        &self.stripes[idx]
    }

    /// Walks the stripe's chain; a Buffer observed in `EVICTING` is
    /// treated as absent (a retry will see either the re-created Buffer
    /// or an empty slot).
    #[instrument(level = "trace", skip(self))]
    pub fn find(&self, key: &BufferKey) -> Option<Arc<Buffer>> {
        let stripe = self.stripe_for(key);
        let mut chain = stripe.chain.lock();
        match chain.get(key).and_then(Weak::upgrade) {
            Some(buf) if buf.lock().state.contains(BufferState::EVICTING) => {
                chain.remove(key);
                None
            }
            Some(buf) => Some(buf),
            None => {
                chain.remove(key);
                None
            }
        }
    }

    /// Like `find`, but stores `buffer` under its key if no live match
    /// exists. Returns the pre-existing Buffer on a match so the caller
    /// can drop its freshly-allocated one; a duplicate insert silently
    /// yields the existing Buffer rather than erroring.
    #[instrument(level = "trace", skip(self, buffer), fields(key = %buffer.key))]
    pub fn insert(&self, buffer: Arc<Buffer>) -> Option<Arc<Buffer>> {
        let stripe = self.stripe_for(&buffer.key);
        let mut chain = stripe.chain.lock();
        if let Some(existing) = chain.get(&buffer.key).and_then(Weak::upgrade) {
            if !existing.lock().state.contains(BufferState::EVICTING) {
                return Some(existing);
            }
        }
        chain.insert(buffer.key, Arc::downgrade(&buffer));
        None
    }

    /// Requires `holds==0` and `state==EVICTING`; callers must not hold
    /// the Buffer mutex.
    #[instrument(level = "trace", skip(self, buffer), fields(key = %buffer.key))]
    pub fn remove(&self, buffer: &Arc<Buffer>) {
        {
            let inner = buffer.lock();
            if inner.holds != 0 || !inner.state.contains(BufferState::EVICTING) {
                warn!(key = %buffer.key, "hash_index::remove called on a live buffer; ignoring");
                return;
            }
        }
        let stripe = self.stripe_for(&buffer.key);
        let mut chain = stripe.chain.lock();
        if let Some(weak) = chain.get(&buffer.key) {
            if weak.upgrade().map(|b| Arc::ptr_eq(&b, buffer)).unwrap_or(true) {
                chain.remove(&buffer.key);
            }
        }
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.stripes.iter().map(|s| s.chain.lock().values().filter(|w| w.strong_count() > 0).count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::BufferKind;

    fn key(blkid: u64) -> BufferKey {
        BufferKey::new(1, 1, 0, blkid)
    }

    #[test]
    fn insert_then_find() {
        let idx = HashIndex::new(&DbufCacheConfig::default());
        let buf = Buffer::new_uncached(key(1), BufferKind::Regular, 512, None);
        assert!(idx.insert(buf.clone()).is_none());
        let found = idx.find(&key(1)).expect("should find inserted buffer");
        assert!(Arc::ptr_eq(&found, &buf));
    }

    #[test]
    fn duplicate_insert_yields_existing() {
        let idx = HashIndex::new(&DbufCacheConfig::default());
        let buf1 = Buffer::new_uncached(key(1), BufferKind::Regular, 512, None);
        let buf2 = Buffer::new_uncached(key(1), BufferKind::Regular, 512, None);
        idx.insert(buf1.clone());
        let existing = idx.insert(buf2).expect("duplicate insert should return existing");
        assert!(Arc::ptr_eq(&existing, &buf1));
    }

    #[test]
    fn evicting_buffer_treated_as_absent() {
        let idx = HashIndex::new(&DbufCacheConfig::default());
        let buf = Buffer::new_uncached(key(1), BufferKind::Regular, 512, None);
        idx.insert(buf.clone());
        buf.lock().state = BufferState::EVICTING;
        assert!(idx.find(&key(1)).is_none());
    }
}
