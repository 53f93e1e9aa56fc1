//! Hold/eviction (§4.7, C9).
//!
//! `add_ref`/`release` manage the Buffer's reference count; `release`
//! additionally decides whether to freeze the frontend, fire the user
//! eviction callback, or tear the Buffer down entirely. Teardown itself is
//! the two-step `clear`/`destroy` split spec.md calls out explicitly in
//! §9: `clear` runs under the Buffer mutex and flips the state to
//! `EVICTING`; `destroy` runs *without* the Buffer mutex held, because
//! `hash_index::remove` must not be called while holding it (lock order:
//! stripe > Buffer, so removing from the hash while holding the Buffer
//! mutex would invert that order).

use std::sync::Arc;

use tracing::{instrument, trace};

use crate::buffer::{Buffer, BufferState, UserData};
use crate::collab::AdaptiveCache;
use crate::common::BufferKind;
use crate::hash_index::HashIndex;

/// Increment the hold count (§4.7 `add_ref`), unless the Buffer has already
/// been torn down. `find`/`insert` hand back a bare `Arc<Buffer>` without
/// holding its mutex across the gap to this call (§4.1 notes that gap
/// exists), so a concurrent `release` can run `clear_and_destroy` in
/// between; checking `EVICTING` here, under the same lock that increments
/// `holds`, is what keeps that race from resurrecting an already-evicted
/// Buffer. Returns `false` if the caller lost that race — it must re-`find`
/// (or re-`insert`) rather than trust the Buffer it was handed.
#[instrument(level = "trace", skip(buf), fields(key = %buf.key))]
pub fn add_ref(buf: &Arc<Buffer>) -> bool {
    let mut inner = buf.lock();
    if inner.state.contains(BufferState::EVICTING) {
        trace!(key = %buf.key, "add_ref lost the race with a concurrent teardown");
        return false;
    }
    inner.holds += 1;
    trace!(holds = inner.holds, "add_ref");
    true
}

/// §4.7 `release`. Runs the freeze/evict-callback/teardown decision tree
/// and, if the Buffer becomes collectible, removes it from `hash` and
/// destroys it.
#[instrument(level = "trace", skip(buf, hash, arc), fields(key = %buf.key))]
pub fn release(buf: &Arc<Buffer>, hash: &HashIndex, arc: &dyn AdaptiveCache) {
    let should_destroy = {
        let mut inner = buf.lock();
        assert!(inner.holds > 0, "release with no outstanding hold");
        inner.holds -= 1;

        let dirty_count = inner.dirty_count();
        let min_live_holds = if buf.kind == BufferKind::Indirect { 0 } else { dirty_count };

        if inner.state.contains(BufferState::CACHED) && inner.data.is_some() && inner.holds == min_live_holds {
            if let Some(data) = &inner.data {
                arc.arc_buf_freeze(data);
                trace!("froze frontend on release to minimum live holds");
            }
        }

        if inner.holds == dirty_count && buf.kind != BufferKind::Indirect && inner.immediate_evict {
            if let Some(user) = inner.user.take() {
                if let Some(evict_fn) = user.evict_fn {
                    evict_fn(user.ptr.as_ref());
                }
            }
        }

        if inner.holds == 0 {
            match buf.kind {
                // Bonus buffers hold a reference on their owning object
                // rather than on ARC; drop_object_hold is out of scope for
                // THE CORE, but the Buffer itself is still collectible
                // (§4.7: "bonus: drop the object hold" still falls through
                // to eviction, it just skips the ARC-specific step below).
                BufferKind::Bonus => true,
                // No arc_buf attached: evict directly.
                _ if inner.data.is_none() => true,
                _ => {
                    let data = inner.data.as_ref().unwrap();
                    if data.is_anonymous() {
                        arc.arc_buf_remove_ref(data.clone());
                    } else {
                        arc.arc_release(data);
                    }
                    true
                }
            }
        } else {
            false
        }
    };

    buf.notify_changed();

    if should_destroy {
        clear_and_destroy(buf, hash);
    }
}

/// `set_user`: install client user data. Panics in debug builds if the
/// Buffer already carries user data — callers that want to overwrite an
/// existing attachment must go through [`replace_user`] instead, matching
/// the distinction the public operation table in spec.md §6 draws between
/// `set_user` and `replace_user`.
pub fn set_user(buf: &Arc<Buffer>, user: UserData) {
    let mut inner = buf.lock();
    debug_assert!(inner.user.is_none(), "set_user on a buffer that already has user data");
    inner.user = Some(user);
}

/// `replace_user`: install client user data unconditionally, returning
/// whatever was previously attached (if anything).
pub fn replace_user(buf: &Arc<Buffer>, user: UserData) -> Option<UserData> {
    let mut inner = buf.lock();
    inner.user.replace(user)
}

/// `remove_user`: detach and return the client's user data, if any.
pub fn remove_user(buf: &Arc<Buffer>) -> Option<UserData> {
    let mut inner = buf.lock();
    inner.user.take()
}

/// `get_user`: run `f` against a reference to the currently attached user
/// data, under the Buffer mutex. The data can't be handed out by value
/// without cloning the caller's `dyn Any` payload, so this mirrors the
/// "run a closure under the lock" shape the teacher's own
/// `buffer/manager.rs` uses for its own pinned-metadata accessors.
pub fn get_user<R>(buf: &Arc<Buffer>, f: impl FnOnce(Option<&UserData>) -> R) -> R {
    let inner = buf.lock();
    f(inner.user.as_ref())
}

/// `clear` (under the Buffer mutex, via the caller taking `buf.lock()`
/// internally) followed by `destroy` (without it). Split exactly as
/// spec.md §9 requires.
///
/// Also the teardown `free_one_buffer` (§4.5 step 5) reaches for directly
/// when it finds `holds == 0`: a freed block with no live holder has
/// nothing keeping a pre-free frontend honest, so rather than leave it
/// `CACHED` with stale bytes reachable via the hash index, it gets torn
/// down the same way a last `release` would. Callers must not hold `buf`'s
/// mutex when calling this.
pub(crate) fn clear_and_destroy(buf: &Arc<Buffer>, hash: &HashIndex) {
    {
        let mut inner = buf.lock();
        if inner.holds != 0 || inner.state.contains(BufferState::EVICTING) {
            // Lost the race (a concurrent add_ref/hold resurrected it, or
            // another release already tore it down); nothing to do.
            return;
        }
        // §9 "Eviction sequence": invoke user eviction unconditionally on
        // destroy, not just when `immediate_evict` fired a proactive
        // callback earlier in `release`. A no-op if that already consumed
        // `user` (it's an `Option::take`, so at most one of the two call
        // sites ever actually invokes the callback).
        if let Some(user) = inner.user.take() {
            if let Some(evict_fn) = user.evict_fn {
                evict_fn(user.ptr.as_ref());
            }
        }
        inner.data = None;
        inner.blkptr = None;
        inner.state = BufferState::EVICTING;
        inner.parent = None;
    }
    buf.notify_changed();
    // hash_remove must be called without the Buffer mutex held (§4.1).
    hash.remove(buf);
    trace!(key = %buf.key, "buffer destroyed and removed from hash index");
}
