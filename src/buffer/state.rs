//! The buffer state bitset (§3 "state", legal-combination table).

use std::fmt;

/// Bitset over `{UNCACHED, READ, PARTIAL, FILL, CACHED, NOFILL, EVICTING}`.
///
/// Legal combinations, reproduced from spec.md §3:
/// - each of `UNCACHED`/`CACHED`/`NOFILL`/`EVICTING` is mutually exclusive
///   with the other three;
/// - `PARTIAL` only ever appears together with `FILL`;
/// - `READ` only ever appears together with `FILL`;
/// - `FILL` only ever appears together with `PARTIAL` or `READ` (never
///   alone, never with both at once — exactly one filler reason at a time,
///   consistent with I6 "a `FILL` buffer has exactly one writer in
///   progress").
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferState(u8);

impl BufferState {
    pub const UNCACHED: BufferState = BufferState(1 << 0);
    pub const READ: BufferState = BufferState(1 << 1);
    pub const PARTIAL: BufferState = BufferState(1 << 2);
    pub const FILL: BufferState = BufferState(1 << 3);
    pub const CACHED: BufferState = BufferState(1 << 4);
    pub const NOFILL: BufferState = BufferState(1 << 5);
    pub const EVICTING: BufferState = BufferState(1 << 6);

    const EXCLUSIVE_BASE: u8 =
        Self::UNCACHED.0 | Self::CACHED.0 | Self::NOFILL.0 | Self::EVICTING.0;

    pub const fn empty() -> Self {
        BufferState(0)
    }

    pub fn contains(self, bit: BufferState) -> bool {
        self.0 & bit.0 == bit.0
    }

    pub fn intersects(self, bit: BufferState) -> bool {
        self.0 & bit.0 != 0
    }

    pub fn insert(&mut self, bit: BufferState) {
        self.0 |= bit.0;
    }

    pub fn remove(&mut self, bit: BufferState) {
        self.0 &= !bit.0;
    }

    pub fn union(self, other: BufferState) -> BufferState {
        BufferState(self.0 | other.0)
    }

    /// Checks the legal-combination table verbatim. Used by
    /// [`crate::buffer::Buffer::verify`] and by every state-mutating path
    /// in debug builds, matching spec.md §7's "state-bit legality" contract
    /// violation class.
    pub fn is_legal(self) -> bool {
        let base_bits = (self.0 & Self::EXCLUSIVE_BASE).count_ones();
        if base_bits > 1 {
            return false;
        }
        if self.contains(Self::PARTIAL) && !self.contains(Self::FILL) {
            return false;
        }
        if self.contains(Self::READ) && !self.contains(Self::FILL) {
            return false;
        }
        if self.contains(Self::FILL) && !(self.contains(Self::PARTIAL) || self.contains(Self::READ))
        {
            return false;
        }
        if self.contains(Self::PARTIAL) && self.contains(Self::READ) {
            // I6: a FILL buffer has exactly one writer/reason in progress.
            return false;
        }
        true
    }
}

impl fmt::Debug for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (bit, name) in [
            (Self::UNCACHED, "UNCACHED"),
            (Self::READ, "READ"),
            (Self::PARTIAL, "PARTIAL"),
            (Self::FILL, "FILL"),
            (Self::CACHED, "CACHED"),
            (Self::NOFILL, "NOFILL"),
            (Self::EVICTING, "EVICTING"),
        ] {
            if self.contains(bit) {
                names.push(name);
            }
        }
        write!(f, "{}", names.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_states_legal_alone() {
        for s in [
            BufferState::UNCACHED,
            BufferState::CACHED,
            BufferState::NOFILL,
            BufferState::EVICTING,
        ] {
            assert!(s.is_legal(), "{s:?} should be legal alone");
        }
    }

    #[test]
    fn partial_requires_fill() {
        assert!(!BufferState::PARTIAL.is_legal());
        assert!(BufferState::PARTIAL.union(BufferState::FILL).is_legal());
    }

    #[test]
    fn read_requires_fill() {
        assert!(!BufferState::READ.is_legal());
        assert!(BufferState::READ.union(BufferState::FILL).is_legal());
    }

    #[test]
    fn fill_requires_partial_or_read_not_both() {
        assert!(!BufferState::FILL.is_legal());
        assert!(!BufferState::FILL
            .union(BufferState::PARTIAL)
            .union(BufferState::READ)
            .is_legal());
    }

    #[test]
    fn two_exclusive_base_bits_illegal() {
        assert!(!BufferState::UNCACHED.union(BufferState::CACHED).is_legal());
    }
}
