/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use core::{
    cmp::Ordering,
    fmt,
    sync::atomic::{AtomicU32, Ordering::SeqCst},
};

// Distances of up to half the sequence space count as "ahead".
const WINDOW: u32 = 1 << 31;

/// A 32-bit sequence number compared within a window of 2^31, ala TCP
/// sequence numbers.
///
/// Incarnation numbers and user-event sequence numbers are `Seq`s: they
/// survive wrap-around so long as no two live values are ever more than
/// 2^31 increments apart, which holds in practice because incarnations
/// only advance on suspicion and refutation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Seq(u32);

impl Seq {
    /// Wraps a raw value.
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// The raw value.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The sequence immediately after this one.
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Compares two sequences under the 2^31 window.
    ///
    /// `self` is `Greater` when it is up to 2^31 increments ahead of
    /// `other` (modulo 2^32) and `Less` otherwise. This is not a total
    /// order, so `Seq` deliberately does not implement [`Ord`].
    pub fn cmp_window(self, other: Self) -> Ordering {
        let delta = self.0.wrapping_sub(other.0);
        if delta == 0 {
            Ordering::Equal
        } else if delta <= WINDOW {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    }
}

impl From<u32> for Seq {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A [`Seq`] that can be read and advanced from parallel callers
/// without locks.
#[derive(Debug, Default)]
pub struct AtomicSeq(AtomicU32);

impl AtomicSeq {
    /// Starts counting from `value`.
    pub fn new(value: Seq) -> Self {
        Self(AtomicU32::new(value.get()))
    }

    /// Reads the current sequence.
    pub fn get(&self) -> Seq {
        Seq(self.0.load(SeqCst))
    }

    /// Increments the sequence, returning the new value.
    pub fn increment(&self) -> Seq {
        Seq(self.0.fetch_add(1, SeqCst)).next()
    }

    /// Advances the sequence to at least `value` under the window
    /// ordering, returning whichever of the two was ahead.
    pub fn witness(&self, value: Seq) -> Seq {
        loop {
            let current = Seq(self.0.load(SeqCst));

            if value.cmp_window(current) != Ordering::Greater {
                return current;
            }

            // Another caller may have advanced past us; retry from the top.
            if self
                .0
                .compare_exchange(current.get(), value.get(), SeqCst, SeqCst)
                .is_ok()
            {
                return value;
            }
        }
    }
}

impl From<Seq> for AtomicSeq {
    fn from(value: Seq) -> Self {
        Self::new(value)
    }
}

impl Clone for AtomicSeq {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_comparison() {
        assert_eq!(Ordering::Equal, Seq::new(42).cmp_window(Seq::new(42)));
        assert_eq!(Ordering::Greater, Seq::new(43).cmp_window(Seq::new(42)));
        assert_eq!(Ordering::Less, Seq::new(42).cmp_window(Seq::new(43)));

        // Wrap-around: zero is one step past the maximum value
        assert_eq!(Ordering::Greater, Seq::new(0).cmp_window(Seq::new(u32::MAX)));
        // The window boundary itself still counts as ahead
        assert_eq!(Ordering::Greater, Seq::new(1 << 31).cmp_window(Seq::new(0)));
        // One past the window is behind
        assert_eq!(
            Ordering::Less,
            Seq::new((1 << 31) + 1).cmp_window(Seq::new(0))
        );
    }

    #[test]
    fn increment_and_get() {
        let seq = AtomicSeq::default();

        assert_eq!(Seq::new(0), seq.get());
        assert_eq!(Seq::new(1), seq.increment());
        assert_eq!(Seq::new(1), seq.get());
    }

    #[test]
    fn witness_advances_to_max() {
        let seq = AtomicSeq::default();
        seq.increment();

        assert_eq!(Seq::new(41), seq.witness(Seq::new(41)));
        assert_eq!(Seq::new(41), seq.get());

        // Witnessing the same value again is a no-op
        assert_eq!(Seq::new(41), seq.witness(Seq::new(41)));
        assert_eq!(Seq::new(41), seq.get());

        assert_eq!(Seq::new(420), seq.witness(Seq::new(420)));
        assert_eq!(Seq::new(420), seq.get());

        // A value behind under the window ordering does not move us
        let behind = Seq::new(420u32.wrapping_add((1 << 31) + 1));
        assert_eq!(Seq::new(420), seq.witness(behind));
        assert_eq!(Seq::new(420), seq.get());
    }

    #[test]
    fn wrap_around_increment() {
        let seq = AtomicSeq::new(Seq::new(u32::MAX));
        assert_eq!(Seq::new(0), seq.increment());
        assert_eq!(
            Ordering::Greater,
            seq.get().cmp_window(Seq::new(u32::MAX)),
            "the wrapped value still orders after the maximum"
        );
    }
}
