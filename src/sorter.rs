/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

/// A pure total order over peer ids, relative to the local node.
///
/// Sorters decide which peers count as "near" for a [`crate::BucketList`]:
/// near peers land in small buckets and get probed proportionally more
/// often.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Sorter {
    /// Plain ascending id order; no topology.
    #[default]
    None,
    /// Clockwise identifier-ring order starting at the local node:
    /// distance is `(id - local) mod 2^64`.
    Ring,
    /// Ring order relabeled so that position `2^k - 1` becomes
    /// position `k`, like a Chord finger table; remaining positions
    /// fill in.
    Finger,
    /// Kademlia order: distance is `id XOR local`.
    Xor,
}

impl Sorter {
    /// The distance key of `id` relative to `local`. Meaningless for
    /// [`Sorter::Finger`], which orders positionally.
    pub fn key(self, id: u64, local: u64) -> u64 {
        match self {
            Sorter::None => id,
            Sorter::Ring | Sorter::Finger => id.wrapping_sub(local),
            Sorter::Xor => id ^ local,
        }
    }

    /// Sorts `ids` nearest-first relative to `local`.
    pub fn sort(self, ids: &mut [u64], local: u64) {
        match self {
            Sorter::None | Sorter::Ring | Sorter::Xor => {
                ids.sort_unstable_by_key(|&id| self.key(id, local));
            }
            Sorter::Finger => finger_sort(ids, local),
        }
    }
}

/// Reorders ring-sorted ids into Chord-finger order: the k-th output
/// position takes the node at ring position `2^k - 1`, wrapping and
/// skipping positions already consumed.
fn finger_sort(ids: &mut [u64], local: u64) {
    let len = ids.len();
    if len < 2 {
        return;
    }

    let mut presorted = ids.to_vec();
    presorted.sort_unstable_by_key(|&id| id.wrapping_sub(local));

    let mut taken = vec![false; len];
    // finger = (2^i - 1) mod len, computed incrementally to dodge the
    // shift overflow at i >= 64
    let mut finger = 0usize;

    for slot in ids.iter_mut() {
        let mut at = finger;
        while taken[at] {
            at = (at + 1) % len;
        }
        taken[at] = true;
        *slot = presorted[at];

        finger = (finger * 2 + 1) % len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_starts_clockwise_from_local() {
        let mut ids = vec![2, 5, 90, 200];
        Sorter::Ring.sort(&mut ids, 100);

        // 200 is 100 away clockwise; 2, 5 and 90 wrap around
        assert_eq!(vec![200, 2, 5, 90], ids);
    }

    #[test]
    fn xor_prefers_shared_high_bits() {
        let mut ids = vec![0b0001, 0b1111, 0b1000];
        Sorter::Xor.sort(&mut ids, 0b1010);

        assert_eq!(vec![0b1000, 0b1111, 0b0001], ids);
    }

    #[test]
    fn finger_relabels_ring_positions() {
        // Local = 0 so the ring order is 1..=7
        let mut ids = vec![1, 2, 3, 4, 5, 6, 7];
        Sorter::Finger.sort(&mut ids, 0);

        // Fingers: 2^0-1=0, 2^1-1=1, 2^2-1=3, 2^3-1=7 mod 7=0 (taken,
        // advance to 2), then 15 mod 7 = 1 (taken, advance to 4), ...
        assert_eq!(ids[0], 1, "first finger is the ring successor");
        assert_eq!(ids[1], 2);
        assert_eq!(ids[2], 4, "third finger is 2^2 - 1 = position 3");

        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(
            vec![1, 2, 3, 4, 5, 6, 7],
            sorted,
            "relabeling is a permutation"
        );
    }

    #[test]
    fn none_is_plain_id_order() {
        let mut ids = vec![9, 1, 5];
        Sorter::None.sort(&mut ids, 12345);
        assert_eq!(vec![1, 5, 9], ids);
    }
}
