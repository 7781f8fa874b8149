/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use std::collections::HashMap;

use crate::{selection::SelectionList, shuffle::ShuffleList, sorter::Sorter};

/// Peer selection over K buckets of geometrically decreasing size.
///
/// Peers are sorted nearest-first by the [`Sorter`] metric and
/// partitioned from the far end inward, so each bucket is roughly
/// twice the size of the next-nearer one. Selection round-robins
/// *across* buckets, which means a peer in the nearest bucket is
/// probed about `2^(K-1)` times as often as one in the farthest:
/// the near neighbourhood is watched closely while dissemination
/// across the whole group stays O(log n).
#[derive(Debug)]
pub struct BucketList {
    sorter: Sorter,
    local_id: u64,
    buckets: Vec<ShuffleList>,
    /// All contained ids, sorted nearest-first.
    sorted: Vec<u64>,
    /// Memoized sort keys; recomputed only when the local id changes.
    keys: HashMap<u64, u64>,
    cursor: usize,
}

impl BucketList {
    /// A list of `k >= 2` buckets ordered by `sorter` around
    /// `local_id`.
    ///
    /// # Panics
    ///
    /// When `k < 2`; a single bucket is just a worse
    /// [`ShuffleList`].
    pub fn new(k: u32, sorter: Sorter, local_id: u64, seed: u64) -> Self {
        assert!(k >= 2, "a bucket list needs at least two buckets");

        Self {
            sorter,
            local_id,
            buckets: (0..k)
                .map(|at| ShuffleList::new(seed.wrapping_add(u64::from(at))))
                .collect(),
            sorted: Vec::new(),
            keys: HashMap::new(),
            cursor: 0,
        }
    }

    /// The number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[cfg(test)]
    pub(crate) fn bucket_sizes(&self) -> Vec<usize> {
        self.buckets.iter().map(|bucket| bucket.len()).collect()
    }

    fn sort_value(&mut self, id: u64) -> u64 {
        let sorter = self.sorter;
        let local_id = self.local_id;
        *self
            .keys
            .entry(id)
            .or_insert_with(|| sorter.key(id, local_id))
    }

    /// Re-sorts the full set and re-partitions it over the buckets.
    /// Partitions are staged via [`ShuffleList::set_next`] so
    /// in-progress rounds keep their visit-once guarantee.
    fn repartition(&mut self) {
        match self.sorter {
            Sorter::Finger => {
                let mut ids = core::mem::take(&mut self.sorted);
                self.sorter.sort(&mut ids, self.local_id);
                self.sorted = ids;
            }
            _ => {
                for at in 0..self.sorted.len() {
                    let id = self.sorted[at];
                    self.sort_value(id);
                }
                let keys = &self.keys;
                self.sorted.sort_unstable_by_key(|id| keys[id]);
            }
        }

        // Partition from the far end inward: of the |U| still
        // unallocated nodes, bucket i takes the last
        // ceil(|U| * 2^i / (2^(i+1) - 1))
        let mut remaining = self.sorted.len();
        for at in (1..self.buckets.len()).rev() {
            let weight = 1usize << at;
            let take = (remaining * weight).div_ceil(2 * weight - 1);

            self.buckets[at].set_next(self.sorted[remaining - take..remaining].to_vec());
            remaining -= take;
        }
        self.buckets[0].set_next(self.sorted[..remaining].to_vec());
    }
}

impl SelectionList for BucketList {
    fn add(&mut self, ids: &[u64]) {
        self.sorted.extend_from_slice(ids);
        self.repartition();
    }

    fn remove(&mut self, ids: &[u64]) {
        // Drop from the active rounds immediately: a removed peer must
        // not be probed again, rebalancing can wait for set_next
        for bucket in &mut self.buckets {
            bucket.remove(ids);
        }
        self.sorted.retain(|id| !ids.contains(id));
        for id in ids {
            self.keys.remove(id);
        }
        self.repartition();
    }

    fn replace(&mut self, ids: Vec<u64>) {
        for bucket in &mut self.buckets {
            bucket.replace(Vec::new());
        }
        self.sorted = ids;
        self.repartition();
    }

    fn next(&mut self) -> Option<u64> {
        for _ in 0..self.buckets.len() {
            let at = self.cursor;
            self.cursor = (self.cursor + 1) % self.buckets.len();

            if let Some(id) = self.buckets[at].next() {
                return Some(id);
            }
        }
        None
    }

    fn list(&self) -> &[u64] {
        &self.sorted
    }

    fn len(&self) -> usize {
        self.sorted.len()
    }
}
