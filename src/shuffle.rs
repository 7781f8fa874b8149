/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};

use crate::selection::SelectionList;

/// Round-robin peer selection with a uniform shuffle at the end of
/// every round.
///
/// Two guarantees: every peer is visited exactly once per round, and
/// each round's permutation is uniform (Fisher-Yates). Removal
/// preserves the first guarantee by swapping the removed slot against
/// the visited prefix or the unvisited suffix, depending on where the
/// cursor is.
#[derive(Debug)]
pub struct ShuffleList {
    nodes: Vec<u64>,
    /// Replacement set staged by [`ShuffleList::set_next`], adopted
    /// when the current round ends.
    next_nodes: Option<Vec<u64>>,
    cursor: usize,
    rng: SmallRng,
}

impl ShuffleList {
    /// An empty list. The seed makes test runs reproducible; feed it
    /// entropy in production.
    pub fn new(seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            next_nodes: None,
            cursor: 0,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Stages `nodes` as the set to use from the next round onwards,
    /// leaving the in-progress round undisturbed. Used by the bucket
    /// list to rebalance without resetting rounds.
    pub fn set_next(&mut self, nodes: Vec<u64>) {
        if self.nodes.is_empty() {
            self.nodes = nodes;
            self.next_nodes = None;
            self.shuffle();
        } else {
            self.next_nodes = Some(nodes);
        }
    }

    fn shuffle(&mut self) {
        if let Some(next) = self.next_nodes.take() {
            self.nodes = next;
        }
        self.nodes.shuffle(&mut self.rng);
        self.cursor = 0;
    }

    fn remove_one(&mut self, id: u64) {
        if let Some(next) = self.next_nodes.as_mut() {
            next.retain(|&other| other != id);
        }

        let Some(at) = self.nodes.iter().position(|&other| other == id) else {
            return;
        };

        if at < self.cursor {
            // Already visited: plug the hole with the last visited
            // peer, then fill its slot from the unvisited tail
            self.nodes[at] = self.nodes[self.cursor - 1];
            self.nodes.swap_remove(self.cursor - 1);
            self.cursor -= 1;
        } else {
            // Not visited yet: swap against the end of the suffix
            self.nodes.swap_remove(at);
        }
    }
}

impl SelectionList for ShuffleList {
    fn add(&mut self, ids: &[u64]) {
        // New peers join the unvisited suffix, so the round guarantee
        // extends to them immediately
        if let Some(next) = self.next_nodes.as_mut() {
            next.extend_from_slice(ids);
        } else {
            self.nodes.extend_from_slice(ids);
        }
    }

    fn remove(&mut self, ids: &[u64]) {
        for &id in ids {
            self.remove_one(id);
        }
    }

    fn replace(&mut self, ids: Vec<u64>) {
        self.nodes = ids;
        self.next_nodes = None;
        self.cursor = 0;
        self.shuffle();
    }

    fn next(&mut self) -> Option<u64> {
        if self.cursor >= self.nodes.len() {
            self.shuffle();
        }

        let picked = self.nodes.get(self.cursor).copied();
        if picked.is_some() {
            self.cursor += 1;
        }
        picked
    }

    fn list(&self) -> &[u64] {
        self.next_nodes.as_deref().unwrap_or(&self.nodes)
    }

    fn len(&self) -> usize {
        self.list().len()
    }
}
