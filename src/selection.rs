/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

/// The strategy with which the failure detector picks peers to probe.
///
/// Lists hold peer *ids* only; the detector owns the actual records
/// and keeps the list in sync with membership: a peer is listed iff it
/// is `Alive` or `Suspect`.
///
/// Implementations are not thread-safe; the detector serializes all
/// access from its event loop.
pub trait SelectionList: Send + Sync {
    /// Adds peers to the list. Ids already present are the caller's
    /// bug and may be visited twice.
    fn add(&mut self, ids: &[u64]);

    /// Removes peers from the list, taking effect before the next
    /// [`SelectionList::next`] call.
    fn remove(&mut self, ids: &[u64]);

    /// Replaces the entire content of the list.
    fn replace(&mut self, ids: Vec<u64>);

    /// Picks the next peer to probe. `None` iff the list is empty.
    fn next(&mut self) -> Option<u64>;

    /// A view of the contained ids, in no particular order.
    fn list(&self) -> &[u64];

    /// Number of contained peers.
    fn len(&self) -> usize;

    /// Whether the list contains no peers.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
