/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use std::collections::{HashMap, HashSet};

use tokio::sync::oneshot;

use crate::event::{Event, Tag};

/// Reserved class whose priority is pinned at zero forever.
pub const CLASS_PINNED: u8 = 0;
/// Synchronous client broadcasts; overtakes [`CLASS_EVENT`] after its
/// first retransmission.
pub const CLASS_SYNC: u8 = 1;
/// Ordinary membership gossip.
pub const CLASS_EVENT: u8 = 2;
/// Low-priority incarnation refreshers.
pub const CLASS_REFRESH: u8 = 3;

/// An event queued for dissemination, together with its transmission
/// bookkeeping.
#[derive(Debug)]
pub struct Broadcast {
    class: u8,
    attempts: u32,
    event: Event,
    done: Option<oneshot::Sender<()>>,
    delivered_to: HashSet<u64>,
    order: u64,
}

impl Broadcast {
    /// Wraps an event in the given priority class.
    pub fn new(event: Event, class: u8) -> Self {
        Self {
            class,
            attempts: 0,
            event,
            done: None,
            delivered_to: HashSet::new(),
            order: 0,
        }
    }

    /// Like [`Broadcast::new`], but the returned receiver fires once
    /// the broadcast leaves the queue, either by invalidation or after
    /// reaching the transmission limit.
    pub fn with_done(event: Event, class: u8) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let mut this = Self::new(event, class);
        this.done = Some(tx);
        (this, rx)
    }

    /// The wrapped event.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// How many times the broadcast has been attached to a message.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The overall priority: `class * attempts`, lower meaning more
    /// urgent. A class-zero broadcast stays at priority zero no matter
    /// how often it is retransmitted.
    pub fn priority(&self) -> u64 {
        u64::from(self.class) * u64::from(self.attempts)
    }

    /// Whether this broadcast was already attached to a message headed
    /// for `recipient`.
    pub fn was_delivered_to(&self, recipient: u64) -> bool {
        self.delivered_to.contains(&recipient)
    }

    /// Records one transmission attempt towards `recipient`.
    pub fn mark_attempt(&mut self, recipient: u64) {
        self.attempts += 1;
        self.delivered_to.insert(recipient);
    }

    /// Records a transmission opportunity that sent no bytes because
    /// `recipient` already had this broadcast. Aging these too is what
    /// lets fully-delivered broadcasts reach the retransmit limit and
    /// leave the queue in small groups.
    pub fn mark_skipped(&mut self) {
        self.attempts += 1;
    }

    /// Determines whether this broadcast supersedes `that`: same tag
    /// and either a fresher sequence or, at the same sequence, a
    /// dominant kind (death beats suspicion beats aliveness).
    pub fn invalidates(&self, that: &Broadcast) -> bool {
        match (self.event.tag(), that.event.tag()) {
            (Some(this_tag), Some(that_tag)) if this_tag == that_tag => {
                match self.event.seq().cmp_window(that.event.seq()) {
                    core::cmp::Ordering::Greater => true,
                    core::cmp::Ordering::Equal => self.event.rank() > that.event.rank(),
                    core::cmp::Ordering::Less => false,
                }
            }
            _ => false,
        }
    }

    fn finish(mut self) {
        if let Some(done) = self.done.take() {
            // The receiver may have lost interest; that's fine
            let _ = done.send(());
        }
    }
}

/// An invalidation-aware priority queue of pending broadcasts.
///
/// Keyed by [`Tag`] so a fresher claim about a node displaces the
/// stale one immediately, even mid-dissemination. Ordered by
/// `(priority, insertion order)`; the sort is recomputed lazily, only
/// after the queue has been mutated.
///
/// Not thread-safe: the broker holds a lock around it.
#[derive(Debug, Default)]
pub(crate) struct BroadcastQueue {
    entries: Vec<Broadcast>,
    index: HashMap<Tag, usize>,
    next_order: u64,
    dirty: bool,
}

impl BroadcastQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds a broadcast, letting it race any queued broadcast with the
    /// same tag. The loser's done signal fires immediately.
    pub(crate) fn push(&mut self, mut bcast: Broadcast) {
        bcast.order = self.next_order;
        self.next_order += 1;

        let Some(tag) = bcast.event().tag() else {
            debug_assert!(false, "only taggable events can be broadcast");
            bcast.finish();
            return;
        };

        if let Some(&at) = self.index.get(&tag) {
            if bcast.invalidates(&self.entries[at]) {
                let loser = core::mem::replace(&mut self.entries[at], bcast);
                loser.finish();
                self.dirty = true;
            } else {
                bcast.finish();
            }
        } else {
            self.index.insert(tag, self.entries.len());
            self.entries.push(bcast);
            self.dirty = true;
        }
    }

    /// Removes every broadcast matching `pred`, firing their done
    /// signals.
    pub(crate) fn prune(&mut self, pred: impl Fn(&Broadcast) -> bool) {
        if !self.entries.iter().any(&pred) {
            return;
        }

        let mut kept = Vec::with_capacity(self.entries.len());
        for bcast in self.entries.drain(..) {
            if pred(&bcast) {
                bcast.finish();
            } else {
                kept.push(bcast);
            }
        }
        self.entries = kept;
        self.reindex();
    }

    /// The queued broadcasts, most urgent first. The caller may bump
    /// attempt counts on the returned entries, so the order is
    /// recomputed on the next call.
    pub(crate) fn sorted_mut(&mut self) -> &mut [Broadcast] {
        if self.dirty {
            self.entries
                .sort_by_key(|bcast| (bcast.priority(), bcast.order));
            self.reindex();
        }
        // Attempt counts are about to change under our feet
        self.dirty = true;
        &mut self.entries
    }

    /// Rebuilds the tag index after positions shifted. Relative order
    /// is untouched, so the dirty flag stays as it is.
    fn reindex(&mut self) {
        self.index.clear();
        for (at, bcast) in self.entries.iter().enumerate() {
            if let Some(tag) = bcast.event().tag() {
                self.index.insert(tag, at);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{seq::Seq, Node};

    fn suspect(id: u64, incarnation: u32) -> Event {
        Event::Suspect {
            from: 1,
            id,
            incarnation: Seq::new(incarnation),
        }
    }

    fn death(id: u64, incarnation: u32) -> Event {
        Event::Death {
            from: 1,
            id,
            incarnation: Seq::new(incarnation),
        }
    }

    fn alive(id: u64, incarnation: u32) -> Event {
        let mut node = Node::with_addr(id, format!("n{id}"));
        node.incarnation = Seq::new(incarnation);
        Event::Alive { from: 1, node }
    }

    #[test]
    fn fresher_sequence_invalidates() {
        let old = Broadcast::new(suspect(3, 4), CLASS_SYNC);
        let new = Broadcast::new(suspect(3, 5), CLASS_SYNC);

        assert!(new.invalidates(&old));
        assert!(!old.invalidates(&new));
        assert!(!old.invalidates(&old), "a broadcast never invalidates itself");
    }

    #[test]
    fn kind_dominance_breaks_ties() {
        let alive = Broadcast::new(alive(3, 4), CLASS_EVENT);
        let suspected = Broadcast::new(suspect(3, 4), CLASS_EVENT);
        let dead = Broadcast::new(death(3, 4), CLASS_EVENT);

        assert!(suspected.invalidates(&alive));
        assert!(dead.invalidates(&suspected));
        assert!(dead.invalidates(&alive));
        assert!(!alive.invalidates(&suspected));
        assert!(!suspected.invalidates(&dead));
    }

    #[test]
    fn different_nodes_never_interact() {
        let a = Broadcast::new(suspect(3, 9), CLASS_EVENT);
        let b = Broadcast::new(suspect(4, 1), CLASS_EVENT);

        assert!(!a.invalidates(&b));
        assert!(!b.invalidates(&a));
    }

    #[test]
    fn push_replaces_and_signals_the_loser() {
        let mut queue = BroadcastQueue::new();

        let (old, mut old_done) = Broadcast::with_done(suspect(3, 4), CLASS_EVENT);
        queue.push(old);
        assert_eq!(1, queue.len());
        assert!(old_done.try_recv().is_err(), "still queued");

        queue.push(Broadcast::new(death(3, 4), CLASS_EVENT));
        assert_eq!(1, queue.len(), "same tag replaces in place");
        assert!(old_done.try_recv().is_ok(), "invalidation fires done");

        // A stale push loses immediately
        let (stale, mut stale_done) = Broadcast::with_done(suspect(3, 4), CLASS_EVENT);
        queue.push(stale);
        assert_eq!(1, queue.len());
        assert!(stale_done.try_recv().is_ok());
    }

    #[test]
    fn prune_signals_done() {
        let mut queue = BroadcastQueue::new();
        let (bcast, mut done) = Broadcast::with_done(suspect(3, 4), CLASS_EVENT);
        queue.push(bcast);
        queue.push(Broadcast::new(suspect(7, 1), CLASS_EVENT));

        queue.prune(|b| matches!(b.event(), Event::Suspect { id: 3, .. }));

        assert_eq!(1, queue.len());
        assert!(done.try_recv().is_ok());
    }

    #[test]
    fn sorted_by_priority_then_insertion() {
        let mut queue = BroadcastQueue::new();

        let mut pinned = Broadcast::new(suspect(1, 1), CLASS_PINNED);
        pinned.attempts = 100;
        let mut retried = Broadcast::new(suspect(2, 1), CLASS_SYNC);
        retried.attempts = 11;
        let mut less_retried = Broadcast::new(suspect(3, 1), CLASS_SYNC);
        less_retried.attempts = 10;

        queue.push(retried);
        queue.push(pinned);
        queue.push(less_retried);

        let order: Vec<u64> = queue
            .sorted_mut()
            .iter()
            .map(|b| match b.event() {
                Event::Suspect { id, .. } => *id,
                _ => unreachable!(),
            })
            .collect();

        // Class 0 pins to the front regardless of attempts; equal
        // classes order by attempts
        assert_eq!(vec![1, 3, 2], order);
    }

    #[test]
    fn fresh_broadcasts_preempt_retransmitted_ones() {
        let mut queue = BroadcastQueue::new();

        let mut stale = Broadcast::new(suspect(1, 1), CLASS_EVENT);
        stale.attempts = 3;
        queue.push(stale);
        queue.push(Broadcast::new(suspect(2, 1), CLASS_SYNC));

        let first = queue.sorted_mut().first().map(|b| b.event().clone());
        assert!(
            matches!(first, Some(Event::Suspect { id: 2, .. })),
            "an untransmitted broadcast outranks a retried one"
        );
    }
}
