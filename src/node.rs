/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use bytes::Bytes;
use tokio::time::Instant;

use crate::{rtt::Rtt, seq::Seq};

/// State describes how a detector perceives a member of the group.
///
/// This is the Suspicion Mechanism from section 4.2 of the SWIM paper.
#[derive(Debug, PartialEq, Eq, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub enum State {
    /// Member is active.
    Alive,
    /// Member is active, but at least one peer suspects it's down.
    /// A `Suspect` member is treated as if it were `Alive` until it
    /// either refutes the suspicion or fails to do so within the
    /// suspicion duration and is declared `Dead`.
    Suspect,
    /// Confirmed down. A member declared `Dead` at incarnation `i`
    /// stays dead for `i`; only a strictly higher incarnation can
    /// re-admit it.
    Dead,
}

impl State {
    /// Whether a member in this state participates in probing.
    pub fn is_active(self) -> bool {
        matches!(self, State::Alive | State::Suspect)
    }
}

/// The public identity and membership state of a group member.
///
/// A `Node` is also the unit of gossip: Alive and anti-entropy events
/// carry a full snapshot of one.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Node {
    /// Globally unique 64-bit identifier, as in the IEEE EUI-64 format.
    pub id: u64,
    /// Routable addresses, most-preferred first. The first address is
    /// the canonical one; the rest exist for multi-homed and mobile
    /// members.
    pub addrs: Vec<String>,
    /// Membership state as locally perceived.
    pub state: State,
    /// Last known incarnation number.
    pub incarnation: Seq,
    /// Opaque application payload carried along with the identity.
    pub user_data: Bytes,
}

impl Node {
    /// A fresh `Alive` node with a single address.
    pub fn with_addr(id: u64, addr: impl Into<String>) -> Self {
        Self {
            id,
            addrs: vec![addr.into()],
            state: State::Alive,
            incarnation: Seq::default(),
            user_data: Bytes::new(),
        }
    }

    /// Decides whether a claim `(incarnation, state)` overrides the
    /// current knowledge about this node.
    ///
    /// This is the order of preference of the suspicion subprotocol,
    /// section 4.2 of the SWIM paper: alive claims need a strictly
    /// newer incarnation, suspicion beats aliveness at the same
    /// incarnation, death beats everything, and a dead node stays dead
    /// until a strictly newer incarnation re-admits it.
    pub fn can_change(&self, incarnation: Seq, state: State) -> bool {
        use core::cmp::Ordering::*;
        let cmp = incarnation.cmp_window(self.incarnation);

        match (self.state, state) {
            (State::Dead, State::Alive) => cmp == Greater,
            (State::Dead, _) => false,
            (_, State::Dead) => true,
            (State::Alive, State::Suspect) => cmp != Less,
            (_, _) => cmp == Greater,
        }
    }

    /// Applies a claim, returning whether anything changed.
    pub fn change_state(&mut self, incarnation: Seq, state: State) -> bool {
        if self.can_change(incarnation, state) {
            self.state = state;
            self.incarnation = incarnation;
            true
        } else {
            false
        }
    }
}

/// Per-peer runtime state, owned exclusively by the detector's event
/// loop. Exactly one `InternalNode` exists per id; every other
/// collection (selection list, suspect set) refers to it by id only.
#[derive(Debug)]
pub(crate) struct InternalNode {
    pub(crate) node: Node,

    /// Round-trip estimator for probes to this peer.
    pub(crate) rtt: Rtt,
    /// This peer's last seen value of *our* incarnation. When it lags,
    /// outgoing messages to the peer get an anti-entropy event
    /// prepended.
    pub(crate) remote_incarnation: Seq,
    /// When the last ack from this peer arrived.
    pub(crate) last_ack_time: Option<Instant>,
    /// Start of the protocol period in which the peer became suspect.
    pub(crate) suspect_time: Option<Instant>,
}

impl InternalNode {
    pub(crate) fn new(node: Node) -> Self {
        Self {
            node,
            rtt: Rtt::new(),
            remote_incarnation: Seq::default(),
            last_ack_time: None,
            suspect_time: None,
        }
    }

    /// Whether an ack has been seen at or after `period_start`.
    pub(crate) fn acked_since(&self, period_start: Instant) -> bool {
        self.last_ack_time
            .map(|at| at >= period_start)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(incarnation: u32, state: State) -> Node {
        Node {
            id: 1,
            addrs: vec![String::from("n1")],
            state,
            incarnation: Seq::new(incarnation),
            user_data: Bytes::new(),
        }
    }

    #[test]
    fn alive_transitions() {
        let mut member = node(1, State::Alive);

        assert!(
            member.change_state(Seq::new(2), State::Alive),
            "can transition to a higher incarnation"
        );
        assert_eq!(Seq::new(2), member.incarnation);

        assert!(
            !member.change_state(Seq::new(1), State::Alive),
            "cannot transition to a lower incarnation"
        );
        assert!(
            !member.change_state(Seq::new(2), State::Alive),
            "cannot transition to the same state and incarnation"
        );

        assert!(
            !member.change_state(Seq::new(1), State::Suspect),
            "lower suspect incarnation shouldn't transition"
        );
        assert!(
            member.change_state(Seq::new(2), State::Suspect),
            "suspicion applies at the same incarnation"
        );
        assert_eq!(State::Suspect, member.state);

        // Death always applies
        assert!(node(1, State::Alive).change_state(Seq::new(0), State::Dead));
        assert!(node(1, State::Alive).change_state(Seq::new(1), State::Dead));
        assert!(node(1, State::Alive).change_state(Seq::new(2), State::Dead));
    }

    #[test]
    fn suspect_transitions() {
        let mut member = node(1, State::Suspect);

        assert!(
            !member.change_state(Seq::new(1), State::Alive),
            "an alive claim at the same incarnation does not clear suspicion"
        );
        assert!(
            !member.change_state(Seq::new(1), State::Suspect),
            "re-suspecting the same incarnation changes nothing"
        );

        assert!(
            member.change_state(Seq::new(2), State::Alive),
            "refutation carries a higher incarnation"
        );
        assert_eq!(State::Alive, member.state);

        assert!(node(1, State::Suspect).change_state(Seq::new(0), State::Dead));
    }

    #[test]
    fn dead_stays_dead_for_its_incarnation() {
        let mut member = node(1, State::Dead);

        assert!(!member.change_state(Seq::new(1), State::Alive));
        assert!(!member.change_state(Seq::new(1), State::Suspect));
        assert!(!member.change_state(Seq::new(1), State::Dead));
        assert!(!member.change_state(Seq::new(0), State::Dead));

        assert!(
            member.change_state(Seq::new(2), State::Alive),
            "a later incarnation re-admits the node"
        );
        assert_eq!(State::Alive, member.state);
    }

    #[test]
    fn ack_window() {
        let mut internal = InternalNode::new(node(0, State::Alive));
        let epoch = Instant::now();

        assert!(!internal.acked_since(epoch));

        internal.last_ack_time = Some(epoch);
        assert!(internal.acked_since(epoch));
    }
}
