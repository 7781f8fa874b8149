/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use bytes::Bytes;

use crate::{node::Node, seq::Seq};

/// Everything that can travel inside a [`crate::Message`].
///
/// The set is closed: dispatch is by exhaustive matching, and unknown
/// kinds never make it past the codec. Timestamps are nanoseconds on
/// the *originator's* private monotonic clock; every other node echoes
/// them back verbatim and never interprets them.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Event {
    /// Probes a peer. The timestamp comes back in the matching ack.
    Ping {
        /// Prober's id.
        from: u64,
        /// Prober's clock at send time.
        time: u64,
    },

    /// Acknowledges a ping. `from` is the peer being acknowledged,
    /// which may differ from the message sender when the ack was
    /// relayed through an indirect probe.
    Ack {
        /// The acknowledged peer.
        from: u64,
        /// Echo of the ping timestamp.
        time: u64,
    },

    /// Asks an unrelated peer to probe `target` on the requester's
    /// behalf.
    IndirectPingRequest {
        /// Requester's id.
        from: u64,
        /// Requester's addresses, so relays can answer without
        /// knowing it.
        from_addrs: Vec<String>,
        /// The peer to probe.
        target: u64,
        /// Where to reach the target.
        target_addrs: Vec<String>,
        /// Requester's clock at the time of the original direct probe.
        time: u64,
    },

    /// A ping routed through a helper. Carries enough context for the
    /// target to answer the helper and for the helper to answer the
    /// original requester.
    IndirectPing {
        /// Helper's id.
        from: u64,
        /// Helper's addresses.
        from_addrs: Vec<String>,
        /// Helper's clock at send time.
        time: u64,
        /// The original requester.
        via: u64,
        /// The original requester's addresses.
        via_addrs: Vec<String>,
        /// The original requester's probe timestamp.
        via_time: u64,
    },

    /// The target's answer to an [`Event::IndirectPing`], sent to the
    /// helper.
    IndirectAck {
        /// Target's id.
        from: u64,
        /// Echo of the helper's timestamp.
        time: u64,
        /// The original requester, for the forwarded ack.
        via: u64,
        /// The original requester's probe timestamp.
        via_time: u64,
    },

    /// Unsolicited full-state exchange: a snapshot of the *sender*,
    /// placed first in a message so the recipient repairs its view of
    /// the sender before interpreting anything else.
    AntiEntropy {
        /// Sender's id.
        from: u64,
        /// Snapshot of the sender.
        node: Node,
    },

    /// A node is alive, joining, or changed its metadata. Carries the
    /// full node since recipients may have never heard of it.
    Alive {
        /// Broadcaster's id; may differ from `node.id`.
        from: u64,
        /// The alive node.
        node: Node,
    },

    /// A node is suspected of failure.
    Suspect {
        /// Broadcaster's id.
        from: u64,
        /// The suspected node.
        id: u64,
        /// The suspected node's incarnation as known by the
        /// broadcaster.
        incarnation: Seq,
    },

    /// A node is confirmed dead.
    Death {
        /// Broadcaster's id.
        from: u64,
        /// The dead node.
        id: u64,
        /// The dead node's incarnation as known by the broadcaster.
        incarnation: Seq,
    },

    /// An application-defined broadcast, delivered to the client and
    /// re-disseminated at most once per `(source, seq)`.
    User {
        /// Broadcaster's id.
        from: u64,
        /// Source-local sequence number.
        seq: Seq,
        /// Opaque payload.
        data: Bytes,
    },
}

/// The invalidation key of a broadcastable event.
///
/// Membership claims about the same node share a tag so that fresher
/// claims displace stale ones in the broadcast queue. User events are
/// keyed by their source instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    /// The node the broadcast is about (the source, for user events).
    pub id: u64,
    /// Whether this is a membership-state broadcast.
    pub state: bool,
}

impl Event {
    /// The id of the node that produced this event.
    pub fn source(&self) -> u64 {
        match self {
            Event::Ping { from, .. }
            | Event::Ack { from, .. }
            | Event::IndirectPingRequest { from, .. }
            | Event::IndirectPing { from, .. }
            | Event::IndirectAck { from, .. }
            | Event::AntiEntropy { from, .. }
            | Event::Alive { from, .. }
            | Event::Suspect { from, .. }
            | Event::Death { from, .. }
            | Event::User { from, .. } => *from,
        }
    }

    /// The invalidation tag, for events that can be broadcast.
    pub fn tag(&self) -> Option<Tag> {
        match self {
            Event::Alive { node, .. } => Some(Tag {
                id: node.id,
                state: true,
            }),
            Event::Suspect { id, .. } | Event::Death { id, .. } => {
                Some(Tag { id: *id, state: true })
            }
            Event::User { from, .. } => Some(Tag {
                id: *from,
                state: false,
            }),
            _ => None,
        }
    }

    /// The sequence that orders broadcasts sharing a tag: the
    /// incarnation for membership claims, the source-local sequence
    /// for user events.
    pub fn seq(&self) -> Seq {
        match self {
            Event::Alive { node, .. } => node.incarnation,
            Event::Suspect { incarnation, .. } | Event::Death { incarnation, .. } => *incarnation,
            Event::User { seq, .. } => *seq,
            _ => Seq::default(),
        }
    }

    /// Kind dominance for seq ties: a death invalidates a
    /// contemporaneous suspicion, which invalidates a contemporaneous
    /// alive claim.
    pub fn rank(&self) -> u8 {
        match self {
            Event::Death { .. } => 3,
            Event::Suspect { .. } => 2,
            Event::Alive { .. } => 1,
            _ => 0,
        }
    }
}
