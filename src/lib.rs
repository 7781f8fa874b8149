/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! Cardume is a weakly-consistent group-membership and
//! failure-detection library implementing the SWIM protocol
//! (`SWIM+Inf.+Susp.`) with a topology-aware dissemination extension.
//!
//! Every process runs a [`Detector`]: it periodically probes peers,
//! marks the unresponsive as [`State::Suspect`] and then
//! [`State::Dead`], and piggybacks membership gossip on its ordinary
//! probe traffic until the whole group converges on the same view.
//!
//! * **Bring your own wire and transport**: implement [`Codec`] for
//!   the byte format and [`Transport`] for delivery; [`BincodeCodec`]
//!   is included and any datagram-ish transport will do. Messages are
//!   delivered whole, loss is tolerated by design.
//!
//! * **Topology-aware probing**: besides the classic uniform
//!   round-robin ([`ShuffleList`]), peers can be partitioned into
//!   geometric buckets over a distance metric ([`BucketList`] with a
//!   [`Sorter`]: identifier ring, Chord fingers or Kademlia XOR) so
//!   near neighbourhoods are probed at a higher rate while
//!   dissemination stays logarithmic.
//!
//! * **Application broadcasts**: arbitrary payloads ride the same
//!   piggyback channel as membership gossip, with invalidation so
//!   stale payloads stop circulating the moment fresher ones appear.
//!
//! * **Simulator included**: the [`sim`] module drives whole groups
//!   of detectors over an in-process network with configurable delay,
//!   loss and partitions, and measures failure-detection convergence.
#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

mod addr;
mod broadcast;
mod broker;
mod bucket;
mod codec;
mod config;
mod detector;
mod error;
mod event;
mod message;
mod node;
mod rtt;
mod selection;
mod seq;
mod shuffle;
pub mod sim;
mod sorter;
mod transport;

pub use crate::{
    addr::Addr,
    broadcast::{Broadcast, CLASS_EVENT, CLASS_PINNED, CLASS_REFRESH, CLASS_SYNC},
    broker::Broker,
    bucket::BucketList,
    codec::{BincodeCodec, Codec},
    config::Config,
    detector::{Detector, UserBroadcast},
    error::Error,
    event::{Event, Tag},
    message::{CodedMessage, Message, WILDCARD},
    node::{Node, State},
    rtt::Rtt,
    selection::SelectionList,
    seq::{AtomicSeq, Seq},
    shuffle::ShuffleList,
    sorter::Sorter,
    transport::Transport,
};
