/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use bytes::Bytes;

use crate::{event::Event, seq::Seq};

/// Destination id used while joining, before the sender knows who is
/// listening on the other end. Receivers accept it as if it were their
/// own id.
pub const WILDCARD: u64 = 0;

/// The envelope for everything that goes over the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    /// Sender's id.
    pub from: u64,
    /// Recipient's id, or [`WILDCARD`].
    pub to: u64,
    /// The sender's view of the *recipient's* incarnation. Recipients
    /// witness it into their own counter and use the lag to decide
    /// when the sender needs a refresher.
    pub incarnation: Seq,

    events: Vec<Event>,
}

impl Message {
    /// An empty message from `from` to `to`.
    pub fn new(from: u64, to: u64, incarnation: Seq) -> Self {
        Self {
            from,
            to,
            incarnation,
            events: Vec::new(),
        }
    }

    /// Appends an event.
    pub fn add_event(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Inserts an event at the front. Anti-entropy goes first so the
    /// recipient repairs its view of the sender before interpreting
    /// the rest.
    pub fn prepend_event(&mut self, event: Event) {
        self.events.insert(0, event);
    }

    /// The contained events, in order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Consumes the message, yielding its events.
    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    /// Number of contained events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the message carries no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// A [`Message`] paired with its byte encoding.
///
/// Brokers hand these to the codec and the transport; either side may
/// be present depending on the direction of travel.
#[derive(Debug, Clone, Default)]
pub struct CodedMessage {
    /// The decoded message, when known.
    pub message: Option<Message>,
    /// The encoded message, when known.
    pub bytes: Bytes,
    /// Encoded size in bytes; zero when the codec doesn't report
    /// sizes.
    pub size: usize,
}

impl CodedMessage {
    /// Wraps a message that hasn't been encoded yet.
    pub fn from_message(message: Message) -> Self {
        Self {
            message: Some(message),
            bytes: Bytes::new(),
            size: 0,
        }
    }

    /// Wraps raw bytes received from a transport.
    pub fn from_bytes(bytes: Bytes) -> Self {
        let size = bytes.len();
        Self {
            message: None,
            bytes,
            size,
        }
    }
}
