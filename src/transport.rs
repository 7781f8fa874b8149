/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use async_trait::async_trait;

use crate::{message::CodedMessage, Error};

/// How messages reach other members: it's up to you.
///
/// The protocol assumes datagram semantics: messages are delivered
/// whole or not at all, there is no fragmentation and no ordering
/// between senders. Implementations SHOULD drop silently on congestion
/// or unreachable addresses; the dissemination layer tolerates
/// per-message loss by design of the protocol, not by retries.
///
/// Methods take `&self` so that a single transport can serve the
/// detector's event loop and its receive task concurrently; use
/// interior mutability where needed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// A hint of the maximum byte length of a message for this
    /// transport, used to limit how many broadcasts get piggybacked
    /// onto outgoing messages. Negative means unlimited. If the hint
    /// is smaller than the smallest possible message, the transport
    /// will still receive messages larger than the hint.
    fn max_message_len(&self) -> i32;

    /// Sends an encoded message to the first reachable of `addrs`.
    async fn send_to(&self, addrs: &[String], message: &CodedMessage) -> Result<(), Error>;

    /// Receives the next message, blocking until one arrives or the
    /// transport is closed ([`Error::TransportClosed`]).
    async fn recv(&self) -> Result<CodedMessage, Error>;

    /// Closes the transport, waking any blocked receiver. Closing
    /// twice is a programmer error and panics.
    fn close(&self) -> Result<(), Error>;
}

// A shared transport is a transport too
#[async_trait]
impl<T> Transport for std::sync::Arc<T>
where
    T: Transport + ?Sized,
{
    fn max_message_len(&self) -> i32 {
        T::max_message_len(self)
    }

    async fn send_to(&self, addrs: &[String], message: &CodedMessage) -> Result<(), Error> {
        T::send_to(self, addrs, message).await
    }

    async fn recv(&self) -> Result<CodedMessage, Error> {
        T::recv(self).await
    }

    fn close(&self) -> Result<(), Error> {
        T::close(self)
    }
}
