/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::trace;

use crate::{message::CodedMessage, sim::SimRouter, transport::Transport, Error};

// Same bound as the detector inbox: a slow consumer loses messages
// instead of backpressuring the network.
const RECV_CAPACITY: usize = 8;

/// A [`Transport`] wired to a [`SimRouter`] instead of a real
/// network.
pub struct SimTransport {
    router: SimRouter,
    addr: String,

    inbox_tx: mpsc::Sender<CodedMessage>,
    inbox_rx: Mutex<mpsc::Receiver<CodedMessage>>,
    closed_tx: watch::Sender<bool>,
}

impl SimTransport {
    pub(crate) fn new(router: SimRouter, addr: String) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(RECV_CAPACITY);
        let (closed_tx, _) = watch::channel(false);

        Arc::new(Self {
            router,
            addr,
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
            closed_tx,
        })
    }

    /// The address this transport answers to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Hands a message to the receive queue, dropping it when the
    /// queue is full or the transport closed. Called by the router.
    pub(crate) fn deliver(&self, message: CodedMessage) {
        if self.is_closed() {
            return;
        }
        if self.inbox_tx.try_send(message).is_err() {
            trace!(addr = %self.addr, "inbox full; dropping message");
        }
    }
}

#[async_trait]
impl Transport for SimTransport {
    fn max_message_len(&self) -> i32 {
        self.router.max_message_len()
    }

    async fn send_to(&self, addrs: &[String], message: &CodedMessage) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        self.router.route(&self.addr, addrs, message);
        Ok(())
    }

    async fn recv(&self) -> Result<CodedMessage, Error> {
        let mut closed_rx = self.closed_tx.subscribe();
        if *closed_rx.borrow_and_update() {
            return Err(Error::TransportClosed);
        }

        let mut inbox = self.inbox_rx.lock().await;
        tokio::select! {
            maybe = inbox.recv() => maybe.ok_or(Error::TransportClosed),
            _ = closed_rx.changed() => Err(Error::TransportClosed),
        }
    }

    fn close(&self) -> Result<(), Error> {
        if self.is_closed() {
            panic!("transport already closed");
        }
        let _ = self.closed_tx.send(true);
        Ok(())
    }
}
