/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use std::sync::{
    atomic::{AtomicU32, Ordering::SeqCst},
    Arc, Mutex,
};

use tokio::sync::oneshot;

use crate::{
    broadcast::{Broadcast, BroadcastQueue, CLASS_SYNC},
    codec::Codec,
    event::Event,
    message::{CodedMessage, Message, WILDCARD},
    transport::Transport,
    Error,
};

// Smoothing applied to the events-per-message estimate, plus a small
// bias towards attaching more while messages still fit under the
// transport hint.
const ESTIMATE_GAIN: f64 = 0.25;
const ESTIMATE_BIAS: f64 = 0.1;

/// Broker combines a [`Codec`] and a [`Transport`] and piggybacks
/// pending broadcasts onto ordinary outgoing traffic.
///
/// How many broadcasts fit is learned, not configured: the broker
/// keeps a running estimate of events-per-message derived from actual
/// encoded sizes, so the budget adapts to whatever codec is in use
/// without codec-specific knowledge.
pub struct Broker {
    transport: Arc<dyn Transport>,
    codec: Box<dyn Codec>,

    // push() may be called from any task, the event loop drains
    // concurrently
    queue: Mutex<BroadcastQueue>,
    limit: AtomicU32,
    estimate: Mutex<f64>,
}

impl Broker {
    /// A broker over the given transport and codec. The transmission
    /// limit starts at 1 and is retuned by the detector as the group
    /// grows.
    pub fn new(transport: Arc<dyn Transport>, codec: Box<dyn Codec>) -> Self {
        Self {
            transport,
            codec,
            queue: Mutex::new(BroadcastQueue::new()),
            limit: AtomicU32::new(1),
            estimate: Mutex::new(0.0),
        }
    }

    /// The underlying transport's message size hint.
    pub fn max_message_len(&self) -> i32 {
        self.transport.max_message_len()
    }

    /// Receives and decodes one message from the transport.
    pub async fn recv(&self) -> Result<Message, Error> {
        let mut coded = self.transport.recv().await?;
        self.codec.decode(&mut coded)?;
        coded
            .message
            .ok_or_else(|| Error::decode(DecodedNothing))
    }

    /// Encodes and sends a message without piggybacking broadcasts.
    pub async fn direct_to(&self, addrs: &[String], message: Message) -> Result<(), Error> {
        let mut coded = CodedMessage::from_message(message);
        self.codec.encode(&mut coded)?;
        self.transport.send_to(addrs, &coded).await
    }

    /// Encodes and sends a message, attaching as many pending
    /// broadcasts as the current budget allows.
    pub async fn send_to(&self, addrs: &[String], message: Message) -> Result<(), Error> {
        let coded = self.encode_with_broadcasts(message)?;
        self.transport.send_to(addrs, &coded).await
    }

    /// Queues an event for dissemination in the given priority class.
    pub fn broadcast(&self, event: Event, class: u8) {
        self.queue
            .lock()
            .expect("broadcast queue poisoned")
            .push(Broadcast::new(event, class));
    }

    /// Queues an event and returns a receiver that fires once the
    /// broadcast leaves the queue, either from invalidation or after
    /// reaching the transmission limit.
    pub fn broadcast_sync(&self, event: Event) -> oneshot::Receiver<()> {
        let (bcast, done) = Broadcast::with_done(event, CLASS_SYNC);
        self.queue
            .lock()
            .expect("broadcast queue poisoned")
            .push(bcast);
        done
    }

    /// Number of broadcasts waiting for dissemination.
    pub fn pending_broadcasts(&self) -> usize {
        self.queue.lock().expect("broadcast queue poisoned").len()
    }

    /// Retunes the per-broadcast transmission limit. Lock-free; takes
    /// effect on the next send.
    pub fn set_broadcast_limit(&self, limit: u32) {
        self.limit.store(limit, SeqCst);
    }

    /// The current per-broadcast transmission limit.
    pub fn broadcast_limit(&self) -> u32 {
        self.limit.load(SeqCst)
    }

    /// Closes the underlying transport.
    pub fn close(&self) -> Result<(), Error> {
        self.transport.close()
    }

    fn encode_with_broadcasts(&self, mut message: Message) -> Result<CodedMessage, Error> {
        let max_len = self.transport.max_message_len();
        let recipient = message.to;

        {
            let mut queue = self.queue.lock().expect("broadcast queue poisoned");
            if !queue.is_empty() {
                let estimate = *self.estimate.lock().expect("estimate poisoned");

                let mut budget = usize::MAX;
                if max_len > 0 && estimate > 0.0 {
                    // Whatever the estimate leaves after the events
                    // already in the message, but always at least one
                    budget = (estimate as usize)
                        .saturating_sub(message.len())
                        .max(1);
                }

                for bcast in queue.sorted_mut().iter_mut() {
                    if budget == 0 {
                        break;
                    }
                    // Never send a broadcast back to its own source
                    if recipient != WILDCARD && bcast.event().source() == recipient {
                        continue;
                    }
                    // Nor twice to the same recipient; the missed
                    // opportunity still ages the broadcast
                    if recipient != WILDCARD && bcast.was_delivered_to(recipient) {
                        bcast.mark_skipped();
                        continue;
                    }

                    message.add_event(bcast.event().clone());
                    bcast.mark_attempt(recipient);
                    budget -= 1;
                }
            }
        }

        let event_count = message.len();
        let mut coded = CodedMessage::from_message(message);
        self.codec.encode(&mut coded)?;

        // Feed the observed bytes-per-event back into the estimate
        if coded.size > 0 {
            if max_len > 0 && event_count > 0 {
                let per_event = coded.size as f64 / event_count as f64;
                let mut estimate = self.estimate.lock().expect("estimate poisoned");
                *estimate =
                    (1.0 - ESTIMATE_GAIN) * *estimate + ESTIMATE_GAIN * (f64::from(max_len) / per_event);
                if coded.size <= max_len as usize {
                    *estimate += ESTIMATE_BIAS;
                }
            }
        } else {
            // Codec doesn't report sizes: no point limiting
            *self.estimate.lock().expect("estimate poisoned") = -1.0;
        }

        let limit = self.limit.load(SeqCst);
        self.queue
            .lock()
            .expect("broadcast queue poisoned")
            .prune(|bcast| bcast.attempts() >= limit);

        Ok(coded)
    }
}

#[derive(Debug)]
struct DecodedNothing;

impl core::fmt::Display for DecodedNothing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("codec produced no message")
    }
}

impl std::error::Error for DecodedNothing {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broadcast::CLASS_EVENT,
        codec::BincodeCodec,
        seq::Seq,
        sim::{SimRouter, SimTransport},
        Node,
    };

    fn suspect(id: u64, incarnation: u32) -> Event {
        Event::Suspect {
            from: 1,
            id,
            incarnation: Seq::new(incarnation),
        }
    }

    fn harness(max_len: i32) -> (Broker, Arc<SimTransport>) {
        let router = SimRouter::new(0xCA);
        router.set_max_message_len(max_len);
        router.set_delay(core::time::Duration::ZERO, core::time::Duration::ZERO);

        let sender = router.transport("sender");
        let receiver = router.transport("receiver");
        let broker = Broker::new(sender, Box::new(BincodeCodec::standard()));
        (broker, receiver)
    }

    fn ping_to(to: u64) -> Message {
        let mut msg = Message::new(1, to, Seq::default());
        msg.add_event(Event::Ping { from: 1, time: 9 });
        msg
    }

    #[tokio::test]
    async fn direct_send_carries_no_broadcasts() {
        let (broker, receiver) = harness(512);
        broker.set_broadcast_limit(10);
        broker.broadcast(suspect(3, 1), CLASS_EVENT);

        broker
            .direct_to(&[String::from("receiver")], ping_to(2))
            .await
            .expect("send");

        let got = receiver.recv().await.expect("delivery");
        let mut coded = got;
        BincodeCodec::standard().decode(&mut coded).expect("decode");
        assert_eq!(1, coded.message.unwrap().len());
        assert_eq!(1, broker.pending_broadcasts(), "queue untouched");
    }

    #[tokio::test]
    async fn send_piggybacks_and_prunes() {
        let (broker, receiver) = harness(512);
        broker.set_broadcast_limit(1);
        broker.broadcast(suspect(3, 1), CLASS_EVENT);

        broker
            .send_to(&[String::from("receiver")], ping_to(2))
            .await
            .expect("send");

        let mut coded = receiver.recv().await.expect("delivery");
        BincodeCodec::standard().decode(&mut coded).expect("decode");
        assert_eq!(
            2,
            coded.message.unwrap().len(),
            "the suspect event rides along with the ping"
        );
        assert_eq!(
            0,
            broker.pending_broadcasts(),
            "limit 1 prunes after the first transmission"
        );
    }

    #[tokio::test]
    async fn broadcasts_skip_their_source() {
        let (broker, receiver) = harness(512);
        broker.set_broadcast_limit(10);
        // Event originated by node 2; node 2 must not receive it back
        broker.broadcast(
            Event::Suspect {
                from: 2,
                id: 3,
                incarnation: Seq::new(1),
            },
            CLASS_EVENT,
        );

        broker
            .send_to(&[String::from("receiver")], ping_to(2))
            .await
            .expect("send");

        let mut coded = receiver.recv().await.expect("delivery");
        BincodeCodec::standard().decode(&mut coded).expect("decode");
        assert_eq!(1, coded.message.unwrap().len());
    }

    #[tokio::test]
    async fn broadcasts_are_not_repeated_to_a_recipient() {
        let (broker, receiver) = harness(512);
        broker.set_broadcast_limit(10);
        broker.broadcast(suspect(3, 1), CLASS_EVENT);

        for expected in [2usize, 1] {
            broker
                .send_to(&[String::from("receiver")], ping_to(2))
                .await
                .expect("send");
            let mut coded = receiver.recv().await.expect("delivery");
            BincodeCodec::standard().decode(&mut coded).expect("decode");
            assert_eq!(expected, coded.message.unwrap().len());
        }
    }

    #[tokio::test]
    async fn sync_broadcast_signals_when_pruned() {
        let (broker, receiver) = harness(512);
        broker.set_broadcast_limit(1);

        let done = broker.broadcast_sync(suspect(3, 1));

        broker
            .send_to(&[String::from("receiver")], ping_to(2))
            .await
            .expect("send");
        let _ = receiver.recv().await.expect("delivery");

        done.await.expect("done fires after prune");
        assert_eq!(0, broker.pending_broadcasts());
    }

    #[tokio::test]
    async fn saturation_respects_the_size_hint() {
        let (broker, receiver) = harness(512);
        broker.set_broadcast_limit(1);

        // Warm the events-per-message estimate with one normal send
        broker.broadcast(alive_node(100), CLASS_EVENT);
        broker
            .send_to(&[String::from("receiver")], ping_to(2))
            .await
            .expect("send");
        let _ = receiver.recv().await.expect("delivery");

        // Now saturate: 100 pending alive broadcasts, one outgoing ping
        for id in 200..300u64 {
            broker.broadcast(alive_node(id), CLASS_EVENT);
        }
        broker
            .send_to(&[String::from("receiver")], ping_to(2))
            .await
            .expect("send");

        let mut coded = receiver.recv().await.expect("delivery");
        let size = coded.size;
        BincodeCodec::standard().decode(&mut coded).expect("decode");
        let events = coded.message.unwrap().len();

        let remaining = broker.pending_broadcasts();
        assert!(
            (90..=99).contains(&remaining),
            "attached a size-bounded batch, got {remaining} left, {events} events in {size} bytes"
        );
        assert!(
            size <= 512 || events == 2,
            "either under the hint or clamped to the single-broadcast floor"
        );
    }

    fn alive_node(id: u64) -> Event {
        Event::Alive {
            from: id,
            node: Node::with_addr(id, format!("n{id:020}")),
        }
    }
}
