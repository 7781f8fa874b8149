/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
        Arc, Mutex, RwLock,
    },
};

use bytes::Bytes;
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

use crate::{
    broadcast::{CLASS_EVENT, CLASS_REFRESH},
    broker::Broker,
    bucket::BucketList,
    codec::Codec,
    config::Config,
    event::Event,
    message::{Message, WILDCARD},
    node::{InternalNode, Node, State},
    selection::SelectionList,
    seq::{AtomicSeq, Seq},
    shuffle::ShuffleList,
    transport::Transport,
    Error,
};

// Inbound messages buffered between the receive task and the event
// loop. Anything past this is dropped at the transport, like UDP.
const INBOX_CAPACITY: usize = 8;
const CONTROL_CAPACITY: usize = 8;

/// An application broadcast delivered by a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserBroadcast {
    /// The originating peer.
    pub from: u64,
    /// The originator's sequence number for this payload.
    pub seq: Seq,
    /// The payload.
    pub data: Bytes,
}

enum Control {
    Stop(oneshot::Sender<()>),
    Leave(oneshot::Sender<()>),
    Join(Vec<String>),
}

/// The SWIM failure detector: one instance per process.
///
/// A detector owns all mutable membership state on a single event-loop
/// task (no locks beyond the broadcast queue) and talks to the world
/// through its [`Transport`] and [`Codec`]. Each protocol period it
/// probes peers picked by the configured [`SelectionList`], suspects
/// the unresponsive, declares the unrecovered dead, and piggybacks
/// the resulting gossip on its ordinary traffic.
///
/// ```no_run
/// # async fn example(transport: impl cardume::Transport + 'static) {
/// let detector = cardume::Detector::new(
///     cardume::Node::with_addr(1, "10.0.0.1:7946"),
///     cardume::Config::simple(),
///     transport,
///     cardume::BincodeCodec::standard(),
/// );
/// detector.join(&[String::from("10.0.0.2:7946")]).await;
/// # }
/// ```
pub struct Detector {
    shared: Arc<Shared>,
    control_tx: mpsc::Sender<Control>,
    parked: Arc<Mutex<Option<EventLoop>>>,
    updates_rx: Mutex<Option<mpsc::UnboundedReceiver<Node>>>,
    user_rx: Mutex<Option<mpsc::UnboundedReceiver<UserBroadcast>>>,
}

struct Shared {
    config: Config,
    broker: Broker,
    local: Node,
    incarnation: AtomicSeq,
    sequence: AtomicSeq,
    active: AtomicUsize,
    members: RwLock<Arc<[Node]>>,
    running: AtomicBool,
    epoch: Instant,
}

impl Shared {
    /// Our current public identity: always Alive, at the live
    /// incarnation.
    fn snapshot(&self) -> Node {
        let mut node = self.local.clone();
        node.state = State::Alive;
        node.incarnation = self.incarnation.get();
        node
    }

    /// Wire timestamps: nanoseconds on our private monotonic clock.
    fn nanos(&self, at: Instant) -> u64 {
        at.duration_since(self.epoch).as_nanos() as u64
    }
}

impl Detector {
    /// A stopped detector identified as `local`, talking through
    /// `transport` with `codec`. The selection strategy comes from
    /// [`Config::bucket_count`] and [`Config::sorter`].
    pub fn new(
        local: Node,
        config: Config,
        transport: impl Transport + 'static,
        codec: impl Codec + 'static,
    ) -> Self {
        let nodes: Box<dyn SelectionList> = if config.bucket_count >= 2 {
            Box::new(BucketList::new(
                config.bucket_count,
                config.sorter,
                local.id,
                local.id,
            ))
        } else {
            Box::new(ShuffleList::new(local.id))
        };

        let shared = Arc::new(Shared {
            broker: Broker::new(Arc::new(transport), Box::new(codec)),
            local: local.clone(),
            incarnation: AtomicSeq::new(local.incarnation),
            sequence: AtomicSeq::default(),
            active: AtomicUsize::new(0),
            members: RwLock::new(Vec::new().into()),
            running: AtomicBool::new(false),
            epoch: Instant::now(),
            config,
        });

        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (user_tx, user_rx) = mpsc::unbounded_channel();

        let event_loop = EventLoop {
            shared: Arc::clone(&shared),
            control_rx,
            inbox_rx: None,
            updates_tx,
            user_tx,
            nodes,
            node_map: HashMap::new(),
            suspects: HashSet::new(),
            probed: Vec::new(),
            period_start: shared.epoch,
            indirect_at: None,
            seen_user: HashMap::new(),
        };

        Self {
            shared,
            control_tx,
            parked: Arc::new(Mutex::new(Some(event_loop))),
            updates_rx: Mutex::new(Some(updates_rx)),
            user_rx: Mutex::new(Some(user_rx)),
        }
    }

    /// Our own identity.
    pub fn local(&self) -> &Node {
        &self.shared.local
    }

    /// Our current incarnation.
    pub fn incarnation(&self) -> Seq {
        self.shared.incarnation.get()
    }

    /// Starts the event loop and the transport receiver.
    ///
    /// # Panics
    ///
    /// When already running. Must be called within a tokio runtime.
    pub fn start(&self) {
        if self.shared.running.swap(true, SeqCst) {
            panic!("detector already started");
        }

        let mut event_loop = self
            .parked
            .lock()
            .expect("parked loop poisoned")
            .take()
            .expect("event loop state must be parked while stopped");

        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        event_loop.inbox_rx = Some(inbox_rx);

        // The receive task: transport -> inbox. Dies when the
        // transport closes or the loop stops listening.
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                match shared.broker.recv().await {
                    Ok(msg) => {
                        if inbox_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(Error::TransportClosed) => break,
                    Err(err) => {
                        warn!(error = %err, "dropping undecodable message");
                    }
                }
            }
            trace!("receive task finished");
        });

        let parked = Arc::clone(&self.parked);
        tokio::spawn(async move {
            let (mut event_loop, ack) = event_loop.run().await;
            event_loop.inbox_rx = None;
            *parked.lock().expect("parked loop poisoned") = Some(event_loop);
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
        });
    }

    /// Stops the event loop, preserving membership state. The
    /// transport stays open.
    ///
    /// # Panics
    ///
    /// When not running.
    pub async fn stop(&self) {
        if !self.shared.running.load(SeqCst) {
            panic!("detector not started");
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.control_tx
            .send(Control::Stop(ack_tx))
            .await
            .expect("event loop is gone");
        ack_rx.await.expect("event loop dropped the stop ack");
        self.shared.running.store(false, SeqCst);
    }

    /// Stops the event loop if running, then closes the transport.
    ///
    /// # Panics
    ///
    /// Closing twice panics, transport permitting: it's API misuse.
    pub async fn close(&self) -> Result<(), Error> {
        if self.shared.running.load(SeqCst) {
            self.stop().await;
        }
        self.shared.broker.close()
    }

    /// Joins a group: bumps our incarnation, broadcasts our identity
    /// and offers it directly to each given address. Starts the
    /// detector when needed; does not wait for any acknowledgement --
    /// the targets learn about us on receipt and gossip takes it from
    /// there.
    pub async fn join(&self, addrs: &[String]) {
        if !self.shared.running.load(SeqCst) {
            self.start();
        }
        self.control_tx
            .send(Control::Join(addrs.to_vec()))
            .await
            .expect("event loop is gone");
    }

    /// Leaves the group gracefully: announces our own death so peers
    /// skip the whole suspicion dance, then stops the event loop.
    ///
    /// # Panics
    ///
    /// When not running.
    pub async fn leave(&self) {
        if !self.shared.running.load(SeqCst) {
            panic!("detector not started");
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.control_tx
            .send(Control::Leave(ack_tx))
            .await
            .expect("event loop is gone");
        ack_rx.await.expect("event loop dropped the leave ack");
        self.shared.running.store(false, SeqCst);
    }

    /// Queues an application payload for dissemination to the whole
    /// group.
    pub fn broadcast(&self, data: Bytes) {
        let event = Event::User {
            from: self.shared.local.id,
            seq: self.shared.sequence.increment(),
            data,
        };
        self.shared.broker.broadcast(event, CLASS_EVENT);
    }

    /// Like [`Detector::broadcast`], but the returned receiver fires
    /// once the payload left the dissemination queue, either after
    /// reaching its retransmit limit or by being superseded by a newer
    /// payload.
    pub fn broadcast_sync(&self, data: Bytes) -> oneshot::Receiver<()> {
        let event = Event::User {
            from: self.shared.local.id,
            seq: self.shared.sequence.increment(),
            data,
        };
        self.shared.broker.broadcast_sync(event)
    }

    /// A snapshot of every known peer, dead ones included, sorted by
    /// id. Served from a cache invalidated on membership change.
    pub fn members(&self) -> Vec<Node> {
        self.shared.members.read().expect("members poisoned").to_vec()
    }

    /// Number of peers currently considered active (alive or
    /// suspect), not counting ourselves.
    pub fn active_count(&self) -> usize {
        self.shared.active.load(SeqCst)
    }

    /// The stream of membership changes: one [`Node`] snapshot per
    /// transition.
    ///
    /// # Panics
    ///
    /// When taken twice; there is a single consumer.
    pub fn updates(&self) -> mpsc::UnboundedReceiver<Node> {
        self.updates_rx
            .lock()
            .expect("updates receiver poisoned")
            .take()
            .expect("updates() supports a single consumer")
    }

    /// The stream of application broadcasts received from peers.
    ///
    /// # Panics
    ///
    /// When taken twice; there is a single consumer.
    pub fn user_events(&self) -> mpsc::UnboundedReceiver<UserBroadcast> {
        self.user_rx
            .lock()
            .expect("user receiver poisoned")
            .take()
            .expect("user_events() supports a single consumer")
    }
}

struct EventLoop {
    shared: Arc<Shared>,
    control_rx: mpsc::Receiver<Control>,
    inbox_rx: Option<mpsc::Receiver<Message>>,
    updates_tx: mpsc::UnboundedSender<Node>,
    user_tx: mpsc::UnboundedSender<UserBroadcast>,

    nodes: Box<dyn SelectionList>,
    node_map: HashMap<u64, InternalNode>,
    suspects: HashSet<u64>,
    /// Peers probed this protocol period.
    probed: Vec<u64>,
    period_start: Instant,
    indirect_at: Option<Instant>,
    /// Highest user-broadcast sequence witnessed per source.
    seen_user: HashMap<u64, Seq>,
}

impl EventLoop {
    async fn run(mut self) -> (Self, Option<oneshot::Sender<()>>) {
        let mut ticker = time::interval(self.shared.config.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut inbox = self.inbox_rx.take().expect("start() installs the inbox");

        let ack = loop {
            let indirect_at = self.indirect_at.unwrap_or_else(Instant::now);

            tokio::select! {
                biased;

                maybe_control = self.control_rx.recv() => match maybe_control {
                    Some(Control::Stop(ack)) => break Some(ack),
                    Some(Control::Leave(ack)) => {
                        self.handle_leave().await;
                        break Some(ack);
                    }
                    Some(Control::Join(addrs)) => self.handle_join(addrs).await,
                    // Handle dropped; nobody can stop us anymore
                    None => break None,
                },

                Some(msg) = inbox.recv() => self.handle_message(msg).await,

                _ = time::sleep_until(indirect_at), if self.indirect_at.is_some() => {
                    self.indirect_at = None;
                    self.indirect_probe().await;
                }

                _ = ticker.tick() => self.tick().await,
            }
        };

        (self, ack)
    }

    fn local_id(&self) -> u64 {
        self.shared.local.id
    }

    // ---- protocol period ----

    async fn tick(&mut self) {
        let now = Instant::now();

        // Resolve the previous period first: whoever we probed and
        // didn't hear back from becomes suspect
        let probed = core::mem::take(&mut self.probed);
        for id in probed {
            let still_alive = self
                .node_map
                .get(&id)
                .map(|rec| rec.node.state == State::Alive && !rec.acked_since(self.period_start))
                .unwrap_or(false);
            if still_alive {
                self.make_suspect(id, now);
            }
        }

        // And whoever stayed suspect for a whole suspicion duration
        // is declared dead
        let duration = self
            .shared
            .config
            .suspicion_duration(self.shared.active.load(SeqCst));
        for id in self.suspects.clone() {
            match self.node_map.get(&id) {
                Some(rec) if rec.node.state == State::Suspect => {
                    let expired = rec
                        .suspect_time
                        .map(|at| now.duration_since(at) >= duration)
                        .unwrap_or(false);
                    if expired {
                        self.make_dead(id);
                    }
                }
                _ => {
                    self.suspects.remove(&id);
                }
            }
        }

        // Fresh probes for this period
        self.period_start = now;
        let time = self.shared.nanos(now);

        let want = (self.shared.config.direct_probes as usize).min(self.nodes.len());
        let mut targets = Vec::with_capacity(want);
        for _ in 0..want {
            match self.nodes.next() {
                Some(id) if !targets.contains(&id) => targets.push(id),
                _ => {}
            }
        }

        for id in targets {
            let Some(addrs) = self.node_map.get(&id).map(|rec| rec.node.addrs.clone()) else {
                continue;
            };
            trace!(peer = id, "probing");
            self.probed.push(id);
            self.send_events(
                id,
                &addrs,
                vec![Event::Ping {
                    from: self.local_id(),
                    time,
                }],
            )
            .await;
        }

        if !self.probed.is_empty() {
            self.indirect_at = Some(now + self.bounded_timeout());
        }
    }

    /// How long to wait for direct acks before probing indirectly:
    /// the slowest probed peer's RTT estimate, floored by the
    /// configured probe timeout and capped at a third of the protocol
    /// period so the indirect cycle still fits.
    fn bounded_timeout(&self) -> Duration {
        let config = &self.shared.config;

        let mut rtt = Duration::ZERO;
        for id in &self.probed {
            if let Some(rec) = self.node_map.get(id) {
                rtt = rtt.max(rec.rtt.timeout());
            }
        }

        let cap = (config.probe_interval / 3).max(config.probe_timeout);
        rtt.max(config.probe_timeout).clamp(config.probe_timeout, cap)
    }

    async fn indirect_probe(&mut self) {
        let time = self.shared.nanos(self.period_start);

        let targets: Vec<u64> = self
            .probed
            .iter()
            .copied()
            .filter(|id| {
                self.node_map
                    .get(id)
                    .map(|rec| {
                        rec.node.state.is_active() && !rec.acked_since(self.period_start)
                    })
                    .unwrap_or(false)
            })
            .collect();
        if targets.is_empty() {
            return;
        }

        let mut requests = Vec::with_capacity(targets.len());
        for &target in &targets {
            let Some(rec) = self.node_map.get(&target) else {
                continue;
            };
            trace!(peer = target, "no direct ack yet; trying indirect probes");
            requests.push(Event::IndirectPingRequest {
                from: self.local_id(),
                from_addrs: self.shared.local.addrs.clone(),
                target,
                target_addrs: rec.node.addrs.clone(),
                time,
            });
        }

        // Fan the whole batch out to a few alive, unsuspected helpers
        let want = self.shared.config.indirect_probes as usize;
        let mut helpers = Vec::with_capacity(want);
        let mut scanned = 0;
        let len = self.nodes.len();
        while helpers.len() < want && scanned < len {
            scanned += 1;
            let Some(id) = self.nodes.next() else { break };
            if targets.contains(&id) || helpers.contains(&id) {
                continue;
            }
            if self
                .node_map
                .get(&id)
                .map(|rec| rec.node.state == State::Alive)
                .unwrap_or(false)
            {
                helpers.push(id);
            }
        }

        for helper in helpers {
            let Some(addrs) = self.node_map.get(&helper).map(|rec| rec.node.addrs.clone())
            else {
                continue;
            };
            self.send_events(helper, &addrs, requests.clone()).await;
        }
    }

    fn make_suspect(&mut self, id: u64, now: Instant) {
        let Some(rec) = self.node_map.get_mut(&id) else {
            return;
        };
        debug!(peer = id, "no ack within the protocol period; suspecting");

        rec.node.state = State::Suspect;
        if rec.suspect_time.is_none() {
            rec.suspect_time = Some(now);
        }
        let event = Event::Suspect {
            from: self.shared.local.id,
            id,
            incarnation: rec.node.incarnation,
        };
        let node = rec.node.clone();

        self.suspects.insert(id);
        self.shared.broker.broadcast(event, CLASS_EVENT);
        self.publish();
        self.emit(node);
    }

    fn make_dead(&mut self, id: u64) {
        let Some(rec) = self.node_map.get_mut(&id) else {
            return;
        };
        info!(peer = id, "suspicion expired; declaring dead");

        rec.node.state = State::Dead;
        rec.suspect_time = None;
        let event = Event::Death {
            from: self.shared.local.id,
            id,
            incarnation: rec.node.incarnation,
        };
        let node = rec.node.clone();

        self.nodes.remove(&[id]);
        self.suspects.remove(&id);
        self.shared.broker.broadcast(event, CLASS_EVENT);
        self.publish();
        self.emit(node);
    }

    // ---- join / leave ----

    async fn handle_join(&mut self, addrs: Vec<String>) {
        let incarnation = self.shared.incarnation.increment();
        let node = self.shared.snapshot();
        info!(id = node.id, incarnation = %incarnation, "joining the group");

        // Invalidates any stale broadcast about us still in the queue
        self.shared.broker.broadcast(
            Event::Alive {
                from: node.id,
                node: node.clone(),
            },
            CLASS_EVENT,
        );

        for addr in addrs {
            if self.shared.local.addrs.contains(&addr) {
                continue;
            }
            let mut msg = Message::new(node.id, WILDCARD, Seq::default());
            msg.add_event(Event::Alive {
                from: node.id,
                node: node.clone(),
            });
            if let Err(err) = self.shared.broker.direct_to(&[addr.clone()], msg).await {
                debug!(error = %err, addr = %addr, "join offer failed");
            }
        }
    }

    async fn handle_leave(&mut self) {
        let node = self.shared.snapshot();
        let event = Event::Death {
            from: node.id,
            id: node.id,
            incarnation: node.incarnation,
        };
        info!(id = node.id, "leaving the group");

        self.shared.broker.broadcast(event.clone(), CLASS_EVENT);

        // Tell a few peers directly so the news survives our exit
        let want = (self.shared.config.indirect_probes as usize).min(self.nodes.len());
        let mut told = HashSet::with_capacity(want);
        for _ in 0..want {
            let Some(peer) = self.nodes.next() else { break };
            if !told.insert(peer) {
                continue;
            }
            let Some(rec) = self.node_map.get(&peer) else {
                continue;
            };
            let mut msg = Message::new(node.id, peer, rec.node.incarnation);
            msg.add_event(event.clone());
            if let Err(err) = self.shared.broker.direct_to(&rec.node.addrs.clone(), msg).await {
                debug!(error = %err, peer, "death notice failed");
            }
        }
    }

    // ---- inbound ----

    async fn handle_message(&mut self, msg: Message) {
        let from = msg.from;
        if from == self.local_id() {
            trace!("dropping a message from ourselves");
            return;
        }
        if msg.to != self.local_id() && msg.to != WILDCARD {
            trace!(to = msg.to, "dropping a misdelivered message");
            return;
        }

        // The envelope carries the sender's view of our incarnation:
        // never fall behind it, and refresh the sender when it lags
        self.shared.incarnation.witness(msg.incarnation);
        if let Some(rec) = self.node_map.get_mut(&from) {
            rec.remote_incarnation = msg.incarnation;
        }
        if msg.to == self.local_id()
            && msg.incarnation.cmp_window(self.shared.incarnation.get()).is_lt()
        {
            self.shared.broker.broadcast(
                Event::Alive {
                    from: self.local_id(),
                    node: self.shared.snapshot(),
                },
                CLASS_REFRESH,
            );
        }

        for event in msg.into_events() {
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Ping { from, time } => self.on_ping(from, time).await,
            Event::Ack { from, time } => {
                if from != self.local_id() {
                    self.process_ack(from, time);
                }
            }
            Event::IndirectPingRequest { .. } => self.on_indirect_ping_request(event).await,
            Event::IndirectPing { .. } => self.on_indirect_ping(event).await,
            Event::IndirectAck { .. } => self.on_indirect_ack(event).await,
            Event::AntiEntropy { node, .. } => {
                if node.id != self.local_id() {
                    self.apply_snapshot(node);
                }
            }
            Event::Alive { .. } => self.on_alive(event),
            Event::Suspect { .. } => self.on_suspect(event),
            Event::Death { .. } => self.on_death(event),
            Event::User { .. } => self.on_user(event),
        }
    }

    async fn on_ping(&mut self, from: u64, time: u64) {
        if from == self.local_id() {
            return;
        }
        let Some(addrs) = self.node_map.get(&from).map(|rec| rec.node.addrs.clone()) else {
            trace!(peer = from, "ping from an unknown peer; nowhere to ack");
            return;
        };
        self.send_events(
            from,
            &addrs,
            vec![Event::Ack {
                from: self.local_id(),
                time,
            }],
        )
        .await;
    }

    /// Applies an ack about `acked`, directly received or relayed.
    /// Returns whether it was accepted.
    fn process_ack(&mut self, acked: u64, time: u64) -> bool {
        let now = Instant::now();
        let period_nanos = self.shared.nanos(self.period_start);
        let now_nanos = self.shared.nanos(now);

        let Some(rec) = self.node_map.get_mut(&acked) else {
            return false;
        };
        if rec.node.state == State::Dead {
            return false;
        }
        // Only acks for this period's probes count; anything else is
        // an echo of older traffic
        if time < period_nanos || time > now_nanos {
            trace!(peer = acked, "ack outside the current period");
            return false;
        }
        if rec.acked_since(self.period_start) {
            return true;
        }

        rec.rtt.sample(Duration::from_nanos(now_nanos - time));
        rec.last_ack_time = Some(now);

        if rec.node.state == State::Suspect {
            debug!(peer = acked, "ack from a suspect; reviving");
            rec.node.state = State::Alive;
            rec.suspect_time = None;
            let node = rec.node.clone();
            self.suspects.remove(&acked);
            self.shared.broker.broadcast(
                Event::Alive {
                    from: self.local_id(),
                    node: node.clone(),
                },
                CLASS_EVENT,
            );
            self.publish();
            self.emit(node);
        }
        true
    }

    async fn on_indirect_ping_request(&mut self, event: Event) {
        let Event::IndirectPingRequest {
            from,
            from_addrs,
            target,
            target_addrs,
            time,
        } = event
        else {
            unreachable!("dispatched on variant");
        };

        if from == self.local_id() || target == self.local_id() {
            return;
        }

        // A target we know to be dead isn't worth a probe; short-cut
        // the bad news back to the requester
        if let Some(rec) = self.node_map.get(&target) {
            if rec.node.state == State::Dead {
                let death = Event::Death {
                    from: self.local_id(),
                    id: target,
                    incarnation: rec.node.incarnation,
                };
                self.send_events(from, &from_addrs, vec![death]).await;
                return;
            }
        }

        let now_nanos = self.shared.nanos(Instant::now());
        self.send_events(
            target,
            &target_addrs,
            vec![Event::IndirectPing {
                from: self.local_id(),
                from_addrs: self.shared.local.addrs.clone(),
                time: now_nanos,
                via: from,
                via_addrs: from_addrs,
                via_time: time,
            }],
        )
        .await;
    }

    async fn on_indirect_ping(&mut self, event: Event) {
        let Event::IndirectPing {
            from,
            from_addrs,
            time,
            via,
            via_time,
            ..
        } = event
        else {
            unreachable!("dispatched on variant");
        };

        if from == self.local_id() {
            return;
        }
        self.send_events(
            from,
            &from_addrs,
            vec![Event::IndirectAck {
                from: self.local_id(),
                time,
                via,
                via_time,
            }],
        )
        .await;
    }

    async fn on_indirect_ack(&mut self, event: Event) {
        let Event::IndirectAck {
            from,
            time,
            via,
            via_time,
        } = event
        else {
            unreachable!("dispatched on variant");
        };

        if from == self.local_id() || via == self.local_id() {
            return;
        }

        // The target answered: that's an ack for us too
        self.process_ack(from, time);

        // And the requester gets a regular-looking ack for its
        // original probe timestamp
        let Some(addrs) = self.node_map.get(&via).map(|rec| rec.node.addrs.clone()) else {
            trace!(peer = via, "indirect ack for an unknown requester");
            return;
        };
        self.send_events(via, &addrs, vec![Event::Ack { from, time: via_time }])
            .await;
    }

    /// Adopts a full peer snapshot when it carries a strictly newer
    /// incarnation. Anti-entropy only: no broadcast.
    fn apply_snapshot(&mut self, node: Node) {
        match self.node_map.get_mut(&node.id) {
            Some(rec) => {
                if node.incarnation.cmp_window(rec.node.incarnation).is_gt() {
                    let was_active = rec.node.state.is_active();
                    rec.node = node.clone();
                    self.after_transition(node.id, was_active);
                    self.publish();
                    self.emit(node);
                }
            }
            None => self.insert_node(node),
        }
    }

    fn on_alive(&mut self, event: Event) {
        let Event::Alive { ref node, .. } = event else {
            unreachable!("dispatched on variant");
        };

        if node.id == self.local_id() {
            // Someone knows a future us; catch up and overrule
            if node
                .incarnation
                .cmp_window(self.shared.incarnation.get())
                .is_gt()
            {
                self.refute(node.incarnation);
            }
            return;
        }

        match self.node_map.get_mut(&node.id) {
            Some(rec) => {
                if !rec.node.can_change(node.incarnation, State::Alive) {
                    return;
                }
                let was_active = rec.node.state.is_active();
                rec.node = node.clone();
                rec.node.state = State::Alive;
                let snapshot = rec.node.clone();
                self.after_transition(snapshot.id, was_active);
                self.publish();
                self.emit(snapshot);
                self.shared.broker.broadcast(event, CLASS_EVENT);
            }
            None => {
                let mut fresh = node.clone();
                fresh.state = State::Alive;
                self.insert_node(fresh);
                self.shared.broker.broadcast(event, CLASS_EVENT);
            }
        }
    }

    fn on_suspect(&mut self, event: Event) {
        let Event::Suspect {
            id, incarnation, ..
        } = event
        else {
            unreachable!("dispatched on variant");
        };

        if id == self.local_id() {
            // That's about us and it's current: refute it
            if incarnation
                .cmp_window(self.shared.incarnation.get())
                .is_ge()
            {
                self.refute(incarnation);
            }
            return;
        }

        let Some(rec) = self.node_map.get_mut(&id) else {
            return;
        };
        if !rec.node.can_change(incarnation, State::Suspect) {
            return;
        }

        rec.node.state = State::Suspect;
        rec.node.incarnation = incarnation;
        if rec.suspect_time.is_none() {
            rec.suspect_time = Some(Instant::now());
        }
        let node = rec.node.clone();

        self.suspects.insert(id);
        self.publish();
        self.emit(node);
        self.shared.broker.broadcast(event, CLASS_EVENT);
    }

    fn on_death(&mut self, event: Event) {
        let Event::Death {
            id, incarnation, ..
        } = event
        else {
            unreachable!("dispatched on variant");
        };

        if id == self.local_id() {
            // Reports of our death are greatly exaggerated
            if incarnation
                .cmp_window(self.shared.incarnation.get())
                .is_ge()
            {
                self.refute(incarnation);
            }
            return;
        }

        let Some(rec) = self.node_map.get_mut(&id) else {
            return;
        };
        if !rec.node.can_change(incarnation, State::Dead) {
            return;
        }

        rec.node.state = State::Dead;
        rec.node.incarnation = incarnation;
        rec.suspect_time = None;
        let node = rec.node.clone();

        self.nodes.remove(&[id]);
        self.suspects.remove(&id);
        self.publish();
        self.emit(node);
        self.shared.broker.broadcast(event, CLASS_EVENT);
    }

    fn on_user(&mut self, event: Event) {
        let Event::User {
            from,
            seq,
            ref data,
        } = event
        else {
            unreachable!("dispatched on variant");
        };

        if from == self.local_id() {
            return;
        }

        // Dedup on the highest sequence witnessed per source; the
        // entry leaves with the peer record
        let fresh = self
            .seen_user
            .get(&from)
            .map(|&seen| seq.cmp_window(seen).is_gt())
            .unwrap_or(true);
        if !fresh {
            return;
        }
        self.seen_user.insert(from, seq);

        let _ = self.user_tx.send(UserBroadcast {
            from,
            seq,
            data: data.clone(),
        });
        self.shared.broker.broadcast(event, CLASS_EVENT);
    }

    /// Somebody claimed we're suspect or dead at our own incarnation,
    /// or knows a newer us: jump past the claim and tell everyone.
    fn refute(&mut self, claimed: Seq) {
        self.shared.incarnation.witness(claimed);
        let incarnation = self.shared.incarnation.increment();
        info!(incarnation = %incarnation, "refuting a claim about us");

        self.shared.broker.broadcast(
            Event::Alive {
                from: self.local_id(),
                node: self.shared.snapshot(),
            },
            CLASS_EVENT,
        );
    }

    // ---- bookkeeping ----

    fn insert_node(&mut self, node: Node) {
        debug!(peer = node.id, state = ?node.state, "learned about a peer");

        let id = node.id;
        let rec = InternalNode::new(node.clone());
        rec.rtt.hint(self.shared.config.probe_timeout);
        let is_active = node.state.is_active();
        self.node_map.insert(id, rec);

        if is_active {
            self.nodes.add(&[id]);
        }
        if node.state == State::Suspect {
            self.suspects.insert(id);
            if let Some(rec) = self.node_map.get_mut(&id) {
                rec.suspect_time = Some(Instant::now());
            }
        }

        self.publish();
        self.emit(node);
    }

    /// Fixes up the selection list and suspect set after a peer's
    /// state changed by arbitrary means (snapshot adoption, claims).
    fn after_transition(&mut self, id: u64, was_active: bool) {
        let Some(rec) = self.node_map.get_mut(&id) else {
            return;
        };
        let is_active = rec.node.state.is_active();

        match rec.node.state {
            State::Suspect => {
                if rec.suspect_time.is_none() {
                    rec.suspect_time = Some(Instant::now());
                }
                self.suspects.insert(id);
            }
            _ => {
                rec.suspect_time = None;
                self.suspects.remove(&id);
            }
        }

        if was_active && !is_active {
            self.nodes.remove(&[id]);
        } else if !was_active && is_active {
            self.nodes.add(&[id]);
        }
    }

    /// Rebuilds the cached membership snapshot, the active count and
    /// the broadcast retransmit limit.
    fn publish(&self) {
        let mut members: Vec<Node> = self
            .node_map
            .values()
            .map(|rec| rec.node.clone())
            .collect();
        members.sort_by_key(|node| node.id);
        let active = members.iter().filter(|node| node.state.is_active()).count();

        self.shared.active.store(active, SeqCst);
        *self.shared.members.write().expect("members poisoned") = members.into();
        self.shared
            .broker
            .set_broadcast_limit(self.shared.config.retransmit_limit(active));
    }

    fn emit(&self, node: Node) {
        // The consumer may be gone; that's its prerogative
        let _ = self.updates_tx.send(node);
    }

    /// Sends `events` to a peer, prepending an anti-entropy snapshot
    /// of ourselves whenever the peer's last seen value of our
    /// incarnation lags. Send failures are logged and dropped; the
    /// protocol tolerates loss.
    async fn send_events(&self, to: u64, addrs: &[String], events: Vec<Event>) {
        let peer_incarnation = self
            .node_map
            .get(&to)
            .map(|rec| rec.node.incarnation)
            .unwrap_or_default();
        let mut msg = Message::new(self.local_id(), to, peer_incarnation);
        for event in events {
            msg.add_event(event);
        }

        let lagging = self
            .node_map
            .get(&to)
            .map(|rec| {
                rec.remote_incarnation
                    .cmp_window(self.shared.incarnation.get())
                    .is_lt()
            })
            .unwrap_or(true);
        if lagging {
            msg.prepend_event(Event::AntiEntropy {
                from: self.local_id(),
                node: self.shared.snapshot(),
            });
        }

        if let Err(err) = self.shared.broker.send_to(addrs, msg).await {
            debug!(error = %err, peer = to, "send failed; dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::BincodeCodec, message::CodedMessage, sim::SimRouter, sorter::Sorter,
    };

    fn test_config() -> Config {
        Config {
            direct_probes: 1,
            indirect_probes: 2,
            probe_interval: Duration::from_millis(80),
            probe_timeout: Duration::from_millis(20),
            retransmit_mult: 4,
            suspicion_mult: 4,
            bucket_count: 1,
            sorter: Sorter::None,
        }
    }

    fn detector_on(router: &SimRouter, id: u64, config: &Config) -> Detector {
        let addr = format!("n{id}");
        Detector::new(
            Node::with_addr(id, addr.clone()),
            config.clone(),
            router.transport(addr),
            BincodeCodec::standard(),
        )
    }

    /// Polls until `pred` holds or `patience` runs out.
    async fn eventually(patience: Duration, mut pred: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + patience;
        loop {
            if pred() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn knows(detector: &Detector, id: u64, state: State) -> bool {
        detector
            .members()
            .iter()
            .any(|node| node.id == id && node.state == state)
    }

    async fn converge_pair(router: &SimRouter, config: &Config) -> (Detector, Detector) {
        let n1 = detector_on(router, 1, config);
        let n2 = detector_on(router, 2, config);

        n1.join(&[]).await;
        n2.join(&[String::from("n1")]).await;

        assert!(
            eventually(config.probe_interval * 10, || {
                knows(&n1, 2, State::Alive) && knows(&n2, 1, State::Alive)
            })
            .await,
            "two nodes should discover each other"
        );
        (n1, n2)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_node_join() {
        let router = SimRouter::new(0xCA);
        let config = test_config();

        let (n1, n2) = converge_pair(&router, &config).await;

        assert_eq!(1, n1.active_count());
        assert_eq!(1, n2.active_count());

        n1.close().await.expect("close n1");
        n2.close().await.expect("close n2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failure_detection_goes_suspect_then_dead() {
        let router = SimRouter::new(0xCA);
        let config = test_config();

        let (n1, n2) = converge_pair(&router, &config).await;
        let mut updates = n1.updates();

        // Kill n2's transport without a goodbye
        n2.close().await.expect("close n2");
        router.remove("n2");

        // n1 must suspect first, then declare death; never the other
        // way around
        let mut saw_suspect = false;
        let deadline = Instant::now()
            + config.probe_interval * 4
            + config.suspicion_duration(1)
            + Duration::from_millis(500);
        loop {
            let node = time::timeout_at(deadline, updates.recv())
                .await
                .expect("suspicion should resolve within the deadline")
                .expect("updates channel open");
            if node.id != 2 {
                continue;
            }
            match node.state {
                State::Suspect => saw_suspect = true,
                State::Dead => {
                    assert!(saw_suspect, "death must be preceded by suspicion");
                    break;
                }
                State::Alive => {}
            }
        }

        assert_eq!(0, n1.active_count());
        n1.close().await.expect("close n1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn a_suspect_claim_is_refuted_with_a_higher_incarnation() {
        let router = SimRouter::new(0xCA);
        let config = test_config();

        let (n1, n2) = converge_pair(&router, &config).await;
        let initial = n2.incarnation();

        // A third party claims n2 is suspect at its current
        // incarnation
        let rogue = router.transport("rogue");
        let mut msg = Message::new(99, 2, Seq::default());
        msg.add_event(Event::Suspect {
            from: 99,
            id: 2,
            incarnation: initial,
        });
        let mut coded = CodedMessage::from_message(msg);
        BincodeCodec::standard().encode(&mut coded).expect("encode");
        rogue
            .send_to(&[String::from("n2")], &coded)
            .await
            .expect("send");

        // n2 overrules the claim and the fresher incarnation spreads
        assert!(
            eventually(config.probe_interval * 10, || {
                n2.incarnation().cmp_window(initial).is_gt()
                    && n1.members().iter().any(|node| {
                        node.id == 2
                            && node.state == State::Alive
                            && node.incarnation.cmp_window(initial).is_gt()
                    })
            })
            .await,
            "n2 should refute and n1 should learn the new incarnation"
        );

        n1.close().await.expect("close n1");
        n2.close().await.expect("close n2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transient_suspicion_heals_back_to_alive() {
        let router = SimRouter::new(0xCA);
        let mut config = test_config();
        // A roomy suspicion window so the heal lands before the death
        config.suspicion_mult = 8;

        let (n1, n2) = converge_pair(&router, &config).await;

        router.partition("n1", "n2");
        assert!(
            eventually(config.probe_interval * 6, || knows(&n1, 2, State::Suspect)).await,
            "n1 should suspect the unreachable n2"
        );
        router.heal("n1", "n2");

        assert!(
            eventually(config.probe_interval * 15, || knows(&n1, 2, State::Alive)).await,
            "n1's view should flip back once n2 acks again"
        );

        n1.close().await.expect("close n1");
        n2.close().await.expect("close n2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn indirect_probes_route_around_a_partition() {
        let router = SimRouter::new(0xCA);
        let config = test_config();

        let n1 = detector_on(&router, 1, &config);
        let n2 = detector_on(&router, 2, &config);
        let n3 = detector_on(&router, 3, &config);

        let all = vec![String::from("n1"), String::from("n2"), String::from("n3")];
        n1.join(&all).await;
        n2.join(&all).await;
        n3.join(&all).await;

        assert!(
            eventually(config.probe_interval * 10, || {
                n1.active_count() == 2 && n2.active_count() == 2 && n3.active_count() == 2
            })
            .await,
            "three nodes should converge"
        );

        // n1 can no longer reach n3 directly, but n2 reaches both
        router.partition("n1", "n3");
        time::sleep(config.probe_interval * 4).await;

        assert_eq!(
            2,
            n1.active_count(),
            "indirect acks through n2 keep n3 active"
        );
        assert!(!knows(&n1, 3, State::Dead));

        for detector in [n1, n2, n3] {
            detector.close().await.expect("close");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn graceful_leave_skips_suspicion() {
        let router = SimRouter::new(0xCA);
        let config = test_config();

        let (n1, n2) = converge_pair(&router, &config).await;
        let mut updates = n1.updates();

        n2.leave().await;

        let deadline = Instant::now() + config.probe_interval * 10;
        loop {
            let node = time::timeout_at(deadline, updates.recv())
                .await
                .expect("leave should propagate quickly")
                .expect("updates channel open");
            if node.id != 2 {
                continue;
            }
            assert_ne!(
                State::Suspect,
                node.state,
                "a death notice must short-circuit suspicion"
            );
            if node.state == State::Dead {
                break;
            }
        }

        assert_eq!(0, n1.active_count());
        n1.close().await.expect("close n1");
        n2.close().await.expect("close n2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn user_broadcasts_reach_the_group_once() {
        let router = SimRouter::new(0xCA);
        let config = test_config();

        let (n1, n2) = converge_pair(&router, &config).await;
        let mut inbox = n2.user_events();

        n1.broadcast(Bytes::from_static(b"hello fish"));

        let got = time::timeout(config.probe_interval * 10, inbox.recv())
            .await
            .expect("payload should arrive")
            .expect("user channel open");
        assert_eq!(1, got.from);
        assert_eq!(Bytes::from_static(b"hello fish"), got.data);

        // The same sequence never gets delivered twice
        let dup = time::timeout(config.probe_interval * 4, inbox.recv()).await;
        assert!(dup.is_err(), "duplicate delivery of {dup:?}");

        n1.close().await.expect("close n1");
        n2.close().await.expect("close n2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn broadcast_sync_resolves() {
        let router = SimRouter::new(0xCA);
        let config = test_config();

        let (n1, n2) = converge_pair(&router, &config).await;

        let done = n1.broadcast_sync(Bytes::from_static(b"payload"));
        time::timeout(config.probe_interval * 20, done)
            .await
            .expect("broadcast should leave the queue")
            .expect("done signal intact");

        n1.close().await.expect("close n1");
        n2.close().await.expect("close n2");
    }

    #[tokio::test]
    #[should_panic(expected = "already started")]
    async fn double_start_panics() {
        let router = SimRouter::new(0xCA);
        let detector = detector_on(&router, 1, &test_config());

        detector.start();
        detector.start();
    }

    #[tokio::test]
    #[should_panic(expected = "not started")]
    async fn stop_without_start_panics() {
        let router = SimRouter::new(0xCA);
        let detector = detector_on(&router, 1, &test_config());

        detector.stop().await;
    }

    #[tokio::test]
    async fn stop_and_restart_preserves_membership() {
        let router = SimRouter::new(0xCA);
        let config = test_config();

        let (n1, n2) = converge_pair(&router, &config).await;

        n1.stop().await;
        assert_eq!(1, n1.active_count(), "membership survives a stop");

        n1.start();
        assert!(
            eventually(config.probe_interval * 10, || knows(&n1, 2, State::Alive)).await,
            "restarted detector keeps probing"
        );

        n1.close().await.expect("close n1");
        n2.close().await.expect("close n2");
    }
}
