/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicI32, Ordering::SeqCst},
        Arc, Mutex,
    },
};

use rand::{rngs::SmallRng, Rng, SeedableRng};
use tokio::time::{self, Duration};
use tracing::trace;

use crate::{message::CodedMessage, sim::SimTransport};

const DEFAULT_NET_DELAY: Duration = Duration::from_millis(5);
const DEFAULT_MAX_MESSAGE_LEN: i32 = 512;

/// Routes messages between [`SimTransport`]s, playing the part of a
/// slightly hostile network.
///
/// Every delivery is delayed by a sample from a normal distribution;
/// messages to unknown addresses, partitioned pairs or full inboxes
/// are silently dropped, exactly the way UDP loses datagrams.
///
/// `SimRouter` is a cheap handle: clones share the same network.
#[derive(Clone)]
pub struct SimRouter {
    inner: Arc<Inner>,
}

struct Inner {
    routes: Mutex<HashMap<String, Arc<SimTransport>>>,
    /// Directed `(from, to)` pairs that currently drop everything.
    blocked: Mutex<HashSet<(String, String)>>,
    delay: Mutex<(Duration, Duration)>,
    max_message_len: AtomicI32,
    rng: Mutex<SmallRng>,
}

impl SimRouter {
    /// A router with the default 5 ms mean delay, a standard
    /// deviation of a tenth of that, and a 512-byte message hint.
    /// The seed makes delay sequences reproducible.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                routes: Mutex::new(HashMap::new()),
                blocked: Mutex::new(HashSet::new()),
                delay: Mutex::new((DEFAULT_NET_DELAY, DEFAULT_NET_DELAY / 10)),
                max_message_len: AtomicI32::new(DEFAULT_MAX_MESSAGE_LEN),
                rng: Mutex::new(SmallRng::seed_from_u64(seed)),
            }),
        }
    }

    /// The transport bound to `addr`, creating it if needed.
    pub fn transport(&self, addr: impl Into<String>) -> Arc<SimTransport> {
        let addr = addr.into();
        let mut routes = self.inner.routes.lock().expect("routes poisoned");
        Arc::clone(
            routes
                .entry(addr.clone())
                .or_insert_with(|| SimTransport::new(self.clone(), addr)),
        )
    }

    /// Forgets the transport bound to `addr`; future deliveries to it
    /// vanish.
    pub fn remove(&self, addr: &str) {
        self.inner
            .routes
            .lock()
            .expect("routes poisoned")
            .remove(addr);
    }

    /// Reconfigures the delay distribution.
    pub fn set_delay(&self, mean: Duration, std_dev: Duration) {
        *self.inner.delay.lock().expect("delay poisoned") = (mean, std_dev);
    }

    /// Reconfigures the message size hint handed to transports.
    pub fn set_max_message_len(&self, len: i32) {
        self.inner.max_message_len.store(len, SeqCst);
    }

    pub(crate) fn max_message_len(&self) -> i32 {
        self.inner.max_message_len.load(SeqCst)
    }

    /// Drops everything sent between `a` and `b`, both directions,
    /// until [`SimRouter::heal`].
    pub fn partition(&self, a: &str, b: &str) {
        let mut blocked = self.inner.blocked.lock().expect("blocked poisoned");
        blocked.insert((a.into(), b.into()));
        blocked.insert((b.into(), a.into()));
    }

    /// Undoes a [`SimRouter::partition`].
    pub fn heal(&self, a: &str, b: &str) {
        let mut blocked = self.inner.blocked.lock().expect("blocked poisoned");
        blocked.remove(&(a.to_string(), b.to_string()));
        blocked.remove(&(b.to_string(), a.to_string()));
    }

    /// Schedules delivery of `message` to the first reachable of
    /// `addrs` after a sampled network delay.
    pub(crate) fn route(&self, from: &str, addrs: &[String], message: &CodedMessage) {
        let inner = Arc::clone(&self.inner);
        let from = from.to_string();
        let addrs = addrs.to_vec();
        let message = message.clone();
        let delay = self.sample_delay();

        tokio::spawn(async move {
            if !delay.is_zero() {
                time::sleep(delay).await;
            }

            // Routes are resolved after the delay: a transport removed
            // in flight loses its mail, like a real network
            for addr in &addrs {
                if inner
                    .blocked
                    .lock()
                    .expect("blocked poisoned")
                    .contains(&(from.clone(), addr.clone()))
                {
                    trace!(%from, to = %addr, "partitioned; dropping");
                    continue;
                }

                let target = inner
                    .routes
                    .lock()
                    .expect("routes poisoned")
                    .get(addr)
                    .cloned();
                if let Some(target) = target {
                    // A full inbox drops the message, UDP-style
                    target.deliver(message.clone());
                    break;
                }
            }
        });
    }

    /// A delay sampled from `N(mean, std_dev)`, clamped at zero.
    fn sample_delay(&self) -> Duration {
        let (mean, std_dev) = *self.inner.delay.lock().expect("delay poisoned");
        if mean.is_zero() && std_dev.is_zero() {
            return Duration::ZERO;
        }

        // Box-Muller; one sample per message is cheap enough
        let normal = {
            let mut rng = self.inner.rng.lock().expect("rng poisoned");
            let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
            let u2: f64 = rng.gen();
            (-2.0 * u1.ln()).sqrt() * (core::f64::consts::TAU * u2).cos()
        };

        let sampled = mean.as_secs_f64() + normal * std_dev.as_secs_f64();
        if sampled <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(sampled)
        }
    }
}
