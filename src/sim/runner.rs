/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tokio::{
    sync::mpsc,
    time::{self, Duration, Instant},
};
use tracing::{debug, info};

use crate::{
    codec::BincodeCodec,
    config::Config,
    detector::Detector,
    node::{Node, State},
    sim::SimRouter,
    sorter::Sorter,
};

/// Returned when the victim's death is never observed; effectively
/// "didn't converge", without poisoning statistics with infinities.
const NEVER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How long a single measurement may take before giving up entirely.
const MEASUREMENT_CAP: Duration = Duration::from_secs(60);

/// One convergence measurement: a group reaches steady state, loses a
/// member, and the survivors notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    /// Time from the kill until the *first* survivor declared the
    /// victim dead.
    pub first: Duration,
    /// Time from the kill until *every* survivor agreed on the new
    /// group size.
    pub last: Duration,
}

/// Measures how long a simulated group takes to detect a failure and
/// re-converge.
///
/// The experiment per [`ConvergenceRunner::measure`] call: populate
/// `n` detectors on one router, join them with staggered starts, wait
/// until everyone counts `n - 1` active peers, hold one suspicion
/// duration of steady state, kill a member, then record the first
/// detection and the final agreement times.
pub struct ConvergenceRunner {
    /// Buckets (K) handed to each detector; below 2 selects the flat
    /// shuffled list.
    pub bucket_count: u32,
    /// Direct probes (P) per protocol period.
    pub direct_probes: u32,
    /// Distance metric (D) for bucketed selection.
    pub sorter: Sorter,
    /// Protocol period used by every detector.
    pub probe_interval: Duration,
    /// Initial RTT hint used by every detector.
    pub probe_timeout: Duration,

    rng: SmallRng,
}

struct Instance {
    id: u64,
    addr: String,
    detector: Detector,
}

impl ConvergenceRunner {
    /// A runner with the classic experiment parameters: flat
    /// selection, two direct probes, a 200 ms protocol period.
    pub fn new(seed: u64) -> Self {
        Self {
            bucket_count: 1,
            direct_probes: 2,
            sorter: Sorter::None,
            probe_interval: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(20),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    fn config(&self) -> Config {
        Config {
            direct_probes: self.direct_probes,
            indirect_probes: 3,
            probe_interval: self.probe_interval,
            probe_timeout: self.probe_timeout,
            retransmit_mult: 4,
            suspicion_mult: 3,
            bucket_count: self.bucket_count,
            sorter: self.sorter,
        }
    }

    /// Runs one measurement over a group of `n >= 2` detectors.
    pub async fn measure(&mut self, n: usize) -> Measurement {
        assert!(n >= 2, "a group of one cannot lose a member it knows");

        let router = SimRouter::new(self.rng.gen());
        let config = self.config();

        // Populate: fresh detectors with distinct random ids
        let mut instances: Vec<Instance> = Vec::with_capacity(n);
        let (events_tx, mut events) = mpsc::unbounded_channel::<(u64, Node)>();

        while instances.len() < n {
            let id: u64 = self.rng.gen_range(1..u64::MAX);
            if instances.iter().any(|instance| instance.id == id) {
                continue;
            }
            let addr = format!("n{id:020}");

            let detector = Detector::new(
                Node::with_addr(id, addr.clone()),
                config.clone(),
                router.transport(addr.clone()),
                BincodeCodec::standard(),
            );

            // Funnel every detector's updates into one stream so the
            // runner can react to changes instead of busy-polling
            let mut updates = detector.updates();
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                while let Some(node) = updates.recv().await {
                    if events_tx.send((id, node)).is_err() {
                        break;
                    }
                }
            });

            debug!(id, "populated");
            instances.push(Instance { id, addr, detector });
        }
        drop(events_tx);

        let addrs: Vec<String> = instances
            .iter()
            .map(|instance| instance.addr.clone())
            .collect();

        // Start everyone, staggered by a random fraction of the
        // protocol period
        for instance in &instances {
            debug!(id = instance.id, "joining");
            instance.detector.join(&addrs).await;
            let pause = self
                .rng
                .gen_range(0..self.probe_interval.as_millis().max(1) as u64);
            time::sleep(Duration::from_millis(pause)).await;
        }

        let deadline = Instant::now() + MEASUREMENT_CAP;
        if !wait_for_count(&instances, n - 1, &mut events, deadline).await {
            info!("group never converged; giving up");
            self.teardown(&instances).await;
            return Measurement {
                first: NEVER,
                last: NEVER,
            };
        }
        info!(n, "group converged");

        // Hold steady for one suspicion duration before disturbing it
        time::sleep(config.suspicion_duration(n - 1)).await;

        // Kill one member: transport down, no goodbye
        let victim = instances.remove(0);
        victim
            .detector
            .close()
            .await
            .expect("victim transport closes once");
        router.remove(&victim.addr);
        info!(id = victim.id, "killed");

        let start = Instant::now();
        let deadline = start + MEASUREMENT_CAP;
        let mut first = None;

        let converged = loop {
            if all_counting(&instances, n - 2) {
                break true;
            }
            match time::timeout_at(deadline, events.recv()).await {
                Ok(Some((observer, node))) => {
                    if first.is_none()
                        && observer != victim.id
                        && node.id == victim.id
                        && node.state == State::Dead
                    {
                        first = Some(start.elapsed());
                        info!(elapsed = ?first, "first detection");
                    }
                }
                Ok(None) | Err(_) => break false,
            }
        };

        let last = if converged { start.elapsed() } else { NEVER };
        self.teardown(&instances).await;

        Measurement {
            first: first.unwrap_or(NEVER),
            last,
        }
    }

    async fn teardown(&self, instances: &[Instance]) {
        for instance in instances {
            let _ = instance.detector.close().await;
        }
    }
}

fn all_counting(instances: &[Instance], expected: usize) -> bool {
    instances
        .iter()
        .all(|instance| instance.detector.active_count() == expected)
}

/// Waits until every instance reports `expected` active peers, waking
/// on membership updates. False when `deadline` passes first.
async fn wait_for_count(
    instances: &[Instance],
    expected: usize,
    events: &mut mpsc::UnboundedReceiver<(u64, Node)>,
    deadline: Instant,
) -> bool {
    loop {
        if all_counting(instances, expected) {
            return true;
        }
        match time::timeout_at(deadline, events.recv()).await {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return all_counting(instances, expected),
        }
    }
}
