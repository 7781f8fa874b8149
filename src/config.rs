/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use core::time::Duration;

use crate::sorter::Sorter;

/// A Config specifies the parameters a [`crate::Detector`] will use
/// for the SWIM protocol.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// How many peers get a fresh Ping each protocol period.
    ///
    /// One is the classic SWIM setting. Zero disables direct probing
    /// entirely, which is only useful as a test aid.
    pub direct_probes: u32,

    /// How many peers are asked to probe an unresponsive target on
    /// our behalf before the period ends.
    ///
    /// This doesn't need to be a large number: it's a fan-out to route
    /// around poor transmission quality and weird partitions. 3-5 is
    /// plenty for a modern network.
    pub indirect_probes: u32,

    /// The protocol period T: the fixed interval between probing
    /// rounds and the failure detector's fundamental time unit.
    ///
    /// Should comfortably exceed [`Config::probe_timeout`], since the
    /// indirect-probe cycle has to fit inside it too. Must not be
    /// zero.
    pub probe_interval: Duration,

    /// Initial round-trip hint and floor for the indirect-probe
    /// trigger.
    ///
    /// Set it to a value that describes your transport's round-trip
    /// time well, like a high quantile of the cluster-wide ping RTT.
    /// The per-peer estimator adapts from there. Must not be zero.
    pub probe_timeout: Duration,

    /// Scales how many times a broadcast is piggybacked before being
    /// dropped: the limit is `retransmit_mult` times a logarithmic
    /// factor of the group size.
    ///
    /// A high value trades bandwidth for better dissemination odds in
    /// flaky networks.
    pub retransmit_mult: u32,

    /// Scales how long a Suspect member gets to refute before being
    /// declared dead: `suspicion_mult` times the logarithmic group
    /// factor, in protocol periods.
    ///
    /// Higher values give more time to recover from a false
    /// suspicion, but slow down detection of a real failure.
    pub suspicion_mult: u32,

    /// Number of buckets (K) for topology-aware peer selection. Any
    /// value below 2 selects the flat shuffled list instead.
    pub bucket_count: u32,

    /// The distance metric for bucket partitioning. Ignored when
    /// [`Config::bucket_count`] selects the flat list.
    pub sorter: Sorter,
}

impl Config {
    /// A conservative configuration that behaves well on a LAN.
    pub fn simple() -> Self {
        Self {
            direct_probes: 1,
            indirect_probes: 3,
            probe_interval: Duration::from_millis(1000),
            probe_timeout: Duration::from_millis(200),
            retransmit_mult: 4,
            suspicion_mult: 3,
            bucket_count: 1,
            sorter: Sorter::None,
        }
    }

    /// The logarithmic group-size factor shared by the retransmit and
    /// suspicion knobs: `max(1, ceil(log2(n + 1) / 3))`, the division
    /// approximating a base-10 logarithm as the SWIM paper suggests.
    pub(crate) fn scale(n: usize) -> u32 {
        log2ceil(n + 1).div_ceil(3).max(1)
    }

    /// Times a broadcast is attached to outgoing messages before
    /// being dropped, for a group of `n` peers.
    pub fn retransmit_limit(&self, n: usize) -> u32 {
        self.retransmit_mult * Self::scale(n)
    }

    /// How long a peer may stay Suspect before being declared dead,
    /// for a group of `n` peers.
    pub fn suspicion_duration(&self, n: usize) -> Duration {
        self.probe_interval * self.suspicion_mult * Self::scale(n)
    }
}

/// `ceil(log2(x))` for positive `x`.
fn log2ceil(x: usize) -> u32 {
    x.next_power_of_two().trailing_zeros()
}
