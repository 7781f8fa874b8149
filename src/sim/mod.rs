/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! An in-process network simulator and the convergence experiments
//! built on top of it.
//!
//! [`SimRouter`] plays the network: it delivers whole messages between
//! [`SimTransport`]s with a normally distributed delay, drops on
//! congestion like UDP would, and can partition arbitrary address
//! pairs. [`ConvergenceRunner`] spins up a group of detectors on one
//! router, kills a member and measures how long the survivors take to
//! notice and to agree.

mod router;
mod runner;
mod transport;

pub use router::SimRouter;
pub use runner::{ConvergenceRunner, Measurement};
pub use transport::SimTransport;
