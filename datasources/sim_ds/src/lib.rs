// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Simulation data source.
//!
//! Read-only `sim://` channels producing synthetic values on a timer.
//!

mod signal;
mod sim;

pub use signal::Signal;
pub use sim::{DEFAULT_PERIOD, SCHEME, SimDataSource};
