// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Local data source.
//!
//! In-process `loc://` channels, held in memory and shared by every
//! subscription of the same data source.
//!

mod local;

pub use local::{LocalDataSource, SCHEME};
