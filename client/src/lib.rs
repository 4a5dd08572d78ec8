// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Live data client
//!
//! A client library for subscribing to and writing live data channels, the
//! kind of values published by instruments and control systems. Its core is
//! a rate decoupling and event notification engine: sources deliver updates
//! on arbitrary threads at arbitrary rates, and the consumer is notified at
//! a bounded, configurable rate with strict ordering, no overlapping
//! notifications and redundant information coalesced away.
//!
//! ## Overview
//!
//! A subscription is built from a small number of cooperating parts:
//!
//! - **Collectors** buffer what data sources deliver and fire source-rate
//!   events. A [`LatestValueCollector`] keeps the newest value, an
//!   [`AllValuesCollector`] queues everything since the last read.
//! - The **rate decoupler** turns source-rate events into desired-rate
//!   events. Only one desired-rate event is ever in flight and the
//!   [`ScanMode`] decides when the next one goes out.
//! - The **director** recomputes the value, aggregates connection state,
//!   removes what did not change and dispatches the result to the
//!   notification executor. It also runs writes.
//! - The **handle** ([`Pv`]) exposes the last delivered state to the user
//!   and runs the user's listeners.
//!
//! ```text
//! DataSource --> Collector --> RateDecoupler --> Director --> Executor --> Pv listeners
//! ```
//!
//! ## Events
//!
//! Everything that happens to a subscription is described by an [`Event`]:
//! a set of [`EventKind`]s plus the read and write errors, if any. Events
//! merge, so a burst of updates between two notifications becomes a single
//! event describing everything that changed.
//!
//! ## Threads
//!
//! Three kinds of threads are involved:
//!
//! - data source threads, which only touch collectors;
//! - the [`Scheduler`], a tokio runtime running scans, timeouts and writes;
//! - the notification [`Executor`], running user listeners, by default one
//!   at a time in order ([`SerialExecutor`]).
//!
//! Locks are never held while user code runs, and panics in user code are
//! caught and logged.
//!
//! ## Getting Started
//!
//! ```ignore
//! use client::{GpClient, channel};
//! use std::{sync::Arc, time::Duration};
//!
//! let client = GpClient::builder()
//!     .data_source(Arc::new(local_ds::LocalDataSource::new()))
//!     .build()?;
//!
//! let pv = client
//!     .read_and_write(channel("loc://setpoint(0)"))
//!     .max_rate(Duration::from_millis(50))
//!     .add_listener(|event, pv| println!("{:?} -> {:?}", event, pv.value()))
//!     .start()?;
//!
//! pv.write_and_wait(client::Value::Int(3)).await?;
//! pv.close();
//! ```
//!
//! ## Data sources
//!
//! Transports plug in through the [`DataSource`] trait. The workspace ships
//! an in-process `loc://` source and a simulated `sim://` source.

// Private modules containing the implementation
mod barrier;
mod channel;
mod client;
mod collector;
mod config;
mod datasource;
mod decoupler;
mod director;
mod error;
mod event;
mod executor;
mod expression;
mod pv;
mod registry;
mod scan;
mod value;
mod write_collector;

use std::sync::{Mutex, MutexGuard, PoisonError};

//
// Client and subscriptions
//

/// Entry point of the library and its builder.
///
/// A client carries the defaults shared by its subscriptions and closes all
/// of them when it is closed.
pub use client::{GpClient, GpClientBuilder};

/// Builder of one subscription, with the default and minimum maximum rates.
pub use config::{DEFAULT_MAX_RATE, MIN_MAX_RATE, PvConfig};

/// Handle of an open subscription and its listener types.
pub use pv::{ListenerId, ListenerScope, Pv, PvListener};

/// Orchestrator of one subscription.
pub use director::Director;

//
// Events and values
//

/// Notification descriptor and its kinds.
pub use event::{Event, EventKind};

/// Decoded channel value.
pub use value::Value;

/// Error type of the library.
pub use error::Error;

//
// Collectors
//

/// Read collectors and the listener they fire.
pub use collector::{
    AllValuesCollector, Collector, LatestValueCollector, ReadCollector,
    UpdateListener,
};

/// Write collectors and write transactions.
pub use write_collector::{
    WriteCallback, WriteCollector, WriteHandler, WriteId, WriteRequests,
};

/// Joins the outcomes of one write.
pub use barrier::WriteBarrier;

//
// Scheduling
//

/// Rate decoupler and its callbacks.
pub use decoupler::{DesiredRateListener, ExceptionHandler, RateDecoupler};

/// Scan strategies.
pub use scan::{ActiveScan, PassiveScan, ScanMode, ScanStrategy};

/// Executors and scheduler.
pub use executor::{
    Executor, InlineExecutor, Scheduler, SerialExecutor, SpawnExecutor, Task,
};

//
// Expressions and data sources
//

/// Expression traits and the context they are started in.
pub use expression::{
    ExpressionContext, Map, ReadExpression, ReadExpressionExt, ReadSource,
    TryMap, WriteExpression, WriteTarget,
};

/// Channel expressions.
pub use channel::{Channel, Channels, Now, Queue, channel, channels, now, queue};

/// Data source interface.
pub use datasource::{DataSource, ReadSubscription, WriteSubscription};

/// Locks `mutex`, recovering the data of a poisoned lock. Every critical
/// section in the crate leaves its data consistent, and user code never
/// runs under a lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
