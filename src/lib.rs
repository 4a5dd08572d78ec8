// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Live data client.
//! Subscribes to live data channels and notifies the consumer at a bounded
//! rate, coalescing everything that happened in between.
//! The reference data sources are behind the `local` and `sim` features.

pub use client::{
    AllValuesCollector, Channel, Channels, DEFAULT_MAX_RATE, DataSource,
    Director, Error, Event, EventKind, Executor, ExpressionContext,
    GpClient, GpClientBuilder, InlineExecutor, LatestValueCollector,
    ListenerId, ListenerScope, MIN_MAX_RATE, Pv, PvConfig, PvListener,
    ReadExpression, ReadExpressionExt, ReadSource, ReadSubscription,
    RateDecoupler, ScanMode, Scheduler, SerialExecutor, SpawnExecutor, Task,
    Value, WriteCallback, WriteCollector, WriteExpression, WriteSubscription,
    WriteTarget, channel, channels, now, queue,
};

#[cfg(feature = "local")]
pub use local_ds::LocalDataSource;

#[cfg(feature = "sim")]
pub use sim_ds::{Signal, SimDataSource};
