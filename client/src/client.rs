// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Client
//!
//! [`GpClient`] is the entry point of the library. It carries the defaults
//! shared by its subscriptions (data source, notification executor,
//! scheduler, maximum rate) and the registry of the subscriptions it
//! opened. There is no global instance: create as many clients as needed and
//! close them when done.

use crate::{
    DataSource, Error, PvConfig, ReadExpression, WriteExpression,
    config::{DEFAULT_MAX_RATE, ReadPart, WritePart, validate_max_rate},
    executor::{Executor, Scheduler, SerialExecutor},
    registry::Registry,
};

use tokio::{runtime::Handle, time::Duration};
use tracing::debug;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

struct ClientInner {
    data_source: Arc<dyn DataSource>,
    executor: Arc<dyn Executor>,
    scheduler: Scheduler,
    max_rate: Duration,
    registry: Registry,
    closed: AtomicBool,
}

/// Live data client.
///
/// Cloning is cheap; every clone shares the same defaults and registry.
#[derive(Clone)]
pub struct GpClient {
    inner: Arc<ClientInner>,
}

impl GpClient {
    /// Starts configuring a client.
    pub fn builder() -> GpClientBuilder {
        GpClientBuilder::default()
    }

    /// Subscription reading `expression`.
    pub fn read<E>(&self, expression: E) -> PvConfig<E::Output, ()>
    where
        E: ReadExpression,
        E::Output: Clone + PartialEq + Sync,
    {
        let expression = Arc::new(expression);
        let function = expression.clone();
        PvConfig::new(
            self.clone(),
            Some(ReadPart {
                source: expression,
                function: Arc::new(move || function.read()),
            }),
            None,
        )
    }

    /// Subscription writing `expression`.
    pub fn write<E>(&self, expression: E) -> PvConfig<(), E::Input>
    where
        E: WriteExpression,
    {
        let expression = Arc::new(expression);
        let function = expression.clone();
        PvConfig::new(
            self.clone(),
            None,
            Some(WritePart {
                target: expression,
                function: Arc::new(move |value| function.write(value)),
            }),
        )
    }

    /// Subscription reading and writing `expression`.
    pub fn read_and_write<E>(&self, expression: E) -> PvConfig<E::Output, E::Input>
    where
        E: ReadExpression + WriteExpression,
        E::Output: Clone + PartialEq + Sync,
    {
        let expression = Arc::new(expression);
        let reader = expression.clone();
        let writer = expression.clone();
        PvConfig::new(
            self.clone(),
            Some(ReadPart {
                source: expression.clone(),
                function: Arc::new(move || reader.read()),
            }),
            Some(WritePart {
                target: expression,
                function: Arc::new(move |value| writer.write(value)),
            }),
        )
    }

    /// Closes every subscription opened by this client. Subscriptions can
    /// no longer be opened afterwards.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing client.");
        self.inner.registry.close_all();
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of open subscriptions.
    pub fn open_subscriptions(&self) -> usize {
        self.inner.registry.len()
    }

    /// Default maximum notification rate.
    pub fn default_max_rate(&self) -> Duration {
        self.inner.max_rate
    }

    /// Default data source.
    pub fn data_source(&self) -> &Arc<dyn DataSource> {
        &self.inner.data_source
    }

    /// Default notification executor.
    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.inner.executor
    }

    /// Scheduler running scans, timeouts and writes.
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.inner.registry
    }
}

/// Builder of a [`GpClient`].
#[derive(Default)]
pub struct GpClientBuilder {
    data_source: Option<Arc<dyn DataSource>>,
    executor: Option<Arc<dyn Executor>>,
    runtime: Option<Handle>,
    max_rate: Option<Duration>,
}

impl GpClientBuilder {
    /// Default data source. Required.
    pub fn data_source(mut self, data_source: Arc<dyn DataSource>) -> Self {
        self.data_source = Some(data_source);
        self
    }

    /// Default notification executor. A [`SerialExecutor`] on the runtime
    /// otherwise.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Runtime for scans, timeouts and writes. The current runtime
    /// otherwise.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Default maximum notification rate. One second otherwise.
    pub fn max_rate(mut self, rate: Duration) -> Self {
        self.max_rate = Some(rate);
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] without data source, outside of a tokio runtime
    /// when none was given, or with a maximum rate below the minimum.
    pub fn build(self) -> Result<GpClient, Error> {
        let data_source = self
            .data_source
            .ok_or_else(|| Error::Config("no data source configured".to_owned()))?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| Error::Config(e.to_string()))?,
        };
        let max_rate = validate_max_rate(self.max_rate.unwrap_or(DEFAULT_MAX_RATE))?;
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(SerialExecutor::new(&runtime)));
        debug!("Creating new client, default max rate {:?}.", max_rate);
        Ok(GpClient {
            inner: Arc::new(ClientInner {
                data_source,
                executor,
                scheduler: Scheduler::new(runtime),
                max_rate,
                registry: Registry::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }
}
