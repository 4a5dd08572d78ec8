// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Subscription configuration
//!
//! A [`PvConfig`] is obtained from [`GpClient::read`],
//! [`GpClient::write`] or [`GpClient::read_and_write`]. It starts from the
//! client defaults; every option can be overridden per subscription.
//! Nothing is validated nor opened until [`PvConfig::start`].
//!
//! ```no_run
//! use client::{GpClient, ListenerScope, channel};
//! use std::time::Duration;
//!
//! # async fn doc(client: GpClient) -> Result<(), client::Error> {
//! let pv = client
//!     .read(channel("loc://temperature(20.0)"))
//!     .max_rate(Duration::from_millis(100))
//!     .connection_timeout(Duration::from_secs(5), "temperature not available")
//!     .add_read_listener(|event, pv| println!("{:?}: {:?}", event, pv.value()))
//!     .start()?;
//! # Ok(())
//! # }
//! ```
//!
//! [`GpClient::read`]: crate::GpClient::read
//! [`GpClient::write`]: crate::GpClient::write
//! [`GpClient::read_and_write`]: crate::GpClient::read_and_write

use crate::{
    DataSource, Error, Event, GpClient, ListenerScope, Pv, PvListener,
    ReadSource, WriteTarget,
    decoupler::ExceptionHandler,
    director::{DirectorSetup, ReadFunction, WriteFunction},
    executor::Executor,
    scan::ScanMode,
};

use tokio::time::Duration;
use tracing::debug;

use std::{panic::Location, sync::Arc};

/// Maximum notification rate used when none is configured.
pub const DEFAULT_MAX_RATE: Duration = Duration::from_secs(1);

/// Tightest maximum notification rate accepted.
pub const MIN_MAX_RATE: Duration = Duration::from_millis(5);

/// Checks a maximum notification rate.
pub(crate) fn validate_max_rate(rate: Duration) -> Result<Duration, Error> {
    if rate < MIN_MAX_RATE {
        return Err(Error::Config(format!(
            "max rate {:?} is below the minimum of {:?}",
            rate, MIN_MAX_RATE
        )));
    }
    Ok(rate)
}

/// Read side of a subscription being configured.
pub(crate) struct ReadPart<R> {
    pub source: Arc<dyn ReadSource>,
    pub function: ReadFunction<R>,
}

/// Write side of a subscription being configured.
pub(crate) struct WritePart<W> {
    pub target: Arc<dyn WriteTarget>,
    pub function: WriteFunction<W>,
}

/// Builder of one subscription.
pub struct PvConfig<R, W> {
    client: GpClient,
    read: Option<ReadPart<R>>,
    write: Option<WritePart<W>>,
    max_rate: Option<Duration>,
    timeout: Option<(Duration, String)>,
    data_source: Option<Arc<dyn DataSource>>,
    executor: Option<Arc<dyn Executor>>,
    scan_mode: Option<ScanMode>,
    exception_handler: Option<ExceptionHandler>,
    listeners: Vec<(ListenerScope, PvListener<R, W>)>,
}

impl<R, W> PvConfig<R, W>
where
    R: Clone + PartialEq + Send + Sync + 'static,
    W: Send + 'static,
{
    pub(crate) fn new(
        client: GpClient,
        read: Option<ReadPart<R>>,
        write: Option<WritePart<W>>,
    ) -> Self {
        Self {
            client,
            read,
            write,
            max_rate: None,
            timeout: None,
            data_source: None,
            executor: None,
            scan_mode: None,
            exception_handler: None,
            listeners: Vec::new(),
        }
    }

    /// Minimum time between two notifications. At least 5 ms.
    pub fn max_rate(mut self, rate: Duration) -> Self {
        self.max_rate = Some(rate);
        self
    }

    /// Notifies a [`Error::Timeout`] exception carrying `message` if the
    /// subscription is not connected within `timeout`. The exception is
    /// retracted once the connection arrives.
    pub fn connection_timeout(mut self, timeout: Duration, message: &str) -> Self {
        self.timeout = Some((timeout, message.to_owned()));
        self
    }

    /// Data source for this subscription only.
    pub fn data_source(mut self, data_source: Arc<dyn DataSource>) -> Self {
        self.data_source = Some(data_source);
        self
    }

    /// Executor running the listeners of this subscription.
    pub fn notify_on(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Forces a scan mode. By default time dependent expressions are sampled
    /// actively and everything else passively.
    pub fn scan_mode(mut self, mode: ScanMode) -> Self {
        self.scan_mode = Some(mode);
        self
    }

    /// Handler called with every read error as soon as it happens, ahead of
    /// and regardless of the rate limited notifications.
    pub fn on_exception(
        mut self,
        handler: impl Fn(&Error) + Send + Sync + 'static,
    ) -> Self {
        self.exception_handler = Some(Arc::new(handler));
        self
    }

    /// Adds a listener receiving every event kind.
    pub fn add_listener(
        mut self,
        listener: impl Fn(&Event, &Pv<R, W>) + Send + Sync + 'static,
    ) -> Self {
        self.listeners.push((ListenerScope::All, Arc::new(listener)));
        self
    }

    /// Adds a listener receiving read side events only.
    pub fn add_read_listener(
        mut self,
        listener: impl Fn(&Event, &Pv<R, W>) + Send + Sync + 'static,
    ) -> Self {
        self.listeners.push((ListenerScope::Read, Arc::new(listener)));
        self
    }

    /// Adds a listener receiving write side events only.
    pub fn add_write_listener(
        mut self,
        listener: impl Fn(&Event, &Pv<R, W>) + Send + Sync + 'static,
    ) -> Self {
        self.listeners.push((ListenerScope::Write, Arc::new(listener)));
        self
    }

    /// Validates the configuration and opens the subscription.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid option and [`Error::Closed`] if the
    /// client is closed.
    #[track_caller]
    pub fn start(self) -> Result<Pv<R, W>, Error> {
        let origin = Location::caller();
        let client = self.client;
        if client.is_closed() {
            return Err(Error::Closed);
        }
        let max_rate =
            validate_max_rate(self.max_rate.unwrap_or(client.default_max_rate()))?;
        if let Some((timeout, _)) = &self.timeout {
            if timeout.is_zero() {
                return Err(Error::Config("connection timeout must not be zero".to_owned()));
            }
        }
        let time_dependent = self
            .read
            .as_ref()
            .is_some_and(|read| read.source.is_time_dependent());
        let draining = self
            .read
            .as_ref()
            .is_some_and(|read| read.source.is_draining());
        let scan_mode = self.scan_mode.unwrap_or(if time_dependent {
            ScanMode::Active
        } else {
            ScanMode::Passive
        });

        let registry = client.registry();
        let id = registry.next_id();
        let (read_source, read_function) = match self.read {
            Some(read) => (Some(read.source), Some(read.function)),
            None => (None, None),
        };
        let (write_target, write_function) = match self.write {
            Some(write) => (Some(write.target), Some(write.function)),
            None => (None, None),
        };
        let setup = DirectorSetup {
            read_function,
            write_function,
            data_source: self
                .data_source
                .unwrap_or_else(|| client.data_source().clone()),
            executor: self.executor.unwrap_or_else(|| client.executor().clone()),
            scheduler: client.scheduler().clone(),
            scan_mode,
            max_rate,
            dedup_values: !draining,
            exception_handler: self.exception_handler,
            registry: registry.downgrade(),
            id,
            origin,
        };
        debug!(
            "Opening subscription {} ({:?}, max rate {:?}) at {}.",
            id, scan_mode, max_rate, origin
        );

        let pv = Pv::create(setup, self.listeners);
        let director = pv.director().clone();
        registry.insert(id, director.clone());
        if let Some(source) = read_source {
            director.context().connect_read_expression(source);
        }
        if let Some(target) = write_target {
            director.context().connect_write_expression(target);
        }
        if let Some((timeout, message)) = self.timeout {
            director.schedule_timeout(timeout, message);
        }
        director.start();
        Ok(pv)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_validate_max_rate() {
        assert!(validate_max_rate(Duration::from_millis(5)).is_ok());
        assert!(matches!(
            validate_max_rate(Duration::from_millis(4)),
            Err(Error::Config(_))
        ));
        assert_eq!(
            validate_max_rate(DEFAULT_MAX_RATE),
            Ok(Duration::from_secs(1))
        );
    }
}
