// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Simulated channels.
//!
//! Each distinct channel name runs one generator task on the runtime of the
//! data source. The task is spawned with the first reader, samples its
//! [`Signal`] once per period and fans the value out to every reader; it is
//! cancelled when the last reader leaves. Constant channels deliver their
//! value on subscription and run no task.
//!
//! A reader joining a running channel receives the last sampled value right
//! away. Simulated channels can not be written.

use crate::Signal;

use client::{
    DataSource, Error, Event, ReadSubscription, Value, WriteCallback,
    WriteSubscription,
};

use tokio::{runtime::Handle, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Prefix of simulated channel names.
pub const SCHEME: &str = "sim://";

/// Sampling period used by [`SimDataSource::new`].
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(100);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Fanout {
    readers: Vec<ReadSubscription>,
    last: Option<Value>,
}

struct SimChannel {
    fanout: Arc<Mutex<Fanout>>,
    token: Option<CancellationToken>,
}

struct SimInner {
    runtime: Handle,
    period: Duration,
    channels: Mutex<HashMap<String, SimChannel>>,
}

impl Drop for SimInner {
    fn drop(&mut self) {
        let channels = self
            .channels
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for channel in channels.values() {
            if let Some(token) = &channel.token {
                token.cancel();
            }
        }
    }
}

/// Data source serving `sim://` channels.
///
/// Cloning is cheap; clones share the generators.
#[derive(Clone)]
pub struct SimDataSource {
    inner: Arc<SimInner>,
}

impl SimDataSource {
    /// Data source sampling every [`DEFAULT_PERIOD`] on the current runtime.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] outside of a tokio runtime.
    pub fn new() -> Result<Self, Error> {
        let runtime = Handle::try_current().map_err(|e| Error::Config(e.to_string()))?;
        Self::with_runtime(runtime, DEFAULT_PERIOD)
    }

    /// Data source sampling every `period` on `runtime`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for a zero period.
    pub fn with_runtime(runtime: Handle, period: Duration) -> Result<Self, Error> {
        if period.is_zero() {
            return Err(Error::Config("simulation period must not be zero".to_owned()));
        }
        Ok(Self {
            inner: Arc::new(SimInner {
                runtime,
                period,
                channels: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Sampling period.
    pub fn period(&self) -> Duration {
        self.inner.period
    }

    /// Number of channels with at least one reader.
    pub fn active_channels(&self) -> usize {
        lock(&self.inner.channels).len()
    }

    /// Spawns the generator of `name`.
    fn spawn(&self, name: &str, signal: Signal, fanout: Arc<Mutex<Fanout>>) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let period = self.inner.period;
        let name = name.to_owned();
        debug!("Starting simulated channel {}.", name);
        self.inner.runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut tick = 0u64;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        let value = signal.sample(tick);
                        tick = tick.wrapping_add(1);
                        let readers = {
                            let mut fanout = lock(&fanout);
                            fanout.last = Some(value.clone());
                            fanout.readers.clone()
                        };
                        for reader in readers {
                            reader.collector().update_value(value.clone());
                        }
                    }
                }
            }
            debug!("Simulated channel {} stopped.", name);
        });
        token
    }
}

impl DataSource for SimDataSource {
    fn start_read(&self, subscription: ReadSubscription) -> Result<(), Error> {
        let name = subscription.channel();
        let rest = name
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::ChannelNotFound(name.to_owned()))?;
        let signal = Signal::parse(rest)?;

        let last = {
            let mut channels = lock(&self.inner.channels);
            match channels.get(name) {
                Some(channel) => {
                    let mut fanout = lock(&channel.fanout);
                    fanout.readers.push(subscription.clone());
                    fanout.last.clone()
                }
                None => {
                    let constant = signal.is_constant().then(|| signal.sample(0));
                    let fanout = Arc::new(Mutex::new(Fanout {
                        readers: vec![subscription.clone()],
                        last: constant.clone(),
                    }));
                    let token = if signal.is_constant() {
                        None
                    } else {
                        Some(self.spawn(name, signal, fanout.clone()))
                    };
                    channels.insert(name.to_owned(), SimChannel { fanout, token });
                    constant
                }
            }
        };
        match last {
            Some(value) => subscription
                .collector()
                .update_value_and_connection(value, true),
            None => subscription.collector().update_connection(true),
        }
        Ok(())
    }

    fn stop_read(&self, subscription: &ReadSubscription) {
        let name = subscription.channel();
        let mut channels = lock(&self.inner.channels);
        let Some(channel) = channels.get(name) else {
            warn!("Stopping read on unknown simulated channel {}.", name);
            return;
        };
        let empty = {
            let mut fanout = lock(&channel.fanout);
            fanout
                .readers
                .retain(|reader| !reader.same_collector(subscription));
            fanout.readers.is_empty()
        };
        if empty {
            if let Some(channel) = channels.remove(name) {
                if let Some(token) = channel.token {
                    debug!("Last reader of {} gone, stopping generator.", name);
                    token.cancel();
                }
            }
        }
    }

    fn start_write(&self, subscription: WriteSubscription) -> Result<(), Error> {
        let name = subscription.channel().to_owned();
        subscription.collector().set_write_handler(Some(Arc::new(
            move |_: Value, callback: WriteCallback| {
                callback(Event::write_failed(Error::Write(format!(
                    "{} is a simulated channel and can not be written",
                    name
                ))))
            },
        )));
        subscription.collector().update_connection(false);
        Ok(())
    }

    fn stop_write(&self, subscription: &WriteSubscription) {
        subscription.collector().set_write_handler(None);
    }
}
