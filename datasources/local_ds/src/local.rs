// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! In-memory channels.
//!
//! A local channel is created by the first subscription naming it and lives
//! as long as the data source. Names have the form `loc://name` or
//! `loc://name(initial)`, where `initial` is any literal accepted by
//! [`Value::parse`]. The initial value is only applied when the channel does
//! not hold a value yet; a later subscription with an initial value of a
//! different kind is refused.
//!
//! Every write replaces the value of the channel and is fanned out to all of
//! its readers. A channel keeps the kind of its first value: writing a value
//! of another kind fails. The host can mark channels read-only, toggle their
//! connection and publish values directly.
//!
//! Collectors are always updated after the channel lock is released, under a
//! per channel delivery lock so that readers see updates in store order.

use client::{
    DataSource, Error, Event, ReadSubscription, Value, WriteCallback,
    WriteSubscription,
};

use tracing::{debug, warn};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

/// Prefix of local channel names.
pub const SCHEME: &str = "loc://";

struct LocalChannel {
    value: Option<Value>,
    connected: bool,
    read_only: bool,
    readers: Vec<ReadSubscription>,
    writers: Vec<WriteSubscription>,
}

impl LocalChannel {
    fn new() -> Self {
        Self {
            value: None,
            connected: true,
            read_only: false,
            readers: Vec::new(),
            writers: Vec::new(),
        }
    }

    fn write_connected(&self) -> bool {
        self.connected && !self.read_only
    }
}

#[derive(Default)]
struct LocalInner {
    channels: Mutex<HashMap<String, LocalChannel>>,
    deliveries: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LocalInner {
    fn channels(&self) -> MutexGuard<'_, HashMap<String, LocalChannel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock held from storing a change of `name` until its collectors are
    /// updated.
    fn delivery(&self, name: &str) -> Arc<Mutex<()>> {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_owned())
            .or_default()
            .clone()
    }

    /// Stores `value` and returns the readers to notify.
    fn store(
        &self,
        name: &str,
        value: Value,
        from_host: bool,
    ) -> Result<Vec<ReadSubscription>, Error> {
        let mut channels = self.channels();
        let channel = if from_host {
            channels.entry(name.to_owned()).or_insert_with(|| {
                debug!("Creating local channel {}.", name);
                LocalChannel::new()
            })
        } else {
            channels
                .get_mut(name)
                .ok_or_else(|| Error::ChannelNotFound(format!("{}{}", SCHEME, name)))?
        };
        if !from_host {
            if channel.read_only {
                return Err(Error::Write(format!("{}{} is read-only", SCHEME, name)));
            }
            if !channel.connected {
                return Err(Error::Disconnected(format!("{}{}", SCHEME, name)));
            }
        }
        if let Some(current) = &channel.value {
            if !current.same_kind(&value) {
                return Err(Error::Write(format!(
                    "{}{} holds {} values, {} rejected",
                    SCHEME,
                    name,
                    current.kind_name(),
                    value.kind_name()
                )));
            }
        }
        channel.value = Some(value);
        Ok(channel.readers.clone())
    }

    fn write(&self, name: &str, value: Value, from_host: bool) -> Result<(), Error> {
        let delivery = self.delivery(name);
        let _order = delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let readers = self.store(name, value.clone(), from_host)?;
        for reader in readers {
            reader.collector().update_value(value.clone());
        }
        Ok(())
    }
}

/// Parses a channel name into its key and optional initial value.
fn parse_name(channel: &str) -> Result<(String, Option<Value>), Error> {
    let rest = channel
        .strip_prefix(SCHEME)
        .ok_or_else(|| Error::ChannelNotFound(channel.to_owned()))?;
    let (name, initial) = match rest.find('(') {
        Some(open) => {
            let literal = rest[open + 1..].strip_suffix(')').ok_or_else(|| {
                Error::Config(format!("unbalanced initial value in {}", channel))
            })?;
            let value = Value::parse(literal).ok_or_else(|| {
                Error::Config(format!("invalid initial value in {}", channel))
            })?;
            (&rest[..open], Some(value))
        }
        None => (rest, None),
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::Config(format!("empty local channel name in {}", channel)));
    }
    Ok((name.to_owned(), initial))
}

/// Key of a channel named by the host, with or without scheme and initial
/// value.
fn key(name: &str) -> &str {
    let name = name.strip_prefix(SCHEME).unwrap_or(name);
    name.split('(').next().unwrap_or(name).trim()
}

/// Data source serving `loc://` channels from memory.
///
/// Cloning is cheap; clones serve the same channels.
#[derive(Clone, Default)]
pub struct LocalDataSource {
    inner: Arc<LocalInner>,
}

impl LocalDataSource {
    /// Creates a data source without channels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a channel.
    pub fn value(&self, name: &str) -> Option<Value> {
        self.inner
            .channels()
            .get(key(name))
            .and_then(|channel| channel.value.clone())
    }

    /// Number of read subscriptions of a channel.
    pub fn readers(&self, name: &str) -> usize {
        self.inner
            .channels()
            .get(key(name))
            .map_or(0, |channel| channel.readers.len())
    }

    /// Publishes `value` on a channel, creating it if needed. Read-only and
    /// disconnected channels accept values from the host.
    ///
    /// # Errors
    ///
    /// [`Error::Write`] if the channel holds values of another kind.
    pub fn publish(&self, name: &str, value: Value) -> Result<(), Error> {
        self.inner.write(key(name), value, true)
    }

    /// Marks a channel read-only or writable. Its writers see a write
    /// connection change.
    pub fn set_read_only(&self, name: &str, read_only: bool) {
        let delivery = self.inner.delivery(key(name));
        let _order = delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let writers = {
            let mut channels = self.inner.channels();
            let channel = channels
                .entry(key(name).to_owned())
                .or_insert_with(LocalChannel::new);
            channel.read_only = read_only;
            channel
                .writers
                .iter()
                .map(|writer| (writer.clone(), channel.write_connected()))
                .collect::<Vec<_>>()
        };
        for (writer, connected) in writers {
            writer.collector().update_connection(connected);
        }
    }

    /// Connects or disconnects a channel.
    pub fn set_connected(&self, name: &str, connected: bool) {
        let delivery = self.inner.delivery(key(name));
        let _order = delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let (readers, writers, write_connected) = {
            let mut channels = self.inner.channels();
            let channel = channels
                .entry(key(name).to_owned())
                .or_insert_with(LocalChannel::new);
            if channel.connected == connected {
                return;
            }
            channel.connected = connected;
            (
                channel.readers.clone(),
                channel.writers.clone(),
                channel.write_connected(),
            )
        };
        debug!(
            "Local channel {} is {}.",
            key(name),
            if connected { "connected" } else { "disconnected" }
        );
        for reader in readers {
            reader.collector().update_connection(connected);
        }
        for writer in writers {
            writer.collector().update_connection(write_connected);
        }
    }

    /// Creates the channel of a subscription, applying its initial value.
    fn open(&self, channel: &str) -> Result<String, Error> {
        let (name, initial) = parse_name(channel)?;
        let mut channels = self.inner.channels();
        let local = channels.entry(name.clone()).or_insert_with(|| {
            debug!("Creating local channel {}.", name);
            LocalChannel::new()
        });
        if let Some(initial) = initial {
            match &local.value {
                None => local.value = Some(initial),
                Some(current) if !current.same_kind(&initial) => {
                    return Err(Error::Config(format!(
                        "{} holds {} values, initialized as {}",
                        channel,
                        current.kind_name(),
                        initial.kind_name()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(name)
    }
}

impl DataSource for LocalDataSource {
    fn start_read(&self, subscription: ReadSubscription) -> Result<(), Error> {
        let name = self.open(subscription.channel())?;
        let delivery = self.inner.delivery(&name);
        let _order = delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let (value, connected) = {
            let mut channels = self.inner.channels();
            let Some(channel) = channels.get_mut(&name) else {
                return Err(Error::ChannelNotFound(subscription.channel().to_owned()));
            };
            channel.readers.push(subscription.clone());
            (channel.value.clone(), channel.connected)
        };
        match value {
            Some(value) => subscription
                .collector()
                .update_value_and_connection(value, connected),
            None => subscription.collector().update_connection(connected),
        }
        Ok(())
    }

    fn stop_read(&self, subscription: &ReadSubscription) {
        let name = key(subscription.channel());
        let mut channels = self.inner.channels();
        match channels.get_mut(name) {
            Some(channel) => {
                channel
                    .readers
                    .retain(|reader| !reader.same_collector(subscription));
            }
            None => warn!("Stopping read on unknown local channel {}.", name),
        }
    }

    fn start_write(&self, subscription: WriteSubscription) -> Result<(), Error> {
        let name = self.open(subscription.channel())?;
        let delivery = self.inner.delivery(&name);
        let _order = delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let connected = {
            let mut channels = self.inner.channels();
            let Some(channel) = channels.get_mut(&name) else {
                return Err(Error::ChannelNotFound(subscription.channel().to_owned()));
            };
            channel.writers.push(subscription.clone());
            channel.write_connected()
        };
        let inner: Weak<LocalInner> = Arc::downgrade(&self.inner);
        subscription.collector().set_write_handler(Some(Arc::new(
            move |value: Value, callback: WriteCallback| {
                let result = match inner.upgrade() {
                    Some(inner) => inner.write(&name, value, false),
                    None => Err(Error::Closed),
                };
                callback(match result {
                    Ok(()) => Event::write_succeeded(),
                    Err(error) => Event::write_failed(error),
                });
            },
        )));
        subscription.collector().update_connection(connected);
        Ok(())
    }

    fn stop_write(&self, subscription: &WriteSubscription) {
        subscription.collector().set_write_handler(None);
        let name = key(subscription.channel());
        if let Some(channel) = self.inner.channels().get_mut(name) {
            channel
                .writers
                .retain(|writer| !writer.same_collector(subscription));
        }
    }
}
