// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Write collectors
//!
//! The write side of a channel. A [`WriteCollector`] sits between the write
//! function of an expression and the data source that performs the actual
//! write:
//!
//! 1. The director prepares a transaction on every participating collector.
//! 2. The write function decomposes the user value and queues one value on
//!    each collector it wants to write.
//! 3. The director sends the write request; the collector hands the queued
//!    value to the handler installed by the data source, which answers with
//!    exactly one `WriteSucceeded` or `WriteFailed` event.
//!
//! The collector also tracks the write connection flag and fires
//! `WriteConnection` events on the same update listener mechanism used by
//! read collectors.

use crate::{Collector, Error, Event, UpdateListener, lock};

use tracing::{debug, warn};

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

/// Identifier of one logical write across all its collectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteId(pub u64);

impl WriteId {
    /// Random transaction id.
    pub fn random() -> Self {
        WriteId(rand::random())
    }
}

impl fmt::Display for WriteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// One-shot completion callback of a write.
pub type WriteCallback = Box<dyn FnOnce(Event) + Send + 'static>;

/// Handler installed by a data source to perform writes.
pub type WriteHandler<T> = Arc<dyn Fn(T, WriteCallback) + Send + Sync>;

/// Transaction side of a write collector, as seen by the director.
pub trait WriteRequests: Collector {
    /// Opens transaction `id`. Values queued until the request is sent
    /// belong to it.
    fn prepare_write(&self, id: WriteId);

    /// Discards transaction `id`.
    fn cancel_write(&self, id: WriteId);

    /// Performs transaction `id`. `callback` receives exactly one event.
    fn send_write_request(&self, id: WriteId, callback: WriteCallback);
}

struct WriteState<T> {
    connected: bool,
    listener: Option<UpdateListener>,
    handler: Option<WriteHandler<T>>,
    current: Option<WriteId>,
    pending: HashMap<WriteId, Option<T>>,
}

/// Write collector for one channel.
pub struct WriteCollector<T> {
    channel: String,
    state: Mutex<WriteState<T>>,
}

impl<T> WriteCollector<T> {
    /// Creates a disconnected collector for `channel`.
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_owned(),
            state: Mutex::new(WriteState {
                connected: false,
                listener: None,
                handler: None,
                current: None,
                pending: HashMap::new(),
            }),
        }
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Installs or removes the handler performing the writes.
    pub fn set_write_handler(&self, handler: Option<WriteHandler<T>>) {
        lock(&self.state).handler = handler;
    }

    /// Sets the write connection flag and fires a `WriteConnection` event.
    pub fn update_connection(&self, connected: bool) {
        let listener = {
            let mut state = lock(&self.state);
            state.connected = connected;
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener(Event::write_connection());
        }
    }

    /// Queues `value` on the transaction being prepared.
    pub fn queue_value(&self, value: T) {
        let mut state = lock(&self.state);
        match state.current {
            Some(id) => {
                state.pending.insert(id, Some(value));
            }
            None => {
                warn!(
                    "Value queued on {} outside of a write transaction, discarded.",
                    self.channel
                );
            }
        }
    }
}

impl<T> fmt::Debug for WriteCollector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("WriteCollector")
            .field("channel", &self.channel)
            .field("connected", &state.connected)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl<T: Send + 'static> Collector for WriteCollector<T> {
    fn connection(&self) -> bool {
        lock(&self.state).connected
    }

    fn set_update_listener(&self, listener: Option<UpdateListener>) {
        lock(&self.state).listener = listener;
    }
}

impl<T: Send + 'static> WriteRequests for WriteCollector<T> {
    fn prepare_write(&self, id: WriteId) {
        let mut state = lock(&self.state);
        state.current = Some(id);
        state.pending.insert(id, None);
    }

    fn cancel_write(&self, id: WriteId) {
        let mut state = lock(&self.state);
        state.pending.remove(&id);
        if state.current == Some(id) {
            state.current = None;
        }
    }

    fn send_write_request(&self, id: WriteId, callback: WriteCallback) {
        let (value, handler) = {
            let mut state = lock(&self.state);
            if state.current == Some(id) {
                state.current = None;
            }
            (state.pending.remove(&id).flatten(), state.handler.clone())
        };
        match (value, handler) {
            // Nothing to write on this channel for this transaction.
            (None, _) => callback(Event::write_succeeded()),
            (Some(_), None) => {
                debug!("No write handler for {}.", self.channel);
                callback(Event::write_failed(Error::Disconnected(
                    self.channel.clone(),
                )))
            }
            (Some(value), Some(handler)) => handler(value, callback),
        }
    }
}
