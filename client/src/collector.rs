// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Collectors
//!
//! A collector is the buffer between a data source and the rate decoupler.
//! Data sources push raw updates into it from their own threads, at their own
//! rate; the read function pulls the buffered state out when a notification
//! is computed.
//!
//! Two buffering policies are provided:
//!
//! - [`LatestValueCollector`] keeps only the newest value. This is the right
//!   choice when the consumer only cares about the current state.
//! - [`AllValuesCollector`] queues every value received since the last read.
//!   Reading drains the queue, so a consumer never sees the same value twice.
//!
//! Every mutation happens under the collector's lock. The registered update
//! listener is captured under the lock and invoked after it is released, so a
//! listener may call back into the collector without deadlocking.

use crate::{Event, lock};

use std::{fmt, sync::Arc, sync::Mutex};

/// Callback invoked by a collector on every update.
pub type UpdateListener = Arc<dyn Fn(Event) + Send + Sync>;

/// Connection state and listener wiring shared by every collector.
pub trait Collector: Send + Sync + 'static {
    /// Current connection flag.
    fn connection(&self) -> bool;

    /// Replaces the update listener. `None` unwires the collector.
    fn set_update_listener(&self, listener: Option<UpdateListener>);
}

/// Update side of a read collector, as seen by data sources.
pub trait ReadCollector<T>: Collector {
    /// Stores a new value and fires a `Value` event.
    fn update_value(&self, value: T);

    /// Sets the connection flag and fires a `ReadConnection` event.
    fn update_connection(&self, connected: bool);

    /// Stores a new value, sets the connection flag and fires a combined
    /// `ReadConnection + Value` event.
    fn update_value_and_connection(&self, value: T, connected: bool);
}

struct CollectorState<B> {
    buffer: B,
    connected: bool,
    listener: Option<UpdateListener>,
}

impl<B: Default> Default for CollectorState<B> {
    fn default() -> Self {
        Self {
            buffer: B::default(),
            connected: false,
            listener: None,
        }
    }
}

/// Runs `mutate` under the lock, then notifies the listener outside of it.
fn update_and_notify<B>(
    state: &Mutex<CollectorState<B>>,
    event: Event,
    mutate: impl FnOnce(&mut CollectorState<B>),
) {
    let listener = {
        let mut state = lock(state);
        mutate(&mut state);
        state.listener.clone()
    };
    if let Some(listener) = listener {
        listener(event);
    }
}

/// Collector that keeps only the most recent value.
pub struct LatestValueCollector<T> {
    state: Mutex<CollectorState<Option<T>>>,
}

impl<T> LatestValueCollector<T> {
    /// Creates an empty, disconnected collector.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CollectorState::default()),
        }
    }
}

impl<T: Clone> LatestValueCollector<T> {
    /// Latest value received, if any.
    pub fn value(&self) -> Option<T> {
        lock(&self.state).buffer.clone()
    }
}

impl<T> Default for LatestValueCollector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for LatestValueCollector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatestValueCollector")
            .field("connected", &lock(&self.state).connected)
            .finish()
    }
}

impl<T: Send + 'static> Collector for LatestValueCollector<T> {
    fn connection(&self) -> bool {
        lock(&self.state).connected
    }

    fn set_update_listener(&self, listener: Option<UpdateListener>) {
        lock(&self.state).listener = listener;
    }
}

impl<T: Send + 'static> ReadCollector<T> for LatestValueCollector<T> {
    fn update_value(&self, value: T) {
        update_and_notify(&self.state, Event::value(), |state| {
            state.buffer = Some(value);
        });
    }

    fn update_connection(&self, connected: bool) {
        update_and_notify(&self.state, Event::read_connection(), |state| {
            state.connected = connected;
        });
    }

    fn update_value_and_connection(&self, value: T, connected: bool) {
        update_and_notify(
            &self.state,
            Event::read_connection_and_value(),
            |state| {
                state.buffer = Some(value);
                state.connected = connected;
            },
        );
    }
}

/// Collector that queues every value received since the last read.
pub struct AllValuesCollector<T> {
    state: Mutex<CollectorState<Vec<T>>>,
}

impl<T> AllValuesCollector<T> {
    /// Creates an empty, disconnected collector.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CollectorState::default()),
        }
    }

    /// Drains the queue. A second call without intervening updates returns
    /// an empty vector.
    pub fn values(&self) -> Vec<T> {
        std::mem::take(&mut lock(&self.state).buffer)
    }

    /// Number of queued values.
    pub fn len(&self) -> usize {
        lock(&self.state).buffer.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for AllValuesCollector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for AllValuesCollector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("AllValuesCollector")
            .field("connected", &state.connected)
            .field("queued", &state.buffer.len())
            .finish()
    }
}

impl<T: Send + 'static> Collector for AllValuesCollector<T> {
    fn connection(&self) -> bool {
        lock(&self.state).connected
    }

    fn set_update_listener(&self, listener: Option<UpdateListener>) {
        lock(&self.state).listener = listener;
    }
}

impl<T: Send + 'static> ReadCollector<T> for AllValuesCollector<T> {
    fn update_value(&self, value: T) {
        update_and_notify(&self.state, Event::value(), |state| {
            state.buffer.push(value);
        });
    }

    fn update_connection(&self, connected: bool) {
        update_and_notify(&self.state, Event::read_connection(), |state| {
            state.connected = connected;
        });
    }

    fn update_value_and_connection(&self, value: T, connected: bool) {
        update_and_notify(
            &self.state,
            Event::read_connection_and_value(),
            |state| {
                state.buffer.push(value);
                state.connected = connected;
            },
        );
    }
}
