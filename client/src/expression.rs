// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Expressions
//!
//! An expression describes *what* a subscription reads or writes. It owns
//! the collectors for its channels and knows how to turn their content into
//! the value handed to the user (the read function) or how to decompose a
//! user value into per-channel writes (the write function).
//!
//! Expressions are started and stopped through an [`ExpressionContext`],
//! which is shared with the director of the subscription. Through it an
//! expression:
//!
//! - registers its collectors, wiring them to the rate decoupler;
//! - reaches the data source serving its channels;
//! - connects or disconnects further expressions while the subscription is
//!   running.
//!
//! The traits are split in two layers. [`ReadSource`] and [`WriteTarget`]
//! are the object-safe lifecycle hooks the context keeps track of;
//! [`ReadExpression`] and [`WriteExpression`] add the typed read and write
//! functions used by the director.

use crate::{
    Collector, DataSource, Error, Event, UpdateListener, WriteRequests, lock,
};

use tracing::{debug, warn};

use std::sync::{Arc, Mutex};

/// Lifecycle hooks of the read side of an expression.
pub trait ReadSource: Send + Sync + 'static {
    /// Registers collectors and subscribes to the data source.
    fn start_read(&self, context: &ExpressionContext);

    /// Undoes [`ReadSource::start_read`].
    fn stop_read(&self, context: &ExpressionContext);

    /// True if the value depends on wall-clock time rather than only on
    /// source events. Such expressions are sampled periodically.
    fn is_time_dependent(&self) -> bool {
        false
    }

    /// True if reading consumes what was buffered, so that two equal reads
    /// still carry different data and must both be notified.
    fn is_draining(&self) -> bool {
        false
    }
}

/// Read side of an expression.
pub trait ReadExpression: ReadSource {
    type Output: Send + 'static;

    /// Computes the current value from the collectors.
    ///
    /// # Errors
    ///
    /// A recoverable failure. The notification carries it as an exception
    /// and the previous value is kept.
    fn read(&self) -> Result<Self::Output, Error>;
}

/// Lifecycle hooks of the write side of an expression.
pub trait WriteTarget: Send + Sync + 'static {
    /// Registers write collectors and subscribes to the data source.
    fn start_write(&self, context: &ExpressionContext);

    /// Undoes [`WriteTarget::start_write`].
    fn stop_write(&self, context: &ExpressionContext);
}

/// Write side of an expression.
pub trait WriteExpression: WriteTarget {
    type Input: Send + 'static;

    /// Decomposes `value` into per-channel values queued on the write
    /// collectors of the transaction being prepared.
    ///
    /// # Errors
    ///
    /// The write is cancelled on every collector and reported as failed.
    fn write(&self, value: Self::Input) -> Result<(), Error>;
}

#[derive(Default)]
struct Members {
    read_collectors: Vec<Arc<dyn Collector>>,
    write_collectors: Vec<Arc<dyn WriteRequests>>,
    read_expressions: Vec<Arc<dyn ReadSource>>,
    write_expressions: Vec<Arc<dyn WriteTarget>>,
    closed: bool,
}

struct ContextInner {
    data_source: Arc<dyn DataSource>,
    update_listener: UpdateListener,
    members: Mutex<Members>,
}

/// Membership of a running subscription.
///
/// Cloning is cheap; every clone refers to the same membership.
#[derive(Clone)]
pub struct ExpressionContext {
    inner: Arc<ContextInner>,
}

impl ExpressionContext {
    /// Creates an empty context. Every registered collector is wired to
    /// `update_listener`.
    pub fn new(
        data_source: Arc<dyn DataSource>,
        update_listener: UpdateListener,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                data_source,
                update_listener,
                members: Mutex::new(Members::default()),
            }),
        }
    }

    /// Data source serving the channels of this subscription.
    pub fn data_source(&self) -> &Arc<dyn DataSource> {
        &self.inner.data_source
    }

    /// Injects `event` as if a collector had fired it.
    pub fn report(&self, event: Event) {
        (self.inner.update_listener)(event);
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        lock(&self.inner.members).closed
    }

    /// Wires `collector` to the update listener and counts its connection
    /// flag towards the read connection.
    pub fn register_collector(&self, collector: Arc<dyn Collector>) {
        {
            let mut members = lock(&self.inner.members);
            if members.closed {
                debug!("Collector registered on a closed subscription, ignored.");
                return;
            }
            if members
                .read_collectors
                .iter()
                .any(|c| std::ptr::addr_eq(Arc::as_ptr(c), Arc::as_ptr(&collector)))
            {
                return;
            }
            members.read_collectors.push(collector.clone());
        }
        collector.set_update_listener(Some(self.inner.update_listener.clone()));
    }

    /// Unwires `collector`.
    pub fn deregister_collector(&self, collector: &dyn Collector) {
        let removed = {
            let mut members = lock(&self.inner.members);
            let before = members.read_collectors.len();
            members
                .read_collectors
                .retain(|c| !std::ptr::addr_eq(Arc::as_ptr(c), collector));
            before != members.read_collectors.len()
        };
        if removed {
            collector.set_update_listener(None);
        }
    }

    /// Wires `collector` to the update listener and counts its connection
    /// flag towards the write connection. It takes part in every write.
    pub fn register_write_collector(&self, collector: Arc<dyn WriteRequests>) {
        {
            let mut members = lock(&self.inner.members);
            if members.closed {
                debug!(
                    "Write collector registered on a closed subscription, ignored."
                );
                return;
            }
            if members
                .write_collectors
                .iter()
                .any(|c| std::ptr::addr_eq(Arc::as_ptr(c), Arc::as_ptr(&collector)))
            {
                return;
            }
            members.write_collectors.push(collector.clone());
        }
        collector.set_update_listener(Some(self.inner.update_listener.clone()));
    }

    /// Unwires `collector`.
    pub fn deregister_write_collector(&self, collector: &dyn WriteRequests) {
        let removed = {
            let mut members = lock(&self.inner.members);
            let before = members.write_collectors.len();
            members
                .write_collectors
                .retain(|c| !std::ptr::addr_eq(Arc::as_ptr(c), collector));
            before != members.write_collectors.len()
        };
        if removed {
            collector.set_update_listener(None);
        }
    }

    /// Starts `expression` and tracks it until it is disconnected or the
    /// context is closed.
    pub fn connect_read_expression(&self, expression: Arc<dyn ReadSource>) {
        {
            let mut members = lock(&self.inner.members);
            if members.closed {
                debug!("Read expression connected to a closed subscription, ignored.");
                return;
            }
            members.read_expressions.push(expression.clone());
        }
        expression.start_read(self);
    }

    /// Stops `expression`. Warns if it is not tracked.
    pub fn disconnect_read_expression(&self, expression: &Arc<dyn ReadSource>) {
        let found = {
            let mut members = lock(&self.inner.members);
            let position = members
                .read_expressions
                .iter()
                .position(|e| Arc::ptr_eq(e, expression));
            position.map(|i| members.read_expressions.remove(i))
        };
        match found {
            Some(expression) => expression.stop_read(self),
            None => warn!("Disconnecting a read expression that is not connected."),
        }
    }

    /// Starts `expression` and tracks it until it is disconnected or the
    /// context is closed.
    pub fn connect_write_expression(&self, expression: Arc<dyn WriteTarget>) {
        {
            let mut members = lock(&self.inner.members);
            if members.closed {
                debug!(
                    "Write expression connected to a closed subscription, ignored."
                );
                return;
            }
            members.write_expressions.push(expression.clone());
        }
        expression.start_write(self);
    }

    /// Stops `expression`. Warns if it is not tracked.
    pub fn disconnect_write_expression(&self, expression: &Arc<dyn WriteTarget>) {
        let found = {
            let mut members = lock(&self.inner.members);
            let position = members
                .write_expressions
                .iter()
                .position(|e| Arc::ptr_eq(e, expression));
            position.map(|i| members.write_expressions.remove(i))
        };
        match found {
            Some(expression) => expression.stop_write(self),
            None => warn!("Disconnecting a write expression that is not connected."),
        }
    }

    /// AND of the connection flags of every read collector.
    pub fn read_connection(&self) -> bool {
        lock(&self.inner.members)
            .read_collectors
            .iter()
            .all(|c| c.connection())
    }

    /// AND of the connection flags of every write collector.
    pub fn write_connection(&self) -> bool {
        lock(&self.inner.members)
            .write_collectors
            .iter()
            .all(|c| c.connection())
    }

    /// Snapshot of the write collectors.
    pub fn write_collectors(&self) -> Vec<Arc<dyn WriteRequests>> {
        lock(&self.inner.members).write_collectors.clone()
    }

    /// Stops every tracked expression, last connected first, and unwires
    /// whatever collectors are left. Idempotent.
    pub fn close(&self) {
        let (reads, writes) = {
            let mut members = lock(&self.inner.members);
            if members.closed {
                return;
            }
            members.closed = true;
            (
                std::mem::take(&mut members.read_expressions),
                std::mem::take(&mut members.write_expressions),
            )
        };
        for expression in reads.iter().rev() {
            expression.stop_read(self);
        }
        for expression in writes.iter().rev() {
            expression.stop_write(self);
        }
        let (read_collectors, write_collectors) = {
            let mut members = lock(&self.inner.members);
            (
                std::mem::take(&mut members.read_collectors),
                std::mem::take(&mut members.write_collectors),
            )
        };
        for collector in read_collectors {
            collector.set_update_listener(None);
        }
        for collector in write_collectors {
            collector.set_update_listener(None);
        }
    }
}

/// Read expression transformed by an infallible function.
pub struct Map<E, F> {
    inner: E,
    function: F,
}

impl<E, F, U> ReadSource for Map<E, F>
where
    E: ReadExpression,
    F: Fn(E::Output) -> U + Send + Sync + 'static,
{
    fn start_read(&self, context: &ExpressionContext) {
        self.inner.start_read(context);
    }

    fn stop_read(&self, context: &ExpressionContext) {
        self.inner.stop_read(context);
    }

    fn is_time_dependent(&self) -> bool {
        self.inner.is_time_dependent()
    }

    fn is_draining(&self) -> bool {
        self.inner.is_draining()
    }
}

impl<E, F, U> ReadExpression for Map<E, F>
where
    E: ReadExpression,
    F: Fn(E::Output) -> U + Send + Sync + 'static,
    U: Send + 'static,
{
    type Output = U;

    fn read(&self) -> Result<U, Error> {
        self.inner.read().map(&self.function)
    }
}

/// Read expression transformed by a fallible function.
pub struct TryMap<E, F> {
    inner: E,
    function: F,
}

impl<E, F, U> ReadSource for TryMap<E, F>
where
    E: ReadExpression,
    F: Fn(E::Output) -> Result<U, Error> + Send + Sync + 'static,
{
    fn start_read(&self, context: &ExpressionContext) {
        self.inner.start_read(context);
    }

    fn stop_read(&self, context: &ExpressionContext) {
        self.inner.stop_read(context);
    }

    fn is_time_dependent(&self) -> bool {
        self.inner.is_time_dependent()
    }

    fn is_draining(&self) -> bool {
        self.inner.is_draining()
    }
}

impl<E, F, U> ReadExpression for TryMap<E, F>
where
    E: ReadExpression,
    F: Fn(E::Output) -> Result<U, Error> + Send + Sync + 'static,
    U: Send + 'static,
{
    type Output = U;

    fn read(&self) -> Result<U, Error> {
        self.inner.read().and_then(&self.function)
    }
}

/// Adapters on read expressions.
pub trait ReadExpressionExt: ReadExpression + Sized {
    /// Applies `function` to every value read.
    fn map<F, U>(self, function: F) -> Map<Self, F>
    where
        F: Fn(Self::Output) -> U + Send + Sync + 'static,
    {
        Map {
            inner: self,
            function,
        }
    }

    /// Applies `function` to every value read. An error becomes the
    /// exception of the notification.
    fn try_map<F, U>(self, function: F) -> TryMap<Self, F>
    where
        F: Fn(Self::Output) -> Result<U, Error> + Send + Sync + 'static,
    {
        TryMap {
            inner: self,
            function,
        }
    }
}

impl<E: ReadExpression> ReadExpressionExt for E {}
