// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Channel expressions.

use crate::{
    AllValuesCollector, Error, Event, ExpressionContext, LatestValueCollector,
    ReadCollector, ReadExpression, ReadSource, ReadSubscription, Value,
    WriteCollector, WriteExpression, WriteSubscription, WriteTarget, lock,
};

use tracing::debug;

use std::{
    sync::{Arc, Mutex},
    time::SystemTime,
};

/// Latest value of one channel. Also writable.
pub struct Channel {
    name: String,
    collector: Arc<LatestValueCollector<Value>>,
    write_collector: Arc<WriteCollector<Value>>,
    read_subscription: Mutex<Option<ReadSubscription>>,
    write_subscription: Mutex<Option<WriteSubscription>>,
}

/// Expression reading the latest value of `name`, or writing to it.
pub fn channel(name: &str) -> Channel {
    Channel {
        name: name.to_owned(),
        collector: Arc::new(LatestValueCollector::new()),
        write_collector: Arc::new(WriteCollector::new(name)),
        read_subscription: Mutex::new(None),
        write_subscription: Mutex::new(None),
    }
}

impl Channel {
    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Registers `collector` and opens its subscription, reporting a refusal of
/// the data source as an exception.
fn open_read<C: ReadCollector<Value>>(
    context: &ExpressionContext,
    slot: &Mutex<Option<ReadSubscription>>,
    name: &str,
    collector: &Arc<C>,
) {
    context.register_collector(collector.clone());
    let subscription = ReadSubscription::new(name, collector.clone());
    *lock(slot) = Some(subscription.clone());
    debug!("Opening read subscription on {}.", name);
    if let Err(error) = context.data_source().start_read(subscription) {
        context.report(Event::exception(error));
    }
}

fn close_read<C: ReadCollector<Value>>(
    context: &ExpressionContext,
    slot: &Mutex<Option<ReadSubscription>>,
    collector: &C,
) {
    let subscription = lock(slot).take();
    if let Some(subscription) = subscription {
        context.data_source().stop_read(&subscription);
        context.deregister_collector(collector);
    }
}

impl ReadSource for Channel {
    fn start_read(&self, context: &ExpressionContext) {
        open_read(context, &self.read_subscription, &self.name, &self.collector);
    }

    fn stop_read(&self, context: &ExpressionContext) {
        close_read(context, &self.read_subscription, &*self.collector);
    }
}

impl ReadExpression for Channel {
    type Output = Option<Value>;

    fn read(&self) -> Result<Option<Value>, Error> {
        Ok(self.collector.value())
    }
}

impl WriteTarget for Channel {
    fn start_write(&self, context: &ExpressionContext) {
        context.register_write_collector(self.write_collector.clone());
        let subscription =
            WriteSubscription::new(&self.name, self.write_collector.clone());
        *lock(&self.write_subscription) = Some(subscription.clone());
        debug!("Opening write subscription on {}.", self.name);
        if let Err(error) = context.data_source().start_write(subscription) {
            context.report(Event::exception(error));
        }
    }

    fn stop_write(&self, context: &ExpressionContext) {
        let subscription = lock(&self.write_subscription).take();
        if let Some(subscription) = subscription {
            context.data_source().stop_write(&subscription);
            context.deregister_write_collector(&*self.write_collector);
        }
    }
}

impl WriteExpression for Channel {
    type Input = Value;

    fn write(&self, value: Value) -> Result<(), Error> {
        self.write_collector.queue_value(value);
        Ok(())
    }
}

/// Every value of one channel since the last notification.
pub struct Queue {
    name: String,
    collector: Arc<AllValuesCollector<Value>>,
    subscription: Mutex<Option<ReadSubscription>>,
}

/// Expression reading every value received on `name`.
pub fn queue(name: &str) -> Queue {
    Queue {
        name: name.to_owned(),
        collector: Arc::new(AllValuesCollector::new()),
        subscription: Mutex::new(None),
    }
}

impl ReadSource for Queue {
    fn start_read(&self, context: &ExpressionContext) {
        open_read(context, &self.subscription, &self.name, &self.collector);
    }

    fn stop_read(&self, context: &ExpressionContext) {
        close_read(context, &self.subscription, &*self.collector);
    }

    fn is_draining(&self) -> bool {
        true
    }
}

impl ReadExpression for Queue {
    type Output = Vec<Value>;

    fn read(&self) -> Result<Vec<Value>, Error> {
        Ok(self.collector.values())
    }
}

/// Latest values of a list of channels, in order.
pub struct Channels {
    channels: Vec<Channel>,
}

/// Expression reading or writing several channels at once.
pub fn channels(names: &[&str]) -> Channels {
    Channels {
        channels: names.iter().map(|name| channel(name)).collect(),
    }
}

impl ReadSource for Channels {
    fn start_read(&self, context: &ExpressionContext) {
        for channel in &self.channels {
            channel.start_read(context);
        }
    }

    fn stop_read(&self, context: &ExpressionContext) {
        for channel in &self.channels {
            channel.stop_read(context);
        }
    }
}

impl ReadExpression for Channels {
    type Output = Vec<Option<Value>>;

    fn read(&self) -> Result<Vec<Option<Value>>, Error> {
        self.channels.iter().map(|channel| channel.read()).collect()
    }
}

impl WriteTarget for Channels {
    fn start_write(&self, context: &ExpressionContext) {
        for channel in &self.channels {
            channel.start_write(context);
        }
    }

    fn stop_write(&self, context: &ExpressionContext) {
        for channel in &self.channels {
            channel.stop_write(context);
        }
    }
}

impl WriteExpression for Channels {
    type Input = Vec<Value>;

    fn write(&self, values: Vec<Value>) -> Result<(), Error> {
        if values.len() != self.channels.len() {
            return Err(Error::Write(format!(
                "{} values for {} channels",
                values.len(),
                self.channels.len()
            )));
        }
        for (channel, value) in self.channels.iter().zip(values) {
            channel.write(value)?;
        }
        Ok(())
    }
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct Now;

/// Expression reading the current time. Being time dependent, it is sampled
/// periodically instead of waiting for source events.
pub fn now() -> Now {
    Now
}

impl ReadSource for Now {
    fn start_read(&self, _context: &ExpressionContext) {}

    fn stop_read(&self, _context: &ExpressionContext) {}

    fn is_time_dependent(&self) -> bool {
        true
    }
}

impl ReadExpression for Now {
    type Output = SystemTime;

    fn read(&self) -> Result<SystemTime, Error> {
        Ok(SystemTime::now())
    }
}
