// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Data sources
//!
//! A [`DataSource`] connects collectors to the outside world. Expressions
//! hand it one subscription per channel; the data source then pushes values
//! and connection changes into the subscription's collector from whatever
//! thread its transport runs on.
//!
//! Data sources never see the rate decoupler or the handle. Everything they
//! need to know is in the subscription.

use crate::{Error, ReadCollector, Value, WriteCollector};

use std::{fmt, sync::Arc};

/// Read interest of one expression in one channel.
#[derive(Clone)]
pub struct ReadSubscription {
    channel: String,
    collector: Arc<dyn ReadCollector<Value>>,
}

impl ReadSubscription {
    pub fn new(channel: &str, collector: Arc<dyn ReadCollector<Value>>) -> Self {
        Self {
            channel: channel.to_owned(),
            collector,
        }
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Collector receiving the updates.
    pub fn collector(&self) -> &Arc<dyn ReadCollector<Value>> {
        &self.collector
    }

    /// True if both subscriptions feed the same collector.
    pub fn same_collector(&self, other: &ReadSubscription) -> bool {
        std::ptr::addr_eq(
            Arc::as_ptr(&self.collector),
            Arc::as_ptr(&other.collector),
        )
    }
}

impl fmt::Debug for ReadSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadSubscription")
            .field("channel", &self.channel)
            .finish()
    }
}

/// Write interest of one expression in one channel.
#[derive(Clone)]
pub struct WriteSubscription {
    channel: String,
    collector: Arc<WriteCollector<Value>>,
}

impl WriteSubscription {
    pub fn new(channel: &str, collector: Arc<WriteCollector<Value>>) -> Self {
        Self {
            channel: channel.to_owned(),
            collector,
        }
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Collector the data source installs its write handler on.
    pub fn collector(&self) -> &Arc<WriteCollector<Value>> {
        &self.collector
    }

    /// True if both subscriptions use the same collector.
    pub fn same_collector(&self, other: &WriteSubscription) -> bool {
        Arc::ptr_eq(&self.collector, &other.collector)
    }
}

impl fmt::Debug for WriteSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteSubscription")
            .field("channel", &self.channel)
            .finish()
    }
}

/// Connection to live channels.
///
/// Implementations must be cheap to call: the start and stop methods run on
/// the thread opening or closing a subscription.
pub trait DataSource: Send + Sync + 'static {
    /// Starts delivering `subscription.channel()` to its collector.
    ///
    /// # Errors
    ///
    /// Returns an error when the channel can not be served at all, for
    /// instance a malformed or unknown name. The error is reported to the
    /// subscription as an exception.
    fn start_read(&self, subscription: ReadSubscription) -> Result<(), Error>;

    /// Stops delivering to the collector of `subscription`.
    fn stop_read(&self, subscription: &ReadSubscription);

    /// Installs a write handler on the collector of `subscription` and keeps
    /// its write connection flag current.
    ///
    /// # Errors
    ///
    /// Returns an error when the channel can not be written at all.
    fn start_write(&self, subscription: WriteSubscription) -> Result<(), Error>;

    /// Removes the write handler of `subscription`.
    fn stop_write(&self, subscription: &WriteSubscription);
}
