// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Rate decoupling
//!
//! The [`RateDecoupler`] converts *source-rate* events, produced by collectors
//! whenever a data source delivers something, into *desired-rate* events
//! delivered to a single downstream listener (the director of a
//! subscription).
//!
//! The decoupler enforces four things:
//!
//! - **Single flight**: at most one desired-rate event is in flight. An event
//!   is in flight from the moment it is sent downstream until the consumer
//!   calls [`RateDecoupler::ready_for_next_event`].
//! - **Maximum rate**: how often events are emitted is decided by the scan
//!   strategy, bounded by the configured maximum duration.
//! - **Pause / resume**: while paused no new scans are scheduled; whatever is
//!   already in flight still completes.
//! - **Stop**: permanent. Queued events are discarded, repeating scans are
//!   cancelled and the downstream listener is released.
//!
//! ## Lifecycle
//!
//! ```text
//! Created --start--> Running --pause--> Paused --resume--> Running
//!    |                  |                  |
//!    +------------------+------stop--------+-----> Stopped (terminal)
//! ```
//!
//! `pause` and `resume` warn when the decoupler already is in the requested
//! state, but are otherwise idempotent.
//!
//! ## Strategies
//!
//! *When* events are emitted is delegated to a [`ScanStrategy`]. Two are
//! provided in the [`scan`](crate::scan) module:
//!
//! - [`PassiveScan`]: coalesces every source event into one pending event and
//!   emits it no sooner than the maximum duration after the previous
//!   emission. Nothing is emitted when nothing happened.
//! - [`ActiveScan`]: samples at a fixed period whether or not anything
//!   happened. Used when the read function depends on wall-clock time.
//!
//! ## Protocol violations
//!
//! Sending a desired-rate event while another one is in flight means the
//! strategy itself is broken. This is never recovered from: the violation is
//! logged at error level, [`Error::Protocol`] is returned and the event is not
//! forwarded.
//!
//! [`PassiveScan`]: crate::scan::PassiveScan
//! [`ActiveScan`]: crate::scan::ActiveScan

use crate::{
    Error, Event, UpdateListener,
    executor::{Scheduler, isolate},
    lock,
    scan::{ActiveScan, PassiveScan, ScanMode, ScanStrategy},
};

use tokio::time::Duration;
use tracing::{debug, error, warn};

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

/// Downstream listener receiving desired-rate events.
pub type DesiredRateListener = Arc<dyn Fn(Event) + Send + Sync>;

/// Out-of-band handler for read errors carried by source-rate events.
pub type ExceptionHandler = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Debug, Default)]
struct Lifecycle {
    started: bool,
    paused: bool,
    stopped: bool,
}

struct DecouplerInner {
    /// Minimum time between two emitted events.
    max_duration: Duration,
    /// Runs the scans.
    scheduler: Scheduler,
    /// Lifecycle flags.
    lifecycle: Mutex<Lifecycle>,
    /// Set while a desired-rate event is being processed downstream.
    event_processing: AtomicBool,
    /// Downstream listener, released on stop.
    listener: Mutex<Option<DesiredRateListener>>,
    /// Optional handler for read errors, invoked at source rate.
    exception_handler: Option<ExceptionHandler>,
    /// Scheduling strategy.
    strategy: Box<dyn ScanStrategy>,
}

/// Scheduling engine turning source-rate events into desired-rate events.
///
/// Cloning is cheap and every clone drives the same decoupler.
#[derive(Clone)]
pub struct RateDecoupler {
    inner: Arc<DecouplerInner>,
}

impl RateDecoupler {
    /// Creates a decoupler in the `Created` state.
    ///
    /// # Arguments
    ///
    /// * `mode` - Scan strategy to use.
    /// * `max_duration` - Minimum time between emitted events for the passive
    ///   strategy, sampling period for the active one.
    /// * `scheduler` - Where the scans run.
    /// * `listener` - Receives the desired-rate events.
    /// * `exception_handler` - Optional handler for read errors, invoked
    ///   synchronously on every source-rate event that carries one.
    ///
    pub fn new(
        mode: ScanMode,
        max_duration: Duration,
        scheduler: Scheduler,
        listener: DesiredRateListener,
        exception_handler: Option<ExceptionHandler>,
    ) -> Self {
        debug!("Creating new {:?} rate decoupler.", mode);
        let strategy: Box<dyn ScanStrategy> = match mode {
            ScanMode::Passive => Box::new(PassiveScan::new()),
            ScanMode::Active => Box::new(ActiveScan::new()),
        };
        Self::with_strategy(
            strategy,
            max_duration,
            scheduler,
            listener,
            exception_handler,
        )
    }

    /// Creates a decoupler driven by a custom strategy.
    pub fn with_strategy(
        strategy: Box<dyn ScanStrategy>,
        max_duration: Duration,
        scheduler: Scheduler,
        listener: DesiredRateListener,
        exception_handler: Option<ExceptionHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(DecouplerInner {
                max_duration,
                scheduler,
                lifecycle: Mutex::new(Lifecycle::default()),
                event_processing: AtomicBool::new(false),
                listener: Mutex::new(Some(listener)),
                exception_handler,
                strategy,
            }),
        }
    }

    /// Maximum notification duration.
    pub fn max_duration(&self) -> Duration {
        self.inner.max_duration
    }

    /// Scheduler running the scans.
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Starts the decoupler. Only the first call has an effect.
    pub fn start(&self) {
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if lifecycle.stopped {
                warn!("Rate decoupler is stopped and can not be started.");
                return;
            }
            if lifecycle.started {
                warn!("Rate decoupler already started.");
                return;
            }
            lifecycle.started = true;
        }
        debug!("Rate decoupler started.");
        self.inner.strategy.on_start(self);
    }

    /// Suspends the scheduling of new scans.
    pub fn pause(&self) {
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if lifecycle.stopped {
                return;
            }
            if lifecycle.paused {
                warn!("Rate decoupler is already paused.");
            }
            lifecycle.paused = true;
        }
        debug!("Rate decoupler paused.");
        self.inner.strategy.on_pause(self);
    }

    /// Resumes scheduling. Anything queued while paused is scheduled right
    /// away.
    pub fn resume(&self) {
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if lifecycle.stopped {
                return;
            }
            if !lifecycle.paused {
                warn!("Rate decoupler is not paused.");
            }
            lifecycle.paused = false;
        }
        debug!("Rate decoupler resumed.");
        self.inner.strategy.on_resume(self);
    }

    /// Stops the decoupler for good and releases the downstream listener.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] when the strategy detects a lifecycle bug,
    /// such as stopping an active scan that was never started.
    pub fn stop(&self) -> Result<(), Error> {
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if lifecycle.stopped {
                return Ok(());
            }
            lifecycle.stopped = true;
        }
        lock(&self.inner.listener).take();
        debug!("Rate decoupler stopped.");
        self.inner.strategy.on_stop(self)
    }

    /// True once started.
    pub fn is_started(&self) -> bool {
        lock(&self.inner.lifecycle).started
    }

    /// True while paused.
    pub fn is_paused(&self) -> bool {
        lock(&self.inner.lifecycle).paused
    }

    /// True once stopped.
    pub fn is_stopped(&self) -> bool {
        lock(&self.inner.lifecycle).stopped
    }

    /// True while a desired-rate event is in flight.
    pub fn is_event_processing(&self) -> bool {
        self.inner.event_processing.load(Ordering::SeqCst)
    }

    /// Listener to install on collectors.
    ///
    /// Every event is handed to the strategy. When an exception handler was
    /// supplied and the event carries a read error, the handler is then
    /// invoked in isolation: a panic inside it is logged and swallowed.
    pub fn update_listener(&self) -> UpdateListener {
        let decoupler = self.clone();
        Arc::new(move |event: Event| {
            let error = event.error().cloned();
            decoupler.inner.strategy.new_event(&decoupler, event);
            if let (Some(handler), Some(error)) =
                (&decoupler.inner.exception_handler, error)
            {
                isolate("Exception handler", || handler(&error));
            }
        })
    }

    /// Runs one scan of the strategy. Called by the tasks the strategy
    /// schedules.
    pub fn run_scan(&self) {
        self.inner.strategy.scan(self);
    }

    /// Sends `event` downstream and marks it in flight.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if an event is already in flight. The event
    /// is not forwarded in that case.
    pub fn send_desired_rate_event(&self, event: Event) -> Result<(), Error> {
        if self
            .inner
            .event_processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            error!(
                "Desired rate event {:?} sent while the previous one is still in flight!",
                event.kinds()
            );
            return Err(Error::Protocol(
                "desired rate event already in flight".to_owned(),
            ));
        }
        let listener = lock(&self.inner.listener).clone();
        match listener {
            Some(listener) => {
                if isolate("Desired rate listener", || listener(event)).is_none() {
                    self.ready_for_next_event();
                }
            }
            None => {
                debug!("Rate decoupler without listener, event dropped.");
                self.inner.event_processing.store(false, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Signals that the downstream consumer finished processing the last
    /// event, letting the strategy schedule the next one.
    pub fn ready_for_next_event(&self) {
        if !self.inner.event_processing.swap(false, Ordering::SeqCst) {
            warn!("Ready for next event signalled with no event in flight.");
        }
        self.inner.strategy.on_desired_event_processed(self);
    }
}
