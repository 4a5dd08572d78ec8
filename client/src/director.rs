// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Director
//!
//! The director orchestrates one subscription. It sits between the rate
//! decoupler and the handle:
//!
//! ```text
//! collectors --> RateDecoupler --> Director::notify_pv --> Executor --> Pv listeners
//!                                        |
//!                     Pv::write --> Director::submit_write --> WriteCollectors
//! ```
//!
//! ## Notification protocol
//!
//! Every desired-rate event goes through the same steps:
//!
//! 1. **Protocol check.** A second notification while one is in flight is a
//!    bug in the decoupler and is logged at error level.
//! 2. **Value.** If the event carries `Value`, the read function runs. A
//!    recoverable failure strips `Value` and merges an `Exception`; a panic is
//!    logged and the decoupler is released without notifying.
//! 3. **Read connection.** The AND of every read collector. Once connected,
//!    a pending timeout error is retracted.
//! 4. **Write connection.** The AND of every write collector.
//! 5. **Deduplication.** Kinds whose payload did not change since the last
//!    notification are removed.
//! 6. **Empty event.** Nothing left: the decoupler is released right away.
//! 7. **Dispatch.** The new snapshot is stored and a task is handed to the
//!    notification executor. The task updates the handle and runs its
//!    listeners, then always releases the decoupler.
//!
//! ## Lifetime
//!
//! The director only holds a weak reference to its handle. When the handle
//! is dropped without being closed, the next event closes the subscription
//! and logs where the handle was created.

use crate::{
    DataSource, Error, Event, EventKind, ExpressionContext, RateDecoupler,
    WriteBarrier, WriteCallback, WriteId,
    decoupler::ExceptionHandler,
    executor::{Executor, Scheduler, isolate},
    lock,
    pv::PvShared,
    registry::{Subscription, WeakRegistry},
    scan::ScanMode,
};

use tokio::time::Duration;
use tracing::{debug, error, warn};

use std::{
    panic::Location,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

/// Read function of a subscription.
pub(crate) type ReadFunction<R> = Arc<dyn Fn() -> Result<R, Error> + Send + Sync>;

/// Write function of a subscription.
pub(crate) type WriteFunction<W> =
    Arc<dyn Fn(W) -> Result<(), Error> + Send + Sync>;

/// Everything a director is built from.
pub(crate) struct DirectorSetup<R, W> {
    pub read_function: Option<ReadFunction<R>>,
    pub write_function: Option<WriteFunction<W>>,
    pub data_source: Arc<dyn DataSource>,
    pub executor: Arc<dyn Executor>,
    pub scheduler: Scheduler,
    pub scan_mode: ScanMode,
    pub max_rate: Duration,
    /// False for draining reads, whose equal batches are distinct data.
    pub dedup_values: bool,
    pub exception_handler: Option<ExceptionHandler>,
    pub registry: WeakRegistry,
    pub id: u64,
    pub origin: &'static Location<'static>,
}

/// State delivered by the last notification.
#[derive(Clone)]
struct Snapshot<R> {
    value: Option<R>,
    connected: bool,
    write_connected: bool,
    error: Option<Error>,
}

/// Orchestrator of one subscription.
pub struct Director<R, W> {
    id: u64,
    pv: Weak<PvShared<R, W>>,
    context: ExpressionContext,
    decoupler: RateDecoupler,
    read_function: Option<ReadFunction<R>>,
    write_function: Option<WriteFunction<W>>,
    executor: Arc<dyn Executor>,
    scheduler: Scheduler,
    snapshot: Mutex<Snapshot<R>>,
    dedup_values: bool,
    notification_in_flight: Arc<AtomicBool>,
    /// Serializes the writes of this subscription.
    write_lock: Arc<Mutex<()>>,
    closed: AtomicBool,
    registry: WeakRegistry,
    origin: &'static Location<'static>,
}

impl<R, W> Director<R, W>
where
    R: Clone + PartialEq + Send + Sync + 'static,
    W: Send + 'static,
{
    /// Builds the director, its decoupler and its expression context.
    /// Nothing is started yet.
    pub(crate) fn new(
        setup: DirectorSetup<R, W>,
        pv: Weak<PvShared<R, W>>,
        me: Weak<Director<R, W>>,
    ) -> Self {
        let decoupler = RateDecoupler::new(
            setup.scan_mode,
            setup.max_rate,
            setup.scheduler.clone(),
            Arc::new(move |event| {
                if let Some(director) = me.upgrade() {
                    director.notify_pv(event);
                }
            }),
            setup.exception_handler,
        );
        let context =
            ExpressionContext::new(setup.data_source, decoupler.update_listener());
        Self {
            id: setup.id,
            pv,
            context,
            decoupler,
            read_function: setup.read_function,
            write_function: setup.write_function,
            executor: setup.executor,
            scheduler: setup.scheduler,
            snapshot: Mutex::new(Snapshot {
                value: None,
                connected: false,
                write_connected: false,
                error: None,
            }),
            dedup_values: setup.dedup_values,
            notification_in_flight: Arc::new(AtomicBool::new(false)),
            write_lock: Arc::new(Mutex::new(())),
            closed: AtomicBool::new(false),
            registry: setup.registry,
            origin: setup.origin,
        }
    }

    /// Registry id of the subscription.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Membership of the subscription. Expressions may be connected and
    /// disconnected through it while the subscription runs.
    pub fn context(&self) -> &ExpressionContext {
        &self.context
    }

    /// Rate decoupler of the subscription.
    pub fn decoupler(&self) -> &RateDecoupler {
        &self.decoupler
    }

    /// Notification executor of the subscription.
    pub(crate) fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// True if the subscription has a write side.
    pub fn is_writable(&self) -> bool {
        self.write_function.is_some()
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Starts the decoupler.
    pub(crate) fn start(&self) {
        self.decoupler.start();
    }

    /// Stops scheduling notifications. One already in flight still arrives.
    pub fn pause(&self) {
        self.decoupler.pause();
    }

    /// Resumes notifications.
    pub fn resume(&self) {
        self.decoupler.resume();
    }

    /// Connection flag relevant for the timeout: the read connection, or the
    /// write connection for write-only subscriptions.
    fn effective_connection(&self, connected: bool, write_connected: bool) -> bool {
        if self.read_function.is_some() {
            connected
        } else {
            write_connected
        }
    }

    /// Runs the notification protocol for one desired-rate event.
    pub(crate) fn notify_pv(&self, event: Event) {
        if self.notification_in_flight.load(Ordering::SeqCst) {
            error!(
                "Notification for subscription {} requested while the previous one is still in flight!",
                self.id
            );
            return;
        }

        let Some(pv) = self.pv.upgrade() else {
            warn!(
                "Handle created at {} was dropped without being closed, closing subscription {}.",
                self.origin, self.id
            );
            self.close();
            self.decoupler.ready_for_next_event();
            return;
        };
        if pv.is_closed() {
            self.decoupler.ready_for_next_event();
            return;
        }
        drop(pv);

        let previous = lock(&self.snapshot).clone();
        let mut next = previous.clone();
        let mut event = event;

        if event.is_kind(EventKind::Value) {
            match &self.read_function {
                Some(read) => match isolate("Read function", || read()) {
                    Some(Ok(value)) => next.value = Some(value),
                    Some(Err(error)) => {
                        event = event
                            .remove_kind(EventKind::Value)
                            .merge(&Event::exception(error));
                    }
                    None => {
                        self.decoupler.ready_for_next_event();
                        return;
                    }
                },
                None => event = event.remove_kind(EventKind::Value),
            }
        }

        if event.is_kind(EventKind::Exception) {
            next.error = event.error().cloned();
        }

        if event.is_kind(EventKind::ReadConnection) {
            next.connected = self.context.read_connection();
        }

        if event.is_kind(EventKind::WriteConnection) {
            next.write_connected = self.context.write_connection();
        }

        if self.effective_connection(next.connected, next.write_connected)
            && next.error.as_ref().is_some_and(Error::is_timeout)
        {
            debug!("Subscription {} connected, timeout retracted.", self.id);
            next.error = None;
            event = event.remove_kind(EventKind::Exception);
        }

        if event.is_kind(EventKind::Value)
            && self.dedup_values
            && next.value == previous.value
        {
            event = event.remove_kind(EventKind::Value);
        }
        if event.is_kind(EventKind::ReadConnection)
            && next.connected == previous.connected
        {
            event = event.remove_kind(EventKind::ReadConnection);
        }
        if event.is_kind(EventKind::WriteConnection)
            && next.write_connected == previous.write_connected
        {
            event = event.remove_kind(EventKind::WriteConnection);
        }
        if event.is_kind(EventKind::Exception) && next.error == previous.error {
            event = event.remove_kind(EventKind::Exception);
        }

        *lock(&self.snapshot) = next.clone();

        if event.is_empty() {
            self.decoupler.ready_for_next_event();
            return;
        }

        self.notification_in_flight.store(true, Ordering::SeqCst);
        let pv = self.pv.clone();
        let in_flight = self.notification_in_flight.clone();
        let decoupler = self.decoupler.clone();
        let id = self.id;
        self.executor.execute(Box::new(move || {
            match pv.upgrade() {
                Some(pv) => {
                    isolate("Notification", || {
                        pv.fire(
                            &event,
                            next.value,
                            next.connected,
                            next.write_connected,
                        )
                    });
                }
                None => {
                    debug!("Handle of subscription {} gone, notification dropped.", id)
                }
            }
            in_flight.store(false, Ordering::SeqCst);
            decoupler.ready_for_next_event();
        }));
    }

    /// Writes `value` through the write function.
    ///
    /// The write runs on the scheduler; `callback` receives exactly one
    /// `WriteSucceeded` or `WriteFailed` event. Writes of one subscription
    /// never overlap.
    ///
    /// # Errors
    ///
    /// [`Error::ReadOnly`] if the subscription has no write side and
    /// [`Error::Closed`] once it is closed. The callback is not called then.
    pub fn submit_write(&self, value: W, callback: WriteCallback) -> Result<(), Error> {
        let Some(write) = self.write_function.clone() else {
            return Err(Error::ReadOnly);
        };
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let context = self.context.clone();
        let write_lock = self.write_lock.clone();
        self.scheduler.submit(Box::new(move || {
            let _guard = lock(&write_lock);
            let collectors = context.write_collectors();
            let id = WriteId::random();
            debug!("Preparing write {} on {} channels.", id, collectors.len());
            for collector in &collectors {
                collector.prepare_write(id);
            }
            match isolate("Write function", || write(value)) {
                Some(Ok(())) => {
                    let barrier = WriteBarrier::new(collectors.len(), callback);
                    for collector in &collectors {
                        // Nothing is written once a failure was reported.
                        if barrier.is_done() {
                            collector.cancel_write(id);
                        } else {
                            collector.send_write_request(id, barrier.participant());
                        }
                    }
                }
                outcome => {
                    for collector in &collectors {
                        collector.cancel_write(id);
                    }
                    let error = match outcome {
                        Some(Err(error)) => error,
                        _ => Error::Write("write function panicked".to_owned()),
                    };
                    debug!("Write {} cancelled: {}", id, error);
                    callback(Event::write_failed(error));
                }
            }
        }));
        Ok(())
    }

    /// Injects a timeout exception after `timeout` unless the subscription
    /// is connected by then.
    pub(crate) fn schedule_timeout(self: &Arc<Self>, timeout: Duration, message: String) {
        let director = Arc::downgrade(self);
        self.scheduler.schedule(
            timeout,
            Box::new(move || {
                let Some(director) = director.upgrade() else {
                    return;
                };
                let Some(pv) = director.pv.upgrade() else {
                    return;
                };
                if pv.is_closed()
                    || director
                        .effective_connection(pv.is_connected(), pv.is_write_connected())
                {
                    return;
                }
                debug!("Subscription {} timed out.", director.id);
                director
                    .context
                    .report(Event::exception(Error::Timeout(message)));
            }),
        );
    }

    /// Stops the decoupler, disconnects every expression and leaves the
    /// registry. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.decoupler.stop();
        self.context.close();
        if let Some(pv) = self.pv.upgrade() {
            pv.mark_closed();
        }
        self.registry.remove(self.id);
        debug!("Subscription {} is closed.", self.id);
    }
}

impl<R, W> Subscription for Director<R, W>
where
    R: Clone + PartialEq + Send + Sync + 'static,
    W: Send + 'static,
{
    fn close(&self) {
        Director::close(self);
    }
}
