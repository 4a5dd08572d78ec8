// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Executors
//!
//! Two kinds of execution resources are involved in a subscription:
//!
//! - The [`Scheduler`] runs rate decoupler scans, connection timeouts and
//!   write transactions. It is a thin wrapper over a tokio runtime handle and
//!   supports both immediate submission and delayed scheduling.
//! - A notification [`Executor`] delivers the final callbacks to user code.
//!   It is kept separate so that a slow listener can never block data
//!   collection or scheduling. The default is the [`SerialExecutor`], which
//!   runs one task at a time in submission order.
//!
//! Every task submitted through this module runs isolated: a panic inside a
//! task is caught, logged, and does not take the worker down.

use crate::Error;

use tokio::{
    runtime::Handle,
    sync::mpsc,
    task::JoinHandle,
    time::{Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use tracing::{debug, error};

use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

/// Unit of work handed to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Executor for notification tasks.
pub trait Executor: Send + Sync + 'static {
    /// Runs `task`, now or later, on some thread.
    fn execute(&self, task: Task);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Runs `f`, converting a panic into a logged error. Returns `None` if `f`
/// panicked.
pub(crate) fn isolate<R>(context: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Some(result),
        Err(payload) => {
            error!("{} panicked: {}", context, panic_message(payload.as_ref()));
            None
        }
    }
}

/// Mailbox sender of a [`SerialExecutor`].
type MailboxSender = mpsc::UnboundedSender<Task>;

/// Executor running tasks one at a time, in submission order, on a single
/// tokio task.
///
/// The executor keeps draining its mailbox until every clone has been
/// dropped.
#[derive(Clone)]
pub struct SerialExecutor {
    sender: MailboxSender,
}

impl SerialExecutor {
    /// Creates the mailbox and spawns its worker on `runtime`.
    pub fn new(runtime: &Handle) -> Self {
        debug!("Creating new serial executor.");
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        runtime.spawn(async move {
            while let Some(task) = receiver.recv().await {
                isolate("Notification task", task);
            }
            debug!("Serial executor stopped.");
        });
        Self { sender }
    }

    /// Creates the executor on the runtime of the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when called outside of a tokio runtime.
    pub fn current() -> Result<Self, Error> {
        Handle::try_current()
            .map(|runtime| Self::new(&runtime))
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// True if the worker is gone.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl Executor for SerialExecutor {
    fn execute(&self, task: Task) {
        if let Err(error) = self.sender.send(task) {
            error!("Failed to queue notification task! {}", error);
        }
    }
}

/// Executor spawning every task as its own tokio task. Tasks may run
/// concurrently; ordering between notifications of one subscription is still
/// guaranteed by the single-flight protocol.
#[derive(Clone)]
pub struct SpawnExecutor {
    runtime: Handle,
}

impl SpawnExecutor {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl Executor for SpawnExecutor {
    fn execute(&self, task: Task) {
        self.runtime.spawn(async move {
            isolate("Notification task", task);
        });
    }
}

/// Executor running every task on the submitting thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        isolate("Notification task", task);
    }
}

/// Scheduler for scans, timeouts and writes.
#[derive(Clone, Debug)]
pub struct Scheduler {
    runtime: Handle,
}

impl Scheduler {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Scheduler on the runtime of the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when called outside of a tokio runtime.
    pub fn current() -> Result<Self, Error> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Runtime handle.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Runs `task` as soon as possible.
    pub fn submit(&self, task: Task) -> JoinHandle<()> {
        self.runtime.spawn(async move {
            isolate("Scheduled task", task);
        })
    }

    /// Runs `task` after `delay`. A zero delay runs it as soon as possible.
    pub fn schedule(&self, delay: Duration, task: Task) -> JoinHandle<()> {
        if delay.is_zero() {
            return self.submit(task);
        }
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            isolate("Scheduled task", task);
        })
    }

    /// Runs `tick` every `period`, first immediately, until `token` is
    /// cancelled. A slow tick delays the following ones instead of bunching
    /// them up.
    pub fn repeat(
        &self,
        period: Duration,
        token: CancellationToken,
        tick: Arc<dyn Fn() + Send + Sync>,
    ) -> JoinHandle<()> {
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let tick = tick.clone();
                        isolate("Repeating task", move || tick());
                    }
                }
            }
            debug!("Repeating task cancelled.");
        })
    }
}
