// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Handles
//!
//! A [`Pv`] is what the user holds for an open subscription. It exposes the
//! state delivered by the last notification, the listeners notified on
//! every change, pause and resume, writes and closing.
//!
//! Listeners are kept in an explicit list and run in registration order on
//! the notification executor. Each one has a [`ListenerScope`] selecting the
//! event kinds it receives; a listener whose scope filters out every kind of
//! an event is not called for it. A panicking listener is logged and the
//! remaining listeners still run.
//!
//! Dropping every clone of a handle without closing it leaks the
//! subscription until its next event, which closes it and logs a warning
//! naming where the handle was created.

use crate::{
    Error, Event, EventKind, WriteCallback,
    director::{Director, DirectorSetup},
    executor::isolate,
    lock,
};

use tokio::sync::oneshot;
use tracing::debug;

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

/// Listener of a handle.
pub type PvListener<R, W> = Arc<dyn Fn(&Event, &Pv<R, W>) + Send + Sync>;

/// Event kinds a listener receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerScope {
    /// `ReadConnection`, `Value` and `Exception`.
    Read,
    /// `WriteConnection`, `WriteSucceeded` and `WriteFailed`.
    Write,
    /// Everything.
    #[default]
    All,
}

impl ListenerScope {
    fn accepts(self, kind: EventKind) -> bool {
        match self {
            ListenerScope::Read => kind.is_read(),
            ListenerScope::Write => kind.is_write(),
            ListenerScope::All => true,
        }
    }
}

/// Identifier of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registered<R, W> {
    id: ListenerId,
    scope: ListenerScope,
    listener: PvListener<R, W>,
}

impl<R, W> Clone for Registered<R, W> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            scope: self.scope,
            listener: self.listener.clone(),
        }
    }
}

struct PvState<R> {
    value: Option<R>,
    connected: bool,
    write_connected: bool,
    paused: bool,
    closed: bool,
}

/// State shared by every clone of a handle.
pub(crate) struct PvShared<R, W> {
    director: Arc<Director<R, W>>,
    state: Mutex<PvState<R>>,
    listeners: Mutex<Vec<Registered<R, W>>>,
    next_listener: AtomicU64,
}

impl<R, W> PvShared<R, W>
where
    R: Clone + PartialEq + Send + Sync + 'static,
    W: Send + 'static,
{
    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub(crate) fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    pub(crate) fn is_write_connected(&self) -> bool {
        lock(&self.state).write_connected
    }

    pub(crate) fn mark_closed(&self) {
        lock(&self.state).closed = true;
    }

    /// Applies a notification and runs the listeners.
    pub(crate) fn fire(
        self: &Arc<Self>,
        event: &Event,
        value: Option<R>,
        connected: bool,
        write_connected: bool,
    ) {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            if event.is_kind(EventKind::Value) {
                state.value = value;
            }
            state.connected = connected;
            state.write_connected = write_connected;
        }
        self.dispatch(event);
    }

    /// Runs the listeners accepting at least one kind of `event`, in
    /// registration order, without holding any lock.
    pub(crate) fn dispatch(self: &Arc<Self>, event: &Event) {
        let listeners = lock(&self.listeners).clone();
        let handle = Pv {
            shared: self.clone(),
        };
        for registered in listeners {
            let filtered = event.retain_kinds(|kind| registered.scope.accepts(kind));
            if filtered.is_empty() {
                continue;
            }
            isolate("Listener", || (registered.listener)(&filtered, &handle));
        }
    }
}

/// Handle of an open subscription.
///
/// `R` is the type read, `W` the type written. Cloning is cheap and every
/// clone controls the same subscription.
pub struct Pv<R, W = ()> {
    shared: Arc<PvShared<R, W>>,
}

impl<R, W> Clone for Pv<R, W> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<R, W> fmt::Debug for Pv<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("Pv")
            .field("connected", &state.connected)
            .field("write_connected", &state.write_connected)
            .field("paused", &state.paused)
            .field("closed", &state.closed)
            .finish()
    }
}

impl<R, W> Pv<R, W>
where
    R: Clone + PartialEq + Send + Sync + 'static,
    W: Send + 'static,
{
    /// Builds the handle and its director. Nothing is started.
    pub(crate) fn create(
        setup: DirectorSetup<R, W>,
        listeners: Vec<(ListenerScope, PvListener<R, W>)>,
    ) -> Self {
        let shared = Arc::new_cyclic(|pv| {
            let director =
                Arc::new_cyclic(|me| Director::new(setup, pv.clone(), me.clone()));
            let listeners = listeners
                .into_iter()
                .enumerate()
                .map(|(i, (scope, listener))| Registered {
                    id: ListenerId(i as u64),
                    scope,
                    listener,
                })
                .collect::<Vec<_>>();
            PvShared {
                director,
                next_listener: AtomicU64::new(listeners.len() as u64),
                listeners: Mutex::new(listeners),
                state: Mutex::new(PvState {
                    value: None,
                    connected: false,
                    write_connected: false,
                    paused: false,
                    closed: false,
                }),
            }
        });
        Self { shared }
    }

    /// Director of the subscription.
    pub fn director(&self) -> &Arc<Director<R, W>> {
        &self.shared.director
    }

    /// Value delivered by the last notification carrying one.
    pub fn value(&self) -> Option<R> {
        lock(&self.shared.state).value.clone()
    }

    /// Read connection as of the last notification.
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Write connection as of the last notification.
    pub fn is_write_connected(&self) -> bool {
        self.shared.is_write_connected()
    }

    /// True while paused.
    pub fn is_paused(&self) -> bool {
        lock(&self.shared.state).paused
    }

    /// Pauses or resumes notifications. Does nothing if already in the
    /// requested state.
    pub fn set_paused(&self, paused: bool) {
        {
            let mut state = lock(&self.shared.state);
            if state.paused == paused || state.closed {
                return;
            }
            state.paused = paused;
        }
        if paused {
            self.shared.director.pause();
        } else {
            self.shared.director.resume();
        }
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Closes the subscription. Idempotent.
    pub fn close(&self) {
        {
            let mut state = lock(&self.shared.state);
            if state.closed {
                return;
            }
            state.closed = true;
        }
        debug!("Closing handle of subscription {}.", self.shared.director.id());
        self.shared.director.close();
    }

    /// Adds a listener receiving every event kind.
    pub fn add_listener(
        &self,
        listener: impl Fn(&Event, &Pv<R, W>) + Send + Sync + 'static,
    ) -> ListenerId {
        self.add_scoped_listener(ListenerScope::All, Arc::new(listener))
    }

    /// Adds a listener receiving only the kinds in `scope`.
    pub fn add_scoped_listener(
        &self,
        scope: ListenerScope,
        listener: PvListener<R, W>,
    ) -> ListenerId {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::SeqCst));
        lock(&self.shared.listeners).push(Registered {
            id,
            scope,
            listener,
        });
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.shared.listeners);
        let before = listeners.len();
        listeners.retain(|registered| registered.id != id);
        before != listeners.len()
    }

    /// Writes `value`. The outcome is delivered to the listeners as a
    /// `WriteSucceeded` or `WriteFailed` event.
    ///
    /// # Errors
    ///
    /// [`Error::ReadOnly`] for subscriptions without write side,
    /// [`Error::Closed`] once closed.
    pub fn write(&self, value: W) -> Result<(), Error> {
        let pv = Arc::downgrade(&self.shared);
        let executor = self.shared.director.executor().clone();
        self.submit(
            value,
            Box::new(move |event| {
                executor.execute(Box::new(move || {
                    if let Some(pv) = pv.upgrade() {
                        pv.dispatch(&event);
                    }
                }))
            }),
        )
    }

    /// Writes `value` and hands the outcome to `callback`, on the
    /// notification executor. Listeners are not notified.
    ///
    /// # Errors
    ///
    /// As [`Pv::write`]. `callback` is not called then.
    pub fn write_with(
        &self,
        value: W,
        callback: impl FnOnce(Event) + Send + 'static,
    ) -> Result<(), Error> {
        let executor = self.shared.director.executor().clone();
        self.submit(
            value,
            Box::new(move |event| {
                executor.execute(Box::new(move || callback(event)));
            }),
        )
    }

    /// Writes `value` and waits for the outcome.
    ///
    /// # Errors
    ///
    /// As [`Pv::write`], plus the error of a failed write.
    pub async fn write_and_wait(&self, value: W) -> Result<(), Error> {
        let receiver = self.oneshot_write(value)?;
        outcome(receiver.await.map_err(|_| Error::Closed)?)
    }

    /// Blocking version of [`Pv::write_and_wait`]. Must not be called from
    /// an asynchronous context.
    ///
    /// # Errors
    ///
    /// As [`Pv::write_and_wait`].
    pub fn blocking_write_and_wait(&self, value: W) -> Result<(), Error> {
        let receiver = self.oneshot_write(value)?;
        outcome(receiver.blocking_recv().map_err(|_| Error::Closed)?)
    }

    fn oneshot_write(&self, value: W) -> Result<oneshot::Receiver<Event>, Error> {
        let (sender, receiver) = oneshot::channel();
        self.submit(
            value,
            Box::new(move |event| {
                let _ = sender.send(event);
            }),
        )?;
        Ok(receiver)
    }

    fn submit(&self, value: W, callback: WriteCallback) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.shared.director.submit_write(value, callback)
    }
}

/// Turns a write outcome event into a result.
fn outcome(event: Event) -> Result<(), Error> {
    if event.is_kind(EventKind::WriteSucceeded) {
        Ok(())
    } else {
        Err(event
            .write_error()
            .cloned()
            .unwrap_or_else(|| Error::Write("write failed".to_owned())))
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_scopes() {
        assert!(ListenerScope::Read.accepts(EventKind::Value));
        assert!(ListenerScope::Read.accepts(EventKind::Exception));
        assert!(!ListenerScope::Read.accepts(EventKind::WriteSucceeded));
        assert!(ListenerScope::Write.accepts(EventKind::WriteConnection));
        assert!(!ListenerScope::Write.accepts(EventKind::ReadConnection));
        assert!(ListenerScope::All.accepts(EventKind::WriteFailed));
    }

    #[test]
    fn test_outcome() {
        assert_eq!(outcome(Event::write_succeeded()), Ok(()));
        assert_eq!(
            outcome(Event::write_failed(Error::Write("no".to_owned()))),
            Err(Error::Write("no".to_owned()))
        );
    }
}
