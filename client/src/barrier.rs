// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Write barrier.
//!
//! Joins the outcomes of the collectors taking part in one write into a
//! single terminal event.

use crate::{Event, EventKind, WriteCallback, lock};

use tracing::debug;

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

/// Counts the outcomes of one write.
///
/// The callback receives exactly one event: `WriteSucceeded` once every
/// participant succeeded, or the first non-success event as soon as it
/// arrives. Outcomes arriving after that are ignored.
pub struct WriteBarrier {
    remaining: AtomicUsize,
    callback: Mutex<Option<WriteCallback>>,
}

impl WriteBarrier {
    /// Barrier for `participants` outcomes. With no participants the callback
    /// fires right away with success.
    pub fn new(participants: usize, callback: WriteCallback) -> Arc<Self> {
        let barrier = Arc::new(Self {
            remaining: AtomicUsize::new(participants),
            callback: Mutex::new(Some(callback)),
        });
        if participants == 0 {
            barrier.complete(Event::write_succeeded());
        }
        barrier
    }

    /// Records one outcome.
    pub fn arrive(&self, event: Event) {
        if !event.is_kind(EventKind::WriteSucceeded) {
            self.complete(event);
            return;
        }
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            });
        if previous == Ok(1) {
            self.complete(Event::write_succeeded());
        }
    }

    /// Callback handing one outcome to this barrier.
    pub fn participant(self: &Arc<Self>) -> WriteCallback {
        let barrier = self.clone();
        Box::new(move |event| barrier.arrive(event))
    }

    /// True once the terminal event was delivered.
    pub fn is_done(&self) -> bool {
        lock(&self.callback).is_none()
    }

    fn complete(&self, event: Event) {
        let callback = lock(&self.callback).take();
        match callback {
            Some(callback) => callback(event),
            None => debug!("Write outcome after completion ignored."),
        }
    }
}
