// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Subscription registry
//!
//! Every subscription opened through a client is kept in its registry until
//! it is closed. The registry is what keeps a director alive while events
//! are flowing: the handle only points to its director, and the director
//! only holds a weak reference back to the handle.
//!
//! Closing the client closes every subscription still in the registry.

use crate::lock;

use tracing::debug;

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

/// Anything the registry can close.
pub(crate) trait Subscription: Send + Sync + 'static {
    /// Closes the subscription. Must be idempotent.
    fn close(&self);
}

type Entries = Mutex<HashMap<u64, Arc<dyn Subscription>>>;

/// Open subscriptions of one client.
#[derive(Clone, Default)]
pub(crate) struct Registry {
    /// Subscriptions by id.
    entries: Arc<Entries>,
    /// Next id to hand out.
    next_id: Arc<AtomicU64>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves an id for a subscription about to be created.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Adds a subscription under `id`.
    pub fn insert(&self, id: u64, subscription: Arc<dyn Subscription>) {
        lock(&self.entries).insert(id, subscription);
        debug!("Subscription {} registered.", id);
    }

    /// Number of open subscriptions.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Non-owning handle, used by subscriptions to remove themselves.
    pub fn downgrade(&self) -> WeakRegistry {
        WeakRegistry {
            entries: Arc::downgrade(&self.entries),
        }
    }

    /// Closes every registered subscription. The lock is released before the
    /// subscriptions are closed, so they may remove themselves.
    pub fn close_all(&self) {
        let entries: Vec<(u64, Arc<dyn Subscription>)> =
            lock(&self.entries).drain().collect();
        debug!("Closing {} subscriptions.", entries.len());
        for (_, subscription) in entries {
            subscription.close();
        }
    }
}

/// Weak side of a [`Registry`].
#[derive(Clone, Default)]
pub(crate) struct WeakRegistry {
    entries: Weak<Entries>,
}

impl WeakRegistry {
    /// Removes `id`, if the registry still exists.
    pub fn remove(&self, id: u64) {
        if let Some(entries) = self.entries.upgrade() {
            if lock(&entries).remove(&id).is_some() {
                debug!("Subscription {} unregistered.", id);
            }
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use std::sync::atomic::AtomicUsize;

    struct Probe {
        id: u64,
        registry: WeakRegistry,
        closed: AtomicUsize,
    }

    impl Subscription for Probe {
        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
            self.registry.remove(self.id);
        }
    }

    #[test]
    fn test_close_all() {
        let registry = Registry::new();
        let probes: Vec<Arc<Probe>> = (0..3)
            .map(|_| {
                let probe = Arc::new(Probe {
                    id: registry.next_id(),
                    registry: registry.downgrade(),
                    closed: AtomicUsize::new(0),
                });
                registry.insert(probe.id, probe.clone());
                probe
            })
            .collect();
        assert_eq!(registry.len(), 3);

        probes[0].close();
        assert_eq!(registry.len(), 2);

        registry.close_all();
        assert_eq!(registry.len(), 0);
        assert!(
            probes
                .iter()
                .all(|probe| probe.closed.load(Ordering::SeqCst) >= 1)
        );
    }

    #[test]
    fn test_weak_registry_outlives_registry() {
        let registry = Registry::new();
        let weak = registry.downgrade();
        drop(registry);
        weak.remove(0);
    }
}
