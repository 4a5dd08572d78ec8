// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Notification events
//!
//! An [`Event`] describes *what changed* for a subscription: a set of
//! [`EventKind`] flags plus the read error and the write error that go with
//! the `Exception` and `WriteFailed` kinds. Events are values. They are built
//! per notification, merged while they wait to be delivered, and discarded
//! once consumed.
//!
//! ## Kind set
//!
//! The kinds are kept in insertion order and each kind appears at most once.
//! Adding a kind that is already present moves it to the most recent
//! position. Two events are equal when they hold the same kinds, whatever
//! the order, and equivalent errors.
//!
//! ## Aggregation
//!
//! ```rust
//! use client::{Error, Event, EventKind};
//!
//! let first = Event::value();
//! let second = Event::exception(Error::Read("boom".to_owned()));
//! let merged = first.merge(&second);
//!
//! assert!(merged.is_kind(EventKind::Value));
//! assert!(merged.is_kind(EventKind::Exception));
//! assert_eq!(merged.error(), Some(&Error::Read("boom".to_owned())));
//! ```

use crate::Error;

use serde::{Deserialize, Serialize};

use std::hash::{Hash, Hasher};

/// Classification of what an event reports.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum EventKind {
    /// The read connection state may have changed.
    ReadConnection,
    /// The write connection state may have changed.
    WriteConnection,
    /// A new value may be available.
    Value,
    /// A read error occurred. The event carries the error.
    Exception,
    /// A write completed successfully.
    WriteSucceeded,
    /// A write failed. The event carries the write error.
    WriteFailed,
}

impl EventKind {
    /// Kinds that describe the read side of a subscription.
    pub const READ: [EventKind; 3] =
        [EventKind::ReadConnection, EventKind::Value, EventKind::Exception];

    /// Kinds that describe the write side of a subscription.
    pub const WRITE: [EventKind; 3] = [
        EventKind::WriteConnection,
        EventKind::WriteSucceeded,
        EventKind::WriteFailed,
    ];

    fn bit(self) -> u8 {
        match self {
            EventKind::ReadConnection => 1,
            EventKind::WriteConnection => 1 << 1,
            EventKind::Value => 1 << 2,
            EventKind::Exception => 1 << 3,
            EventKind::WriteSucceeded => 1 << 4,
            EventKind::WriteFailed => 1 << 5,
        }
    }

    /// True for read side kinds.
    pub fn is_read(self) -> bool {
        Self::READ.contains(&self)
    }

    /// True for write side kinds.
    pub fn is_write(self) -> bool {
        Self::WRITE.contains(&self)
    }
}

/// Immutable, composable notification descriptor.
#[derive(Debug, Clone, Default)]
pub struct Event {
    kinds: Vec<EventKind>,
    error: Option<Error>,
    write_error: Option<Error>,
}

impl Event {
    /// Creates an event with a single kind and no errors.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kinds: vec![kind],
            error: None,
            write_error: None,
        }
    }

    /// Creates an event from its parts. Repeated kinds collapse into their
    /// last position.
    pub fn with_parts(
        kinds: impl IntoIterator<Item = EventKind>,
        error: Option<Error>,
        write_error: Option<Error>,
    ) -> Self {
        let mut event = Self {
            kinds: Vec::new(),
            error,
            write_error,
        };
        for kind in kinds {
            event.push_kind(kind);
        }
        event
    }

    /// Creates an event with no kinds.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Value changed.
    pub fn value() -> Self {
        Self::new(EventKind::Value)
    }

    /// Read connection changed.
    pub fn read_connection() -> Self {
        Self::new(EventKind::ReadConnection)
    }

    /// Write connection changed.
    pub fn write_connection() -> Self {
        Self::new(EventKind::WriteConnection)
    }

    /// Read connection and value changed together.
    pub fn read_connection_and_value() -> Self {
        Self::with_parts(
            [EventKind::ReadConnection, EventKind::Value],
            None,
            None,
        )
    }

    /// Write succeeded.
    pub fn write_succeeded() -> Self {
        Self::new(EventKind::WriteSucceeded)
    }

    /// Read error.
    pub fn exception(error: Error) -> Self {
        Self::with_parts([EventKind::Exception], Some(error), None)
    }

    /// Write error.
    pub fn write_failed(error: Error) -> Self {
        Self::with_parts([EventKind::WriteFailed], None, Some(error))
    }

    fn push_kind(&mut self, kind: EventKind) {
        self.kinds.retain(|k| *k != kind);
        self.kinds.push(kind);
    }

    /// True if the event carries `kind`.
    pub fn is_kind(&self, kind: EventKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Kinds in insertion order.
    pub fn kinds(&self) -> &[EventKind] {
        &self.kinds
    }

    /// True if the event carries no kinds at all.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Read error, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Write error, if any.
    pub fn write_error(&self) -> Option<&Error> {
        self.write_error.as_ref()
    }

    /// Aggregates two events. The kinds of `other` are layered on top of the
    /// kinds of `self`, and the errors of `other` replace those of `self`
    /// when set.
    pub fn merge(&self, other: &Event) -> Event {
        let mut merged = self.clone();
        for kind in &other.kinds {
            merged.push_kind(*kind);
        }
        if other.error.is_some() {
            merged.error.clone_from(&other.error);
        }
        if other.write_error.is_some() {
            merged.write_error.clone_from(&other.write_error);
        }
        merged
    }

    /// Returns a copy of the event without `kind`. Removing
    /// [`EventKind::Exception`] clears the read error and removing
    /// [`EventKind::WriteFailed`] clears the write error.
    pub fn remove_kind(&self, kind: EventKind) -> Event {
        let mut event = self.clone();
        event.kinds.retain(|k| *k != kind);
        match kind {
            EventKind::Exception => event.error = None,
            EventKind::WriteFailed => event.write_error = None,
            _ => {}
        }
        event
    }

    /// Returns a copy of the event holding only the kinds accepted by
    /// `keep`. Errors follow their kinds.
    pub fn retain_kinds(&self, keep: impl Fn(EventKind) -> bool) -> Event {
        self.kinds
            .iter()
            .filter(|kind| !keep(**kind))
            .fold(self.clone(), |event, kind| event.remove_kind(*kind))
    }

    fn mask(&self) -> u8 {
        self.kinds.iter().fold(0, |mask, kind| mask | kind.bit())
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.mask() == other.mask()
            && self.error == other.error
            && self.write_error == other.write_error
    }
}

impl Eq for Event {}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mask().hash(state);
        self.error.hash(state);
        self.write_error.hash(state);
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use std::collections::HashSet;

    #[test]
    fn test_kind_appears_once_and_moves_last() {
        let event = Event::with_parts(
            [EventKind::Value, EventKind::ReadConnection, EventKind::Value],
            None,
            None,
        );
        assert_eq!(
            event.kinds(),
            &[EventKind::ReadConnection, EventKind::Value]
        );
    }

    #[test]
    fn test_merge_layers_other_on_top() {
        let a = Event::with_parts(
            [EventKind::Value, EventKind::ReadConnection],
            Some(Error::Read("first".to_owned())),
            None,
        );
        let b = Event::with_parts(
            [EventKind::Value],
            None,
            Some(Error::Write("nope".to_owned())),
        );
        let merged = a.merge(&b);
        assert_eq!(
            merged.kinds(),
            &[EventKind::ReadConnection, EventKind::Value]
        );
        assert_eq!(merged.error(), Some(&Error::Read("first".to_owned())));
        assert_eq!(
            merged.write_error(),
            Some(&Error::Write("nope".to_owned()))
        );

        let c = Event::exception(Error::Read("second".to_owned()));
        assert_eq!(
            merged.merge(&c).error(),
            Some(&Error::Read("second".to_owned()))
        );
    }

    #[test]
    fn test_remove_kind_clears_matching_error() {
        let event = Event::exception(Error::Read("boom".to_owned()))
            .merge(&Event::write_failed(Error::Write("bang".to_owned())))
            .merge(&Event::value());

        let without_exception = event.remove_kind(EventKind::Exception);
        assert!(!without_exception.is_kind(EventKind::Exception));
        assert!(without_exception.error().is_none());
        assert!(without_exception.write_error().is_some());

        let without_failure = event.remove_kind(EventKind::WriteFailed);
        assert!(without_failure.write_error().is_none());
        assert!(without_failure.error().is_some());

        let without_value = event.remove_kind(EventKind::Value);
        assert!(without_value.error().is_some());
        assert!(without_value.write_error().is_some());
    }

    #[test]
    fn test_equality_ignores_order() {
        let a = Event::with_parts(
            [EventKind::Value, EventKind::ReadConnection],
            None,
            None,
        );
        let b = Event::read_connection_and_value();
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));

        assert_ne!(
            Event::exception(Error::Read("a".to_owned())),
            Event::exception(Error::Read("b".to_owned()))
        );
    }

    #[test]
    fn test_retain_kinds() {
        let event = Event::read_connection_and_value()
            .merge(&Event::write_failed(Error::Write("w".to_owned())));
        let read = event.retain_kinds(EventKind::is_read);
        assert_eq!(read, Event::read_connection_and_value());
        let write = event.retain_kinds(EventKind::is_write);
        assert_eq!(write, Event::write_failed(Error::Write("w".to_owned())));
        assert!(Event::value().retain_kinds(EventKind::is_write).is_empty());
    }
}
