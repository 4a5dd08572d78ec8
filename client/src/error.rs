// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Errors module
//!
//! A single error type travels through the whole client: it is returned from
//! configuration and write entry points, and it is carried inside [`Event`]s
//! when a read computation, a data source or a write fails. Two errors are
//! considered equivalent when they have the same variant and message, which
//! is what the notification pipeline uses to suppress repeated reports of
//! the same failure.
//!
//! [`Event`]: crate::Event

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for the client.
#[derive(
    Clone, Debug, Error, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum Error {
    /// Invalid subscription or client configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// The read function could not compute a value.
    #[error("Read error: {0}")]
    Read(String),
    /// A write could not be completed.
    #[error("Write error: {0}")]
    Write(String),
    /// The channel did not connect in the configured time.
    #[error("Connection timeout: {0}")]
    Timeout(String),
    /// A write was submitted on a subscription without write function.
    #[error("The subscription is read-only.")]
    ReadOnly,
    /// The subscription has been closed.
    #[error("The subscription is closed.")]
    Closed,
    /// The data source does not know the channel.
    #[error("Channel {0} not found.")]
    ChannelNotFound(String),
    /// The channel is not connected.
    #[error("Channel {0} is not connected.")]
    Disconnected(String),
    /// The single-flight scheduling protocol has been violated.
    #[error("Scheduling protocol violation: {0}")]
    Protocol(String),
}

impl Error {
    /// True for the connection timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}
