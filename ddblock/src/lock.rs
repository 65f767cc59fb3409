// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The lock protocol: acquisition, heartbeat renewal, and release.

use thiserror::Error;
use uuid::Uuid;

use crate::store::{self, LockItem};

mod driver;
mod handle;
mod locker;
mod renewer;

pub use locker::Locker;

/// Represents an error that occurred operating the lock.
#[derive(Clone, Debug, Error)]
#[error(transparent)]
pub struct Error(#[from] ErrorKind);

impl Error {
    /// Returns the [`ErrorKind`] of the error.
    #[must_use]
    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }
}

impl From<store::Error> for Error {
    fn from(error: store::Error) -> Self {
        let kind = match error.kind() {
            store::ErrorKind::Unavailable(message) => ErrorKind::StoreUnavailable(message.clone()),
            store::ErrorKind::Fatal(message) | store::ErrorKind::Provision(message) => {
                ErrorKind::StoreFatal(message.clone())
            }
        };
        kind.into()
    }
}

/// Represents the kinds of errors that occur operating the lock.
#[derive(Clone, Debug, Error)]
pub enum ErrorKind {
    /// The lock identifier could not be parsed.
    #[error("invalid lock identifier: {0}")]
    InvalidIdentifier(String),
    /// An option value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// The store could not be reached, even after retrying.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// Another holder currently carries the lease.
    #[error("lock is held by another holder")]
    Contention,
    /// A heartbeat found the stored revision changed underneath us.
    #[error("lease lost to another holder")]
    LeaseLost,
    /// Release was requested on a handle that does not hold the lock.
    #[error("lock is not held")]
    NotHeld,
    /// The caller's cancellation signal fired before completion.
    #[error("operation cancelled")]
    Cancelled,
    /// The store rejected a request for a non-retryable reason.
    #[error("store request failed: {0}")]
    StoreFatal(String),
}

/// Where a handle sits in the acquire/hold/release cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    /// Never granted, or a grant attempt did not succeed.
    Idle,
    /// This process carries the current lease.
    Held,
    /// A release is in flight.
    Releasing,
    /// The lock was released, or the lease was lost.
    Released,
}

/// Result of one acquisition pass against the store.
#[derive(Clone, Debug)]
pub(crate) enum Acquisition {
    /// The conditional write went through; the lease is ours.
    Granted,
    /// Someone else holds the lease; `observed` is their record.
    NotGranted {
        /// The record the refusing read returned.
        observed: LockItem,
    },
}

/// A fresh random revision, as stamped on every grant and heartbeat.
#[must_use]
pub fn generate_revision() -> String {
    Uuid::new_v4().to_string()
}
