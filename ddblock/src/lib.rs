// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Distributed mutual exclusion backed by DynamoDB conditional writes.
//!
//! A [`Locker`] holds the exclusive lease on one named record in a DynamoDB
//! table. Every successful write stamps the record with a fresh revision
//! that acts as a fencing token: heartbeats and the final delete are
//! conditioned on the revision last written by this process, so two holders
//! can never both believe they own the lock. While the lock is held, a
//! background task renews the lease at half the lease interval; if the
//! holder crashes, the record's `ttl` attribute lets the next contender
//! supersede it once the lease has aged out.
//!
//! ```no_run
//! use ddblock::{Locker, LockerOptionsBuilder};
//!
//! # async fn example() -> Result<(), ddblock::Error> {
//! let options = LockerOptionsBuilder::default()
//!     .lease_duration(std::time::Duration::from_secs(10))
//!     .delay(true)
//!     .build()
//!     .expect("options are in range");
//! let locker = Locker::new("ddb://locks/nightly-batch", options).await?;
//! locker.lock().await;
//! // ... the critical section ...
//! locker.unlock().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod identifier;
pub mod lock;
pub mod options;
pub mod store;

pub use lock::{Error, ErrorKind, LockState, Locker, generate_revision};
pub use options::{LockerOptions, LockerOptionsBuilder};
