// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Conditional-write storage for lock records.
//!
//! The lock protocol only ever needs five operations from its backing
//! store: provision the table, insert-if-absent, overwrite-if-revision-
//! matches, read with strong consistency, and delete-if-revision-matches.
//! [`LockStore`] captures exactly that surface; [`Client`] implements it
//! over DynamoDB.

use core::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use derive_getters::Getters;
use thiserror::Error;

mod client;
mod retry;

pub use client::Client;
pub use retry::RetryPolicy;

/// Partition key attribute of the lock table.
pub(crate) const ATTR_ID: &str = "ID";
/// Lease duration attribute, in milliseconds.
pub(crate) const ATTR_LEASE: &str = "LeaseDuration";
/// Revision (fencing token) attribute.
pub(crate) const ATTR_REVISION: &str = "Revision";
/// Record expiry attribute, in unix seconds, evaluated by the store itself.
pub(crate) const ATTR_TTL: &str = "ttl";

/// Represents an error that occurred talking to the store.
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

/// Represents the kinds of errors that occur talking to the store.
#[derive(Clone, Debug, Error)]
pub enum ErrorKind {
    /// The store could not be reached, even after retrying.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store rejected a request for a non-retryable reason.
    #[error("store request failed: {0}")]
    Fatal(String),
    /// The lock table could not be created or did not become usable.
    #[error("table provisioning failed: {0}")]
    Provision(String),
}

/// One lock record as persisted in the table, minus its key.
#[derive(Clone, Debug, Getters, PartialEq, Eq)]
pub struct LockItem {
    /// Lease duration in milliseconds.
    lease_ms: u64,
    /// The revision stamped by the write that produced this record.
    revision: String,
    /// Hard expiry in unix seconds.
    ttl_unix: i64,
}

impl LockItem {
    /// Assemble a record advertising `lease` under `revision`, expiring at
    /// `ttl_unix`.
    #[must_use]
    pub fn new(lease: Duration, revision: String, ttl_unix: i64) -> Self {
        Self {
            lease_ms: u64::try_from(lease.as_millis()).unwrap_or(u64::MAX),
            revision,
            ttl_unix,
        }
    }

    /// The lease duration this record advertises.
    #[must_use]
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

/// Result of a conditional insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// No record existed; ours was written.
    Inserted,
    /// A record already exists; nothing was written.
    Exists,
}

/// Result of a revision-conditioned overwrite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The record was absent or carried the expected revision; ours was written.
    Written,
    /// The record carries a different revision; nothing was written.
    Conflict,
}

/// Result of a revision-conditioned delete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The record carried the expected revision and was removed.
    Deleted,
    /// The record was absent or carried a different revision.
    Conflict,
}

/// The record expiry for a lease granted at `now`.
///
/// Half a lease of slack past the heartbeat deadline, truncated to whole
/// seconds and bumped by one, so the expiry can never precede the deadline.
pub(crate) fn ttl_for_lease(now: SystemTime, lease: Duration) -> i64 {
    let expiry = now + lease + lease / 2;
    let secs = expiry
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    i64::try_from(secs).unwrap_or(i64::MAX).saturating_add(1)
}

/// The conditional-write surface the lock protocol needs from its store.
///
/// Implemented by [`Client`] over DynamoDB; tests substitute an in-memory
/// implementation. All methods are safe to race against a cancellation
/// signal: an abandoned call leaves at most one conditional write behind,
/// which the revision fencing already accounts for.
pub trait LockStore: Send + Sync + 'static {
    /// Retry schedule for acquisition passes, including race-deletion
    /// re-inserts driven by the caller.
    fn acquire_retry(&self) -> &RetryPolicy;

    /// Ensure the table exists and is usable. Idempotent.
    fn provision_table(&self, table: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Write `item` under `id` only if no record currently exists.
    fn put_if_absent(
        &self,
        table: &str,
        id: &str,
        item: &LockItem,
    ) -> impl Future<Output = Result<PutOutcome, Error>> + Send;

    /// Overwrite the record if it is absent or carries `expected_revision`.
    ///
    /// The absent branch lets a heartbeat re-create a record the store has
    /// already expired since the last renewal.
    fn update_if_revision_matches(
        &self,
        table: &str,
        id: &str,
        item: &LockItem,
        expected_revision: &str,
    ) -> impl Future<Output = Result<UpdateOutcome, Error>> + Send;

    /// Strongly consistent read. Records missing any lock attribute read as
    /// `None`, the same as an absent record.
    fn read_consistent(
        &self,
        table: &str,
        id: &str,
    ) -> impl Future<Output = Result<Option<LockItem>, Error>> + Send;

    /// Delete the record only if it carries `expected_revision`.
    fn delete_if_revision_matches(
        &self,
        table: &str,
        id: &str,
        expected_revision: &str,
    ) -> impl Future<Output = Result<DeleteOutcome, Error>> + Send;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::{
        DeleteOutcome, Error, ErrorKind, LockItem, LockStore, PutOutcome, RetryPolicy,
        UpdateOutcome,
    };

    /// In-memory [`LockStore`] with failure injection.
    pub(crate) struct MemoryStore {
        items: Mutex<HashMap<(String, String), LockItem>>,
        retry: RetryPolicy,
        fail_writes: AtomicBool,
        race_deletions: AtomicU32,
        put_attempts: AtomicUsize,
        deletes_applied: AtomicUsize,
    }

    impl MemoryStore {
        pub(crate) fn new() -> Self {
            Self {
                items: Mutex::new(HashMap::new()),
                retry: RetryPolicy {
                    min_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                    max_attempts: 10,
                },
                fail_writes: AtomicBool::new(false),
                race_deletions: AtomicU32::new(0),
                put_attempts: AtomicUsize::new(0),
                deletes_applied: AtomicUsize::new(0),
            }
        }

        fn key(table: &str, id: &str) -> (String, String) {
            (table.to_owned(), id.to_owned())
        }

        pub(crate) fn insert(&self, table: &str, id: &str, item: LockItem) {
            self.items
                .lock()
                .expect("Could not lock mutex")
                .insert(Self::key(table, id), item);
        }

        /// Simulate the store expiring a record.
        pub(crate) fn evict(&self, table: &str, id: &str) {
            self.items
                .lock()
                .expect("Could not lock mutex")
                .remove(&Self::key(table, id));
        }

        pub(crate) fn get(&self, table: &str, id: &str) -> Option<LockItem> {
            self.items
                .lock()
                .expect("Could not lock mutex")
                .get(&Self::key(table, id))
                .cloned()
        }

        /// Make every write fail with [`ErrorKind::Unavailable`].
        pub(crate) fn set_fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }

        /// Report `Exists` to the next `n` inserts while the matching reads
        /// find nothing, imitating records that vanish between the two.
        pub(crate) fn inject_race_deletions(&self, n: u32) {
            self.race_deletions.store(n, Ordering::SeqCst);
        }

        pub(crate) fn put_attempts(&self) -> usize {
            self.put_attempts.load(Ordering::SeqCst)
        }

        pub(crate) fn deletes_applied(&self) -> usize {
            self.deletes_applied.load(Ordering::SeqCst)
        }

        fn check_writable(&self) -> Result<(), Error> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(ErrorKind::Unavailable("injected outage".into()).into());
            }
            Ok(())
        }
    }

    impl LockStore for MemoryStore {
        fn acquire_retry(&self) -> &RetryPolicy {
            &self.retry
        }

        async fn provision_table(&self, _table: &str) -> Result<(), Error> {
            self.check_writable()
        }

        async fn put_if_absent(
            &self,
            table: &str,
            id: &str,
            item: &LockItem,
        ) -> Result<PutOutcome, Error> {
            self.put_attempts.fetch_add(1, Ordering::SeqCst);
            self.check_writable()?;
            if self.race_deletions.load(Ordering::SeqCst) > 0 {
                return Ok(PutOutcome::Exists);
            }
            let mut items = self.items.lock().expect("Could not lock mutex");
            if items.contains_key(&Self::key(table, id)) {
                return Ok(PutOutcome::Exists);
            }
            items.insert(Self::key(table, id), item.clone());
            Ok(PutOutcome::Inserted)
        }

        async fn update_if_revision_matches(
            &self,
            table: &str,
            id: &str,
            item: &LockItem,
            expected_revision: &str,
        ) -> Result<UpdateOutcome, Error> {
            self.check_writable()?;
            let mut items = self.items.lock().expect("Could not lock mutex");
            match items.get(&Self::key(table, id)) {
                Some(existing) if existing.revision() != expected_revision => {
                    Ok(UpdateOutcome::Conflict)
                }
                _ => {
                    items.insert(Self::key(table, id), item.clone());
                    Ok(UpdateOutcome::Written)
                }
            }
        }

        async fn read_consistent(&self, table: &str, id: &str) -> Result<Option<LockItem>, Error> {
            if self
                .race_deletions
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Ok(None);
            }
            Ok(self.get(table, id))
        }

        async fn delete_if_revision_matches(
            &self,
            table: &str,
            id: &str,
            expected_revision: &str,
        ) -> Result<DeleteOutcome, Error> {
            self.check_writable()?;
            let mut items = self.items.lock().expect("Could not lock mutex");
            match items.get(&Self::key(table, id)) {
                Some(existing) if existing.revision() == expected_revision => {
                    items.remove(&Self::key(table, id));
                    self.deletes_applied.fetch_add(1, Ordering::SeqCst);
                    Ok(DeleteOutcome::Deleted)
                }
                _ => Ok(DeleteOutcome::Conflict),
            }
        }
    }
}
