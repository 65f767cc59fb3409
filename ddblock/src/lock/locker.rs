// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The public locking facade.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

use crate::identifier::LockIdentifier;
use crate::lock::driver::Driver;
use crate::lock::{Acquisition, Error, ErrorKind, LockState};
use crate::options::LockerOptions;
use crate::store::{self, LockStore};

/// Distributed mutual exclusion on one named DynamoDB record.
///
/// A `Locker` is created for a single lock identifier and acquires, holds
/// (renewing in the background), and releases that one lock. The first
/// acquisition provisions the lock table when it does not exist yet.
///
/// [`lock`](Self::lock)/[`unlock`](Self::unlock) panic on errors, unless
/// the `no_panic` option routes errors into the deferred slot read by
/// [`last_error`](Self::last_error). The `*_with_cancellation` variants
/// report errors and honor a caller-supplied [`CancellationToken`].
#[derive(Debug)]
pub struct Locker<S = store::Client> {
    store: Arc<S>,
    driver: Driver<S>,
    delay: bool,
    no_panic: bool,
    provisioned: AtomicBool,
}

impl Locker {
    /// Create a locker for `url`, of the form `ddb://<table>/<item_id>`.
    ///
    /// No store traffic happens here; the table is provisioned lazily by
    /// the first lock call.
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`InvalidIdentifier`](ErrorKind::InvalidIdentifier)
    /// if `url` does not parse.
    ///
    /// [`struct@Error`] of kind [`InvalidConfiguration`](ErrorKind::InvalidConfiguration)
    /// if the lease duration is out of range.
    pub async fn new(url: &str, options: LockerOptions) -> Result<Self, Error> {
        let identifier: LockIdentifier = url.parse()?;
        options.validate()?;
        let store = Arc::new(store::Client::new(&options).await);
        Self::with_store(store, identifier, &options)
    }
}

impl<S: LockStore> Locker<S> {
    /// Assemble a locker over an existing store.
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`InvalidConfiguration`](ErrorKind::InvalidConfiguration)
    /// if the lease duration is out of range.
    pub fn with_store(
        store: Arc<S>,
        identifier: LockIdentifier,
        options: &LockerOptions,
    ) -> Result<Self, Error> {
        options.validate()?;
        let driver = Driver::new(Arc::clone(&store), identifier, options.lease_duration);
        Ok(Self {
            store,
            driver,
            delay: options.delay,
            no_panic: options.no_panic,
            provisioned: AtomicBool::new(false),
        })
    }

    /// Acquire the lock, returning whether it was granted.
    ///
    /// With the `delay` option this waits out the current holder's record
    /// expiry and only returns `true`. Without it, contention counts as an
    /// error.
    ///
    /// # Panics
    /// On any error, including contention in non-delay mode, unless the
    /// `no_panic` option stashes the error for [`last_error`](Self::last_error)
    /// instead.
    pub async fn lock(&self) -> bool {
        let cancel = CancellationToken::new();
        match self.lock_with_cancellation(&cancel).await {
            Ok(true) => true,
            Ok(false) => {
                self.fail(ErrorKind::Contention.into());
                false
            }
            Err(error) => {
                self.fail(error);
                false
            }
        }
    }

    /// Acquire the lock, honoring `cancel`.
    ///
    /// Returns `Ok(true)` when granted and `Ok(false)` when another holder
    /// carries the lease in non-delay mode.
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`Cancelled`](ErrorKind::Cancelled) if `cancel` fired first.
    ///
    /// [`struct@Error`] of kind [`LeaseLost`](ErrorKind::LeaseLost) if a renewal failure is
    /// pending on the handle; clear it with [`clear_last_error`](Self::clear_last_error).
    ///
    /// [`struct@Error`] of kind [`StoreUnavailable`](ErrorKind::StoreUnavailable) or
    /// [`StoreFatal`](ErrorKind::StoreFatal) for store failures, after retries.
    pub async fn lock_with_cancellation(&self, cancel: &CancellationToken) -> Result<bool, Error> {
        self.check_deferred()?;
        self.ensure_provisioned(cancel).await?;
        match self.driver.acquire(self.delay, cancel).await? {
            Acquisition::Granted => Ok(true),
            Acquisition::NotGranted { .. } => Ok(false),
        }
    }

    /// Release the lock.
    ///
    /// # Panics
    /// On any error, including release of a never-granted lock, unless the
    /// `no_panic` option stashes the error instead.
    pub async fn unlock(&self) {
        let cancel = CancellationToken::new();
        if let Err(error) = self.unlock_with_cancellation(&cancel).await {
            self.fail(error);
        }
    }

    /// Release the lock, honoring `cancel`.
    ///
    /// Releasing an already-released lock is a no-op; the store is written
    /// at most once per grant.
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`NotHeld`](ErrorKind::NotHeld) if the lock was never granted.
    ///
    /// [`struct@Error`] of kind [`Cancelled`](ErrorKind::Cancelled) if `cancel` fired first;
    /// the lock stays held and the release may be retried.
    ///
    /// [`struct@Error`] of kind [`LeaseLost`](ErrorKind::LeaseLost) if a renewal failure is
    /// pending on the handle.
    ///
    /// [`struct@Error`] of kind [`StoreUnavailable`](ErrorKind::StoreUnavailable) or
    /// [`StoreFatal`](ErrorKind::StoreFatal) for store failures, after retries.
    pub async fn unlock_with_cancellation(&self, cancel: &CancellationToken) -> Result<(), Error> {
        self.check_deferred()?;
        self.driver.release(cancel).await
    }

    /// Where the lock sits in its acquire/hold/release cycle.
    #[must_use]
    pub fn state(&self) -> LockState {
        self.driver.handle().state()
    }

    /// The last deferred error, if any. Renewal failures land here, as do
    /// all errors under the `no_panic` option.
    #[must_use]
    pub fn last_error(&self) -> Option<Error> {
        self.driver.handle().last_error()
    }

    /// Clear the deferred error slot.
    pub fn clear_last_error(&self) {
        self.driver.handle().clear_last_error();
    }

    fn check_deferred(&self) -> Result<(), Error> {
        match self.driver.handle().last_error() {
            Some(error) if matches!(error.kind(), ErrorKind::LeaseLost) => Err(error),
            _ => Ok(()),
        }
    }

    async fn ensure_provisioned(&self, cancel: &CancellationToken) -> Result<(), Error> {
        if self.provisioned.load(Ordering::Acquire) {
            return Ok(());
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ErrorKind::Cancelled.into()),
            result = self.store.provision_table(self.driver.identifier().table()) => result?,
        }
        self.provisioned.store(true, Ordering::Release);
        Ok(())
    }

    fn fail(&self, error: Error) {
        if self.no_panic {
            log::warn!("lock {} failed: {error}", self.driver.identifier());
            self.driver.handle().set_last_error(error);
        } else {
            panic!("{error}");
        }
    }
}

impl<S> Drop for Locker<S> {
    fn drop(&mut self) {
        // Renewal cannot be awaited here; the token stops it at its next
        // loop turn, and an unreleased record lapses through its expiry.
        self.driver.request_stop_renewer();
    }
}
