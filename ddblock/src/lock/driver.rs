// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Drives the acquire and release protocols against the store.

use core::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::identifier::LockIdentifier;
use crate::lock::handle::LockHandle;
use crate::lock::renewer::Renewer;
use crate::lock::{Acquisition, Error, ErrorKind, LockState, generate_revision};
use crate::store::{
    self, DeleteOutcome, LockItem, LockStore, PutOutcome, UpdateOutcome,
};

/// Shortest wait between acquisition passes on a contended lock.
const MIN_CONTENTION_WAIT: Duration = Duration::from_millis(200);

/// The protocol driver for one lock: it owns the store reference, the
/// shared handle, and the renewer of the current lease.
#[derive(Debug)]
pub(crate) struct Driver<S> {
    store: Arc<S>,
    handle: LockHandle,
    identifier: LockIdentifier,
    lease: Duration,
    renewer: Mutex<Option<Renewer>>,
}

impl<S: LockStore> Driver<S> {
    pub(crate) fn new(store: Arc<S>, identifier: LockIdentifier, lease: Duration) -> Self {
        Self {
            store,
            handle: LockHandle::new(),
            identifier,
            lease,
            renewer: Mutex::new(None),
        }
    }

    pub(crate) fn handle(&self) -> &LockHandle {
        &self.handle
    }

    pub(crate) fn identifier(&self) -> &LockIdentifier {
        &self.identifier
    }

    /// Acquire the lock. In delay mode this loops, sleeping out the
    /// observed record's expiry between passes, until granted or cancelled.
    pub(crate) async fn acquire(
        &self,
        delay: bool,
        cancel: &CancellationToken,
    ) -> Result<Acquisition, Error> {
        // A held handle refreshes its own lease through the update path;
        // its renewer is replaced once the refresh lands.
        self.stop_renewer().await;
        let mut expected = self.handle.revision();
        loop {
            match self.acquire_pass(expected.take(), cancel).await? {
                Acquisition::Granted => return Ok(Acquisition::Granted),
                Acquisition::NotGranted { observed } => {
                    if !delay {
                        log::debug!(
                            "lock {} is held by revision {}",
                            self.identifier,
                            observed.revision()
                        );
                        return Ok(Acquisition::NotGranted { observed });
                    }
                    self.wait_for_lapse(&observed, cancel).await?;
                    // Retry on the insert path; the store's own expiry
                    // sweep is what frees an abandoned record.
                }
            }
        }
    }

    /// One pass: a single conditional write, plus the read that explains a
    /// refusal. Records that vanish between the write and the read restart
    /// the pass on the insert path.
    async fn acquire_pass(
        &self,
        expected: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Acquisition, Error> {
        let mut expected = expected;
        let mut failed_attempts = 0;
        loop {
            let revision = generate_revision();
            let now = SystemTime::now();
            let item = LockItem::new(
                self.lease,
                revision.clone(),
                store::ttl_for_lease(now, self.lease),
            );
            let refused = match &expected {
                Some(prev) => matches!(
                    self.cancellable(
                        cancel,
                        self.store.update_if_revision_matches(
                            self.identifier.table(),
                            self.identifier.item_id(),
                            &item,
                            prev,
                        ),
                    )
                    .await?,
                    UpdateOutcome::Conflict
                ),
                None => matches!(
                    self.cancellable(
                        cancel,
                        self.store.put_if_absent(
                            self.identifier.table(),
                            self.identifier.item_id(),
                            &item,
                        ),
                    )
                    .await?,
                    PutOutcome::Exists
                ),
            };
            if !refused {
                self.handle.grant(revision, now + self.lease);
                self.start_renewer();
                log::debug!("lock {} granted", self.identifier);
                return Ok(Acquisition::Granted);
            }
            match self
                .cancellable(
                    cancel,
                    self.store
                        .read_consistent(self.identifier.table(), self.identifier.item_id()),
                )
                .await?
            {
                Some(observed) => return Ok(Acquisition::NotGranted { observed }),
                None => {
                    expected = None;
                    failed_attempts += 1;
                    let Some(delay) = self.store.acquire_retry().backoff(failed_attempts) else {
                        return Err(ErrorKind::StoreUnavailable(
                            "lock record kept vanishing between write and read".into(),
                        )
                        .into());
                    };
                    log::debug!(
                        "lock record for {} vanished between write and read, retrying",
                        self.identifier
                    );
                    self.sleep_cancellable(delay, cancel).await?;
                }
            }
        }
    }

    /// Sleep until the observed record's expiry has elapsed, floored so an
    /// already-expired record is polled instead of spun on while the
    /// store's sweep catches up.
    async fn wait_for_lapse(
        &self,
        observed: &LockItem,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let expiry =
            UNIX_EPOCH + Duration::from_secs(u64::try_from(observed.ttl_unix()).unwrap_or(0));
        let until_expiry = expiry
            .duration_since(SystemTime::now())
            .unwrap_or_default();
        let wait = until_expiry.max(MIN_CONTENTION_WAIT);
        log::debug!(
            "lock {} held by revision {}, retrying in {wait:?}",
            self.identifier,
            observed.revision()
        );
        self.sleep_cancellable(wait, cancel).await
    }

    /// Release the lock. Conflicts count as success: the record is not
    /// ours to delete, and the intent of no longer holding it is met.
    pub(crate) async fn release(&self, cancel: &CancellationToken) -> Result<(), Error> {
        match self.handle.try_begin_release() {
            LockState::Held => {}
            LockState::Releasing | LockState::Released => return Ok(()),
            LockState::Idle => return Err(ErrorKind::NotHeld.into()),
        }
        self.stop_renewer().await;
        let Some(revision) = self.handle.revision() else {
            self.handle.finish_release();
            return Ok(());
        };
        let result = self
            .cancellable(
                cancel,
                self.store.delete_if_revision_matches(
                    self.identifier.table(),
                    self.identifier.item_id(),
                    &revision,
                ),
            )
            .await;
        match result {
            Ok(DeleteOutcome::Deleted) => {
                log::debug!("lock {} released", self.identifier);
                self.handle.finish_release();
                Ok(())
            }
            Ok(DeleteOutcome::Conflict) => {
                log::debug!("lock {} was already gone at release", self.identifier);
                self.handle.finish_release();
                Ok(())
            }
            Err(error) if matches!(error.kind(), ErrorKind::Cancelled) => {
                // Heartbeats have stopped; if the caller never retries, the
                // record lapses through its expiry.
                self.handle.abort_release();
                Err(error)
            }
            Err(error) => {
                self.handle.finish_release();
                Err(error)
            }
        }
    }

    fn start_renewer(&self) {
        let renewer = Renewer::spawn(
            Arc::clone(&self.store),
            self.handle.clone(),
            self.identifier.clone(),
            self.lease,
        );
        *self.renewer.lock().expect("Could not lock mutex") = Some(renewer);
    }

    async fn stop_renewer(&self) {
        let renewer = self.renewer.lock().expect("Could not lock mutex").take();
        if let Some(renewer) = renewer {
            renewer.stop().await;
        }
    }

    async fn cancellable<T>(
        &self,
        cancel: &CancellationToken,
        operation: impl Future<Output = Result<T, store::Error>>,
    ) -> Result<T, Error> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ErrorKind::Cancelled.into()),
            result = operation => result.map_err(Error::from),
        }
    }

    async fn sleep_cancellable(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ErrorKind::Cancelled.into()),
            () = sleep(duration) => Ok(()),
        }
    }
}

impl<S> Driver<S> {
    /// Stop the renewer without waiting, for drop paths that cannot await.
    pub(crate) fn request_stop_renewer(&self) {
        if let Some(renewer) = self.renewer.lock().expect("Could not lock mutex").as_ref() {
            renewer.request_stop();
        }
    }
}
