// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The shared lock-handle record.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use crate::lock::{Error, LockState};

/// Process-local record of one lock: its state, the revision that
/// represents ownership, the next heartbeat deadline, and the deferred
/// error slot.
///
/// Cloneable; all clones share one record behind a single mutex, which is
/// what serializes the caller's protocol driver against the background
/// renewer.
#[derive(Clone, Debug)]
pub(crate) struct LockHandle {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    state: LockState,
    revision: Option<String>,
    next_heartbeat_deadline: Option<SystemTime>,
    last_error: Option<Error>,
}

impl LockHandle {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: LockState::Idle,
                revision: None,
                next_heartbeat_deadline: None,
                last_error: None,
            })),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("Could not lock mutex")
    }

    pub(crate) fn state(&self) -> LockState {
        self.inner().state
    }

    /// The revision this process last wrote, while it still represents
    /// ownership.
    pub(crate) fn revision(&self) -> Option<String> {
        self.inner().revision.clone()
    }

    /// The owning revision, but only while the lock is held. The renewer
    /// uses this to notice a release that won the race to the handle.
    pub(crate) fn held_revision(&self) -> Option<String> {
        let inner = self.inner();
        if inner.state == LockState::Held {
            inner.revision.clone()
        } else {
            None
        }
    }

    pub(crate) fn next_heartbeat_deadline(&self) -> Option<SystemTime> {
        self.inner().next_heartbeat_deadline
    }

    pub(crate) fn last_error(&self) -> Option<Error> {
        self.inner().last_error.clone()
    }

    pub(crate) fn set_last_error(&self, error: Error) {
        self.inner().last_error = Some(error);
    }

    pub(crate) fn clear_last_error(&self) {
        self.inner().last_error = None;
    }

    /// Record a grant: the owning revision, its deadline, state `Held`.
    pub(crate) fn grant(&self, revision: String, deadline: SystemTime) {
        let mut inner = self.inner();
        inner.state = LockState::Held;
        inner.revision = Some(revision);
        inner.next_heartbeat_deadline = Some(deadline);
    }

    /// Install a successful renewal. Returns `false` if the handle left
    /// `Held` in the meantime. A release in flight still gets the new
    /// revision (the write already happened, and the delete must be
    /// conditioned on it), but the renewer stops all the same.
    pub(crate) fn renew(&self, revision: String, deadline: SystemTime) -> bool {
        let mut inner = self.inner();
        match inner.state {
            LockState::Held => {
                inner.revision = Some(revision);
                inner.next_heartbeat_deadline = Some(deadline);
                true
            }
            LockState::Releasing => {
                inner.revision = Some(revision);
                inner.next_heartbeat_deadline = Some(deadline);
                false
            }
            LockState::Idle | LockState::Released => false,
        }
    }

    /// The lease is gone: clear ownership, stash the error, state `Released`.
    pub(crate) fn invalidate(&self, error: Error) {
        let mut inner = self.inner();
        inner.state = LockState::Released;
        inner.revision = None;
        inner.next_heartbeat_deadline = None;
        inner.last_error = Some(error);
    }

    /// Move `Held` to `Releasing`; returns the state found, so the caller
    /// can tell an idle handle from one that already released.
    pub(crate) fn try_begin_release(&self) -> LockState {
        let mut inner = self.inner();
        let found = inner.state;
        if found == LockState::Held {
            inner.state = LockState::Releasing;
        }
        found
    }

    /// A cancelled release puts the handle back to `Held`.
    pub(crate) fn abort_release(&self) {
        let mut inner = self.inner();
        if inner.state == LockState::Releasing {
            inner.state = LockState::Held;
        }
    }

    /// The release ran its course; ownership is gone either way.
    pub(crate) fn finish_release(&self) {
        let mut inner = self.inner();
        inner.state = LockState::Released;
        inner.revision = None;
        inner.next_heartbeat_deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::LockHandle;
    use crate::lock::{ErrorKind, LockState};

    #[test]
    fn grant_then_release_lifecycle() {
        let handle = LockHandle::new();
        assert_eq!(handle.state(), LockState::Idle);
        assert_eq!(handle.revision(), None);

        let deadline = SystemTime::now() + Duration::from_secs(1);
        handle.grant("r-1".into(), deadline);
        assert_eq!(handle.state(), LockState::Held);
        assert_eq!(handle.held_revision().as_deref(), Some("r-1"));
        assert_eq!(handle.next_heartbeat_deadline(), Some(deadline));

        assert_eq!(handle.try_begin_release(), LockState::Held);
        assert_eq!(handle.state(), LockState::Releasing);
        assert_eq!(handle.held_revision(), None);

        handle.finish_release();
        assert_eq!(handle.state(), LockState::Released);
        assert_eq!(handle.revision(), None);
    }

    #[test]
    fn renew_only_applies_while_held() {
        let handle = LockHandle::new();
        let deadline = SystemTime::now();
        assert!(!handle.renew("r-1".into(), deadline));

        handle.grant("r-1".into(), deadline);
        assert!(handle.renew("r-2".into(), deadline + Duration::from_secs(1)));
        assert_eq!(handle.revision().as_deref(), Some("r-2"));

        handle.finish_release();
        assert!(!handle.renew("r-3".into(), deadline));
        assert_eq!(handle.revision(), None);
    }

    #[test]
    fn renew_during_release_installs_revision_but_stops() {
        let handle = LockHandle::new();
        handle.grant("r-1".into(), SystemTime::now());
        handle.try_begin_release();
        assert!(!handle.renew("r-2".into(), SystemTime::now()));
        assert_eq!(handle.revision().as_deref(), Some("r-2"));
    }

    #[test]
    fn invalidate_clears_ownership_and_stashes_error() {
        let handle = LockHandle::new();
        handle.grant("r-1".into(), SystemTime::now());
        handle.invalidate(ErrorKind::LeaseLost.into());
        assert_eq!(handle.state(), LockState::Released);
        assert_eq!(handle.revision(), None);
        assert!(matches!(
            handle.last_error().unwrap().kind(),
            ErrorKind::LeaseLost
        ));
        handle.clear_last_error();
        assert!(handle.last_error().is_none());
    }

    #[test]
    fn abort_release_restores_held() {
        let handle = LockHandle::new();
        handle.grant("r-1".into(), SystemTime::now());
        handle.try_begin_release();
        handle.abort_release();
        assert_eq!(handle.state(), LockState::Held);
        assert_eq!(handle.held_revision().as_deref(), Some("r-1"));
    }
}
