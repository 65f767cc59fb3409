// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Background lease renewal for a held lock.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::identifier::LockIdentifier;
use crate::lock::handle::LockHandle;
use crate::lock::{ErrorKind, generate_revision};
use crate::store::{self, LockItem, LockStore, UpdateOutcome};

/// Pause between renewal attempts once the store has exhausted its own
/// retries for one heartbeat.
const RETRY_PAUSE: Duration = Duration::from_millis(100);

/// A spawned renewal task plus the signals to stop it.
#[derive(Debug)]
pub(crate) struct Renewer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Renewer {
    /// Start renewing the lease recorded on `handle` at half the lease
    /// interval.
    pub(crate) fn spawn<S: LockStore>(
        store: Arc<S>,
        handle: LockHandle,
        identifier: LockIdentifier,
        lease: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(renew_task(store, handle, identifier, lease, cancel.clone()));
        Self { cancel, task }
    }

    /// Request stop without waiting. For drop paths that cannot await.
    pub(crate) fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Request stop and wait for the task to wind down. The task never
    /// blocks past its current store attempt, so this is bounded.
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Half the lease, with up to 10% of jitter either way so contending
/// processes do not heartbeat in lockstep.
fn heartbeat_pause(lease: Duration) -> Duration {
    let jitter_multiplier = rand::thread_rng().gen_range(0.90..=1.10);
    (lease / 2).mul_f64(jitter_multiplier)
}

/// What one heartbeat concluded.
enum Renewal {
    /// The lease was renewed; give up no later than this.
    Renewed(Instant),
    /// Renewal is over, by loss, failure, or request.
    Stopped,
}

async fn renew_task<S: LockStore>(
    store: Arc<S>,
    handle: LockHandle,
    identifier: LockIdentifier,
    lease: Duration,
    cancel: CancellationToken,
) {
    let mut deadline = Instant::now() + lease;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                log::debug!("renewal for {identifier} stopped");
                return;
            }
            () = tokio::time::sleep(heartbeat_pause(lease)) => {}
        }
        let Some(expected) = handle.held_revision() else {
            return;
        };
        match renew_once(&store, &handle, &identifier, lease, &cancel, &expected, deadline).await {
            Renewal::Renewed(next_deadline) => deadline = next_deadline,
            Renewal::Stopped => return,
        }
    }
}

/// One heartbeat: write a fresh revision conditioned on the current one,
/// retrying store outages on our own clock until the heartbeat deadline.
async fn renew_once<S: LockStore>(
    store: &Arc<S>,
    handle: &LockHandle,
    identifier: &LockIdentifier,
    lease: Duration,
    cancel: &CancellationToken,
    expected: &str,
    deadline: Instant,
) -> Renewal {
    loop {
        let revision = generate_revision();
        let started = Instant::now();
        let now = SystemTime::now();
        let item = LockItem::new(lease, revision.clone(), store::ttl_for_lease(now, lease));
        match store
            .update_if_revision_matches(identifier.table(), identifier.item_id(), &item, expected)
            .await
        {
            Ok(UpdateOutcome::Written) => {
                if handle.renew(revision, now + lease) {
                    log::debug!("lease on {identifier} renewed");
                    return Renewal::Renewed(started + lease);
                }
                return Renewal::Stopped;
            }
            Ok(UpdateOutcome::Conflict) => {
                log::warn!("lease on {identifier} was taken over, stopping renewal");
                handle.invalidate(ErrorKind::LeaseLost.into());
                return Renewal::Stopped;
            }
            Err(error) => {
                if Instant::now() >= deadline {
                    log::error!("could not renew lease on {identifier} before its deadline: {error}");
                    handle.invalidate(error.into());
                    return Renewal::Stopped;
                }
                log::warn!("lease renewal on {identifier} failed, retrying: {error}");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Renewal::Stopped,
                    () = tokio::time::sleep(RETRY_PAUSE) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    use super::{Renewer, heartbeat_pause};
    use crate::identifier::LockIdentifier;
    use crate::lock::handle::LockHandle;
    use crate::lock::{ErrorKind, LockState, generate_revision};
    use crate::store::testing::MemoryStore;
    use crate::store::{self, LockItem};

    const LEASE: Duration = Duration::from_secs(1);

    fn identifier() -> LockIdentifier {
        "ddb://locks/renewed".parse().unwrap()
    }

    /// A handle and store already carrying one granted lease.
    fn granted() -> (Arc<MemoryStore>, LockHandle) {
        let store = Arc::new(MemoryStore::new());
        let handle = LockHandle::new();
        let revision = generate_revision();
        let now = SystemTime::now();
        store.insert(
            "locks",
            "renewed",
            LockItem::new(LEASE, revision.clone(), store::ttl_for_lease(now, LEASE)),
        );
        handle.grant(revision, now + LEASE);
        (store, handle)
    }

    #[test]
    fn pause_is_half_the_lease_with_jitter() {
        for _ in 0..200 {
            let pause = heartbeat_pause(LEASE);
            assert!(pause >= Duration::from_millis(450));
            assert!(pause <= Duration::from_millis(550));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renews_and_advances_the_revision() {
        let (store, handle) = granted();
        let first = handle.revision().unwrap();
        let renewer = Renewer::spawn(Arc::clone(&store), handle.clone(), identifier(), LEASE);

        tokio::time::sleep(LEASE).await;
        let second = handle.revision().unwrap();
        assert_ne!(second, first);
        assert_eq!(store.get("locks", "renewed").unwrap().revision(), &second);
        assert_eq!(handle.state(), LockState::Held);

        tokio::time::sleep(LEASE).await;
        let third = handle.revision().unwrap();
        assert_ne!(third, second);
        assert_eq!(store.get("locks", "renewed").unwrap().revision(), &third);

        renewer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_means_the_lease_is_lost() {
        let (store, handle) = granted();
        let renewer = Renewer::spawn(Arc::clone(&store), handle.clone(), identifier(), LEASE);

        let thief = LockItem::new(
            LEASE,
            "thief".into(),
            store::ttl_for_lease(SystemTime::now(), LEASE),
        );
        store.insert("locks", "renewed", thief);

        tokio::time::sleep(LEASE).await;
        assert_eq!(handle.state(), LockState::Released);
        assert_eq!(handle.revision(), None);
        assert!(matches!(
            handle.last_error().unwrap().kind(),
            ErrorKind::LeaseLost
        ));
        assert_eq!(store.get("locks", "renewed").unwrap().revision(), "thief");

        renewer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn outage_past_the_deadline_gives_up() {
        let (store, handle) = granted();
        let renewer = Renewer::spawn(Arc::clone(&store), handle.clone(), identifier(), LEASE);

        store.set_fail_writes(true);
        tokio::time::sleep(LEASE * 2).await;
        assert_eq!(handle.state(), LockState::Released);
        assert!(matches!(
            handle.last_error().unwrap().kind(),
            ErrorKind::StoreUnavailable(_)
        ));

        renewer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn outage_within_the_deadline_recovers() {
        let (store, handle) = granted();
        let first = handle.revision().unwrap();
        let renewer = Renewer::spawn(Arc::clone(&store), handle.clone(), identifier(), LEASE);

        store.set_fail_writes(true);
        // The first beat fails at ~lease/2 and enters its local retry loop.
        tokio::time::sleep(Duration::from_millis(700)).await;
        store.set_fail_writes(false);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(handle.state(), LockState::Held);
        assert_ne!(handle.revision().unwrap(), first);

        renewer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_honored_mid_sleep() {
        let (store, handle) = granted();
        let first = handle.revision().unwrap();
        let renewer = Renewer::spawn(Arc::clone(&store), handle.clone(), identifier(), LEASE);

        renewer.stop().await;
        tokio::time::sleep(LEASE * 2).await;
        assert_eq!(handle.revision().unwrap(), first);
        assert_eq!(store.get("locks", "renewed").unwrap().revision(), &first);
    }
}
