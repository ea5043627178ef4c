//! Lease lock shared by every supervisor pointed at the same store.
//!
//! A lease is a row in the store's lease table: an owner plus an expiry.
//! Holding it grants the right to run one unit of work. Leases expire on
//! their own, so a crashed holder frees the key after at most one budget.
//! A live holder keeps renewing until its work returns.

use std::future::Future;
use std::time::Duration;

use fleet_state::{StateStore, epoch_millis};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LockError;

/// Floor for the renewal period of very short budgets.
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Clone)]
pub struct StoreLock {
    store: StateStore,
    owner: String,
}

impl StoreLock {
    /// A lock handle with a fresh owner identity.
    pub fn new(store: StateStore) -> Self {
        Self::with_owner(store, Uuid::new_v4().to_string())
    }

    pub fn with_owner(store: StateStore, owner: impl Into<String>) -> Self {
        Self {
            store,
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Run `work` while holding the lease on `key`.
    ///
    /// The lease is taken for `budget` and renewed every third of it until
    /// `work` returns, so nobody else can take it while `work` runs. If `work`
    /// is still running when the budget elapses, `on_timeout` is called once
    /// and `work` is awaited to completion anyway; it is never dropped
    /// mid-flight. The lease is released afterwards.
    ///
    /// Fails with [`LockError::Busy`] without running `work` when another
    /// owner holds an unexpired lease.
    pub async fn with_lock<T, Fut>(
        &self,
        key: &str,
        budget: Duration,
        on_timeout: impl FnOnce(),
        work: Fut,
    ) -> Result<T, LockError>
    where
        Fut: Future<Output = T>,
    {
        let renew_every = (budget / 3).max(MIN_RENEW_INTERVAL);
        let ttl_ms = u64::try_from(budget.max(renew_every * 3).as_millis()).unwrap_or(u64::MAX);
        if !self
            .store
            .try_acquire_lease(key, &self.owner, ttl_ms, epoch_millis())?
        {
            debug!(key, owner = %self.owner, "lock busy");
            return Err(LockError::Busy(key.to_string()));
        }

        let mut renewal = tokio::time::interval(renew_every);
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        renewal.tick().await;

        let deadline = tokio::time::sleep(budget);
        let mut on_timeout = Some(on_timeout);
        tokio::pin!(work, deadline);
        let output = loop {
            tokio::select! {
                output = &mut work => break output,
                _ = &mut deadline, if on_timeout.is_some() => {
                    warn!(key, ?budget, "lock budget exceeded");
                    if let Some(on_timeout) = on_timeout.take() {
                        on_timeout();
                    }
                }
                _ = renewal.tick() => self.renew(key, ttl_ms),
            }
        };

        match self.store.release_lease(key, &self.owner) {
            Ok(true) => {}
            Ok(false) => warn!(key, owner = %self.owner, "lease was taken over before release"),
            Err(e) => warn!(key, error = %e, "failed to release lease"),
        }
        Ok(output)
    }

    fn renew(&self, key: &str, ttl_ms: u64) {
        match self.store.renew_lease(key, &self.owner, ttl_ms, epoch_millis()) {
            Ok(true) => {}
            Ok(false) => warn!(key, owner = %self.owner, "lease lost while holding it"),
            Err(e) => warn!(key, error = %e, "failed to renew lease"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn runs_work_and_releases() {
        let store = StateStore::open_in_memory().unwrap();
        let lock = StoreLock::new(store.clone());

        let value = lock
            .with_lock("k", Duration::from_secs(5), || {}, async { 7 })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(store.get_lease("k").unwrap().is_none());
    }

    #[tokio::test]
    async fn second_owner_is_busy_while_held() {
        let store = StateStore::open_in_memory().unwrap();
        let first = StoreLock::new(store.clone());
        let second = StoreLock::new(store.clone());
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (held_tx, held_rx) = oneshot::channel::<()>();

        let holder = tokio::spawn(async move {
            first
                .with_lock("k", Duration::from_secs(5), || {}, async move {
                    held_tx.send(()).unwrap();
                    release_rx.await.unwrap();
                })
                .await
        });
        held_rx.await.unwrap();

        let ran = AtomicBool::new(false);
        let err = second
            .with_lock("k", Duration::from_secs(5), || {}, async {
                ran.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Busy(key) if key == "k"));
        assert!(!ran.load(Ordering::SeqCst));

        release_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert!(
            second
                .with_lock("k", Duration::from_secs(5), || {}, async {})
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn timeout_signals_once_and_work_completes() {
        let store = StateStore::open_in_memory().unwrap();
        let lock = StoreLock::new(store.clone());
        let signalled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&signalled);

        let value = lock
            .with_lock(
                "k",
                Duration::from_millis(20),
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                async {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    "done"
                },
            )
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(signalled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lease_outlives_budget_while_work_runs() {
        let store = StateStore::open_in_memory().unwrap();
        let first = StoreLock::new(store.clone());
        let second = StoreLock::new(store.clone());

        let holder = tokio::spawn(async move {
            first
                .with_lock("k", Duration::from_millis(20), || {}, async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                })
                .await
        });

        // Well past the budget, the first holder is still working.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let ran = AtomicBool::new(false);
        let err = second
            .with_lock("k", Duration::from_millis(20), || {}, async {
                ran.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Busy(_)));
        assert!(!ran.load(Ordering::SeqCst));

        holder.await.unwrap().unwrap();
        assert!(store.get_lease("k").unwrap().is_none());
        assert!(
            second
                .with_lock("k", Duration::from_millis(20), || {}, async {})
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let store = StateStore::open_in_memory().unwrap();
        // A crashed holder left a lease that already expired.
        store
            .try_acquire_lease("k", "crashed", 1, epoch_millis() - 10)
            .unwrap();

        let lock = StoreLock::with_owner(store.clone(), "fresh");
        assert!(
            lock.with_lock("k", Duration::from_secs(1), || {}, async {})
                .await
                .is_ok()
        );
    }
}
