//! Monitor leases: a CAS-based distributed lock keyed by controller
//! identity, persisted as the `(holder, expiry)` pair on the controller
//! record. Multiple coordinating processes race on the same pair; the
//! store's conditional update is the only synchronization primitive, so
//! exactly one CAS wins each contested transition and the losers see the
//! winner's pair.

use std::sync::Arc;

use chrono::Duration;
use tracing::debug;

use crate::record::{ControllerTag, LeaseHolding};
use crate::store::Store;
use crate::time::Clock;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Expiry granted by `claim` and `renew`.
    pub ttl: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(15),
        }
    }
}

pub struct LeaseManager {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: LeaseConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Single conditional transition of a controller's lease pair.
    ///
    /// Applied only if the stored pair exactly equals `previous`; on
    /// mismatch the error carries the pair actually stored so a losing
    /// caller can see who won. Dropping a lease is an `acquire` to the free
    /// holding.
    pub async fn acquire(
        &self,
        controller: &ControllerTag,
        previous: &LeaseHolding,
        next: &LeaseHolding,
    ) -> Result<()> {
        match self
            .store
            .compare_and_set_lease(controller, previous, next)
            .await
        {
            Ok(()) => {
                debug!(%controller, holder = %next.holder, expiry = %next.expiry, "lease transition applied");
                Ok(())
            }
            Err(Error::ConditionFailed { holder, expiry }) => {
                Err(Error::LeaseUnavailable { holder, expiry })
            }
            Err(e) => Err(e),
        }
    }

    /// Claim (or extend) the monitor lease for `holder`.
    ///
    /// Reads the current pair, checks it is free or already owned by
    /// `holder` at the injected clock's notion of now, then attempts the
    /// CAS against exactly the pair that was read. A concurrent winner
    /// surfaces as `LeaseUnavailable` carrying its pair.
    pub async fn claim(&self, controller: &ControllerTag, holder: &str) -> Result<LeaseHolding> {
        let now = self.clock.now();
        let current = self.store.controller(controller).await?.lease;

        if !current.is_free(now) && current.holder != holder {
            return Err(Error::LeaseUnavailable {
                holder: current.holder,
                expiry: current.expiry,
            });
        }

        let next = LeaseHolding::held_by(holder, now + self.config.ttl);
        self.acquire(controller, &current, &next).await?;
        Ok(next)
    }

    /// Extend a lease already held. A renewal is a claim by the current
    /// holder with a later expiry; an expired or foreign lease cannot be
    /// renewed.
    pub async fn renew(&self, controller: &ControllerTag, holder: &str) -> Result<LeaseHolding> {
        let now = self.clock.now();
        let current = self.store.controller(controller).await?.lease;

        if !current.is_held_by(holder, now) {
            return Err(Error::LeaseUnavailable {
                holder: current.holder,
                expiry: current.expiry,
            });
        }

        let next = LeaseHolding::held_by(holder, now + self.config.ttl);
        self.acquire(controller, &current, &next).await?;
        Ok(next)
    }

    /// Drop the lease if `holder` still holds it. Releasing a lease that
    /// has already changed hands fails with the current holder's pair.
    pub async fn release(&self, controller: &ControllerTag, holder: &str) -> Result<()> {
        let current = self.store.controller(controller).await?.lease;
        if current.holder != holder {
            return Err(Error::LeaseUnavailable {
                holder: current.holder,
                expiry: current.expiry,
            });
        }
        self.acquire(controller, &current, &LeaseHolding::free())
            .await
    }

    /// The stored pair, unfiltered; callers apply their own lazy-expiry
    /// comparison.
    pub async fn holding(&self, controller: &ControllerTag) -> Result<LeaseHolding> {
        Ok(self.store.controller(controller).await?.lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ControllerRecord;
    use crate::store::MemoryStore;
    use crate::time::ManualClock;
    use chrono::Utc;

    fn manager(ttl_secs: i64) -> (LeaseManager, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = LeaseConfig {
            ttl: Duration::seconds(ttl_secs),
        };
        (
            LeaseManager::new(store.clone(), clock.clone(), config),
            store,
            clock,
        )
    }

    async fn seed_controller(store: &MemoryStore) -> ControllerTag {
        let tag = ControllerTag::new("alice", "eu-1");
        store
            .insert_controller(ControllerRecord::new(tag.clone(), "aws", "eu-west-1"))
            .await
            .unwrap();
        tag
    }

    #[tokio::test]
    async fn free_lease_claimed_then_rival_rejected() {
        let (manager, store, clock) = manager(15);
        let tag = seed_controller(&store).await;
        let now = clock.now();

        let held = manager.claim(&tag, "worker-1").await.unwrap();
        assert_eq!(held.holder, "worker-1");
        assert_eq!(held.expiry, now + Duration::seconds(15));

        let err = manager.claim(&tag, "worker-2").await.unwrap_err();
        match err {
            Error::LeaseUnavailable { holder, expiry } => {
                assert_eq!(holder, "worker-1");
                assert_eq!(expiry, held.expiry);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn reacquisition_by_holder_extends_expiry() {
        let (manager, store, clock) = manager(15);
        let tag = seed_controller(&store).await;

        let first = manager.claim(&tag, "worker-1").await.unwrap();
        clock.advance(Duration::seconds(10));
        let second = manager.claim(&tag, "worker-1").await.unwrap();
        assert_eq!(second.holder, "worker-1");
        assert!(second.expiry > first.expiry);
    }

    #[tokio::test]
    async fn expired_lease_is_claimable_by_anyone() {
        let (manager, store, clock) = manager(15);
        let tag = seed_controller(&store).await;

        manager.claim(&tag, "worker-1").await.unwrap();
        clock.advance(Duration::seconds(16));

        let held = manager.claim(&tag, "worker-2").await.unwrap();
        assert_eq!(held.holder, "worker-2");
    }

    #[tokio::test]
    async fn renew_requires_a_live_holding() {
        let (manager, store, clock) = manager(15);
        let tag = seed_controller(&store).await;

        manager.claim(&tag, "worker-1").await.unwrap();
        clock.advance(Duration::seconds(16));
        let err = manager.renew(&tag, "worker-1").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::LeaseUnavailable);
    }

    #[tokio::test]
    async fn release_frees_the_pair() {
        let (manager, store, _clock) = manager(15);
        let tag = seed_controller(&store).await;

        manager.claim(&tag, "worker-1").await.unwrap();
        manager.release(&tag, "worker-1").await.unwrap();
        assert_eq!(manager.holding(&tag).await.unwrap(), LeaseHolding::free());

        let held = manager.claim(&tag, "worker-2").await.unwrap();
        assert_eq!(held.holder, "worker-2");
    }

    #[tokio::test]
    async fn release_by_non_holder_is_refused() {
        let (manager, store, _clock) = manager(15);
        let tag = seed_controller(&store).await;

        manager.claim(&tag, "worker-1").await.unwrap();
        let err = manager.release(&tag, "worker-2").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::LeaseUnavailable);
    }

    #[tokio::test]
    async fn missing_controller_is_not_found() {
        let (manager, _store, _clock) = manager(15);
        let tag = ControllerTag::new("alice", "nowhere");
        let err = manager.claim(&tag, "worker-1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn contested_cas_admits_exactly_one_winner() {
        let (manager, store, clock) = manager(15);
        let tag = seed_controller(&store).await;
        let manager = Arc::new(manager);

        // All contenders read the free pair, then race the CAS itself.
        let free = LeaseHolding::free();
        let now = clock.now();
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let manager = manager.clone();
            let tag = tag.clone();
            let free = free.clone();
            let next = LeaseHolding::held_by(format!("worker-{i}"), now + Duration::seconds(15));
            tasks.spawn(async move { manager.acquire(&tag, &free, &next).await });
        }

        let mut winners = 0;
        let mut losers = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined.unwrap() {
                Ok(()) => winners += 1,
                Err(Error::LeaseUnavailable { holder, .. }) => {
                    assert!(holder.starts_with("worker-"));
                    losers += 1;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(losers, 7);
    }
}
