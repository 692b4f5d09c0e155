//! Monitor-lease behavior across competing coordinating processes, driven
//! entirely through the public API with a manual clock.

use std::sync::Arc;

use chrono::{Duration, Utc};
use fleetcore::lease::{LeaseConfig, LeaseManager};
use fleetcore::record::{ControllerRecord, ControllerTag, LeaseHolding};
use fleetcore::store::{MemoryStore, Store};
use fleetcore::time::{Clock, ManualClock};
use fleetcore::{Error, ErrorKind};

fn setup(ttl_secs: i64) -> (LeaseManager, Arc<MemoryStore>, Arc<ManualClock>) {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let manager = LeaseManager::new(
        store.clone(),
        clock.clone(),
        LeaseConfig {
            ttl: Duration::seconds(ttl_secs),
        },
    );
    (manager, store, clock)
}

async fn seed(store: &MemoryStore, name: &str) -> ControllerTag {
    let tag = ControllerTag::new("admin", name);
    store
        .insert_controller(ControllerRecord::new(tag.clone(), "aws", "eu-west-1"))
        .await
        .unwrap();
    tag
}

// The pair starts free, worker-1 claims for 15s, and worker-2's racing
// claim is told exactly who holds the lease and until when.
#[tokio::test]
async fn fresh_claim_then_losing_rival() {
    let (manager, store, clock) = setup(15);
    let tag = seed(&store, "c1").await;
    let now = clock.now();

    let held = manager.claim(&tag, "worker-1").await.unwrap();
    assert_eq!(held.holder, "worker-1");
    assert_eq!(held.expiry, now + Duration::seconds(15));

    match manager.claim(&tag, "worker-2").await.unwrap_err() {
        Error::LeaseUnavailable { holder, expiry } => {
            assert_eq!(holder, "worker-1");
            assert_eq!(expiry, now + Duration::seconds(15));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn holder_renewal_only_moves_the_expiry() {
    let (manager, store, clock) = setup(15);
    let tag = seed(&store, "c1").await;

    let first = manager.claim(&tag, "worker-1").await.unwrap();
    clock.advance(Duration::seconds(5));
    let renewed = manager.renew(&tag, "worker-1").await.unwrap();

    assert_eq!(renewed.holder, first.holder);
    assert_eq!(renewed.expiry, first.expiry + Duration::seconds(5));
}

#[tokio::test]
async fn expiry_is_lazy_no_sweeper_needed() {
    let (manager, store, clock) = setup(15);
    let tag = seed(&store, "c1").await;

    manager.claim(&tag, "worker-1").await.unwrap();
    clock.advance(Duration::seconds(20));

    // The stored pair still names worker-1, but it is logically free.
    let stored = manager.holding(&tag).await.unwrap();
    assert_eq!(stored.holder, "worker-1");
    assert!(stored.is_free(clock.now()));

    let taken = manager.claim(&tag, "worker-2").await.unwrap();
    assert_eq!(taken.holder, "worker-2");
}

#[tokio::test]
async fn release_then_reacquire_by_another_worker() {
    let (manager, store, _clock) = setup(15);
    let tag = seed(&store, "c1").await;

    manager.claim(&tag, "worker-1").await.unwrap();
    manager.release(&tag, "worker-1").await.unwrap();
    assert_eq!(manager.holding(&tag).await.unwrap(), LeaseHolding::free());

    manager.claim(&tag, "worker-2").await.unwrap();
    let err = manager.release(&tag, "worker-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LeaseUnavailable);
}

#[tokio::test]
async fn leases_on_different_controllers_are_independent() {
    let (manager, store, _clock) = setup(15);
    let c1 = seed(&store, "c1").await;
    let c2 = seed(&store, "c2").await;

    manager.claim(&c1, "worker-1").await.unwrap();
    let held = manager.claim(&c2, "worker-2").await.unwrap();
    assert_eq!(held.holder, "worker-2");
}

#[tokio::test]
async fn contested_acquires_admit_one_winner_per_stored_value() {
    let (manager, store, clock) = setup(15);
    let tag = seed(&store, "c1").await;
    let manager = Arc::new(manager);
    let now = clock.now();

    // Sixteen workers all observed the free pair before racing.
    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..16 {
        let manager = manager.clone();
        let tag = tag.clone();
        let next = LeaseHolding::held_by(format!("worker-{i}"), now + Duration::seconds(15));
        tasks.spawn(async move { manager.acquire(&tag, &LeaseHolding::free(), &next).await });
    }

    let mut winners = 0;
    while let Some(joined) = tasks.join_next().await {
        if joined.unwrap().is_ok() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    // The stored pair belongs to the single winner.
    let stored = manager.holding(&tag).await.unwrap();
    assert!(stored.holder.starts_with("worker-"));
    assert!(!stored.is_free(now));
}
