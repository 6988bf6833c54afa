//! Scenario: Crash During Durable Write, Then Restart And Redeliver
//!
//! # Invariant under test
//! A failure at either durable-write stage (event-log append or transition
//! commit) surfaces `StoreUnavailable` with NOTHING committed. After a
//! simulated restart (`Engine::recover` over the same store), redelivering
//! the same event applies it exactly once — never zero times, never twice —
//! and `occupancy == entry_count - exit_count` holds at every step.
//!
//! Restart simulation: the store outlives the engine, exactly as Postgres
//! outlives the process.

use std::sync::Arc;

use cw_engine::{Ack, Engine, EngineError, OccupancyStore, StoreError};
use cw_schemas::{CrossingEvent, EventKind};
use cw_testkit::{FaultStore, MemoryStore};

fn ev(track_id: i64, kind: EventKind, ts: f64) -> CrossingEvent {
    CrossingEvent {
        track_id,
        kind,
        occupancy_at_event: 0,
        timestamp: ts,
    }
}

async fn recover(store: &Arc<FaultStore>) -> Engine {
    Engine::recover(Arc::clone(store) as Arc<dyn OccupancyStore>, 80)
        .await
        .expect("recover")
}

#[tokio::test]
async fn commit_failure_then_restart_applies_exactly_once() {
    let mem = Arc::new(MemoryStore::new());
    let store = Arc::new(FaultStore::new(Arc::clone(&mem)));
    let engine = recover(&store).await;

    // The commit dies after validation; the event-log append succeeded.
    store.fail_next_commits(1);
    let err = engine
        .process(ev(1, EventKind::Entry, 100.0))
        .await
        .expect_err("injected commit failure must surface");
    assert!(matches!(err, EngineError::Store(StoreError::Unavailable { .. })));

    // Nothing committed: no snapshot change, no vehicle row, no audit.
    assert_eq!(mem.snapshot_row().unwrap().occupancy, 0);
    assert!(mem.vehicle_row(1).is_none());
    assert!(mem.audit().is_empty());
    assert_eq!(mem.events().len(), 1, "step-1 append happened before the crash");

    // "Restart": fresh engine over the surviving store, then redeliver.
    drop(engine);
    let engine = recover(&store).await;
    let ack = engine.process(ev(1, EventKind::Entry, 100.0)).await.unwrap();
    assert!(matches!(ack, Ack::Applied { .. }));

    let snap = engine.snapshot().await;
    assert_eq!(snap.occupancy, 1);
    assert_eq!(snap.entry_count, 1);
    assert!(snap.is_consistent());
    assert_eq!(mem.audit().len(), 1, "exactly one audit entry after retry");
    assert_eq!(store.commit_attempts(), 2, "one failed, one successful commit");
}

#[tokio::test]
async fn append_failure_commits_nothing_at_all() {
    let mem = Arc::new(MemoryStore::new());
    let store = Arc::new(FaultStore::new(Arc::clone(&mem)));
    let engine = recover(&store).await;

    store.fail_next_appends(1);
    let err = engine
        .process(ev(2, EventKind::Entry, 100.0))
        .await
        .expect_err("injected append failure must surface");
    assert!(matches!(err, EngineError::Store(StoreError::Unavailable { .. })));

    // Step 1 never completed, so validation/commit were never reached.
    assert!(mem.events().is_empty());
    assert_eq!(store.commit_attempts(), 0);
    assert_eq!(mem.snapshot_row().unwrap().occupancy, 0);

    // Plain retry on the same engine (transient outage, no restart).
    let ack = engine.process(ev(2, EventKind::Entry, 100.0)).await.unwrap();
    assert!(matches!(ack, Ack::Applied { .. }));
    assert_eq!(engine.snapshot().await.occupancy, 1);
}

#[tokio::test]
async fn exit_commit_failure_keeps_vehicle_inside() {
    let mem = Arc::new(MemoryStore::new());
    let store = Arc::new(FaultStore::new(Arc::clone(&mem)));
    let engine = recover(&store).await;

    engine.process(ev(3, EventKind::Entry, 100.0)).await.unwrap();

    store.fail_next_commits(1);
    engine
        .process(ev(3, EventKind::Exit, 150.0))
        .await
        .expect_err("injected exit commit failure");

    // Track still Inside durably and in the engine's view.
    let v = mem.vehicle_row(3).unwrap();
    assert!(v.has_entered && !v.has_exited);
    assert_eq!(engine.snapshot().await.occupancy, 1);

    // Restart, redeliver: exit applies once.
    drop(engine);
    let engine = recover(&store).await;
    let ack = engine.process(ev(3, EventKind::Exit, 150.0)).await.unwrap();
    assert!(matches!(ack, Ack::Applied { .. }));

    let snap = engine.snapshot().await;
    assert_eq!(snap.occupancy, 0);
    assert_eq!(snap.exit_count, 1);
    assert!(snap.is_consistent());
}
