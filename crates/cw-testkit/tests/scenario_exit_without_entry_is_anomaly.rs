//! Scenario: Exit For An Unknown Track Is Logged But Never Applied
//!
//! # Invariant under test
//! An exit event for a track the engine has never seen (expected for
//! vehicles already inside when observation started) must leave the
//! snapshot untouched, produce no audit entry, and still land in the raw
//! event log.

use std::sync::Arc;

use cw_engine::{Ack, Engine, OccupancyStore, RejectReason};
use cw_schemas::{CrossingEvent, EventKind};
use cw_testkit::MemoryStore;

fn ev(track_id: i64, kind: EventKind, ts: f64) -> CrossingEvent {
    CrossingEvent {
        track_id,
        kind,
        occupancy_at_event: 0,
        timestamp: ts,
    }
}

#[tokio::test]
async fn unknown_exit_leaves_snapshot_unchanged() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::recover(Arc::clone(&store) as Arc<dyn OccupancyStore>, 80)
        .await
        .expect("recover");

    // One legitimate vehicle inside, so occupancy is 1.
    engine.process(ev(1, EventKind::Entry, 100.0)).await.unwrap();

    let ack = engine.process(ev(99, EventKind::Exit, 120.0)).await.unwrap();
    assert_eq!(
        ack,
        Ack::Rejected {
            track_id: 99,
            reason: RejectReason::NotEntered
        }
    );

    let snap = engine.snapshot().await;
    assert_eq!(snap.occupancy, 1, "occupancy unchanged by anomalous exit");
    assert_eq!(snap.exit_count, 0);

    // Event log has the anomaly; audit trail does not.
    assert_eq!(store.events().len(), 2);
    assert_eq!(store.audit().len(), 1);
    assert!(store.audit().iter().all(|a| !a.reason.contains("track 99")));
}

#[tokio::test]
async fn anomalous_exit_does_not_create_vehicle_state() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::recover(Arc::clone(&store) as Arc<dyn OccupancyStore>, 80)
        .await
        .expect("recover");

    engine.process(ev(99, EventKind::Exit, 120.0)).await.unwrap();

    // No durable row: the track never transitioned.
    assert!(store.vehicle_row(99).is_none());

    // A later entry for the same id is therefore a normal first entry.
    let ack = engine.process(ev(99, EventKind::Entry, 130.0)).await.unwrap();
    assert!(matches!(ack, Ack::Applied { .. }));
    assert_eq!(engine.snapshot().await.occupancy, 1);
}
