//! Scenario: Exit Clamp When The Snapshot Was Reset Behind The Engine
//!
//! # Invariant under test
//! If an operator resets the snapshot row but not the vehicle rows, an exit
//! for a still-Inside track would drive occupancy negative. The clamp path
//! accepts the exit (the track transitions to Departed) but leaves every
//! counter untouched, records the clamp in the audit trail, and keeps
//! `occupancy == entry_count - exit_count` true.

use std::sync::Arc;

use cw_engine::{Ack, Engine, OccupancyStore, CLAMPED_EXIT_REASON};
use cw_schemas::{CrossingEvent, EventKind, OccupancySnapshot};
use cw_testkit::MemoryStore;

fn ev(track_id: i64, kind: EventKind, ts: f64) -> CrossingEvent {
    CrossingEvent {
        track_id,
        kind,
        occupancy_at_event: 0,
        timestamp: ts,
    }
}

async fn recover(store: &Arc<MemoryStore>) -> Engine {
    Engine::recover(Arc::clone(store) as Arc<dyn OccupancyStore>, 80)
        .await
        .expect("recover")
}

#[tokio::test]
async fn clamped_exit_leaves_counters_untouched() {
    let store = Arc::new(MemoryStore::new());

    {
        let engine = recover(&store).await;
        engine.process(ev(3, EventKind::Entry, 100.0)).await.unwrap();
    }

    // Operator reset: snapshot zeroed, vehicle rows left behind. The row is
    // internally consistent, just out of step with the vehicle table.
    let version = store.snapshot_row().unwrap().version;
    store.force_snapshot(OccupancySnapshot {
        version,
        ..OccupancySnapshot::empty(80)
    });

    // Recovery proceeds (with a logged mismatch warning); the track is
    // still Inside from its durable row.
    let engine = recover(&store).await;
    assert_eq!(engine.snapshot().await.occupancy, 0);

    let ack = engine.process(ev(3, EventKind::Exit, 150.0)).await.unwrap();
    match ack {
        Ack::Applied { snapshot, .. } => {
            assert_eq!(snapshot.occupancy, 0, "clamp must not go negative");
            assert_eq!(snapshot.entry_count, 0);
            assert_eq!(snapshot.exit_count, 0, "clamp leaves counters alone");
            assert!(snapshot.is_consistent());
            assert_eq!(snapshot.version, version + 1, "clamp still versions the row");
        }
        other => panic!("expected Applied, got {other:?}"),
    }

    // The clamp is visible in the trail and the track is closed for good.
    let audit = store.audit();
    assert_eq!(audit.last().unwrap().reason, CLAMPED_EXIT_REASON);
    let v = store.vehicle_row(3).unwrap();
    assert!(v.has_entered && v.has_exited);

    // A redelivered exit is now a plain duplicate.
    let ack = engine.process(ev(3, EventKind::Exit, 150.0)).await.unwrap();
    assert_eq!(
        ack,
        Ack::Duplicate {
            track_id: 3,
            kind: EventKind::Exit
        }
    );
}
