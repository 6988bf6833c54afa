//! In-memory `OccupancyStore` with the same commit semantics as `PgStore`.
//!
//! One mutex guards all tables, so `commit_transition` is trivially atomic:
//! the snapshot change, the vehicle upsert and the audit append happen under
//! a single lock or not at all.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use cw_engine::store::{
    CommitOutcome, OccupancyStore, StoreError, TransitionAction, TransitionCommit,
    OVER_CAPACITY_SUFFIX,
};
use cw_schemas::{AuditEntry, CrossingEvent, OccupancySnapshot, VehicleState};

#[derive(Default)]
struct MemoryInner {
    snapshot: Option<OccupancySnapshot>,
    vehicles: BTreeMap<i64, VehicleState>,
    events: Vec<CrossingEvent>,
    audit: Vec<AuditEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Test inspection surface
    // -----------------------------------------------------------------------

    /// All raw events appended so far (the event log).
    pub fn events(&self) -> Vec<CrossingEvent> {
        self.inner.lock().expect("store poisoned").events.clone()
    }

    /// All audit entries appended so far.
    pub fn audit(&self) -> Vec<AuditEntry> {
        self.inner.lock().expect("store poisoned").audit.clone()
    }

    /// Current durable snapshot row, if initialized.
    pub fn snapshot_row(&self) -> Option<OccupancySnapshot> {
        self.inner.lock().expect("store poisoned").snapshot
    }

    /// Current durable vehicle row for a track.
    pub fn vehicle_row(&self, track_id: i64) -> Option<VehicleState> {
        self.inner
            .lock()
            .expect("store poisoned")
            .vehicles
            .get(&track_id)
            .copied()
    }

    /// Overwrite the snapshot row, bypassing the commit path. Stands in for
    /// an administrative reset done behind the engine's back; used to reach
    /// the defensive exit-clamp branch.
    pub fn force_snapshot(&self, snapshot: OccupancySnapshot) {
        self.inner.lock().expect("store poisoned").snapshot = Some(snapshot);
    }
}

#[async_trait]
impl OccupancyStore for MemoryStore {
    async fn load_snapshot(&self) -> Result<Option<OccupancySnapshot>, StoreError> {
        Ok(self.inner.lock().expect("store poisoned").snapshot)
    }

    async fn init_snapshot(&self, max_capacity: i64) -> Result<OccupancySnapshot, StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let snap = *inner
            .snapshot
            .get_or_insert_with(|| OccupancySnapshot::empty(max_capacity));
        Ok(snap)
    }

    async fn load_vehicle_states(&self) -> Result<Vec<VehicleState>, StoreError> {
        Ok(self
            .inner
            .lock()
            .expect("store poisoned")
            .vehicles
            .values()
            .copied()
            .collect())
    }

    async fn append_event(&self, event: &CrossingEvent) -> Result<(), StoreError> {
        self.inner
            .lock()
            .expect("store poisoned")
            .events
            .push(event.clone());
        Ok(())
    }

    async fn commit_transition(
        &self,
        commit: &TransitionCommit,
    ) -> Result<CommitOutcome, StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");

        let Some(mut snap) = inner.snapshot else {
            return Err(StoreError::unavailable("snapshot singleton row missing"));
        };
        if snap.frozen {
            return Ok(CommitOutcome::Frozen);
        }

        match commit.action {
            TransitionAction::Entry => {
                snap.occupancy += 1;
                snap.entry_count += 1;
            }
            TransitionAction::Exit => {
                snap.occupancy -= 1;
                snap.exit_count += 1;
            }
            TransitionAction::ExitClamped => {}
        }
        snap.last_update = Some(commit.timestamp);
        snap.version += 1;

        debug_assert!(snap.is_consistent(), "commit produced inconsistent snapshot");

        let vehicle = inner
            .vehicles
            .entry(commit.track_id)
            .or_insert_with(|| VehicleState::unseen(commit.track_id));
        match commit.action {
            TransitionAction::Entry => vehicle.has_entered = true,
            TransitionAction::Exit | TransitionAction::ExitClamped => {
                vehicle.has_entered = true;
                vehicle.has_exited = true;
            }
        }
        vehicle.last_seen = Some(commit.timestamp);

        // Over-capacity annotation is decided here, from the occupancy this
        // commit produced, so concurrent entries on other tracks cannot make
        // it stale.
        let mut reason = commit.reason.clone();
        if commit.action == TransitionAction::Entry && snap.occupancy > snap.max_capacity {
            reason.push_str(OVER_CAPACITY_SUFFIX);
        }
        inner.audit.push(AuditEntry {
            occupancy: snap.occupancy,
            reason,
            timestamp: commit.timestamp,
        });
        inner.snapshot = Some(snap);

        Ok(CommitOutcome::Applied(snap))
    }

    async fn set_frozen(&self, frozen: bool) -> Result<OccupancySnapshot, StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let Some(mut snap) = inner.snapshot else {
            return Err(StoreError::unavailable("snapshot singleton row missing"));
        };
        snap.frozen = frozen;
        snap.version += 1;
        inner.snapshot = Some(snap);
        Ok(snap)
    }

    async fn evict_departed_before(&self, cutoff: f64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let before = inner.vehicles.len();
        inner.vehicles.retain(|_, v| {
            !(v.has_entered && v.has_exited && v.last_seen.map(|t| t < cutoff).unwrap_or(false))
        });
        Ok((before - inner.vehicles.len()) as u64)
    }
}
