//! Failure-injecting wrapper around [`MemoryStore`].
//!
//! Models the two durable-write stages an event can die at: the event-log
//! append and the transition commit.
//!
//! An injected failure surfaces as `StoreError::Unavailable` with NOTHING
//! committed — the same guarantee a rolled-back Postgres transaction gives.
//! Tests arm N failures, drive the engine into them, then redeliver and
//! assert exactly-once application.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cw_engine::store::{
    CommitOutcome, OccupancyStore, StoreError, TransitionCommit,
};
use cw_schemas::{CrossingEvent, OccupancySnapshot, VehicleState};

use crate::MemoryStore;

pub struct FaultStore {
    inner: Arc<MemoryStore>,
    /// Remaining event-log appends to fail.
    fail_appends: AtomicU32,
    /// Remaining transition commits to fail.
    fail_commits: AtomicU32,
    commit_attempts: AtomicU64,
}

impl FaultStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_appends: AtomicU32::new(0),
            fail_commits: AtomicU32::new(0),
            commit_attempts: AtomicU64::new(0),
        }
    }

    /// Fail the next `n` event-log appends.
    pub fn fail_next_appends(&self, n: u32) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` transition commits (before anything is applied).
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Total commit attempts seen, including failed ones.
    pub fn commit_attempts(&self) -> u64 {
        self.commit_attempts.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &MemoryStore {
        &self.inner
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl OccupancyStore for FaultStore {
    async fn load_snapshot(&self) -> Result<Option<OccupancySnapshot>, StoreError> {
        self.inner.load_snapshot().await
    }

    async fn init_snapshot(&self, max_capacity: i64) -> Result<OccupancySnapshot, StoreError> {
        self.inner.init_snapshot(max_capacity).await
    }

    async fn load_vehicle_states(&self) -> Result<Vec<VehicleState>, StoreError> {
        self.inner.load_vehicle_states().await
    }

    async fn append_event(&self, event: &CrossingEvent) -> Result<(), StoreError> {
        if Self::take_failure(&self.fail_appends) {
            return Err(StoreError::unavailable("injected: event append failed"));
        }
        self.inner.append_event(event).await
    }

    async fn commit_transition(
        &self,
        commit: &TransitionCommit,
    ) -> Result<CommitOutcome, StoreError> {
        self.commit_attempts.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_commits) {
            return Err(StoreError::unavailable("injected: commit failed"));
        }
        self.inner.commit_transition(commit).await
    }

    async fn set_frozen(&self, frozen: bool) -> Result<OccupancySnapshot, StoreError> {
        self.inner.set_frozen(frozen).await
    }

    async fn evict_departed_before(&self, cutoff: f64) -> Result<u64, StoreError> {
        self.inner.evict_departed_before(cutoff).await
    }
}
