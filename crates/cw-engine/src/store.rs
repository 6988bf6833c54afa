//! Durable-store seam consumed by the reconciliation engine.
//!
//! The engine never talks to a database directly; it talks to an
//! [`OccupancyStore`]. The production implementation is `cw-db::PgStore`
//! (PostgreSQL); `cw-testkit::MemoryStore` provides the in-process
//! implementation the scenario tests run against.
//!
//! # Contract
//! `commit_transition` is the transactional unit: the vehicle-state
//! mutation, the snapshot mutation and the audit append must commit
//! together or not at all. `append_event` is a separate durable write that
//! happens before validation and regardless of whether the event is later
//! accepted.

use async_trait::async_trait;
use cw_schemas::{CrossingEvent, OccupancySnapshot, VehicleState};

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Failure of the underlying durable store.
///
/// All variants mean "nothing was committed" — a store implementation must
/// never surface this after a partial commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not complete the write (connection lost, timeout,
    /// constraint machinery unavailable). The caller should retry the same
    /// event later; retries are idempotent.
    Unavailable { context: String },
}

impl StoreError {
    pub fn unavailable(context: impl Into<String>) -> Self {
        Self::Unavailable {
            context: context.into(),
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable { context } => write!(f, "store unavailable: {context}"),
        }
    }
}

impl std::error::Error for StoreError {}

// ---------------------------------------------------------------------------
// TransitionCommit
// ---------------------------------------------------------------------------

/// What the snapshot side of a commit must do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionAction {
    /// Increment `occupancy` and `entry_count`; mark the track entered.
    Entry,
    /// Decrement `occupancy`, increment `exit_count`; mark the track exited.
    Exit,
    /// Defensive path: record the exit on the track and append the audit
    /// entry, but leave all counters untouched. Taken when an exit would
    /// drive occupancy below zero — which the state machine makes
    /// unreachable unless the snapshot was administratively reset.
    ExitClamped,
}

/// Appended to an entry's audit reason by the store when the post-commit
/// occupancy exceeds `max_capacity`. The decision has to live inside the
/// commit: only there is the occupancy this entry actually landed at known.
pub const OVER_CAPACITY_SUFFIX: &str = " (over capacity)";

/// One validated transition, ready to be committed atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionCommit {
    pub track_id: i64,
    pub action: TransitionAction,
    /// Epoch seconds of the causing event; becomes `last_seen` on the
    /// vehicle row and `last_update` on the snapshot.
    pub timestamp: f64,
    /// Human-readable audit reason, composed by the engine. For `Entry`
    /// actions the store appends [`OVER_CAPACITY_SUFFIX`] when warranted.
    pub reason: String,
}

/// Result of [`OccupancyStore::commit_transition`].
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// Everything committed; carries the post-commit snapshot.
    Applied(OccupancySnapshot),
    /// The snapshot row is frozen; nothing was committed.
    Frozen,
}

// ---------------------------------------------------------------------------
// OccupancyStore
// ---------------------------------------------------------------------------

/// Durable persistence operations required by the engine.
#[async_trait]
pub trait OccupancyStore: Send + Sync {
    /// Read the singleton snapshot row, or `None` if the deployment has
    /// never been initialized.
    async fn load_snapshot(&self) -> Result<Option<OccupancySnapshot>, StoreError>;

    /// Create the singleton snapshot row with the given capacity. Called
    /// once, at first boot. Implementations may treat an existing row as
    /// success and return it unchanged.
    async fn init_snapshot(&self, max_capacity: i64) -> Result<OccupancySnapshot, StoreError>;

    /// All per-track bookkeeping rows, for startup recovery.
    async fn load_vehicle_states(&self) -> Result<Vec<VehicleState>, StoreError>;

    /// Step 1: append one raw crossing event to the event log. Pure append;
    /// duplicates of the same event produce distinct rows by design (the
    /// event log is forensic, not a source of state).
    async fn append_event(&self, event: &CrossingEvent) -> Result<(), StoreError>;

    /// The atomic unit: mutate the vehicle row, mutate the snapshot (per
    /// [`TransitionAction`]), append the audit entry.
    /// Must check the freeze flag inside the same transaction and return
    /// [`CommitOutcome::Frozen`] without committing anything if set.
    /// For `Entry` actions, the audit reason gets [`OVER_CAPACITY_SUFFIX`]
    /// appended when the post-commit occupancy exceeds `max_capacity` —
    /// callers derive the advisory flag from the returned snapshot.
    async fn commit_transition(
        &self,
        commit: &TransitionCommit,
    ) -> Result<CommitOutcome, StoreError>;

    /// Set or clear the freeze flag; returns the updated snapshot. Bumps
    /// `version` but leaves `last_update` alone — that field records the
    /// last accepted transition, and an administrative toggle is not one.
    async fn set_frozen(&self, frozen: bool) -> Result<OccupancySnapshot, StoreError>;

    /// Retention sweep: delete vehicle rows that are fully departed and
    /// whose `last_seen` is strictly older than `cutoff` (epoch seconds).
    /// Returns the number of rows removed.
    async fn evict_departed_before(&self, cutoff: f64) -> Result<u64, StoreError>;
}
