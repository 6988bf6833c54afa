//! `OccupancyStore` implementation backed by PostgreSQL.
//!
//! The transition commit runs inside one database transaction. The snapshot mutation is a single read-modify-write UPDATE
//! guarded by `not frozen`, so the freeze check, the counter change and the
//! version bump are one atomic statement; the vehicle upsert and audit
//! append ride in the same transaction. A crash at any point leaves either
//! everything or nothing committed.

use async_trait::async_trait;
use cw_engine::store::{
    CommitOutcome, OccupancyStore, StoreError, TransitionAction, TransitionCommit,
    OVER_CAPACITY_SUFFIX,
};
use cw_schemas::{CrossingEvent, OccupancySnapshot, VehicleState};
use sqlx::PgPool;

use crate::{snapshot_from_row, SNAPSHOT_COLUMNS};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn unavailable(op: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::unavailable(format!("{op}: {e}"))
}

fn unavailable_any(op: &str) -> impl FnOnce(anyhow::Error) -> StoreError + '_ {
    move |e| StoreError::unavailable(format!("{op}: {e:#}"))
}

#[async_trait]
impl OccupancyStore for PgStore {
    async fn load_snapshot(&self) -> Result<Option<OccupancySnapshot>, StoreError> {
        crate::load_snapshot(&self.pool)
            .await
            .map_err(unavailable_any("load_snapshot"))
    }

    async fn init_snapshot(&self, max_capacity: i64) -> Result<OccupancySnapshot, StoreError> {
        crate::init_snapshot(&self.pool, max_capacity)
            .await
            .map_err(unavailable_any("init_snapshot"))
    }

    async fn load_vehicle_states(&self) -> Result<Vec<VehicleState>, StoreError> {
        crate::load_vehicle_states(&self.pool)
            .await
            .map_err(unavailable_any("load_vehicle_states"))
    }

    async fn append_event(&self, event: &CrossingEvent) -> Result<(), StoreError> {
        crate::insert_event(&self.pool, event)
            .await
            .map_err(unavailable_any("append_event"))
    }

    async fn commit_transition(
        &self,
        commit: &TransitionCommit,
    ) -> Result<CommitOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(unavailable("begin transition tx"))?;

        // Snapshot mutation + freeze gate in one statement. Zero rows back
        // means the row is frozen (or the singleton is missing).
        let update_sql = match commit.action {
            TransitionAction::Entry => format!(
                r#"
                update occupancy_snapshot
                   set occupancy = occupancy + 1,
                       entry_count = entry_count + 1,
                       last_update = $1,
                       version = version + 1
                 where id = 1 and not frozen
                returning {SNAPSHOT_COLUMNS}
                "#
            ),
            TransitionAction::Exit => format!(
                r#"
                update occupancy_snapshot
                   set occupancy = occupancy - 1,
                       exit_count = exit_count + 1,
                       last_update = $1,
                       version = version + 1
                 where id = 1 and not frozen
                returning {SNAPSHOT_COLUMNS}
                "#
            ),
            // Counters deliberately untouched; see engine docs on the
            // clamped-exit path.
            TransitionAction::ExitClamped => format!(
                r#"
                update occupancy_snapshot
                   set last_update = $1,
                       version = version + 1
                 where id = 1 and not frozen
                returning {SNAPSHOT_COLUMNS}
                "#
            ),
        };

        let row = sqlx::query(&update_sql)
            .bind(commit.timestamp)
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable("snapshot update"))?;

        let Some(row) = row else {
            let frozen: Option<bool> =
                sqlx::query_scalar("select frozen from occupancy_snapshot where id = 1")
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(unavailable("frozen probe"))?;
            tx.rollback().await.map_err(unavailable("rollback"))?;
            return match frozen {
                Some(true) => Ok(CommitOutcome::Frozen),
                _ => Err(StoreError::unavailable("snapshot singleton row missing")),
            };
        };

        let snapshot = snapshot_from_row(&row).map_err(unavailable("snapshot decode"))?;

        // Vehicle-state upsert, same transaction. The exit insert arm sets
        // has_entered too: an exited row without an entry would trip
        // ck_exit_requires_entry (and can only occur via the clamp path).
        let vehicle_sql = match commit.action {
            TransitionAction::Entry => {
                r#"
                insert into vehicle_states (track_id, has_entered, has_exited, last_seen)
                values ($1, true, false, $2)
                on conflict (track_id) do update
                    set has_entered = true, last_seen = excluded.last_seen
                "#
            }
            TransitionAction::Exit | TransitionAction::ExitClamped => {
                r#"
                insert into vehicle_states (track_id, has_entered, has_exited, last_seen)
                values ($1, true, true, $2)
                on conflict (track_id) do update
                    set has_exited = true, last_seen = excluded.last_seen
                "#
            }
        };
        sqlx::query(vehicle_sql)
            .bind(commit.track_id)
            .bind(commit.timestamp)
            .execute(&mut *tx)
            .await
            .map_err(unavailable("vehicle upsert"))?;

        // Audit append, same transaction. The over-capacity annotation is
        // decided from the occupancy the UPDATE just returned, so it cannot
        // go stale under concurrent entries on other tracks.
        let mut reason = commit.reason.clone();
        if commit.action == TransitionAction::Entry && snapshot.occupancy > snapshot.max_capacity {
            reason.push_str(OVER_CAPACITY_SUFFIX);
        }
        sqlx::query("insert into audit_log (occupancy, reason, timestamp) values ($1, $2, $3)")
            .bind(snapshot.occupancy)
            .bind(&reason)
            .bind(commit.timestamp)
            .execute(&mut *tx)
            .await
            .map_err(unavailable("audit append"))?;

        tx.commit().await.map_err(unavailable("commit"))?;
        Ok(CommitOutcome::Applied(snapshot))
    }

    async fn set_frozen(&self, frozen: bool) -> Result<OccupancySnapshot, StoreError> {
        crate::set_frozen(&self.pool, frozen)
            .await
            .map_err(unavailable_any("set_frozen"))
    }

    async fn evict_departed_before(&self, cutoff: f64) -> Result<u64, StoreError> {
        crate::evict_departed_before(&self.pool, cutoff)
            .await
            .map_err(unavailable_any("evict_departed_before"))
    }
}
