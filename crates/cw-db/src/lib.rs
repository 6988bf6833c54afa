//! cw-db
//!
//! PostgreSQL persistence for Curbwatch: the event log, the singleton
//! occupancy snapshot, the audit trail, per-track vehicle states and the
//! supplementary plate-reading table.
//!
//! Free functions over a [`PgPool`] cover reads and administrative writes;
//! [`PgStore`](crate::pg_store::PgStore) wraps the pool behind the engine's
//! `OccupancyStore` seam and owns the transactional transition commit.

pub mod pg_store;

pub use pg_store::PgStore;

use anyhow::{Context, Result};
use cw_schemas::{AuditEntry, CrossingEvent, EventKind, OccupancySnapshot, PlateReading, VehicleState};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

pub const ENV_DB_URL: &str = "CW_DATABASE_URL";

/// Connect to Postgres using CW_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url =
        std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='occupancy_snapshot'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_snapshot_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_snapshot_table: bool,
}

// ---------------------------------------------------------------------------
// Occupancy snapshot
// ---------------------------------------------------------------------------

pub(crate) const SNAPSHOT_COLUMNS: &str =
    "occupancy, entry_count, exit_count, max_capacity, last_update, frozen, version";

pub(crate) fn snapshot_from_row(row: &PgRow) -> Result<OccupancySnapshot, sqlx::Error> {
    Ok(OccupancySnapshot {
        occupancy: row.try_get("occupancy")?,
        entry_count: row.try_get("entry_count")?,
        exit_count: row.try_get("exit_count")?,
        max_capacity: row.try_get("max_capacity")?,
        last_update: row.try_get("last_update")?,
        frozen: row.try_get("frozen")?,
        version: row.try_get("version")?,
    })
}

/// Read the singleton snapshot row, if initialized.
pub async fn load_snapshot(pool: &PgPool) -> Result<Option<OccupancySnapshot>> {
    let row = sqlx::query(&format!(
        "select {SNAPSHOT_COLUMNS} from occupancy_snapshot where id = 1"
    ))
    .fetch_optional(pool)
    .await
    .context("load_snapshot failed")?;

    match row {
        Some(r) => Ok(Some(snapshot_from_row(&r).context("snapshot row decode")?)),
        None => Ok(None),
    }
}

/// Create the singleton snapshot row if absent; returns the current row
/// either way.
pub async fn init_snapshot(pool: &PgPool, max_capacity: i64) -> Result<OccupancySnapshot> {
    sqlx::query(
        r#"
        insert into occupancy_snapshot (id, max_capacity)
        values (1, $1)
        on conflict (id) do nothing
        "#,
    )
    .bind(max_capacity)
    .execute(pool)
    .await
    .context("init_snapshot insert failed")?;

    load_snapshot(pool)
        .await?
        .context("snapshot row missing after init")
}

/// Set or clear the freeze flag; bumps the version counter. `last_update`
/// is untouched — it records the last accepted transition only.
pub async fn set_frozen(pool: &PgPool, frozen: bool) -> Result<OccupancySnapshot> {
    let row = sqlx::query(&format!(
        r#"
        update occupancy_snapshot
           set frozen = $1,
               version = version + 1
         where id = 1
        returning {SNAPSHOT_COLUMNS}
        "#
    ))
    .bind(frozen)
    .fetch_one(pool)
    .await
    .context("set_frozen update failed")?;

    snapshot_from_row(&row).context("snapshot row decode")
}

// ---------------------------------------------------------------------------
// Event log (append-only)
// ---------------------------------------------------------------------------

/// Append one raw crossing event. Every received event lands here,
/// accepted or not.
pub async fn insert_event(pool: &PgPool, event: &CrossingEvent) -> Result<()> {
    sqlx::query(
        r#"
        insert into vehicle_events (track_id, event_type, occupancy_at_event, timestamp)
        values ($1, $2, $3, $4)
        "#,
    )
    .bind(event.track_id)
    .bind(event.kind.as_str())
    .bind(event.occupancy_at_event)
    .bind(event.timestamp)
    .execute(pool)
    .await
    .context("insert_event failed")?;
    Ok(())
}

/// Most recent raw events, newest first. Forensic/reporting read.
pub async fn recent_events(pool: &PgPool, limit: i64) -> Result<Vec<CrossingEvent>> {
    let rows = sqlx::query(
        r#"
        select track_id, event_type, occupancy_at_event, timestamp
        from vehicle_events
        order by timestamp desc, id desc
        limit $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("recent_events failed")?;

    rows.iter()
        .map(|r| {
            Ok(CrossingEvent {
                track_id: r.try_get("track_id")?,
                kind: EventKind::parse(&r.try_get::<String, _>("event_type")?)?,
                occupancy_at_event: r.try_get("occupancy_at_event")?,
                timestamp: r.try_get("timestamp")?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Audit trail (append-only)
// ---------------------------------------------------------------------------

/// Most recent audit entries, newest first. Read surface for operator
/// tooling; the core only ever appends (inside the transition transaction).
pub async fn recent_audit(pool: &PgPool, limit: i64) -> Result<Vec<AuditEntry>> {
    let rows = sqlx::query(
        r#"
        select occupancy, reason, timestamp
        from audit_log
        order by id desc
        limit $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("recent_audit failed")?;

    rows.iter()
        .map(|r| {
            Ok(AuditEntry {
                occupancy: r.try_get("occupancy")?,
                reason: r.try_get("reason")?,
                timestamp: r.try_get("timestamp")?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Vehicle states
// ---------------------------------------------------------------------------

/// All per-track bookkeeping rows (startup recovery).
pub async fn load_vehicle_states(pool: &PgPool) -> Result<Vec<VehicleState>> {
    let rows = sqlx::query(
        "select track_id, has_entered, has_exited, last_seen from vehicle_states",
    )
    .fetch_all(pool)
    .await
    .context("load_vehicle_states failed")?;

    rows.iter()
        .map(|r| {
            Ok(VehicleState {
                track_id: r.try_get("track_id")?,
                has_entered: r.try_get("has_entered")?,
                has_exited: r.try_get("has_exited")?,
                last_seen: r.try_get("last_seen")?,
            })
        })
        .collect()
}

/// Retention sweep: remove fully departed rows last touched before `cutoff`.
pub async fn evict_departed_before(pool: &PgPool, cutoff: f64) -> Result<u64> {
    let res = sqlx::query(
        r#"
        delete from vehicle_states
        where has_entered and has_exited
          and last_seen is not null
          and last_seen < $1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("evict_departed_before failed")?;
    Ok(res.rows_affected())
}

/// Administrative reset: delete all vehicle states. Does NOT touch the
/// snapshot — the operator owns reconciling the two after a manual reset.
pub async fn clear_vehicle_states(pool: &PgPool) -> Result<u64> {
    let res = sqlx::query("delete from vehicle_states")
        .execute(pool)
        .await
        .context("clear_vehicle_states failed")?;
    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// Plate readings (external collaborator data)
// ---------------------------------------------------------------------------

/// Store one OCR plate reading. Written by the plate-reading integration,
/// never read by the engine.
pub async fn insert_plate_reading(pool: &PgPool, reading: &PlateReading) -> Result<()> {
    sqlx::query(
        r#"
        insert into plate_readings (track_id, plate_text, confidence, event_type, image_path, timestamp)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(reading.track_id)
    .bind(&reading.plate_text)
    .bind(reading.confidence)
    .bind(reading.kind.map(|k| k.as_str()))
    .bind(&reading.image_path)
    .bind(reading.timestamp)
    .execute(pool)
    .await
    .context("insert_plate_reading failed")?;
    Ok(())
}

/// Plate readings for one track, newest first.
pub async fn plate_readings_for_track(
    pool: &PgPool,
    track_id: i64,
    limit: i64,
) -> Result<Vec<PlateReading>> {
    let rows = sqlx::query(
        r#"
        select track_id, plate_text, confidence, event_type, image_path, timestamp
        from plate_readings
        where track_id = $1
        order by timestamp desc
        limit $2
        "#,
    )
    .bind(track_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("plate_readings_for_track failed")?;

    rows.iter()
        .map(|r| {
            let kind = r
                .try_get::<Option<String>, _>("event_type")?
                .map(|s| EventKind::parse(&s))
                .transpose()?;
            Ok(PlateReading {
                track_id: r.try_get("track_id")?,
                plate_text: r.try_get("plate_text")?,
                confidence: r.try_get("confidence")?,
                kind,
                image_path: r.try_get("image_path")?,
                timestamp: r.try_get("timestamp")?,
            })
        })
        .collect()
}

/// Detect a Postgres check/unique constraint violation by name.
pub fn is_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.constraint() == Some(constraint),
        _ => false,
    }
}
