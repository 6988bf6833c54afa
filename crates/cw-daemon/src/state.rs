//! Shared runtime state for cw-daemon.
//!
//! All types here are `Clone`-able (via `Arc` or copy). Handlers receive
//! `State<Arc<AppState>>` from Axum; this module owns nothing async itself.

use std::sync::Arc;
use std::time::Duration;

use cw_config::Config;
use cw_engine::Engine;
use cw_schemas::OccupancySnapshot;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::warn;

// ---------------------------------------------------------------------------
// BusMsg — SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    Occupancy(OccupancySnapshot),
    LogLine { level: String, msg: String },
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The reconciliation core; every occupancy read and mutation goes
    /// through it.
    pub engine: Arc<Engine>,
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    /// Static build metadata.
    pub build: BuildInfo,
    /// Effective daemon config (already validated).
    pub config: Config,
    /// sha256 of the canonical effective config, surfaced in /v1/health.
    pub config_hash: String,
    /// Pool for the forensic read endpoints (recent events, audit trail,
    /// plate readings) and administrative resets. `None` in router-only
    /// tests; those endpoints then answer 503.
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(
        engine: Arc<Engine>,
        config: Config,
        config_hash: String,
        pool: Option<PgPool>,
    ) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        Self {
            engine,
            bus,
            build: BuildInfo {
                service: "cw-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            config,
            config_hash,
            pool,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Wall clock as epoch seconds, the unit all observation timestamps use.
pub fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}

/// Spawn the retention sweep: every `interval`, evict tracks that fully
/// departed more than `retention` ago. Failures are logged and retried on
/// the next tick; the sweep never takes the daemon down.
pub fn spawn_retention_sweep(state: Arc<AppState>, interval: Duration, retention: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let cutoff = now_epoch() - retention.as_secs_f64();
            if let Err(e) = state.engine.sweep_departed(cutoff).await {
                warn!(error = %e, "retention sweep failed; will retry");
                let _ = state.bus.send(BusMsg::LogLine {
                    level: "WARN".to_string(),
                    msg: format!("retention sweep failed: {e}"),
                });
            }
        }
    });
}
