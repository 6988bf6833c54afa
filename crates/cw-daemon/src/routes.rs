//! Axum router and all HTTP handlers for cw-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers.  All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use cw_engine::{Ack, EngineError, RejectReason};
use cw_schemas::{CrossingEvent, PlateReading};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::{
    api_types::{
        ClearTracksResponse, ErrorResponse, EventRequest, EventResponse, HealthResponse,
        OccupancyResponse, PlateRequest, TrackResponse,
    },
    state::{now_epoch, uptime_secs, AppState, BusMsg},
};

/// Hard ceiling on `?limit=` for the forensic read endpoints.
const MAX_RECENT_LIMIT: i64 = 500;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/occupancy", get(occupancy))
        .route("/v1/events", post(ingest_event))
        .route("/v1/events/recent", get(events_recent))
        .route("/v1/audit/recent", get(audit_recent))
        .route("/v1/tracks/:track_id", get(track))
        .route("/v1/plates", post(ingest_plate))
        .route("/v1/plates/:track_id", get(plates_for_track))
        .route("/v1/freeze", post(freeze))
        .route("/v1/unfreeze", post(unfreeze))
        .route("/v1/admin/clear-tracks", post(clear_tracks))
        .route("/v1/stream", get(stream))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
            config_hash: st.config_hash.clone(),
            daemon_uptime_secs: uptime_secs(),
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/occupancy
// ---------------------------------------------------------------------------

pub(crate) async fn occupancy(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let snap = st.engine.snapshot().await;
    (StatusCode::OK, Json(OccupancyResponse::from(snap)))
}

// ---------------------------------------------------------------------------
// POST /v1/events
// ---------------------------------------------------------------------------

/// Ingest one crossing event.
///
/// Applied, duplicate and rejected outcomes are all HTTP 200 — they are
/// acknowledged deliveries, and upstream must not redeliver them. 409 means
/// the system is frozen; 503 means a durable write failed. In both of those
/// cases the event was NOT applied and the caller should redeliver later.
pub(crate) async fn ingest_event(
    State(st): State<Arc<AppState>>,
    Json(req): Json<EventRequest>,
) -> Response {
    let event = CrossingEvent {
        track_id: req.track_id,
        kind: req.kind,
        occupancy_at_event: req.occupancy_at_event,
        timestamp: req.timestamp.unwrap_or_else(now_epoch),
    };

    match st.engine.process(event).await {
        Ok(Ack::Applied {
            snapshot,
            over_capacity,
        }) => {
            let _ = st.bus.send(BusMsg::Occupancy(snapshot));
            (
                StatusCode::OK,
                Json(EventResponse {
                    status: "applied".to_string(),
                    snapshot: Some(snapshot),
                    over_capacity,
                    reject_reason: None,
                }),
            )
                .into_response()
        }
        Ok(Ack::Duplicate { .. }) => (
            StatusCode::OK,
            Json(EventResponse {
                status: "duplicate".to_string(),
                snapshot: None,
                over_capacity: false,
                reject_reason: None,
            }),
        )
            .into_response(),
        Ok(Ack::Rejected { reason, .. }) => (
            StatusCode::OK,
            Json(EventResponse {
                status: "rejected".to_string(),
                snapshot: None,
                over_capacity: false,
                reject_reason: Some(
                    match reason {
                        RejectReason::NotEntered => "not_entered",
                        RejectReason::TrackClosed => "track_closed",
                    }
                    .to_string(),
                ),
            }),
        )
            .into_response(),
        Err(EngineError::Frozen) => refused(
            StatusCode::CONFLICT,
            "FROZEN: occupancy mutations are disabled; unfreeze and redeliver",
        ),
        Err(EngineError::Store(e)) => {
            refused(StatusCode::SERVICE_UNAVAILABLE, &format!("STORE_UNAVAILABLE: {e}"))
        }
        Err(e) => refused(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/tracks/:track_id
// ---------------------------------------------------------------------------

pub(crate) async fn track(
    State(st): State<Arc<AppState>>,
    Path(track_id): Path<i64>,
) -> impl IntoResponse {
    let state = st.engine.vehicle_state(track_id).await;
    (
        StatusCode::OK,
        Json(TrackResponse {
            known: state.is_some(),
            state,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /v1/freeze   POST /v1/unfreeze
// ---------------------------------------------------------------------------

pub(crate) async fn freeze(State(st): State<Arc<AppState>>) -> Response {
    match st.engine.freeze().await {
        Ok(snap) => {
            info!("occupancy frozen by operator");
            let _ = st.bus.send(BusMsg::LogLine {
                level: "WARN".to_string(),
                msg: "occupancy FROZEN".to_string(),
            });
            (StatusCode::OK, Json(OccupancyResponse::from(snap))).into_response()
        }
        Err(e) => refused(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

pub(crate) async fn unfreeze(State(st): State<Arc<AppState>>) -> Response {
    match st.engine.unfreeze().await {
        Ok(snap) => {
            info!("occupancy unfrozen by operator");
            let _ = st.bus.send(BusMsg::LogLine {
                level: "INFO".to_string(),
                msg: "occupancy unfrozen".to_string(),
            });
            (StatusCode::OK, Json(OccupancyResponse::from(snap))).into_response()
        }
        Err(e) => refused(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Forensic reads (DB-backed)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct LimitQuery {
    limit: Option<i64>,
}

pub(crate) async fn events_recent(
    State(st): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Response {
    let Some(pool) = db_pool(&st) else {
        return no_pool();
    };
    match cw_db::recent_events(pool, clamp_limit(&st, q.limit)).await {
        Ok(events) => (StatusCode::OK, Json(events)).into_response(),
        Err(e) => refused(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

pub(crate) async fn audit_recent(
    State(st): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Response {
    let Some(pool) = db_pool(&st) else {
        return no_pool();
    };
    match cw_db::recent_audit(pool, clamp_limit(&st, q.limit)).await {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(e) => refused(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Plate readings
// ---------------------------------------------------------------------------

pub(crate) async fn ingest_plate(
    State(st): State<Arc<AppState>>,
    Json(req): Json<PlateRequest>,
) -> Response {
    let Some(pool) = db_pool(&st) else {
        return no_pool();
    };
    let reading = PlateReading {
        track_id: req.track_id,
        plate_text: req.plate_text,
        confidence: req.confidence,
        kind: req.kind,
        image_path: req.image_path,
        timestamp: req.timestamp.unwrap_or_else(now_epoch),
    };
    match cw_db::insert_plate_reading(pool, &reading).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => refused(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

pub(crate) async fn plates_for_track(
    State(st): State<Arc<AppState>>,
    Path(track_id): Path<i64>,
    Query(q): Query<LimitQuery>,
) -> Response {
    let Some(pool) = db_pool(&st) else {
        return no_pool();
    };
    match cw_db::plate_readings_for_track(pool, track_id, clamp_limit(&st, q.limit)).await {
        Ok(readings) => (StatusCode::OK, Json(readings)).into_response(),
        Err(e) => refused(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/admin/clear-tracks
// ---------------------------------------------------------------------------

/// Administrative reset of the per-track table. The snapshot is left alone;
/// the operator owns reconciling the two (a restart after this surfaces a
/// mismatch warning, not a refusal).
pub(crate) async fn clear_tracks(State(st): State<Arc<AppState>>) -> Response {
    let Some(pool) = db_pool(&st) else {
        return no_pool();
    };
    match cw_db::clear_vehicle_states(pool).await {
        Ok(removed_rows) => {
            info!(removed_rows, "vehicle states cleared by operator");
            (StatusCode::OK, Json(ClearTracksResponse { removed_rows })).into_response()
        }
        Err(e) => refused(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::Occupancy(_) => "occupancy",
                    BusMsg::LogLine { .. } => "log",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn db_pool(st: &AppState) -> Option<&PgPool> {
    st.pool.as_ref()
}

fn clamp_limit(st: &AppState, requested: Option<i64>) -> i64 {
    requested
        .unwrap_or(st.config.recent_limit)
        .clamp(1, MAX_RECENT_LIMIT)
}

fn no_pool() -> Response {
    refused(
        StatusCode::SERVICE_UNAVAILABLE,
        "DB_UNAVAILABLE: daemon is running without a database pool",
    )
}

fn refused(status: StatusCode, error: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}
