//! Request and response types for all cw-daemon HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded
//! by Axum and decoded by tests.  No business logic lives here.

use cw_schemas::{EventKind, OccupancySnapshot, VehicleState};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
    pub config_hash: String,
    pub daemon_uptime_secs: u64,
}

// ---------------------------------------------------------------------------
// /v1/events
// ---------------------------------------------------------------------------

/// One crossing event as submitted by the tracker integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRequest {
    pub track_id: i64,
    pub kind: EventKind,
    /// Occupancy the tracker claims to see; recorded, never trusted.
    #[serde(default)]
    pub occupancy_at_event: i64,
    /// Epoch seconds. Defaults to the daemon's clock when absent.
    pub timestamp: Option<f64>,
}

/// Outcome of ingesting one event. `status` is "applied", "duplicate" or
/// "rejected"; the ingest is a success (HTTP 200) in all three cases so
/// upstream retry loops treat them uniformly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<OccupancySnapshot>,
    #[serde(default)]
    pub over_capacity: bool,
    /// Set when `status == "rejected"`: "not_entered" | "track_closed".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// /v1/occupancy  /v1/freeze  /v1/unfreeze
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccupancyResponse {
    #[serde(flatten)]
    pub snapshot: OccupancySnapshot,
    /// Advisory: occupancy has reached or passed max_capacity.
    pub at_capacity: bool,
}

impl From<OccupancySnapshot> for OccupancyResponse {
    fn from(snapshot: OccupancySnapshot) -> Self {
        Self {
            at_capacity: snapshot.at_capacity(),
            snapshot,
        }
    }
}

// ---------------------------------------------------------------------------
// /v1/tracks/:track_id
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackResponse {
    pub known: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<VehicleState>,
}

// ---------------------------------------------------------------------------
// /v1/plates
// ---------------------------------------------------------------------------

/// One OCR plate reading submitted by the plate-reading integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlateRequest {
    pub track_id: i64,
    pub plate_text: String,
    pub confidence: Option<f64>,
    pub kind: Option<EventKind>,
    pub image_path: Option<String>,
    pub timestamp: Option<f64>,
}

// ---------------------------------------------------------------------------
// /v1/admin/clear-tracks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearTracksResponse {
    pub removed_rows: u64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Uniform error body for 4xx/5xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
