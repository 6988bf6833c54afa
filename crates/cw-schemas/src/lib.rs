//! Shared data model for Curbwatch.
//!
//! Plain serde types used across the engine, the store implementations and
//! the daemon. Timestamps on observation data are epoch seconds (`f64`),
//! matching what the upstream tracker emits; wall-clock bookkeeping columns
//! use `chrono::DateTime<Utc>` at the DB layer only.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Default configured capacity when no explicit value is provided.
pub const DEFAULT_MAX_CAPACITY: i64 = 80;

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

/// Direction of a crossing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Entry,
    Exit,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Entry => "entry",
            EventKind::Exit => "exit",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "entry" => Ok(EventKind::Entry),
            "exit" => Ok(EventKind::Exit),
            other => Err(anyhow!("invalid event kind: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// CrossingEvent
// ---------------------------------------------------------------------------

/// One observed entry or exit for a track, as delivered by the upstream
/// vision tracker. Immutable once received; always appended to the event
/// log regardless of whether it is accepted as a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossingEvent {
    /// Identifier the tracker assigned to one physical vehicle's traversal.
    pub track_id: i64,
    pub kind: EventKind,
    /// Occupancy the tracker *claims* to observe. Advisory only — the
    /// authoritative value is computed by the engine, never trusted from
    /// the event.
    pub occupancy_at_event: i64,
    /// Epoch seconds. Monotonic per source, not globally ordered across
    /// tracks.
    pub timestamp: f64,
}

// ---------------------------------------------------------------------------
// VehicleState
// ---------------------------------------------------------------------------

/// Per-track recovery bookkeeping. One row per `track_id`.
///
/// Both booleans transition false→true exactly once; `has_exited` implies
/// `has_entered`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub track_id: i64,
    pub has_entered: bool,
    pub has_exited: bool,
    /// Epoch seconds of the most recent accepted event for this track.
    pub last_seen: Option<f64>,
}

impl VehicleState {
    pub fn unseen(track_id: i64) -> Self {
        Self {
            track_id,
            has_entered: false,
            has_exited: false,
            last_seen: None,
        }
    }

    /// Invariant check: a vehicle cannot have exited without having entered.
    pub fn is_consistent(&self) -> bool {
        self.has_entered || !self.has_exited
    }
}

// ---------------------------------------------------------------------------
// OccupancySnapshot
// ---------------------------------------------------------------------------

/// The single authoritative occupancy record. Exactly one instance exists
/// for the lifetime of a deployment; all mutation goes through the engine's
/// transactional commit path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OccupancySnapshot {
    /// Current count of vehicles inside. Never negative.
    pub occupancy: i64,
    /// Cumulative accepted entries. Monotonically non-decreasing.
    pub entry_count: i64,
    /// Cumulative accepted exits. Monotonically non-decreasing.
    pub exit_count: i64,
    /// Configured ceiling. Advisory — entries above it are accepted and
    /// flagged in the audit reason, never rejected.
    pub max_capacity: i64,
    /// Epoch seconds of the last accepted transition.
    pub last_update: Option<f64>,
    /// Operator-invoked safety stop. While true the engine refuses all
    /// occupancy mutations (raw events are still event-logged).
    pub frozen: bool,
    /// Optimistic-concurrency counter, incremented on every committed
    /// mutation of this row.
    pub version: i64,
}

impl OccupancySnapshot {
    pub fn empty(max_capacity: i64) -> Self {
        Self {
            occupancy: 0,
            entry_count: 0,
            exit_count: 0,
            max_capacity,
            last_update: None,
            frozen: false,
            version: 0,
        }
    }

    /// The core accounting invariant: `occupancy == entry_count - exit_count`,
    /// occupancy never negative, capacity strictly positive.
    pub fn is_consistent(&self) -> bool {
        self.occupancy == self.entry_count - self.exit_count
            && self.occupancy >= 0
            && self.entry_count >= 0
            && self.exit_count >= 0
            && self.max_capacity > 0
    }

    /// True when the lot holds at least `max_capacity` vehicles.
    pub fn at_capacity(&self) -> bool {
        self.occupancy >= self.max_capacity
    }
}

// ---------------------------------------------------------------------------
// AuditEntry
// ---------------------------------------------------------------------------

/// Immutable record of one accepted occupancy change. Append-only; never
/// mutated or deleted by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Occupancy *after* the change.
    pub occupancy: i64,
    /// Human-readable cause, e.g. "entry: track 42".
    pub reason: String,
    /// Epoch seconds of the causing event.
    pub timestamp: f64,
}

// ---------------------------------------------------------------------------
// PlateReading
// ---------------------------------------------------------------------------

/// A license-plate OCR result produced by the external plate-reading
/// subsystem, stored alongside occupancy data but never required for
/// occupancy correctness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateReading {
    pub track_id: i64,
    pub plate_text: String,
    pub confidence: Option<f64>,
    pub kind: Option<EventKind>,
    pub image_path: Option<String>,
    /// Epoch seconds of the capture.
    pub timestamp: f64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
