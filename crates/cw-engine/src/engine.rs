//! The occupancy reconciliation engine.
//!
//! Consumes one [`CrossingEvent`] at a time, decides whether it is a
//! legitimate state transition for its track, and commits the occupancy
//! change exactly once per transition through the [`OccupancyStore`] seam.
//!
//! # Per-track state machine
//! ```text
//! Unseen --entry--> Inside --exit--> Departed
//! ```
//! - duplicate entry (track already Inside) and duplicate exit (track
//!   already Departed) are absorbed idempotently: logged, not applied,
//!   acknowledged as [`Ack::Duplicate`];
//! - exit for an Unseen track is an anomaly (`NotEntered`) — expected for
//!   tracks that started before this engine's observation window;
//! - any event for a Departed track is an anomaly (`TrackClosed`) — a
//!   departed track never re-opens; upstream allocates a fresh track_id for
//!   a returning vehicle.
//!
//! # Concurrency
//! Events for different tracks proceed concurrently; events for one track
//! are serialized by a per-track async mutex held across the durable
//! writes. The snapshot mirror is only written under a track lock plus the
//! store's own transaction, so it always equals the durable row.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use cw_schemas::{CrossingEvent, EventKind, OccupancySnapshot, VehicleState};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::store::{
    CommitOutcome, OccupancyStore, StoreError, TransitionAction, TransitionCommit,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures the engine surfaces to its caller.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Administrative stop is active. The raw event was still event-logged;
    /// upstream should retry after unfreeze.
    Frozen,
    /// Durable-write failure; nothing was committed. Retry the same event.
    Store(StoreError),
    /// Recovery found a snapshot that violates its own invariants. The
    /// store was tampered with or corrupted; refusing to start beats
    /// forging an occupancy the system never observed.
    CorruptSnapshot { snapshot: OccupancySnapshot },
    /// Recovery found a vehicle row claiming an exit without an entry.
    CorruptVehicleState { track_id: i64 },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frozen => write!(f, "occupancy mutations are frozen"),
            Self::Store(e) => write!(f, "{e}"),
            Self::CorruptSnapshot { snapshot } => write!(
                f,
                "corrupt snapshot: occupancy={} entry_count={} exit_count={}",
                snapshot.occupancy, snapshot.entry_count, snapshot.exit_count
            ),
            Self::CorruptVehicleState { track_id } => {
                write!(f, "corrupt vehicle state for track {track_id}: exit before entry")
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

// ---------------------------------------------------------------------------
// Acknowledgment
// ---------------------------------------------------------------------------

/// Why a structurally valid event was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Exit for a track with no recorded entry.
    NotEntered,
    /// Entry or exit for a track that already fully departed.
    TrackClosed,
}

/// Engine response for one ingested event.
#[derive(Debug, Clone, PartialEq)]
pub enum Ack {
    /// The transition was committed; carries the post-commit snapshot.
    Applied {
        snapshot: OccupancySnapshot,
        /// True when this entry pushed (or found) occupancy above
        /// `max_capacity`. Advisory — the entry is accepted regardless.
        over_capacity: bool,
    },
    /// Duplicate delivery, absorbed without touching the snapshot.
    Duplicate { track_id: i64, kind: EventKind },
    /// Anomalous event: event-logged, not applied, not an error.
    Rejected { track_id: i64, reason: RejectReason },
}

// ---------------------------------------------------------------------------
// Per-track bookkeeping
// ---------------------------------------------------------------------------

/// In-memory mirror of one vehicle row. Guarded by its slot's mutex, which
/// doubles as the per-track serialization lock.
#[derive(Debug, Clone, Copy, PartialEq)]
struct TrackRecord {
    has_entered: bool,
    has_exited: bool,
    last_seen: Option<f64>,
}

impl TrackRecord {
    fn unseen() -> Self {
        Self {
            has_entered: false,
            has_exited: false,
            last_seen: None,
        }
    }

    fn phase(&self) -> Phase {
        match (self.has_entered, self.has_exited) {
            (false, _) => Phase::Unseen,
            (true, false) => Phase::Inside,
            (true, true) => Phase::Departed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unseen,
    Inside,
    Departed,
}

struct TrackSlot {
    state: Mutex<TrackRecord>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    store: Arc<dyn OccupancyStore>,
    /// Mirror of the durable snapshot row. Written only after a successful
    /// store commit; reads never hit the store.
    snapshot: RwLock<OccupancySnapshot>,
    /// Lock arena keyed by track_id. Entries are reclaimed by the retention
    /// sweep once a track is Departed and past the retention window.
    tracks: StdMutex<HashMap<i64, Arc<TrackSlot>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Recovery flow: load the snapshot and all vehicle rows before
    /// accepting any new events. Initializes the snapshot row on first
    /// boot. Never replays the event log — the snapshot and vehicle rows
    /// are themselves the durable source of truth.
    pub async fn recover(
        store: Arc<dyn OccupancyStore>,
        default_max_capacity: i64,
    ) -> Result<Self, EngineError> {
        let snapshot = match store.load_snapshot().await? {
            Some(s) => s,
            None => {
                info!(max_capacity = default_max_capacity, "initializing snapshot row");
                store.init_snapshot(default_max_capacity).await?
            }
        };
        if !snapshot.is_consistent() {
            return Err(EngineError::CorruptSnapshot { snapshot });
        }

        let mut tracks = HashMap::new();
        let mut inside = 0i64;
        for vs in store.load_vehicle_states().await? {
            if !vs.is_consistent() {
                return Err(EngineError::CorruptVehicleState {
                    track_id: vs.track_id,
                });
            }
            let rec = TrackRecord {
                has_entered: vs.has_entered,
                has_exited: vs.has_exited,
                last_seen: vs.last_seen,
            };
            if rec.phase() == Phase::Inside {
                inside += 1;
            }
            tracks.insert(
                vs.track_id,
                Arc::new(TrackSlot {
                    state: Mutex::new(rec),
                }),
            );
        }

        // Occupancy should equal the number of in-flight tracks unless an
        // operator reset one store but not the other. Not fatal — the
        // snapshot stays authoritative — but worth a loud note.
        if inside != snapshot.occupancy {
            warn!(
                occupancy = snapshot.occupancy,
                inside_tracks = inside,
                "recovered occupancy does not match in-flight track count"
            );
        }

        info!(
            occupancy = snapshot.occupancy,
            entry_count = snapshot.entry_count,
            exit_count = snapshot.exit_count,
            tracks = tracks.len(),
            frozen = snapshot.frozen,
            "engine recovered"
        );

        Ok(Self {
            store,
            snapshot: RwLock::new(snapshot),
            tracks: StdMutex::new(tracks),
        })
    }

    // -----------------------------------------------------------------------
    // Ingress
    // -----------------------------------------------------------------------

    /// Process one crossing event.
    ///
    /// Processing order: append to the event log unconditionally, validate
    /// against the track's state, commit the snapshot mutation + audit entry
    /// atomically, acknowledge.
    ///
    /// # Errors
    /// [`EngineError::Frozen`] when the administrative stop is active (the
    /// raw event is still logged); [`EngineError::Store`] when a durable
    /// write failed with nothing committed — the caller retries the same
    /// event and duplicate absorption makes the retry safe.
    pub async fn process(&self, event: CrossingEvent) -> Result<Ack, EngineError> {
        let slot = self.slot(event.track_id);
        // Serializes all processing for this track; other tracks proceed.
        let mut rec = slot.state.lock().await;

        // Step 1: the raw event is recorded whatever happens next.
        self.store.append_event(&event).await?;

        if self.snapshot.read().await.frozen {
            debug!(track_id = event.track_id, "event refused: frozen");
            return Err(EngineError::Frozen);
        }

        match (event.kind, rec.phase()) {
            (EventKind::Entry, Phase::Unseen) => self.commit_entry(&event, &mut rec).await,
            (EventKind::Exit, Phase::Inside) => self.commit_exit(&event, &mut rec).await,

            // Duplicate deliveries: absorb silently, success to caller.
            (EventKind::Entry, Phase::Inside) | (EventKind::Exit, Phase::Departed) => {
                debug!(
                    track_id = event.track_id,
                    kind = event.kind.as_str(),
                    "duplicate delivery absorbed"
                );
                Ok(Ack::Duplicate {
                    track_id: event.track_id,
                    kind: event.kind,
                })
            }

            // Exit with no recorded entry: expected for tracks that began
            // before our observation window. Logged, never applied.
            (EventKind::Exit, Phase::Unseen) => {
                info!(track_id = event.track_id, "anomaly: exit without entry");
                Ok(Ack::Rejected {
                    track_id: event.track_id,
                    reason: RejectReason::NotEntered,
                })
            }

            // Entry for a departed track: a departed track never re-opens.
            (EventKind::Entry, Phase::Departed) => {
                info!(track_id = event.track_id, "anomaly: entry for departed track");
                Ok(Ack::Rejected {
                    track_id: event.track_id,
                    reason: RejectReason::TrackClosed,
                })
            }
        }
    }

    async fn commit_entry(
        &self,
        event: &CrossingEvent,
        rec: &mut TrackRecord,
    ) -> Result<Ack, EngineError> {
        let commit = TransitionCommit {
            track_id: event.track_id,
            action: TransitionAction::Entry,
            timestamp: event.timestamp,
            reason: entry_reason(event.track_id),
        };
        match self.store.commit_transition(&commit).await? {
            CommitOutcome::Applied(snap) => {
                // The advisory flag comes from the occupancy this entry
                // actually landed at, not from a pre-commit read that a
                // concurrent track could invalidate. The store suffixed the
                // audit reason from the same post-commit value.
                let over_capacity = snap.occupancy > snap.max_capacity;
                rec.has_entered = true;
                rec.last_seen = Some(event.timestamp);
                *self.snapshot.write().await = snap;
                if over_capacity {
                    warn!(
                        track_id = event.track_id,
                        occupancy = snap.occupancy,
                        max_capacity = snap.max_capacity,
                        "entry accepted over capacity"
                    );
                }
                Ok(Ack::Applied {
                    snapshot: snap,
                    over_capacity,
                })
            }
            CommitOutcome::Frozen => Err(EngineError::Frozen),
        }
    }

    async fn commit_exit(
        &self,
        event: &CrossingEvent,
        rec: &mut TrackRecord,
    ) -> Result<Ack, EngineError> {
        // Unreachable while the state machine holds (an Inside track implies
        // occupancy > 0); still handled so a reset snapshot cannot drive the
        // count negative.
        let clamp = self.snapshot.read().await.occupancy == 0;
        let commit = TransitionCommit {
            track_id: event.track_id,
            action: if clamp {
                TransitionAction::ExitClamped
            } else {
                TransitionAction::Exit
            },
            timestamp: event.timestamp,
            reason: if clamp {
                CLAMPED_EXIT_REASON.to_string()
            } else {
                exit_reason(event.track_id)
            },
        };
        match self.store.commit_transition(&commit).await? {
            CommitOutcome::Applied(snap) => {
                rec.has_exited = true;
                rec.last_seen = Some(event.timestamp);
                *self.snapshot.write().await = snap;
                if clamp {
                    warn!(track_id = event.track_id, "exit clamped at zero occupancy");
                }
                Ok(Ack::Applied {
                    snapshot: snap,
                    over_capacity: false,
                })
            }
            CommitOutcome::Frozen => Err(EngineError::Frozen),
        }
    }

    // -----------------------------------------------------------------------
    // Administrative surface
    // -----------------------------------------------------------------------

    /// Freeze: refuse all further occupancy mutations until unfrozen. Raw
    /// events keep flowing into the event log for later reconciliation.
    /// `last_update` is left alone: it tracks accepted transitions, and an
    /// administrative toggle is not one.
    pub async fn freeze(&self) -> Result<OccupancySnapshot, EngineError> {
        let snap = self.store.set_frozen(true).await?;
        *self.snapshot.write().await = snap;
        info!("occupancy mutations frozen");
        Ok(snap)
    }

    pub async fn unfreeze(&self) -> Result<OccupancySnapshot, EngineError> {
        let snap = self.store.set_frozen(false).await?;
        *self.snapshot.write().await = snap;
        info!("occupancy mutations unfrozen");
        Ok(snap)
    }

    // -----------------------------------------------------------------------
    // Read surface
    // -----------------------------------------------------------------------

    /// Current authoritative snapshot (mirror of the durable row).
    pub async fn snapshot(&self) -> OccupancySnapshot {
        *self.snapshot.read().await
    }

    /// Current bookkeeping for a track, if the engine has seen it.
    pub async fn vehicle_state(&self, track_id: i64) -> Option<VehicleState> {
        let slot = {
            let tracks = self.tracks.lock().expect("track arena poisoned");
            tracks.get(&track_id).cloned()
        }?;
        let rec = *slot.state.lock().await;
        Some(VehicleState {
            track_id,
            has_entered: rec.has_entered,
            has_exited: rec.has_exited,
            last_seen: rec.last_seen,
        })
    }

    /// Number of tracks currently held in the lock arena.
    pub fn tracked_count(&self) -> usize {
        self.tracks.lock().expect("track arena poisoned").len()
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Evict fully departed tracks untouched since `cutoff` (epoch seconds)
    /// from both the durable store and the in-memory arena. Returns the
    /// number of durable rows removed.
    ///
    /// A later event for an evicted id starts over as Unseen — identical to
    /// the id having been freshly issued, which is the retention trade-off
    /// the deployment opted into.
    pub async fn sweep_departed(&self, cutoff: f64) -> Result<u64, EngineError> {
        let removed = self.store.evict_departed_before(cutoff).await?;

        let mut reclaimed = 0usize;
        {
            let mut tracks = self.tracks.lock().expect("track arena poisoned");
            tracks.retain(|_, slot| {
                // Skip tracks with an event in flight; next sweep gets them.
                let Ok(rec) = slot.state.try_lock() else {
                    return true;
                };
                let stale = rec.phase() == Phase::Departed
                    && rec.last_seen.map(|t| t < cutoff).unwrap_or(false);
                if stale {
                    reclaimed += 1;
                }
                !stale
            });
        }

        if removed > 0 || reclaimed > 0 {
            info!(removed, reclaimed, "retention sweep completed");
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn slot(&self, track_id: i64) -> Arc<TrackSlot> {
        let mut tracks = self.tracks.lock().expect("track arena poisoned");
        tracks
            .entry(track_id)
            .or_insert_with(|| {
                Arc::new(TrackSlot {
                    state: Mutex::new(TrackRecord::unseen()),
                })
            })
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Audit reasons
// ---------------------------------------------------------------------------

/// Audit reason recorded on the defensive exit-clamp path.
pub const CLAMPED_EXIT_REASON: &str = "exit without matching entry — clamped";

fn entry_reason(track_id: i64) -> String {
    format!("entry: track {track_id}")
}

fn exit_reason(track_id: i64) -> String {
    format!("exit: track {track_id}")
}

// ---------------------------------------------------------------------------
// Tests (pure parts; full engine scenarios live in cw-testkit)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_derivation() {
        let mut rec = TrackRecord::unseen();
        assert_eq!(rec.phase(), Phase::Unseen);
        rec.has_entered = true;
        assert_eq!(rec.phase(), Phase::Inside);
        rec.has_exited = true;
        assert_eq!(rec.phase(), Phase::Departed);
    }

    #[test]
    fn entry_reason_formats() {
        assert_eq!(entry_reason(42), "entry: track 42");
    }

    #[test]
    fn exit_reason_formats() {
        assert_eq!(exit_reason(7), "exit: track 7");
    }

    #[test]
    fn store_error_converts() {
        let e: EngineError = StoreError::unavailable("pg down").into();
        assert_eq!(
            e,
            EngineError::Store(StoreError::Unavailable {
                context: "pg down".to_string()
            })
        );
    }
}
