//! cw-engine
//!
//! The occupancy reconciliation and recovery core: consumes per-vehicle
//! crossing events, validates each as a state transition, and commits the
//! authoritative occupancy change exactly once per transition through a
//! pluggable durable store.
//!
//! Store implementations: `cw-db::PgStore` (production, PostgreSQL) and
//! `cw-testkit::MemoryStore` (tests).

pub mod engine;
pub mod store;

pub use engine::{Ack, Engine, EngineError, RejectReason, CLAMPED_EXIT_REASON};
pub use store::{
    CommitOutcome, OccupancyStore, StoreError, TransitionAction, TransitionCommit,
    OVER_CAPACITY_SUFFIX,
};
