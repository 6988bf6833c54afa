//! cw-testkit
//!
//! In-process store implementations used by the engine scenario tests:
//! [`MemoryStore`] is a faithful, fully atomic implementation of the
//! `OccupancyStore` contract; [`FaultStore`] wraps it and injects
//! `StoreUnavailable` failures at chosen stages to exercise crash and
//! outage recovery.
//!
//! Durability is simulated by keeping the store alive across engine
//! instances: dropping an `Engine` and running `Engine::recover` against
//! the same store is the test analogue of a process restart.

pub mod fault_store;
pub mod memory_store;

pub use fault_store::FaultStore;
pub use memory_store::MemoryStore;
