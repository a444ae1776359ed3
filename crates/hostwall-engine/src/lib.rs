//! Substrate-facing half of hostwall: the reconciliation/transaction engine,
//! the substrate capability seam, the in-memory adapter, and the policy
//! controller that ties validation, compilation, apply and LKG persistence
//! together.

pub mod controller;
pub mod error;
pub mod memory;
pub mod reconcile;
pub mod substrate;

pub use controller::{ApplyReport, PolicyController, RecoveryOutcome};
pub use error::EngineError;
pub use memory::{FaultPlan, MemoryState, MemorySubstrate, OpCounters, StoredFilter};
pub use reconcile::{ApplyResult, ReconcileEngine, TeardownResult};
pub use substrate::{Substrate, SubstrateError};
