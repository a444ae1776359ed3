//! Core policy layer for hostwall: model, validation, compilation, diffing
//! and simulation.
//!
//! Everything in this crate is pure: no I/O, no substrate sessions, no
//! global state. The substrate-facing transaction engine lives in
//! `hostwall-engine`; persistence lives in `hostwall-store`.

pub mod compile;
pub mod diff;
pub mod model;
pub mod net;
pub mod simulate;
pub mod validate;

pub use compile::{
    BASE_FILTER_WEIGHT, CompilationError, CompilationResult, CompilationWarning,
    MAX_RULE_PRIORITY, MIN_RULE_PRIORITY, NullResolver, PathIdentityResolver, ProcessResolver,
    compile, content_fingerprint, fingerprint_from_display_name,
};
pub use diff::compute_diff;
pub use model::{
    Action, CompiledFilter, Direction, Endpoint, ExistingFilter, FilterDiff, FilterDirection,
    FilterKey, MAX_PROCESS_PATH_LEN, MAX_RULE_ID_LEN, Policy, PortRange, Rule, RuleProtocol,
    TransportProtocol,
};
pub use simulate::{SimulationQuery, SimulationResult, TraceEntry, simulate};
pub use validate::{ValidationIssue, ValidationResult, validate};
