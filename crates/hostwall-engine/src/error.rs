//! Engine-level error taxonomy.
//!
//! Validation and compilation problems carry their full issue lists so a
//! caller can surface every individual problem, not just the first.

use hostwall_core::{CompilationError, ValidationIssue};

use crate::substrate::SubstrateError;

/// Failure of a control-plane operation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Bad input; the substrate was never touched.
    #[error("policy validation failed with {} issue(s)", issues.len())]
    Validation { issues: Vec<ValidationIssue> },

    /// Structurally valid but uncompilable; the substrate was never touched.
    #[error("policy compilation failed with {} error(s)", errors.len())]
    Compilation { errors: Vec<CompilationError> },

    /// Substrate call failed; the in-flight transaction was aborted and the
    /// prior filter set is intact.
    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    /// A last-known-good entry was requested but none can be trusted.
    #[error("last-known-good policy unavailable: {0}")]
    LkgUnavailable(String),
}
