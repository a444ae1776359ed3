//! Policy controller: the validate → compile → apply → LKG pipeline.
//!
//! Sits between the control-plane transport and the reconciliation engine.
//! The overarching policy is fail open, never fail destructive: any failure
//! leaves the existing filter set exactly as it was, and every fail-open
//! branch is an explicit, logged arm rather than a catch-all.

use hostwall_core::{
    CompilationWarning, Policy, ProcessResolver, ValidationIssue, compile, validate,
};
use hostwall_store::{LkgLoad, LkgMetadata, LkgStore};

use crate::error::EngineError;
use crate::reconcile::{ApplyResult, ReconcileEngine};
use crate::substrate::Substrate;

/// Successful apply, with everything a caller reports upstream.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApplyReport {
    pub policy_version: String,
    pub apply: ApplyResult,
    pub warnings: Vec<CompilationWarning>,
    pub skipped_rule_count: usize,
}

/// Outcome of startup recovery. Never an error: recovery failures of every
/// kind mean "start with no policy", not "fail to start".
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Applied(ApplyReport),
    NoPolicy { reason: String },
}

/// Control-plane orchestrator over one engine and one LKG store.
pub struct PolicyController<S: Substrate> {
    engine: ReconcileEngine<S>,
    lkg: LkgStore,
}

impl<S: Substrate> PolicyController<S> {
    #[must_use]
    pub const fn new(engine: ReconcileEngine<S>, lkg: LkgStore) -> Self {
        Self { engine, lkg }
    }

    /// The underlying engine, for rollback/teardown passthroughs.
    #[must_use]
    pub const fn engine(&self) -> &ReconcileEngine<S> {
        &self.engine
    }

    /// Consume the controller, returning the engine.
    #[must_use]
    pub fn into_engine(self) -> ReconcileEngine<S> {
        self.engine
    }

    /// Validate, compile and apply a raw policy document, then persist it as
    /// the new last-known-good.
    ///
    /// The LKG write is best effort: by the time it runs the substrate
    /// already holds the new filter set, so its failure is logged and the
    /// apply still succeeds.
    pub fn apply_policy_json(
        &self,
        raw_json: &str,
        source_path: Option<&str>,
    ) -> Result<ApplyReport, EngineError> {
        let validation = validate(raw_json);
        if !validation.is_valid() {
            return Err(EngineError::Validation {
                issues: validation.issues,
            });
        }
        let policy = Policy::from_json(raw_json).map_err(|err| EngineError::Validation {
            issues: vec![ValidationIssue {
                rule_index: None,
                field: "$".to_string(),
                message: format!("validated document failed to parse: {err}"),
            }],
        })?;

        let compiled = compile(&policy, &SubstrateResolver { engine: &self.engine });
        if !compiled.is_success() {
            return Err(EngineError::Compilation {
                errors: compiled.errors,
            });
        }
        for warning in &compiled.warnings {
            tracing::warn!(rule_id = %warning.rule_id, "{}", warning.message);
        }

        let apply = self.engine.apply(&compiled.filters)?;

        if let Err(err) = self.lkg.save(raw_json, source_path) {
            // Fail open: the substrate apply already succeeded.
            tracing::warn!(error = %err, "failed to persist last-known-good policy");
        }

        Ok(ApplyReport {
            policy_version: policy.version,
            apply,
            warnings: compiled.warnings,
            skipped_rule_count: compiled.skipped_rule_count,
        })
    }

    /// Startup path: re-apply the stored last-known-good policy, if any.
    ///
    /// Missing, corrupt, uncompilable and substrate failures all fold to
    /// [`RecoveryOutcome::NoPolicy`]; service start is never blocked.
    pub fn recover_from_lkg(&self) -> RecoveryOutcome {
        let loaded = match self.lkg.load() {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::warn!(error = %err, "could not read last-known-good store");
                return RecoveryOutcome::NoPolicy {
                    reason: format!("LKG store unreadable: {err}"),
                };
            }
        };
        match loaded {
            LkgLoad::Absent => RecoveryOutcome::NoPolicy {
                reason: "no last-known-good policy stored".to_string(),
            },
            LkgLoad::Corrupt { reason } => {
                tracing::warn!(%reason, "last-known-good entry is corrupt, not applying");
                RecoveryOutcome::NoPolicy {
                    reason: format!("last-known-good entry is corrupt: {reason}"),
                }
            }
            LkgLoad::Loaded { entry, .. } => {
                match self.apply_policy_json(&entry.policy_json, entry.source_path.as_deref()) {
                    Ok(report) => RecoveryOutcome::Applied(report),
                    Err(err) => {
                        tracing::warn!(error = %err, "stored policy failed to apply, starting with no policy");
                        RecoveryOutcome::NoPolicy {
                            reason: format!("stored policy failed to apply: {err}"),
                        }
                    }
                }
            }
        }
    }

    /// Re-apply the stored last-known-good on demand.
    ///
    /// Unlike startup recovery this surfaces failures: an operator asked for
    /// the revert and needs to know why it did not happen.
    pub fn lkg_revert(&self) -> Result<ApplyReport, EngineError> {
        match self.lkg.load() {
            Ok(LkgLoad::Loaded { entry, .. }) => {
                self.apply_policy_json(&entry.policy_json, entry.source_path.as_deref())
            }
            Ok(LkgLoad::Absent) => Err(EngineError::LkgUnavailable(
                "no last-known-good policy stored".to_string(),
            )),
            Ok(LkgLoad::Corrupt { reason }) => Err(EngineError::LkgUnavailable(format!(
                "stored entry is corrupt: {reason}"
            ))),
            Err(err) => Err(EngineError::LkgUnavailable(err.to_string())),
        }
    }

    /// Metadata over the LKG slot.
    #[must_use]
    pub fn lkg_metadata(&self) -> LkgMetadata {
        self.lkg.metadata()
    }
}

/// Compiler resolver seam backed by the substrate.
struct SubstrateResolver<'a, S: Substrate> {
    engine: &'a ReconcileEngine<S>,
}

impl<S: Substrate> ProcessResolver for SubstrateResolver<'_, S> {
    fn resolve(&self, path: &str) -> Option<Vec<u8>> {
        self.engine.resolve_process_identity(path)
    }
}
