//! Reconciliation and transaction engine.
//!
//! Owns the substrate-side provider/sublayer/filter lifecycle and converges
//! substrate state onto a desired filter set with minimal disruption. All
//! mutating operations serialize on one lock spanning the whole
//! diff-compute → transaction-open → commit/abort region, so no diff is ever
//! applied against state that changed after it was computed.

use std::collections::HashMap;

use parking_lot::Mutex;

use hostwall_core::{
    CompiledFilter, ExistingFilter, FilterKey, compute_diff, content_fingerprint,
    fingerprint_from_display_name,
};

use crate::substrate::{Substrate, SubstrateError};

/// Outcome of one apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ApplyResult {
    pub created: usize,
    pub removed: usize,
    pub unchanged: usize,
}

/// Outcome of a full teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TeardownResult {
    pub provider_removed: bool,
    pub sublayer_removed: bool,
}

/// Transaction engine over one substrate handle.
///
/// The handle is owned and mutex-guarded here rather than living as ambient
/// global state; callers thread the engine explicitly.
pub struct ReconcileEngine<S: Substrate> {
    substrate: Mutex<S>,
}

impl<S: Substrate> ReconcileEngine<S> {
    #[must_use]
    pub fn new(substrate: S) -> Self {
        Self {
            substrate: Mutex::new(substrate),
        }
    }

    /// Consume the engine, returning the substrate handle.
    #[must_use]
    pub fn into_substrate(self) -> S {
        self.substrate.into_inner()
    }

    /// Resolve a process path via the substrate, outside any session.
    ///
    /// Used by the compiler seam; resolution is read-only and safe to run
    /// concurrently with the pure layers.
    #[must_use]
    pub fn resolve_process_identity(&self, path: &str) -> Option<Vec<u8>> {
        self.substrate.lock().resolve_process_identity(path)
    }

    /// Idempotently create the provider and sublayer.
    ///
    /// "Already exists" is success, so this is safe to call on every start.
    pub fn ensure_infrastructure_exists(&self) -> Result<(), SubstrateError> {
        self.with_session(ensure_infrastructure)
    }

    /// Converge the substrate onto `desired`, atomically.
    ///
    /// Enumerates current filters, computes the key diff, upgrades
    /// content-drifted pairs to delete+recreate, and applies the edit in one
    /// transaction. An empty edit opens no transaction at all, so a repeated
    /// apply performs zero substrate writes. Any failure aborts and leaves
    /// the pre-transaction state intact.
    pub fn apply(&self, desired: &[CompiledFilter]) -> Result<ApplyResult, SubstrateError> {
        self.with_session(|substrate| {
            ensure_infrastructure(substrate)?;
            let current = substrate.enumerate_filters()?;
            let mut diff = compute_diff(desired, &current);

            // The filter key is identity only; a rule edited in place keeps
            // its key but changes its fingerprint and must be replaced.
            for (fresh, stale) in drifted_pairs(desired, &current) {
                diff.to_add.push(fresh);
                diff.to_remove.push(stale);
                diff.unchanged_count -= 1;
            }

            if diff.is_empty() {
                tracing::info!(unchanged = diff.unchanged_count, "filter set already converged");
                return Ok(ApplyResult {
                    created: 0,
                    removed: 0,
                    unchanged: diff.unchanged_count,
                });
            }

            let result = in_transaction(substrate, |substrate| {
                for existing in &diff.to_remove {
                    substrate.delete_filter(existing.native_filter_id)?;
                }
                for filter in &diff.to_add {
                    substrate.add_filter(filter)?;
                }
                Ok(ApplyResult {
                    created: diff.to_add.len(),
                    removed: diff.to_remove.len(),
                    unchanged: diff.unchanged_count,
                })
            })?;
            tracing::info!(
                created = result.created,
                removed = result.removed,
                unchanged = result.unchanged,
                "applied filter diff"
            );
            Ok(result)
        })
    }

    /// Panic/rollback primitive: delete every filter in our sublayer.
    ///
    /// Idempotent; zero filters present is success with zero and opens no
    /// transaction.
    pub fn remove_all_filters(&self) -> Result<usize, SubstrateError> {
        self.with_session(|substrate| {
            let count = remove_all_inner(substrate)?;
            tracing::info!(removed = count, "removed all filters");
            Ok(count)
        })
    }

    /// Full teardown: empty the sublayer, then delete sublayer and provider.
    ///
    /// The engine empties the sublayer itself (rather than requiring callers
    /// to rollback first); deleting an absent object is success, reported as
    /// `false`.
    pub fn remove_infrastructure(&self) -> Result<TeardownResult, SubstrateError> {
        self.with_session(|substrate| {
            remove_all_inner(substrate)?;
            let sublayer_removed = tolerate_not_found(substrate.delete_sublayer())?;
            let provider_removed = tolerate_not_found(substrate.delete_provider())?;
            tracing::info!(provider_removed, sublayer_removed, "removed infrastructure");
            Ok(TeardownResult {
                provider_removed,
                sublayer_removed,
            })
        })
    }

    /// Run `body` inside an open session, closing it on every path.
    fn with_session<T>(
        &self,
        body: impl FnOnce(&mut S) -> Result<T, SubstrateError>,
    ) -> Result<T, SubstrateError> {
        let mut substrate = self.substrate.lock();
        substrate.open_session()?;
        let outcome = body(&mut substrate);
        substrate.close_session();
        outcome
    }
}

fn ensure_infrastructure<S: Substrate>(substrate: &mut S) -> Result<(), SubstrateError> {
    if !substrate.provider_exists()? {
        tolerate_already_exists(substrate.create_provider())?;
    }
    if !substrate.sublayer_exists()? {
        tolerate_already_exists(substrate.create_sublayer())?;
    }
    Ok(())
}

fn remove_all_inner<S: Substrate>(substrate: &mut S) -> Result<usize, SubstrateError> {
    let current = substrate.enumerate_filters()?;
    if current.is_empty() {
        return Ok(0);
    }
    in_transaction(substrate, |substrate| {
        for existing in &current {
            substrate.delete_filter(existing.native_filter_id)?;
        }
        Ok(current.len())
    })
}

/// Key-matching pairs whose content fingerprints disagree.
fn drifted_pairs(
    desired: &[CompiledFilter],
    current: &[ExistingFilter],
) -> Vec<(CompiledFilter, ExistingFilter)> {
    let by_key: HashMap<FilterKey, &ExistingFilter> =
        current.iter().map(|f| (f.filter_key, f)).collect();
    desired
        .iter()
        .filter_map(|filter| {
            let existing = by_key.get(&filter.filter_key)?;
            let expected = content_fingerprint(filter);
            let actual = fingerprint_from_display_name(&existing.display_name);
            if actual == Some(expected.as_str()) {
                None
            } else {
                tracing::debug!(
                    rule_id = %filter.rule_id,
                    filter_key = %filter.filter_key,
                    "content drift under stable key, forcing replacement"
                );
                Some((filter.clone(), (*existing).clone()))
            }
        })
        .collect()
}

/// Run `body` inside one substrate transaction, aborting on any failure.
///
/// A failed commit is also aborted so the substrate never holds a dangling
/// transaction; the original error wins when abort fails too.
fn in_transaction<S: Substrate, T>(
    substrate: &mut S,
    body: impl FnOnce(&mut S) -> Result<T, SubstrateError>,
) -> Result<T, SubstrateError> {
    substrate.begin_transaction()?;
    let outcome = match body(substrate) {
        Ok(value) => substrate.commit_transaction().map(|()| value),
        Err(err) => Err(err),
    };
    if let Err(err) = &outcome {
        tracing::warn!(error = %err, "transaction failed, aborting");
        if let Err(abort_err) = substrate.abort_transaction() {
            tracing::warn!(error = %abort_err, "abort after failed transaction also failed");
        }
    }
    outcome
}

fn tolerate_already_exists(result: Result<(), SubstrateError>) -> Result<(), SubstrateError> {
    match result {
        Ok(()) | Err(SubstrateError::AlreadyExists(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

fn tolerate_not_found(result: Result<(), SubstrateError>) -> Result<bool, SubstrateError> {
    match result {
        Ok(()) => Ok(true),
        Err(SubstrateError::NotFound(_)) => Ok(false),
        Err(err) => Err(err),
    }
}
