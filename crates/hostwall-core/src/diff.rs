//! Filter diff engine: minimal edit between desired and current filter sets.
//!
//! A pure set difference keyed by [`FilterKey`]. Content is never compared
//! here; two filters with the same key are identical by construction, and
//! in-place content drift is the reconciliation engine's concern.

use std::collections::HashSet;

use crate::model::{CompiledFilter, ExistingFilter, FilterDiff, FilterKey};

/// Compute the minimal edit converging `current` onto `desired`.
///
/// Linear in `|desired| + |current|`. Input order is preserved in both output
/// lists; key-intersection filters are counted, never touched.
#[must_use]
pub fn compute_diff(desired: &[CompiledFilter], current: &[ExistingFilter]) -> FilterDiff {
    let desired_keys: HashSet<FilterKey> = desired.iter().map(|f| f.filter_key).collect();
    let current_keys: HashSet<FilterKey> = current.iter().map(|f| f.filter_key).collect();

    let to_add: Vec<CompiledFilter> = desired
        .iter()
        .filter(|f| !current_keys.contains(&f.filter_key))
        .cloned()
        .collect();
    let to_remove: Vec<ExistingFilter> = current
        .iter()
        .filter(|f| !desired_keys.contains(&f.filter_key))
        .cloned()
        .collect();
    let unchanged_count = desired
        .iter()
        .filter(|f| current_keys.contains(&f.filter_key))
        .count();

    FilterDiff {
        to_add,
        to_remove,
        unchanged_count,
    }
}
