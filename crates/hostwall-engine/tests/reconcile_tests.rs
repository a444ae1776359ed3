//! Reconciliation engine property tests: idempotent apply, minimal diff,
//! atomicity under injected faults, drift replacement, teardown.

use hostwall_core::{CompiledFilter, NullResolver, Policy, compile};
use hostwall_engine::{
    ApplyResult, FaultPlan, MemorySubstrate, ReconcileEngine, Substrate, SubstrateError,
    TeardownResult,
};
use pretty_assertions::assert_eq;

fn policy_json(rule_ids: &[&str]) -> String {
    let rules: Vec<String> = rule_ids
        .iter()
        .map(|id| {
            format!(
                r#"{{"id": "{id}", "action": "allow", "direction": "outbound", "protocol": "tcp"}}"#
            )
        })
        .collect();
    format!(
        r#"{{"version": "test", "default_action": "block", "rules": [{}]}}"#,
        rules.join(",")
    )
}

fn filters_for(rule_ids: &[&str]) -> Vec<CompiledFilter> {
    let policy = Policy::from_json(&policy_json(rule_ids)).expect("policy");
    let result = compile(&policy, &NullResolver);
    assert!(result.is_success());
    result.filters
}

fn enumerate(substrate: &mut MemorySubstrate) -> Vec<(u64, String)> {
    substrate.open_session().expect("session");
    let filters = substrate
        .enumerate_filters()
        .expect("enumerate")
        .into_iter()
        .map(|f| (f.native_filter_id, f.display_name))
        .collect();
    substrate.close_session();
    filters
}

#[test]
fn apply_against_empty_substrate_creates_everything() {
    let engine = ReconcileEngine::new(MemorySubstrate::new());
    let result = engine.apply(&filters_for(&["a", "b", "c"])).expect("apply");
    assert_eq!(
        result,
        ApplyResult {
            created: 3,
            removed: 0,
            unchanged: 0
        }
    );
}

#[test]
fn second_identical_apply_is_a_no_op_with_zero_transactions() {
    let engine = ReconcileEngine::new(MemorySubstrate::new());
    let filters = filters_for(&["a", "b", "c"]);
    engine.apply(&filters).expect("first apply");

    let result = engine.apply(&filters).expect("second apply");
    assert_eq!(
        result,
        ApplyResult {
            created: 0,
            removed: 0,
            unchanged: 3
        }
    );

    let substrate = engine.into_substrate();
    // Only the first apply opened a transaction.
    assert_eq!(substrate.counters().transactions_started, 1);
    assert_eq!(substrate.counters().transactions_committed, 1);
}

#[test]
fn changed_rule_set_applies_the_minimal_edit() {
    let engine = ReconcileEngine::new(MemorySubstrate::new());
    engine.apply(&filters_for(&["a", "b", "c"])).expect("seed");

    // B removed, D added; A and C must not be touched.
    let result = engine.apply(&filters_for(&["a", "c", "d"])).expect("apply");
    assert_eq!(
        result,
        ApplyResult {
            created: 1,
            removed: 1,
            unchanged: 2
        }
    );
}

#[test]
fn failed_add_aborts_and_preserves_the_previous_filter_set() {
    let engine = ReconcileEngine::new(MemorySubstrate::new());
    engine.apply(&filters_for(&["a", "b"])).expect("seed");
    let mut substrate = engine.into_substrate();
    let before = enumerate(&mut substrate);

    substrate.set_faults(FaultPlan {
        fail_add_after: Some(1),
        ..FaultPlan::default()
    });
    let engine = ReconcileEngine::new(substrate);
    let err = engine
        .apply(&filters_for(&["a", "b", "c", "d"]))
        .expect_err("injected add failure");
    assert!(matches!(err, SubstrateError::Other(_)));

    let mut substrate = engine.into_substrate();
    assert_eq!(enumerate(&mut substrate), before);
    assert_eq!(substrate.counters().transactions_aborted, 1);
}

#[test]
fn failed_delete_aborts_and_preserves_the_previous_filter_set() {
    let engine = ReconcileEngine::new(MemorySubstrate::new());
    engine.apply(&filters_for(&["a", "b", "c"])).expect("seed");
    let mut substrate = engine.into_substrate();
    let before = enumerate(&mut substrate);

    substrate.set_faults(FaultPlan {
        fail_delete_after: Some(0),
        ..FaultPlan::default()
    });
    let engine = ReconcileEngine::new(substrate);
    engine
        .apply(&filters_for(&["a"]))
        .expect_err("injected delete failure");

    let mut substrate = engine.into_substrate();
    assert_eq!(enumerate(&mut substrate), before);
}

#[test]
fn failed_commit_aborts_and_preserves_the_previous_filter_set() {
    let engine = ReconcileEngine::new(MemorySubstrate::new());
    engine.apply(&filters_for(&["a"])).expect("seed");
    let mut substrate = engine.into_substrate();
    let before = enumerate(&mut substrate);

    substrate.set_faults(FaultPlan {
        fail_commit: true,
        ..FaultPlan::default()
    });
    let engine = ReconcileEngine::new(substrate);
    engine
        .apply(&filters_for(&["a", "b"]))
        .expect_err("injected commit failure");

    let mut substrate = engine.into_substrate();
    assert_eq!(enumerate(&mut substrate), before);
}

#[test]
fn access_denied_surfaces_as_its_own_kind() {
    let mut substrate = MemorySubstrate::new();
    substrate.set_faults(FaultPlan {
        access_denied: true,
        ..FaultPlan::default()
    });
    let engine = ReconcileEngine::new(substrate);
    let err = engine.apply(&filters_for(&["a"])).expect_err("denied");
    assert!(matches!(err, SubstrateError::AccessDenied(_)));
}

#[test]
fn in_place_rule_edit_forces_replacement_under_the_same_key() {
    let engine = ReconcileEngine::new(MemorySubstrate::new());
    let allow_json = policy_json(&["edit-me"]);
    let allow = compile(&Policy::from_json(&allow_json).expect("policy"), &NullResolver).filters;
    engine.apply(&allow).expect("seed");

    let block_json = allow_json.replace("\"action\": \"allow\"", "\"action\": \"block\"");
    let block = compile(&Policy::from_json(&block_json).expect("policy"), &NullResolver).filters;
    assert_eq!(allow[0].filter_key, block[0].filter_key);

    let result = engine.apply(&block).expect("apply edit");
    assert_eq!(
        result,
        ApplyResult {
            created: 1,
            removed: 1,
            unchanged: 0
        }
    );
}

#[test]
fn remove_all_filters_is_idempotent_and_transaction_free_when_empty() {
    let engine = ReconcileEngine::new(MemorySubstrate::new());
    engine.apply(&filters_for(&["a", "b"])).expect("seed");

    assert_eq!(engine.remove_all_filters().expect("rollback"), 2);
    assert_eq!(engine.remove_all_filters().expect("repeat"), 0);

    let substrate = engine.into_substrate();
    // Seed apply plus one rollback; the empty rollback opened nothing.
    assert_eq!(substrate.counters().transactions_started, 2);
}

#[test]
fn remove_infrastructure_empties_the_sublayer_first() {
    let engine = ReconcileEngine::new(MemorySubstrate::new());
    engine.apply(&filters_for(&["a"])).expect("seed");

    let result = engine.remove_infrastructure().expect("teardown");
    assert_eq!(
        result,
        TeardownResult {
            provider_removed: true,
            sublayer_removed: true
        }
    );

    let mut substrate = engine.into_substrate();
    assert_eq!(enumerate(&mut substrate), vec![]);
    assert!(!substrate.state().provider_installed);
    assert!(!substrate.state().sublayer_installed);
}

#[test]
fn teardown_of_absent_infrastructure_is_success_not_error() {
    let engine = ReconcileEngine::new(MemorySubstrate::new());
    let result = engine.remove_infrastructure().expect("teardown");
    assert_eq!(
        result,
        TeardownResult {
            provider_removed: false,
            sublayer_removed: false
        }
    );
}

#[test]
fn ensure_infrastructure_is_idempotent() {
    let engine = ReconcileEngine::new(MemorySubstrate::new());
    engine.ensure_infrastructure_exists().expect("first");
    engine.ensure_infrastructure_exists().expect("second");
    let substrate = engine.into_substrate();
    assert!(substrate.state().provider_installed);
    assert!(substrate.state().sublayer_installed);
}
