//! Rule simulator: dry-run evaluation of a connection tuple against a policy.
//!
//! A pure, read-only evaluator that shares the compiler's endpoint grammar
//! but never calls the compiler and never touches the substrate. Rules are
//! visited in priority-descending order (author order on ties) and evaluation
//! stops at the first full match; every rule visited leaves a trace entry.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::model::{Action, FilterDirection, Policy, Rule, TransportProtocol};
use crate::net::{parse_ipv4_spec, parse_port_tokens};

/// One synthetic connection tuple to evaluate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationQuery {
    pub direction: FilterDirection,
    pub protocol: TransportProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_path: Option<String>,
}

/// Trace of one rule evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub rule_id: String,
    pub matched: bool,
    pub reason: String,
}

/// Outcome of one simulation. Ephemeral, constructed per query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub would_allow: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_action: Option<Action>,
    pub used_default_action: bool,
    pub trace: Vec<TraceEntry>,
}

/// Evaluate `query` against `policy` without touching the substrate.
#[must_use]
pub fn simulate(policy: &Policy, query: &SimulationQuery) -> SimulationResult {
    let mut trace = Vec::new();
    for rule in policy.enabled_rules_by_priority() {
        match evaluate_rule(rule, query) {
            Ok(()) => {
                trace.push(TraceEntry {
                    rule_id: rule.id.clone(),
                    matched: true,
                    reason: "all predicates matched".to_string(),
                });
                return SimulationResult {
                    would_allow: rule.action == Action::Allow,
                    matched_rule_id: Some(rule.id.clone()),
                    matched_action: Some(rule.action),
                    used_default_action: false,
                    trace,
                };
            }
            Err(reason) => trace.push(TraceEntry {
                rule_id: rule.id.clone(),
                matched: false,
                reason,
            }),
        }
    }
    SimulationResult {
        would_allow: policy.default_action == Action::Allow,
        matched_rule_id: None,
        matched_action: None,
        used_default_action: true,
        trace,
    }
}

/// `Ok(())` when every applicable predicate matches; `Err` carries the first
/// mismatch reason (predicates short-circuit per rule).
fn evaluate_rule(rule: &Rule, query: &SimulationQuery) -> Result<(), String> {
    if !rule.direction.covers(query.direction) {
        return Err(format!(
            "direction mismatch (rule {}, query {})",
            rule.direction, query.direction
        ));
    }
    if !rule.protocol.covers(query.protocol) {
        return Err(format!(
            "protocol mismatch (rule {}, query {})",
            rule.protocol, query.protocol
        ));
    }

    if let Some(remote) = &rule.remote {
        if let Some(ip_spec) = remote.ip.as_deref() {
            let net = parse_ipv4_spec(ip_spec)
                .map_err(|err| format!("rule remote ip is unusable: {err}"))?;
            match query.remote_ip {
                None => return Err("query does not specify a remote ip".to_string()),
                Some(ip) if !net.contains(&ip) => {
                    return Err(format!("remote ip {ip} outside {net}"));
                }
                Some(_) => {}
            }
        }
        if let Some(port_spec) = remote.ports.as_deref() {
            let tokens = parse_port_tokens(port_spec)
                .map_err(|err| format!("rule remote ports are unusable: {err}"))?;
            match query.remote_port {
                None => return Err("query does not specify a remote port".to_string()),
                Some(port) if !tokens.iter().any(|t| t.contains(port)) => {
                    return Err(format!("remote port {port} not in {port_spec:?}"));
                }
                Some(_) => {}
            }
        }
    }

    // The query tuple carries no local endpoint, so a local constraint can
    // never be verified; report it rather than guess.
    if let Some(local) = &rule.local {
        if local.ip.is_some() || local.ports.is_some() {
            return Err(
                "rule constrains the local endpoint, which the query does not carry"
                    .to_string(),
            );
        }
    }

    if let Some(process) = rule.process.as_deref() {
        let Some(query_path) = query.process_path.as_deref() else {
            return Err("query does not specify a process path".to_string());
        };
        if !process_matches(process, query_path) {
            return Err(format!(
                "process mismatch (rule {process:?}, query {query_path:?})"
            ));
        }
    }

    Ok(())
}

/// Full-path equality, or file-name equality when the rule holds a bare
/// name. ASCII case-insensitive either way.
fn process_matches(rule_process: &str, query_path: &str) -> bool {
    let is_bare_name = !rule_process.contains('/') && !rule_process.contains('\\');
    if is_bare_name {
        file_name(query_path).eq_ignore_ascii_case(rule_process)
    } else {
        rule_process.eq_ignore_ascii_case(query_path)
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
