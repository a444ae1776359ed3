//! Structural and semantic validation of a raw policy document.
//!
//! The validator works on a [`serde_json::Value`] rather than the typed
//! [`Policy`] so it can keep collecting after the first broken field: a
//! document with N independent problems produces N issues in one report.
//! Validation never mutates state and never touches the substrate.

use serde_json::Value;

use crate::compile::{MAX_RULE_PRIORITY, MIN_RULE_PRIORITY};
use crate::model::{MAX_PROCESS_PATH_LEN, MAX_RULE_ID_LEN};
use crate::net::{parse_ipv4_spec, parse_port_tokens};

/// One validation problem, addressed by rule index and field path.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValidationIssue {
    /// Index into the `rules` array, absent for policy-level issues.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_index: Option<usize>,
    /// Field path relative to the policy or the rule, e.g. `remote.ip`.
    pub field: String,
    pub message: String,
}

/// Outcome of validating one raw policy document.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ValidationResult {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// True when the document may be parsed and compiled.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

const ACTIONS: &[&str] = &["allow", "block"];
const DIRECTIONS: &[&str] = &["inbound", "outbound", "both"];
const PROTOCOLS: &[&str] = &["tcp", "udp", "any"];

/// Validate a raw policy JSON document, collecting every violation.
#[must_use]
pub fn validate(raw_json: &str) -> ValidationResult {
    let mut issues = Vec::new();

    let doc: Value = match serde_json::from_str(raw_json) {
        Ok(doc) => doc,
        Err(err) => {
            issues.push(ValidationIssue {
                rule_index: None,
                field: "$".to_string(),
                message: format!("malformed JSON: {err}"),
            });
            return ValidationResult { issues };
        }
    };

    let Some(obj) = doc.as_object() else {
        issues.push(ValidationIssue {
            rule_index: None,
            field: "$".to_string(),
            message: "policy document must be a JSON object".to_string(),
        });
        return ValidationResult { issues };
    };

    check_version(obj.get("version"), &mut issues);
    check_enum_field(None, "default_action", obj.get("default_action"), ACTIONS, true, &mut issues);
    check_updated_at(obj.get("updated_at"), &mut issues);

    match obj.get("rules") {
        None => {}
        Some(Value::Array(rules)) => {
            let mut seen_ids: Vec<&str> = Vec::new();
            for (index, rule) in rules.iter().enumerate() {
                check_rule(index, rule, &mut seen_ids, &mut issues);
            }
        }
        Some(_) => issues.push(ValidationIssue {
            rule_index: None,
            field: "rules".to_string(),
            message: "must be an array of rules".to_string(),
        }),
    }

    ValidationResult { issues }
}

fn check_version(value: Option<&Value>, issues: &mut Vec<ValidationIssue>) {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => {}
        Some(Value::String(_)) => issues.push(policy_issue("version", "must not be empty")),
        Some(_) => issues.push(policy_issue("version", "must be a string")),
        None => issues.push(policy_issue("version", "is required")),
    }
}

fn check_updated_at(value: Option<&Value>, issues: &mut Vec<ValidationIssue>) {
    match value {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => {
            if chrono::DateTime::parse_from_rfc3339(s).is_err() {
                issues.push(policy_issue(
                    "updated_at",
                    "must be an RFC 3339 timestamp",
                ));
            }
        }
        Some(_) => issues.push(policy_issue("updated_at", "must be a string timestamp")),
    }
}

fn check_rule<'a>(
    index: usize,
    rule: &'a Value,
    seen_ids: &mut Vec<&'a str>,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(obj) = rule.as_object() else {
        issues.push(rule_issue(index, "$", "rule must be a JSON object"));
        return;
    };

    match obj.get("id") {
        Some(Value::String(id)) => {
            if id.is_empty() {
                issues.push(rule_issue(index, "id", "must not be empty"));
            } else if id.len() > MAX_RULE_ID_LEN {
                issues.push(rule_issue(
                    index,
                    "id",
                    format!("exceeds {MAX_RULE_ID_LEN} characters"),
                ));
            } else if !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                issues.push(rule_issue(
                    index,
                    "id",
                    "may only contain [A-Za-z0-9_-]",
                ));
            } else if seen_ids.contains(&id.as_str()) {
                issues.push(rule_issue(index, "id", format!("duplicate rule id {id:?}")));
            } else {
                seen_ids.push(id);
            }
        }
        Some(_) => issues.push(rule_issue(index, "id", "must be a string")),
        None => issues.push(rule_issue(index, "id", "is required")),
    }

    check_enum_field(Some(index), "action", obj.get("action"), ACTIONS, true, issues);
    check_enum_field(
        Some(index),
        "direction",
        obj.get("direction"),
        DIRECTIONS,
        false,
        issues,
    );
    check_protocol(index, obj.get("protocol"), issues);
    check_endpoint(index, "remote", obj.get("remote"), issues);
    check_endpoint(index, "local", obj.get("local"), issues);

    match obj.get("process") {
        None | Some(Value::Null) => {}
        Some(Value::String(path)) => {
            if path.is_empty() {
                issues.push(rule_issue(index, "process", "must not be empty"));
            } else if path.len() > MAX_PROCESS_PATH_LEN {
                issues.push(rule_issue(
                    index,
                    "process",
                    format!("exceeds {MAX_PROCESS_PATH_LEN} characters"),
                ));
            }
        }
        Some(_) => issues.push(rule_issue(index, "process", "must be a string path")),
    }

    match obj.get("priority") {
        None => {}
        Some(value) => match value.as_i64() {
            Some(p) if (i64::from(MIN_RULE_PRIORITY)..=i64::from(MAX_RULE_PRIORITY))
                .contains(&p) => {}
            Some(_) => issues.push(rule_issue(
                index,
                "priority",
                format!("must be between {MIN_RULE_PRIORITY} and {MAX_RULE_PRIORITY}"),
            )),
            None => issues.push(rule_issue(index, "priority", "must be an integer")),
        },
    }

    match obj.get("enabled") {
        None | Some(Value::Bool(_)) => {}
        Some(_) => issues.push(rule_issue(index, "enabled", "must be a boolean")),
    }

    match obj.get("comment") {
        None | Some(Value::Null) | Some(Value::String(_)) => {}
        Some(_) => issues.push(rule_issue(index, "comment", "must be a string")),
    }
}

fn check_protocol(index: usize, value: Option<&Value>, issues: &mut Vec<ValidationIssue>) {
    if let Some(Value::String(s)) = value {
        // ICMP is a documented non-goal; call it out instead of a generic
        // enum-membership message.
        let lower = s.to_ascii_lowercase();
        if matches!(lower.as_str(), "icmp" | "icmpv4" | "icmpv6") {
            issues.push(rule_issue(
                index,
                "protocol",
                "ICMP filtering is not supported (tcp, udp, any)",
            ));
            return;
        }
    }
    check_enum_field(Some(index), "protocol", value, PROTOCOLS, false, issues);
}

fn check_endpoint(
    index: usize,
    field: &str,
    value: Option<&Value>,
    issues: &mut Vec<ValidationIssue>,
) {
    let obj = match value {
        None | Some(Value::Null) => return,
        Some(Value::Object(obj)) => obj,
        Some(_) => {
            issues.push(rule_issue(index, field, "must be an endpoint object"));
            return;
        }
    };

    match obj.get("ip") {
        None | Some(Value::Null) => {}
        Some(Value::String(ip)) => {
            if let Err(err) = parse_ipv4_spec(ip) {
                issues.push(rule_issue(index, format!("{field}.ip"), err.to_string()));
            }
        }
        Some(_) => issues.push(rule_issue(index, format!("{field}.ip"), "must be a string")),
    }

    match obj.get("ports") {
        None | Some(Value::Null) => {}
        Some(Value::String(ports)) => {
            if let Err(err) = parse_port_tokens(ports) {
                issues.push(rule_issue(index, format!("{field}.ports"), err.to_string()));
            }
        }
        Some(_) => issues.push(rule_issue(
            index,
            format!("{field}.ports"),
            "must be a string port list",
        )),
    }
}

fn check_enum_field(
    rule_index: Option<usize>,
    field: &str,
    value: Option<&Value>,
    allowed: &[&str],
    required: bool,
    issues: &mut Vec<ValidationIssue>,
) {
    let message = |verb: &str| {
        let options = allowed
            .iter()
            .map(|v| format!("{v:?}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{verb} one of {options}")
    };
    let push = |issues: &mut Vec<ValidationIssue>, msg: String| {
        issues.push(ValidationIssue {
            rule_index,
            field: field.to_string(),
            message: msg,
        });
    };
    match value {
        Some(Value::String(s)) => {
            if !allowed.contains(&s.as_str()) {
                push(issues, message("must be"));
            }
        }
        None => {
            if required {
                push(issues, message("is required and must be"));
            }
        }
        // Explicit null is not "absent": the typed parse will not default it.
        Some(_) => push(issues, message("must be a string,")),
    }
}

fn policy_issue(field: &str, message: impl Into<String>) -> ValidationIssue {
    ValidationIssue {
        rule_index: None,
        field: field.to_string(),
        message: message.into(),
    }
}

fn rule_issue(
    rule_index: usize,
    field: impl Into<String>,
    message: impl Into<String>,
) -> ValidationIssue {
    ValidationIssue {
        rule_index: Some(rule_index),
        field: field.into(),
        message: message.into(),
    }
}
