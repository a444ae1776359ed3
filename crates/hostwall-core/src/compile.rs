//! Rule compiler: expands validated rules into concrete substrate filters.
//!
//! Compilation is pure and side-effect-free. It never opens a substrate
//! session; the only injected capability is a [`ProcessResolver`], and a path
//! that fails to resolve downgrades to a warning rather than an error
//! (availability over strict enforcement).

use ipnet::Ipv4Net;

use crate::model::{
    CompiledFilter, FilterDirection, FilterKey, Policy, PortRange, Rule, TransportProtocol,
};
use crate::net::{parse_ipv4_spec, parse_port_tokens};

/// Base substrate weight; `weight = BASE_FILTER_WEIGHT + rule.priority`.
/// With priority bounded to [`MIN_RULE_PRIORITY`]..=[`MAX_RULE_PRIORITY`]
/// the mapping is injective: only equal priorities share a weight, and the
/// substrate tie-break decides between those.
pub const BASE_FILTER_WEIGHT: i64 = 32768;

/// Lowest accepted rule priority (maps to weight 0).
pub const MIN_RULE_PRIORITY: i32 = -32768;

/// Highest accepted rule priority (maps to weight 65535).
pub const MAX_RULE_PRIORITY: i32 = 32767;

/// Resolves an executable path to a substrate-native application identity.
///
/// Implemented by the substrate adapter on the apply path; pure callers use
/// [`PathIdentityResolver`] or [`NullResolver`].
pub trait ProcessResolver {
    fn resolve(&self, path: &str) -> Option<Vec<u8>>;
}

/// Resolver that never resolves. Every process-scoped rule compiles without
/// its process condition and records a warning.
pub struct NullResolver;

impl ProcessResolver for NullResolver {
    fn resolve(&self, _path: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Resolver that treats the lower-cased path itself as the identity blob.
/// Used on pure paths (CLI `compile`) where no substrate is available.
pub struct PathIdentityResolver;

impl ProcessResolver for PathIdentityResolver {
    fn resolve(&self, path: &str) -> Option<Vec<u8>> {
        Some(path.to_ascii_lowercase().into_bytes())
    }
}

/// A rule-scoped compilation failure. The rule is excluded from the output;
/// other rules are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CompilationError {
    pub rule_id: String,
    pub message: String,
}

/// A rule-scoped, non-fatal compilation note.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CompilationWarning {
    pub rule_id: String,
    pub message: String,
}

/// Outcome of compiling one policy.
#[derive(Debug, Clone, Default)]
pub struct CompilationResult {
    /// Concrete filters for every enabled rule that compiled cleanly.
    pub filters: Vec<CompiledFilter>,
    /// Enabled-but-uncompilable rules. Non-empty means the result must not
    /// be applied.
    pub errors: Vec<CompilationError>,
    /// Non-fatal notes (e.g. dropped process conditions).
    pub warnings: Vec<CompilationWarning>,
    /// Disabled rules, skipped rather than erred.
    pub skipped_rule_count: usize,
}

impl CompilationResult {
    /// True when the filter list is safe to hand to the reconciliation
    /// engine.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Compile a policy into its concrete substrate filter set.
pub fn compile(policy: &Policy, resolver: &dyn ProcessResolver) -> CompilationResult {
    let mut result = CompilationResult::default();
    for rule in &policy.rules {
        if !rule.enabled {
            result.skipped_rule_count += 1;
            continue;
        }
        compile_rule(rule, resolver, &mut result);
    }
    tracing::debug!(
        filters = result.filters.len(),
        errors = result.errors.len(),
        warnings = result.warnings.len(),
        skipped = result.skipped_rule_count,
        "compiled policy"
    );
    result
}

/// Parsed endpoint constraint: optional network plus port tokens (a single
/// `None` token when the rule leaves ports unconstrained).
struct EndpointSpec {
    net: Option<Ipv4Net>,
    port_tokens: Vec<Option<PortRange>>,
}

impl EndpointSpec {
    const fn any() -> Self {
        Self {
            net: None,
            port_tokens: Vec::new(),
        }
    }
}

fn compile_rule(rule: &Rule, resolver: &dyn ProcessResolver, out: &mut CompilationResult) {
    let mut errors = Vec::new();

    let remote = parse_endpoint(rule, "remote", rule.remote.as_ref(), &mut errors);
    let local = parse_endpoint(rule, "local", rule.local.as_ref(), &mut errors);

    if !(MIN_RULE_PRIORITY..=MAX_RULE_PRIORITY).contains(&rule.priority) {
        errors.push(CompilationError {
            rule_id: rule.id.clone(),
            message: format!(
                "priority {} is outside {MIN_RULE_PRIORITY}..={MAX_RULE_PRIORITY}",
                rule.priority
            ),
        });
    }

    if !errors.is_empty() {
        out.errors.extend(errors);
        return;
    }

    let (process_path, process_identity) = match rule.process.as_deref() {
        None => (None, None),
        Some(path) => match resolver.resolve(path) {
            Some(identity) => (Some(path.to_string()), Some(identity)),
            None => {
                // Fail open: enforce the rest of the rule rather than drop it.
                out.warnings.push(CompilationWarning {
                    rule_id: rule.id.clone(),
                    message: format!(
                        "process path {path:?} did not resolve to an application \
                         identity; compiling without the process condition"
                    ),
                });
                (None, None)
            }
        },
    };

    let weight = rule_weight(rule.priority);
    let remote_tokens = non_empty_tokens(&remote.port_tokens);
    let local_tokens = non_empty_tokens(&local.port_tokens);

    let mut expansion_index: u32 = 0;
    for direction in rule.direction.expand() {
        for protocol in rule.protocol.expand() {
            for remote_port in &remote_tokens {
                for local_port in &local_tokens {
                    out.filters.push(build_filter(
                        rule,
                        expansion_index,
                        *direction,
                        *protocol,
                        weight,
                        remote.net,
                        *remote_port,
                        local.net,
                        *local_port,
                        process_path.clone(),
                        process_identity.clone(),
                    ));
                    expansion_index += 1;
                }
            }
        }
    }
}

fn parse_endpoint(
    rule: &Rule,
    side: &str,
    endpoint: Option<&crate::model::Endpoint>,
    errors: &mut Vec<CompilationError>,
) -> EndpointSpec {
    let Some(endpoint) = endpoint else {
        return EndpointSpec::any();
    };
    let mut spec = EndpointSpec::any();
    if let Some(ip) = endpoint.ip.as_deref() {
        match parse_ipv4_spec(ip) {
            Ok(net) => spec.net = Some(net),
            Err(err) => errors.push(CompilationError {
                rule_id: rule.id.clone(),
                message: format!("{side}.ip: {err}"),
            }),
        }
    }
    if let Some(ports) = endpoint.ports.as_deref() {
        match parse_port_tokens(ports) {
            Ok(tokens) => spec.port_tokens = tokens.into_iter().map(Some).collect(),
            Err(err) => errors.push(CompilationError {
                rule_id: rule.id.clone(),
                message: format!("{side}.ports: {err}"),
            }),
        }
    }
    spec
}

/// An unconstrained port list still contributes one expansion unit.
fn non_empty_tokens(tokens: &[Option<PortRange>]) -> Vec<Option<PortRange>> {
    if tokens.is_empty() {
        vec![None]
    } else {
        tokens.to_vec()
    }
}

fn rule_weight(priority: i32) -> u64 {
    // priority is bounded before this runs; the sum is in 0..=65535.
    u64::try_from(BASE_FILTER_WEIGHT + i64::from(priority)).unwrap_or_default()
}

#[allow(clippy::too_many_arguments)]
fn build_filter(
    rule: &Rule,
    expansion_index: u32,
    direction: FilterDirection,
    protocol: TransportProtocol,
    weight: u64,
    remote_net: Option<Ipv4Net>,
    remote_port: Option<PortRange>,
    local_net: Option<Ipv4Net>,
    local_port: Option<PortRange>,
    process_path: Option<String>,
    process_identity: Option<Vec<u8>>,
) -> CompiledFilter {
    let mut filter = CompiledFilter {
        filter_key: FilterKey::derive(&rule.id, expansion_index),
        display_name: String::new(),
        description: rule.comment.clone().unwrap_or_else(|| {
            format!("{} {} {} traffic", rule.action, direction, protocol)
        }),
        action: rule.action,
        weight,
        rule_id: rule.id.clone(),
        protocol: protocol.number(),
        direction,
        remote_net,
        remote_port,
        local_net,
        local_port,
        process_path,
        process_identity,
    };
    let tag = content_fingerprint(&filter);
    filter.display_name = format!("hostwall {}#{} [{}]", rule.id, expansion_index, tag);
    filter
}

// ─────────────────────────────────────────────────────────────────────────────
// Content fingerprint
// ─────────────────────────────────────────────────────────────────────────────

/// Domain separator for the content fingerprint; versioned like the key.
const FINGERPRINT_DOMAIN: &str = "hostwall.fingerprint.v1";

/// 8-byte hex fingerprint of a filter's semantic fields.
///
/// The filter key deliberately ignores content (identity is
/// `(rule_id, expansion_index)` alone), so the reconciliation engine uses
/// this fingerprint, embedded in the display name, to detect a rule edited
/// in place under a stable id and force delete+recreate.
#[must_use]
pub fn content_fingerprint(filter: &CompiledFilter) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(FINGERPRINT_DOMAIN.as_bytes());
    let fields = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}",
        filter.action,
        filter.weight,
        filter.protocol,
        filter.direction,
        filter.remote_net.map_or_else(String::new, |n| n.to_string()),
        filter
            .remote_port
            .map_or_else(String::new, |p| p.to_string()),
        filter.local_net.map_or_else(String::new, |n| n.to_string()),
        filter.local_port.map_or_else(String::new, |p| p.to_string()),
        filter.process_path.as_deref().unwrap_or_default(),
    );
    hasher.update(fields.as_bytes());
    if let Some(identity) = &filter.process_identity {
        hasher.update(identity);
    }
    let digest = hasher.finalize();
    digest.as_bytes()[..8]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Extract the fingerprint suffix from a substrate-reported display name.
///
/// Returns `None` for foreign or malformed names; callers treat that as
/// drift, never as a match.
#[must_use]
pub fn fingerprint_from_display_name(display_name: &str) -> Option<&str> {
    let start = display_name.rfind('[')?;
    let rest = &display_name[start + 1..];
    let end = rest.find(']')?;
    Some(&rest[..end])
}
