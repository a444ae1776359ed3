//! Policy and filter object model for hostwall.
//!
//! These types are the typed representation of a versioned rule set plus the
//! compiled substrate-facing filter objects. They carry no logic beyond
//! identity derivation and small accessors; validation, compilation, diffing
//! and simulation live in their own modules.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ─────────────────────────────────────────────────────────────────────────────
// Policy document
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum rule id length accepted by the validator.
pub const MAX_RULE_ID_LEN: usize = 64;

/// Maximum process path length accepted by the validator.
pub const MAX_PROCESS_PATH_LEN: usize = 260;

/// A versioned, ordered rule set. Immutable once parsed.
///
/// Invariant (enforced by the validator): rule ids are unique within a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Author-assigned policy version string (non-empty).
    pub version: String,
    /// Verdict applied when no rule matches.
    pub default_action: Action,
    /// Optional author timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Ordered rule list. Order is the tie-break for equal priorities.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Policy {
    /// Parse a policy from raw JSON.
    ///
    /// This is the happy-path typed parse; run [`crate::validate`] first when
    /// the input is untrusted so the author gets every problem in one report.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Enabled rules in priority-descending order, original order on ties.
    #[must_use]
    pub fn enabled_rules_by_priority(&self) -> Vec<&Rule> {
        let mut rules: Vec<&Rule> = self.rules.iter().filter(|r| r.enabled).collect();
        // sort_by_key is stable, so equal priorities keep author order.
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
        rules
    }
}

/// One declarative allow/block rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Unique id, charset `[A-Za-z0-9_-]`, at most [`MAX_RULE_ID_LEN`] chars.
    pub id: String,
    /// Verdict for traffic matching this rule.
    pub action: Action,
    /// Traffic direction the rule covers.
    #[serde(default)]
    pub direction: Direction,
    /// Transport protocol the rule covers.
    #[serde(default)]
    pub protocol: RuleProtocol,
    /// Remote endpoint constraint. Absent means any remote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<Endpoint>,
    /// Local endpoint constraint. Absent means any local.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<Endpoint>,
    /// Executable path (or bare file name) the rule is scoped to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
    /// Higher priority wins at both the substrate and the simulator.
    #[serde(default)]
    pub priority: i32,
    /// Disabled rules are skipped by the compiler and the simulator.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Free-form author note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

const fn default_enabled() -> bool {
    true
}

/// Address/port constraint for one side of a connection.
///
/// Absent fields mean "any". `ip` is a single IPv4 address or an IPv4 CIDR;
/// `ports` is a comma-separated list of single ports and/or `a-b` ranges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Enums
// ─────────────────────────────────────────────────────────────────────────────

/// Rule verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Allow,
    Block,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => f.write_str("allow"),
            Self::Block => f.write_str("block"),
        }
    }
}

/// Direction a rule covers. `Both` expands to two compiled filters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
    #[default]
    Both,
}

impl Direction {
    /// Concrete directions this rule direction expands to.
    #[must_use]
    pub const fn expand(self) -> &'static [FilterDirection] {
        match self {
            Self::Inbound => &[FilterDirection::Inbound],
            Self::Outbound => &[FilterDirection::Outbound],
            Self::Both => &[FilterDirection::Inbound, FilterDirection::Outbound],
        }
    }

    /// Whether this rule direction covers a concrete flow direction.
    #[must_use]
    pub const fn covers(self, dir: FilterDirection) -> bool {
        match self {
            Self::Both => true,
            Self::Inbound => matches!(dir, FilterDirection::Inbound),
            Self::Outbound => matches!(dir, FilterDirection::Outbound),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => f.write_str("inbound"),
            Self::Outbound => f.write_str("outbound"),
            Self::Both => f.write_str("both"),
        }
    }
}

/// Concrete direction of one compiled filter or one simulated flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterDirection {
    Inbound,
    Outbound,
}

impl fmt::Display for FilterDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => f.write_str("inbound"),
            Self::Outbound => f.write_str("outbound"),
        }
    }
}

/// Protocol a rule covers. `Any` expands to TCP and UDP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleProtocol {
    Tcp,
    Udp,
    #[default]
    Any,
}

impl RuleProtocol {
    /// Concrete transport protocols this rule protocol expands to.
    #[must_use]
    pub const fn expand(self) -> &'static [TransportProtocol] {
        match self {
            Self::Tcp => &[TransportProtocol::Tcp],
            Self::Udp => &[TransportProtocol::Udp],
            Self::Any => &[TransportProtocol::Tcp, TransportProtocol::Udp],
        }
    }

    /// Whether this rule protocol covers a concrete transport protocol.
    #[must_use]
    pub const fn covers(self, proto: TransportProtocol) -> bool {
        match self {
            Self::Any => true,
            Self::Tcp => matches!(proto, TransportProtocol::Tcp),
            Self::Udp => matches!(proto, TransportProtocol::Udp),
        }
    }
}

impl fmt::Display for RuleProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
            Self::Any => f.write_str("any"),
        }
    }
}

/// Concrete transport protocol with its IANA protocol number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl TransportProtocol {
    /// IANA protocol number (TCP = 6, UDP = 17).
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ports
// ─────────────────────────────────────────────────────────────────────────────

/// Inclusive port range; a single port has `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// Range covering one port.
    #[must_use]
    pub const fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    /// Whether `port` falls inside this range.
    #[must_use]
    pub const fn contains(self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Filter identity
// ─────────────────────────────────────────────────────────────────────────────

/// Domain separator for filter key derivation. Changing it invalidates every
/// deployed filter key, so it is versioned.
const FILTER_KEY_DOMAIN: &str = "hostwall.filter.v1";

/// Stable 128-bit filter identity.
///
/// Derived purely from `(rule_id, expansion_index)`: the same rule and the
/// same expansion ordinal always produce the same key, in any process, at any
/// time. This is what makes identity-based diffing possible across repeated
/// compiles and process restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FilterKey([u8; 16]);

impl FilterKey {
    /// Derive the key for one expansion of one rule.
    #[must_use]
    pub fn derive(rule_id: &str, expansion_index: u32) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(FILTER_KEY_DOMAIN.as_bytes());
        hasher.update(b":");
        hasher.update(rule_id.as_bytes());
        hasher.update(b":");
        hasher.update(&expansion_index.to_le_bytes());
        let digest = hasher.finalize();
        let mut key = [0u8; 16];
        key.copy_from_slice(&digest.as_bytes()[..16]);
        Self(key)
    }

    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Error parsing a [`FilterKey`] from hex.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid filter key: {0}")]
pub struct FilterKeyParseError(String);

impl FromStr for FilterKey {
    type Err = FilterKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(FilterKeyParseError(format!(
                "expected 32 hex chars, got {}",
                s.len()
            )));
        }
        // The length check above counts bytes; guard the pair slices below
        // against multi-byte input.
        if !s.is_ascii() {
            return Err(FilterKeyParseError("non-ASCII input".to_string()));
        }
        let mut key = [0u8; 16];
        for (i, chunk) in key.iter_mut().enumerate() {
            let pair = &s[i * 2..i * 2 + 2];
            *chunk = u8::from_str_radix(pair, 16)
                .map_err(|_| FilterKeyParseError(format!("non-hex pair {pair:?}")))?;
        }
        Ok(Self(key))
    }
}

impl Serialize for FilterKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FilterKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiled and enumerated filters
// ─────────────────────────────────────────────────────────────────────────────

/// One concrete substrate filter instruction produced by the compiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledFilter {
    /// Stable identity, see [`FilterKey`].
    pub filter_key: FilterKey,
    /// Substrate-visible name; carries the content fingerprint suffix.
    pub display_name: String,
    /// Substrate-visible description (rule comment, when present).
    pub description: String,
    /// Verdict this filter enforces.
    pub action: Action,
    /// Substrate precedence weight (higher wins).
    pub weight: u64,
    /// Id of the rule this filter was expanded from.
    pub rule_id: String,
    /// IANA protocol number.
    pub protocol: u8,
    /// Concrete flow direction.
    pub direction: FilterDirection,
    /// Remote address constraint (host routes are /32 networks).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_net: Option<Ipv4Net>,
    /// Remote port constraint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<PortRange>,
    /// Local address constraint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_net: Option<Ipv4Net>,
    /// Local port constraint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<PortRange>,
    /// Executable path the rule was scoped to, when it resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_path: Option<String>,
    /// Substrate-native application identity blob for `process_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_identity: Option<Vec<u8>>,
}

/// A substrate-reported filter, as returned by enumeration.
///
/// Read-only snapshot; this engine never constructs one except when adapting
/// a substrate's enumeration output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistingFilter {
    pub filter_key: FilterKey,
    pub native_filter_id: u64,
    pub display_name: String,
}

/// Minimal edit between a desired filter set and the substrate's current set.
///
/// Derived, never persisted.
#[derive(Debug, Clone, Default)]
pub struct FilterDiff {
    pub to_add: Vec<CompiledFilter>,
    pub to_remove: Vec<ExistingFilter>,
    pub unchanged_count: usize,
}

impl FilterDiff {
    /// True when applying this diff would perform zero substrate writes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_key_is_stable_across_derivations() {
        let a = FilterKey::derive("allow-dns", 3);
        let b = FilterKey::derive("allow-dns", 3);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn filter_key_differs_per_rule_and_index() {
        let base = FilterKey::derive("rule-a", 0);
        assert_ne!(base, FilterKey::derive("rule-a", 1));
        assert_ne!(base, FilterKey::derive("rule-b", 0));
    }

    #[test]
    fn filter_key_hex_round_trip() {
        let key = FilterKey::derive("rt", 7);
        let parsed: FilterKey = key.to_string().parse().expect("parse");
        assert_eq!(key, parsed);
    }

    #[test]
    fn filter_key_rejects_bad_hex() {
        assert!("abc".parse::<FilterKey>().is_err());
        assert!(
            "zz00000000000000000000000000zz00"
                .parse::<FilterKey>()
                .is_err()
        );
    }

    #[test]
    fn filter_key_rejects_non_ascii_without_panicking() {
        // 32 bytes, but the first char is 3 bytes wide; slicing by byte
        // offset must not land mid-char.
        let multibyte = format!("\u{20ac}{}", "a".repeat(29));
        assert_eq!(multibyte.len(), 32);
        assert!(multibyte.parse::<FilterKey>().is_err());
    }

    #[test]
    fn direction_expansion() {
        assert_eq!(Direction::Both.expand().len(), 2);
        assert_eq!(
            Direction::Inbound.expand(),
            &[FilterDirection::Inbound][..]
        );
    }

    #[test]
    fn protocol_numbers_are_iana() {
        assert_eq!(TransportProtocol::Tcp.number(), 6);
        assert_eq!(TransportProtocol::Udp.number(), 17);
    }

    #[test]
    fn port_range_containment() {
        let range = PortRange {
            start: 8000,
            end: 8080,
        };
        assert!(range.contains(8000));
        assert!(range.contains(8080));
        assert!(!range.contains(7999));
        assert!(PortRange::single(443).contains(443));
    }

    #[test]
    fn enabled_rules_sorted_by_priority_stable() {
        let policy: Policy = serde_json::from_str(
            r#"{
                "version": "1",
                "default_action": "block",
                "rules": [
                    {"id": "low", "action": "allow", "priority": 10},
                    {"id": "off", "action": "allow", "priority": 99, "enabled": false},
                    {"id": "high", "action": "block", "priority": 50},
                    {"id": "tie", "action": "allow", "priority": 50}
                ]
            }"#,
        )
        .expect("policy");
        let ordered: Vec<&str> = policy
            .enabled_rules_by_priority()
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ordered, vec!["high", "tie", "low"]);
    }
}
