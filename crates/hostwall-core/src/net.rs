//! Endpoint grammar: IPv4 address/CIDR specs and port-token lists.
//!
//! Shared by the validator (reporting), the compiler (expansion) and the
//! simulator (matching), so the three layers cannot drift on what an endpoint
//! string means.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::model::PortRange;

/// Error parsing an `ip` endpoint field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IpSpecError {
    /// IPv6 is a documented non-goal, rejected explicitly rather than
    /// silently dropped.
    #[error("IPv6 addresses are not supported (IPv4 only)")]
    Ipv6Unsupported,
    #[error("invalid IPv4 address {0:?}")]
    InvalidAddress(String),
    #[error("invalid IPv4 CIDR {0:?}")]
    InvalidCidr(String),
}

/// Parse an `ip` field: a single IPv4 address or an IPv4 CIDR.
///
/// Single addresses become /32 networks; CIDR specs are truncated to their
/// network address so equivalent spellings compare equal.
pub fn parse_ipv4_spec(spec: &str) -> Result<Ipv4Net, IpSpecError> {
    let spec = spec.trim();
    if spec.contains(':') {
        return Err(IpSpecError::Ipv6Unsupported);
    }
    if spec.contains('/') {
        let net: Ipv4Net = spec
            .parse()
            .map_err(|_| IpSpecError::InvalidCidr(spec.to_string()))?;
        return Ok(net.trunc());
    }
    let addr: Ipv4Addr = spec
        .parse()
        .map_err(|_| IpSpecError::InvalidAddress(spec.to_string()))?;
    Ipv4Net::new(addr, 32).map_err(|_| IpSpecError::InvalidCidr(spec.to_string()))
}

/// Error parsing a `ports` endpoint field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortSpecError {
    #[error("port list is empty")]
    Empty,
    #[error("invalid port token {token:?}: {reason}")]
    InvalidToken { token: String, reason: String },
}

impl PortSpecError {
    fn token(token: &str, reason: impl Into<String>) -> Self {
        Self::InvalidToken {
            token: token.to_string(),
            reason: reason.into(),
        }
    }
}

/// Parse a comma-separated port list into its tokens, order preserved.
///
/// Each token is a single port or an `a-b` range with `a < b`, both within
/// 1..=65535. Every token is its own expansion unit for the compiler.
pub fn parse_port_tokens(spec: &str) -> Result<Vec<PortRange>, PortSpecError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(PortSpecError::Empty);
    }
    let mut tokens = Vec::new();
    for raw in spec.split(',') {
        let token = raw.trim();
        if token.is_empty() {
            return Err(PortSpecError::token(raw, "empty token"));
        }
        if let Some((start, end)) = token.split_once('-') {
            let start = parse_port(start.trim())
                .map_err(|reason| PortSpecError::token(token, reason))?;
            let end =
                parse_port(end.trim()).map_err(|reason| PortSpecError::token(token, reason))?;
            if start >= end {
                return Err(PortSpecError::token(
                    token,
                    "range start must be less than range end",
                ));
            }
            tokens.push(PortRange { start, end });
        } else {
            let port =
                parse_port(token).map_err(|reason| PortSpecError::token(token, reason))?;
            tokens.push(PortRange::single(port));
        }
    }
    Ok(tokens)
}

fn parse_port(s: &str) -> Result<u16, String> {
    let port: u16 = s
        .parse()
        .map_err(|_| format!("{s:?} is not a port number (1-65535)"))?;
    if port == 0 {
        return Err("port 0 is out of range (1-65535)".to_string());
    }
    Ok(port)
}
