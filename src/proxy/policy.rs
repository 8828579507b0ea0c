//! CONNECT approval policy.
//!
//! # Responsibilities
//! - Match a CONNECT target host against the configured allow list
//! - Decide between interception and opaque relay for approved targets
//!
//! # Design Decisions
//! - Host matching is case-insensitive
//! - Patterns are `*`, `*.suffix` or an exact host; no regex
//! - `*.example.com` matches subdomains only, not `example.com` itself

use http::StatusCode;

use crate::config::TunnelConfig;
use crate::net::Target;

/// One host pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    Any,
    Suffix(String),
    Exact(String),
}

impl HostPattern {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim().to_lowercase();
        if pattern == "*" {
            HostPattern::Any
        } else if let Some(suffix) = pattern.strip_prefix("*.") {
            HostPattern::Suffix(format!(".{suffix}"))
        } else {
            HostPattern::Exact(pattern)
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        match self {
            HostPattern::Any => true,
            HostPattern::Suffix(suffix) => host.len() > suffix.len() && host.ends_with(suffix.as_str()),
            HostPattern::Exact(expected) => host == *expected,
        }
    }
}

/// A list of patterns; matches when any entry does.
#[derive(Debug, Clone, Default)]
pub struct HostSet {
    patterns: Vec<HostPattern>,
}

impl HostSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            patterns: patterns.iter().map(|p| HostPattern::parse(p.as_ref())).collect(),
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(host))
    }
}

/// Verdict for one CONNECT request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    /// Decrypt the tunnel and run its exchanges through the pipeline.
    Intercept,
    /// Relay bytes without inspection.
    Relay,
    /// Refuse with this status.
    Deny(StatusCode),
}

/// Approves or denies CONNECT targets.
#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    allow: HostSet,
    deny_status: StatusCode,
    intercept: bool,
}

impl ConnectPolicy {
    pub fn new(allow: HostSet, deny_status: StatusCode, intercept: bool) -> Self {
        Self {
            allow,
            deny_status,
            intercept,
        }
    }

    /// Policy from the tunnel section; `intercept` is true when TLS material is configured.
    pub fn from_config(config: &TunnelConfig, intercept: bool) -> Self {
        let deny_status = StatusCode::from_u16(config.deny_status).unwrap_or(StatusCode::FORBIDDEN);
        Self::new(HostSet::new(&config.allow_hosts), deny_status, intercept)
    }

    pub fn decide(&self, target: &Target) -> ConnectDecision {
        if !self.allow.matches(target.host()) {
            ConnectDecision::Deny(self.deny_status)
        } else if self.intercept {
            ConnectDecision::Intercept
        } else {
            ConnectDecision::Relay
        }
    }

    pub fn intercepts(&self) -> bool {
        self.intercept
    }
}
