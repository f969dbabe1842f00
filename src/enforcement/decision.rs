use std::fmt;

use serde::Serialize;

use super::capability::ExecutionToken;

/// Why a command was denied. `Display` is the human-readable reason carried
/// on every deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    BlacklistedUnauthorized,
    Blacklisted,
    /// A covering grant carries the hard `blocked` override.
    Blocked,
    /// Matched an exclusion of a granted command group.
    Excluded,
    Unauthorized,
    /// Grant data could not be read; treated as unauthorized.
    PolicyUnavailable,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BlacklistedUnauthorized => "blacklisted, unauthorized",
            Self::Blacklisted => "blacklisted",
            Self::Blocked => "blocked",
            Self::Excluded => "unauthorized: excluded command",
            Self::Unauthorized => "unauthorized",
            Self::PolicyUnavailable => "unauthorized: policy data unavailable",
        })
    }
}

/// Outcome of a quick authorization check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationDecision {
    pub allowed: bool,
    pub blacklisted: bool,
    /// `None` exactly when `allowed`.
    pub reason: Option<DenyReason>,
    /// Leading token the decision was made on.
    pub prefix: String,
}

impl AuthorizationDecision {
    pub(super) fn allow(prefix: &str) -> Self {
        Self {
            allowed: true,
            blacklisted: false,
            reason: None,
            prefix: prefix.to_owned(),
        }
    }

    pub(super) fn deny(prefix: &str, blacklisted: bool, reason: DenyReason) -> Self {
        Self {
            allowed: false,
            blacklisted,
            reason: Some(reason),
            prefix: prefix.to_owned(),
        }
    }

    pub fn reason_text(&self) -> String {
        self.reason
            .map_or_else(|| "allowed".to_owned(), |r| r.to_string())
    }
}

/// Result of evaluating a proposed invocation.
#[derive(Debug)]
pub enum ExecutionDecision {
    Allow(ExecutionToken),
    Deny(AuthorizationDecision),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_text_matches_decision() {
        assert_eq!(AuthorizationDecision::allow("ls").reason_text(), "allowed");
        let denied = AuthorizationDecision::deny("rm", true, DenyReason::BlacklistedUnauthorized);
        assert_eq!(denied.reason_text(), "blacklisted, unauthorized");
        assert!(!denied.allowed);
    }
}
