use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BastionError {
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("conflict: {0}")]
    Conflict(ConflictReason),

    #[error("dependency unavailable: {0}")]
    Unavailable(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("policy load failed: {0}")]
    PolicyLoad(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("policy validation failed: {0}")]
    PolicyValidation(String),

    #[error("field protection failed: {0}")]
    Protection(String),

    #[error("command execution failed: {0}")]
    Execution(String),
}

impl BastionError {
    pub(crate) fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// The conflict reason, if this is a policy conflict.
    pub fn conflict(&self) -> Option<ConflictReason> {
        match self {
            Self::Conflict(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Stable reason codes for rejected state changes. No partial mutation
/// accompanies any of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    NoPendingLevel,
    NotAnApprover,
    AlreadyActed,
    AlreadyTerminal,
    DuplicateName,
    StaleVersion,
}

impl ConflictReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::NoPendingLevel => "no_pending_level",
            Self::NotAnApprover => "not_an_approver",
            Self::AlreadyActed => "already_acted",
            Self::AlreadyTerminal => "already_terminal",
            Self::DuplicateName => "duplicate_name",
            Self::StaleVersion => "stale_version",
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
