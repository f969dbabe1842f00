use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::grant::{CommandScope, ServerScope};
use super::ids::RequestId;
use super::names::FoldedName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Assigned,
    Denied,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Per-level status. Variant order is the progression order; a level never
/// moves to an earlier variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelStatus {
    Pending,
    ReadyToApprove,
    Assigned,
    Denied,
}

impl LevelStatus {
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::ReadyToApprove)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverAction {
    Pending,
    Assigned,
    Denied,
}

/// What an approver decides in `Act`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Assigned,
    Denied,
}

impl From<ApprovalDecision> for ApproverAction {
    fn from(value: ApprovalDecision) -> Self {
        match value {
            ApprovalDecision::Assigned => Self::Assigned,
            ApprovalDecision::Denied => Self::Denied,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverSlot {
    pub identity: FoldedName,
    pub action: ApproverAction,
    pub acted_at: Option<DateTime<Utc>>,
    pub comments: Option<String>,
}

impl ApproverSlot {
    pub fn new(identity: FoldedName) -> Self {
        Self {
            identity,
            action: ApproverAction::Pending,
            acted_at: None,
            comments: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalLevel {
    pub approvers: Vec<ApproverSlot>,
    pub status: LevelStatus,
}

impl ApprovalLevel {
    pub fn slot(&self, identity: &FoldedName) -> Option<&ApproverSlot> {
        self.approvers.iter().find(|s| &s.identity == identity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub requester: FoldedName,
    pub server_scope: ServerScope,
    /// `None` requests host access without command scoping.
    pub command_scope: Option<CommandScope>,
    pub reason: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    /// Level 1 first. Identity is the position; never reordered.
    pub approval_levels: Vec<ApprovalLevel>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    /// Bumped on every committed transition; used for optimistic concurrency.
    pub version: u64,
}

impl Request {
    /// Index of the first level still awaiting a decision.
    pub fn current_level(&self) -> Option<usize> {
        if self.status.is_terminal() {
            return None;
        }
        self.approval_levels.iter().position(|l| l.status.is_open())
    }

    /// Human-facing number carried onto the materialized grant.
    pub fn number(&self) -> String {
        format!("REQ-{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_status_order_is_progression() {
        assert!(LevelStatus::Pending < LevelStatus::ReadyToApprove);
        assert!(LevelStatus::ReadyToApprove < LevelStatus::Assigned);
        assert!(LevelStatus::ReadyToApprove < LevelStatus::Denied);
    }

    #[test]
    fn only_pending_request_is_open() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(RequestStatus::Assigned.is_terminal());
        assert!(RequestStatus::Denied.is_terminal());
        assert!(RequestStatus::Cancelled.is_terminal());
    }
}
