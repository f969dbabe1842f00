pub mod chain;
pub mod transition;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::audit::{ActionType, Actor, AuditEvent, AuditSink, Module, Notification, NotificationKind};
use crate::engine::Backends;
use crate::error::{BastionError, ConflictReason};
use crate::model::{
    ApprovalDecision, CommandScope, FoldedName, Request, RequestId, RequestStatus, ServerScope,
};
use crate::store::{HostDirectory, RequestStore, RequestTransition};
use crate::time::{Clock, ValidityWindow};

/// Attempts at committing one action before giving up on a contended request.
const MAX_COMMIT_ATTEMPTS: usize = 3;

/// What a subject asks for.
#[derive(Debug, Clone)]
pub struct RequestDraft {
    /// Requesting on someone else's behalf; defaults to the acting subject.
    pub on_behalf_of: Option<String>,
    pub server_scope: ServerScope,
    pub command_scope: Option<CommandScope>,
    pub reason: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

/// Multi-level approval over requests. Every state change commits with a
/// version check, so concurrent approvers cannot both decide one level.
pub struct ApprovalWorkflow {
    requests: Arc<dyn RequestStore>,
    hosts: Arc<dyn HostDirectory>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl ApprovalWorkflow {
    pub fn new(backends: &Backends) -> Self {
        Self {
            requests: backends.requests.clone(),
            hosts: backends.hosts.clone(),
            audit: backends.audit.clone(),
            clock: backends.clock.clone(),
        }
    }

    pub async fn submit_request(
        &self,
        actor: &Actor,
        draft: RequestDraft,
    ) -> Result<Request, BastionError> {
        let requester = match draft.on_behalf_of.as_deref() {
            Some(name) => FoldedName::new(name),
            None => actor.subject.clone(),
        };
        if requester.is_empty() {
            return Err(BastionError::validation("requester", "must not be empty"));
        }
        if draft.server_scope.is_empty() {
            return Err(BastionError::validation(
                "server_scope",
                "must name at least one host or a server group",
            ));
        }
        if draft.command_scope.as_ref().is_some_and(CommandScope::is_empty) {
            return Err(BastionError::validation(
                "command_scope",
                "must not be empty when given",
            ));
        }
        if !ValidityWindow::new(draft.valid_from, draft.valid_until).is_well_formed() {
            return Err(BastionError::validation(
                "valid_until",
                "must be later than valid_from",
            ));
        }

        let resolved = chain::resolve_approvers(self.hosts.as_ref(), &draft.server_scope).await?;
        let approval_levels = chain::build_levels(resolved, &requester)?;

        let request = Request {
            id: RequestId::generate(),
            requester,
            server_scope: draft.server_scope,
            command_scope: draft.command_scope,
            reason: draft.reason,
            valid_from: draft.valid_from,
            valid_until: draft.valid_until,
            approval_levels,
            status: RequestStatus::Pending,
            created_at: self.clock.now(),
            version: 0,
        };
        self.requests.insert_request(request.clone()).await?;

        tracing::info!(
            request = %request.id,
            requester = %request.requester,
            levels = request.approval_levels.len(),
            "request submitted"
        );
        self.audit.record(
            AuditEvent::new(actor, ActionType::SubmitRequest, Module::Workflow, "pending")
                .change(None, Some(&request)),
        );
        Ok(request)
    }

    /// Record an approver's decision on the request's current level.
    ///
    /// `end_date` replaces the requested end of the grant when this action
    /// assigns the last level.
    pub async fn act(
        &self,
        id: &RequestId,
        actor: &Actor,
        decision: ApprovalDecision,
        comments: Option<String>,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<Request, BastionError> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let current = self.requests.request(id).await?;
            let outcome = transition::act(
                &current,
                transition::Action {
                    approver: &actor.subject,
                    decision,
                    comments: comments.clone(),
                    end_date,
                    at: self.clock.now(),
                },
            )
            .inspect_err(|e| {
                tracing::warn!(request = %id, approver = %actor.subject, error = %e, "approval rejected");
            })?;

            let committed = self
                .requests
                .commit_transition(RequestTransition {
                    request: outcome.request.clone(),
                    expected_version: current.version,
                    grant: outcome.grant.clone(),
                })
                .await;
            match committed {
                Ok(()) => {
                    self.record_decision(actor, decision, &current, &outcome);
                    return Ok(outcome.request);
                }
                Err(BastionError::Conflict(ConflictReason::StaleVersion)) => {
                    tracing::debug!(request = %id, attempt, "request changed underneath; retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(BastionError::Conflict(ConflictReason::StaleVersion))
    }

    /// Withdraw a pending request.
    pub async fn cancel(&self, id: &RequestId, actor: &Actor) -> Result<Request, BastionError> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let current = self.requests.request(id).await?;
            let next = transition::cancel(&current)?;
            let committed = self
                .requests
                .commit_transition(RequestTransition {
                    request: next.clone(),
                    expected_version: current.version,
                    grant: None,
                })
                .await;
            match committed {
                Ok(()) => {
                    tracing::info!(request = %id, by = %actor.subject, "request cancelled");
                    self.audit.record(
                        AuditEvent::new(actor, ActionType::Cancel, Module::Workflow, "cancelled")
                            .change(Some(&current), Some(&next)),
                    );
                    return Ok(next);
                }
                Err(BastionError::Conflict(ConflictReason::StaleVersion)) => {
                    tracing::debug!(request = %id, attempt, "request changed underneath; retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(BastionError::Conflict(ConflictReason::StaleVersion))
    }

    pub async fn request(&self, id: &RequestId) -> Result<Request, BastionError> {
        self.requests.request(id).await
    }

    /// All requests, newest first.
    pub async fn list(&self) -> Result<Vec<Request>, BastionError> {
        let mut requests = self.requests.list_requests().await?;
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    /// Pending requests whose current level waits on `approver`.
    pub async fn awaiting(&self, approver: &FoldedName) -> Result<Vec<Request>, BastionError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| {
                r.current_level()
                    .and_then(|i| r.approval_levels[i].slot(approver))
                    .is_some_and(|s| s.acted_at.is_none())
            })
            .collect())
    }

    fn record_decision(
        &self,
        actor: &Actor,
        decision: ApprovalDecision,
        before: &Request,
        outcome: &transition::Outcome,
    ) {
        let after = &outcome.request;
        let (action, verb) = match decision {
            ApprovalDecision::Assigned => (ActionType::Approve, "assigned"),
            ApprovalDecision::Denied => (ActionType::Deny, "denied"),
        };
        let summary = format!("level {} {verb}", outcome.level + 1);
        tracing::info!(request = %after.id, approver = %actor.subject, status = ?after.status, "{summary}");
        self.audit.record(
            AuditEvent::new(actor, action, Module::Workflow, summary)
                .change(Some(before), Some(after)),
        );

        if let Some(grant) = &outcome.grant {
            self.audit.record(
                AuditEvent::new(actor, ActionType::CreateGrant, Module::Grants, "created")
                    .change(None, Some(grant)),
            );
        }
        if after.status.is_terminal() {
            let message = match after.status {
                RequestStatus::Assigned => format!("request {} approved", after.number()),
                _ => format!("request {} denied by {}", after.number(), actor.subject),
            };
            self.audit.notify(Notification {
                subject: after.requester.clone(),
                kind: NotificationKind::RequestDecided,
                message,
                command: None,
            });
        }
    }
}
