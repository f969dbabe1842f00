use chrono::{DateTime, Utc};

use crate::error::{BastionError, ConflictReason};
use crate::model::{
    AccessGrant, ApprovalDecision, ApproverAction, CommandScope, FoldedName, GrantId,
    LevelStatus, Request, RequestStatus,
};

/// One approver's action, as submitted.
#[derive(Debug, Clone)]
pub struct Action<'a> {
    pub approver: &'a FoldedName,
    pub decision: ApprovalDecision,
    pub comments: Option<String>,
    /// End of the materialized grant when this action assigns the last level.
    pub end_date: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

/// The next state of a request, plus the grant it materializes, if any.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub request: Request,
    pub grant: Option<AccessGrant>,
    /// Index of the level the action decided.
    pub level: usize,
}

fn conflict(reason: ConflictReason) -> BastionError {
    BastionError::Conflict(reason)
}

/// Which level `approver` may act on right now, or why not.
fn actionable_level(request: &Request, approver: &FoldedName) -> Result<usize, BastionError> {
    let current = request.current_level();
    if let Some(i) = current
        && let Some(slot) = request.approval_levels[i].slot(approver)
    {
        return if slot.action == ApproverAction::Pending {
            Ok(i)
        } else {
            Err(conflict(ConflictReason::AlreadyActed))
        };
    }

    // Levels before the current one, or all of them once the request is
    // terminal. Only levels someone actually decided count as acted upon.
    let decided = current.unwrap_or(request.approval_levels.len());
    let acted_on = request.approval_levels[..decided].iter().any(|level| {
        !level.status.is_open()
            && level.slot(approver).is_some()
            && level
                .approvers
                .iter()
                .any(|s| s.action != ApproverAction::Pending)
    });

    match current {
        _ if acted_on => Err(conflict(ConflictReason::AlreadyActed)),
        None => Err(conflict(ConflictReason::NoPendingLevel)),
        Some(_) => Err(conflict(ConflictReason::NotAnApprover)),
    }
}

/// Apply one approver action to `request`.
///
/// Pure: the input is untouched, and on error nothing is produced, so a
/// failed action leaves every level as it was.
pub fn act(request: &Request, action: Action<'_>) -> Result<Outcome, BastionError> {
    let level = actionable_level(request, action.approver)?;
    let is_last = level + 1 == request.approval_levels.len();

    // Only the final approval uses `end_date`; earlier levels ignore it.
    if is_last
        && action.decision == ApprovalDecision::Assigned
        && let Some(end) = action.end_date
        && end <= request.valid_from
    {
        return Err(BastionError::validation(
            "end_date",
            "must be later than the request's valid_from",
        ));
    }

    let mut next = request.clone();
    next.version += 1;
    {
        let current = &mut next.approval_levels[level];
        if let Some(slot) = current
            .approvers
            .iter_mut()
            .find(|s| &s.identity == action.approver)
        {
            slot.action = action.decision.into();
            slot.acted_at = Some(action.at);
            slot.comments = action.comments.clone();
        }
    }

    let mut grant = None;
    match action.decision {
        ApprovalDecision::Denied => {
            for later in &mut next.approval_levels[level..] {
                later.status = LevelStatus::Denied;
            }
            next.status = RequestStatus::Denied;
        }
        ApprovalDecision::Assigned => {
            next.approval_levels[level].status = LevelStatus::Assigned;
            if let Some(following) = next.approval_levels.get_mut(level + 1)
                && following.status == LevelStatus::Pending
            {
                following.status = LevelStatus::ReadyToApprove;
            }
            if is_last {
                next.status = RequestStatus::Assigned;
                grant = Some(materialize(&next, action.end_date)?);
            }
        }
    }

    Ok(Outcome {
        request: next,
        grant,
        level,
    })
}

/// Cancel a pending request. Terminal requests are left alone.
pub fn cancel(request: &Request) -> Result<Request, BastionError> {
    if request.status.is_terminal() {
        return Err(conflict(ConflictReason::AlreadyTerminal));
    }
    let mut next = request.clone();
    next.status = RequestStatus::Cancelled;
    next.version += 1;
    Ok(next)
}

/// Grant mirroring the request's scope. An approver-supplied `end_date`
/// replaces the requested end.
fn materialize(
    request: &Request,
    end_date: Option<DateTime<Utc>>,
) -> Result<AccessGrant, BastionError> {
    let grant = AccessGrant {
        id: GrantId::generate(),
        subjects: vec![request.requester.clone()],
        blocked: false,
        server_scope: request.server_scope.clone(),
        commands_apply: request.command_scope.is_some(),
        command_scope: request
            .command_scope
            .clone()
            .unwrap_or_else(|| CommandScope::Commands(Vec::new())),
        valid_from: request.valid_from,
        valid_until: end_date.unwrap_or(request.valid_until),
        request_number: Some(request.number()),
        deleted: false,
    };
    grant.validate()?;
    Ok(grant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApprovalLevel, ApproverSlot, RequestId, ServerScope};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn level(approvers: &[&str], status: LevelStatus) -> ApprovalLevel {
        ApprovalLevel {
            approvers: approvers
                .iter()
                .map(|a| ApproverSlot::new(FoldedName::new(a)))
                .collect(),
            status,
        }
    }

    fn two_level_request() -> Request {
        Request {
            id: RequestId::from("r1"),
            requester: FoldedName::new("alice"),
            server_scope: ServerScope::Hosts(vec![FoldedName::new("host1")]),
            command_scope: Some(CommandScope::Commands(vec!["systemctl".into()])),
            reason: "deploy".into(),
            valid_from: t0(),
            valid_until: t0() + Duration::days(1),
            approval_levels: vec![
                level(&["bob", "carol"], LevelStatus::ReadyToApprove),
                level(&["dave"], LevelStatus::Pending),
            ],
            status: RequestStatus::Pending,
            created_at: t0(),
            version: 0,
        }
    }

    fn action(who: &FoldedName, decision: ApprovalDecision) -> Action<'_> {
        Action {
            approver: who,
            decision,
            comments: Some("ok".into()),
            end_date: None,
            at: t0() + Duration::minutes(5),
        }
    }

    #[test]
    fn denial_closes_every_remaining_level() {
        let bob = FoldedName::new("bob");
        let out = act(&two_level_request(), action(&bob, ApprovalDecision::Denied)).unwrap();
        assert_eq!(out.request.status, RequestStatus::Denied);
        assert_eq!(out.request.approval_levels[0].status, LevelStatus::Denied);
        assert_eq!(out.request.approval_levels[1].status, LevelStatus::Denied);
        assert!(out.grant.is_none());
        assert_eq!(out.request.version, 1);
    }

    #[test]
    fn assignment_promotes_next_level_then_materializes() {
        let bob = FoldedName::new("bob");
        let dave = FoldedName::new("dave");
        let first = act(&two_level_request(), action(&bob, ApprovalDecision::Assigned)).unwrap();
        assert_eq!(first.request.approval_levels[0].status, LevelStatus::Assigned);
        assert_eq!(
            first.request.approval_levels[1].status,
            LevelStatus::ReadyToApprove
        );
        assert_eq!(first.request.status, RequestStatus::Pending);
        assert!(first.grant.is_none());

        let end = t0() + Duration::days(7);
        let mut last = action(&dave, ApprovalDecision::Assigned);
        last.end_date = Some(end);
        let second = act(&first.request, last).unwrap();
        assert_eq!(second.request.status, RequestStatus::Assigned);
        let grant = second.grant.unwrap();
        assert_eq!(grant.valid_until, end);
        assert_eq!(grant.subjects, vec![FoldedName::new("alice")]);
        assert!(grant.commands_apply);
        assert_eq!(grant.request_number.as_deref(), Some("REQ-r1"));
    }

    #[test]
    fn without_end_date_the_requested_end_stands() {
        let mut request = two_level_request();
        request.approval_levels.truncate(1);
        request.command_scope = None;
        let bob = FoldedName::new("bob");
        let out = act(&request, action(&bob, ApprovalDecision::Assigned)).unwrap();
        let grant = out.grant.unwrap();
        assert_eq!(grant.valid_until, request.valid_until);
        assert!(!grant.commands_apply);
    }

    #[test]
    fn repeated_action_is_already_acted_and_changes_nothing() {
        let bob = FoldedName::new("bob");
        let after = act(&two_level_request(), action(&bob, ApprovalDecision::Assigned))
            .unwrap()
            .request;
        for _ in 0..2 {
            let err = act(&after, action(&bob, ApprovalDecision::Assigned)).unwrap_err();
            assert_eq!(err.conflict(), Some(ConflictReason::AlreadyActed));
        }
    }

    #[test]
    fn peer_of_a_decided_level_observes_already_acted() {
        let bob = FoldedName::new("bob");
        let carol = FoldedName::new("carol");
        let after = act(&two_level_request(), action(&bob, ApprovalDecision::Assigned))
            .unwrap()
            .request;
        let err = act(&after, action(&carol, ApprovalDecision::Assigned)).unwrap_err();
        assert_eq!(err.conflict(), Some(ConflictReason::AlreadyActed));
    }

    #[test]
    fn outsiders_and_future_levels_are_not_approvers() {
        let eve = FoldedName::new("eve");
        let dave = FoldedName::new("dave");
        let request = two_level_request();
        let err = act(&request, action(&eve, ApprovalDecision::Assigned)).unwrap_err();
        assert_eq!(err.conflict(), Some(ConflictReason::NotAnApprover));
        let err = act(&request, action(&dave, ApprovalDecision::Assigned)).unwrap_err();
        assert_eq!(err.conflict(), Some(ConflictReason::NotAnApprover));
    }

    #[test]
    fn denial_race_loser_observes_already_acted() {
        let bob = FoldedName::new("bob");
        let carol = FoldedName::new("carol");
        let dave = FoldedName::new("dave");
        let denied = act(&two_level_request(), action(&carol, ApprovalDecision::Denied))
            .unwrap()
            .request;
        let err = act(&denied, action(&bob, ApprovalDecision::Assigned)).unwrap_err();
        assert_eq!(err.conflict(), Some(ConflictReason::AlreadyActed));
        // Level 2 was closed by the cascade, not by anyone acting on it.
        let err = act(&denied, action(&dave, ApprovalDecision::Assigned)).unwrap_err();
        assert_eq!(err.conflict(), Some(ConflictReason::NoPendingLevel));
    }

    #[test]
    fn terminal_request_has_no_pending_level() {
        let eve = FoldedName::new("eve");
        let mut request = two_level_request();
        request.status = RequestStatus::Cancelled;
        let err = act(&request, action(&eve, ApprovalDecision::Assigned)).unwrap_err();
        assert_eq!(err.conflict(), Some(ConflictReason::NoPendingLevel));
    }

    #[test]
    fn end_date_before_start_is_rejected() {
        let mut request = two_level_request();
        request.approval_levels.truncate(1);
        let bob = FoldedName::new("bob");
        let mut a = action(&bob, ApprovalDecision::Assigned);
        a.end_date = Some(t0() - Duration::hours(1));
        let err = act(&request, a).unwrap_err();
        assert!(matches!(err, BastionError::Validation { field: "end_date", .. }));
    }

    #[test]
    fn end_date_on_an_earlier_level_is_ignored() {
        let bob = FoldedName::new("bob");
        let dave = FoldedName::new("dave");
        let mut early = action(&bob, ApprovalDecision::Assigned);
        early.end_date = Some(t0() - Duration::hours(1));
        let first = act(&two_level_request(), early).unwrap();
        assert_eq!(first.request.approval_levels[0].status, LevelStatus::Assigned);

        let second = act(&first.request, action(&dave, ApprovalDecision::Assigned)).unwrap();
        assert_eq!(second.grant.unwrap().valid_until, t0() + Duration::days(1));

        let mut stray = action(&dave, ApprovalDecision::Denied);
        stray.end_date = Some(t0() - Duration::hours(1));
        let denied = act(&first.request, stray).unwrap();
        assert_eq!(denied.request.status, RequestStatus::Denied);
    }

    #[test]
    fn level_status_never_regresses() {
        let bob = FoldedName::new("bob");
        let dave = FoldedName::new("dave");
        let mut states = vec![two_level_request()];
        let first = act(&states[0], action(&bob, ApprovalDecision::Assigned)).unwrap();
        states.push(first.request.clone());
        states.push(act(&first.request, action(&dave, ApprovalDecision::Denied)).unwrap().request);

        for pair in states.windows(2) {
            for (before, after) in pair[0].approval_levels.iter().zip(&pair[1].approval_levels) {
                assert!(after.status >= before.status, "{before:?} -> {after:?}");
            }
        }
    }

    #[test]
    fn cancel_only_from_pending() {
        let cancelled = cancel(&two_level_request()).unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);
        let err = cancel(&cancelled).unwrap_err();
        assert_eq!(err.conflict(), Some(ConflictReason::AlreadyTerminal));
    }
}
