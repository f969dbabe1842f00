pub mod capability;
pub mod decision;
pub mod inventory;
pub mod prefix;
mod scope;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::audit::{ActionType, Actor, AuditEvent, AuditSink, Module, Notification, NotificationKind};
use crate::engine::Backends;
use crate::error::BastionError;
use crate::exec::{CommandInvocation, Evaluated, Proposed};
use crate::model::{AccessGrant, CommandScope, FoldedName};
use crate::store::{GrantStore, HostDirectory, PolicyStore};
use crate::tickets::{self, ChangeTicketResolver, TaskIndex, TicketSnapshot};
use crate::time::Clock;

use capability::ExecutionToken;
use decision::{AuthorizationDecision, DenyReason, ExecutionDecision};
use inventory::{Annotator, Candidate, CommandInventory, Layer};
use scope::ScopeResolver;

/// Where the subject stands on a host for one command, before the
/// blacklist is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Standing {
    Authorized,
    Blocked,
    Excluded,
    Unauthorized,
}

/// Decides whether subjects may run commands on hosts, and what they may
/// see. Pure reads over policy and grant state; every decision is audited.
pub struct Authorizer {
    policy: Arc<dyn PolicyStore>,
    grants: Arc<dyn GrantStore>,
    hosts: Arc<dyn HostDirectory>,
    tickets: Arc<dyn ChangeTicketResolver>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    ticket_timeout: Duration,
}

fn require<'a>(field: &'static str, value: &'a str) -> Result<&'a str, BastionError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(BastionError::validation(field, "must not be empty"));
    }
    Ok(value)
}

impl Authorizer {
    pub fn new(backends: &Backends, ticket_timeout: Duration) -> Self {
        Self {
            policy: backends.policy.clone(),
            grants: backends.grants.clone(),
            hosts: backends.hosts.clone(),
            tickets: backends.tickets.clone(),
            audit: backends.audit.clone(),
            clock: backends.clock.clone(),
            ticket_timeout,
        }
    }

    /// Invocation-time check of one command on one host.
    ///
    /// Priority: blacklist (dominates any grant), then a blocked grant, then
    /// a granted group's exclusion, then missing authorization. Store
    /// failures deny rather than allow. A line chained with shell operators
    /// is allowed only when every segment is.
    pub async fn quick_authorize(
        &self,
        actor: &Actor,
        host: &str,
        command: &str,
    ) -> Result<AuthorizationDecision, BastionError> {
        require("subject", actor.subject.as_str())?;
        let host = FoldedName::new(require("host", host)?);
        let command = require("command", command)?;

        let decision = self.decide(&actor.subject, &host, command).await;
        self.report(actor, &host, command, &decision, ActionType::Authorize);
        Ok(decision)
    }

    /// Authorize a proposed invocation into an executable one.
    ///
    /// While enforcement is suspended for the host, a deny that is not a
    /// blacklist hit is overridden and the token records the override.
    pub async fn evaluate(
        &self,
        actor: &Actor,
        proposal: CommandInvocation<Proposed>,
    ) -> Result<(CommandInvocation<Evaluated>, ExecutionDecision), BastionError> {
        require("subject", actor.subject.as_str())?;
        require("host", proposal.host.as_str())?;
        require("command", &proposal.command)?;

        let mut decision = self
            .decide(&actor.subject, &proposal.host, &proposal.command)
            .await;
        let mut suspended_override = false;
        if !decision.allowed && !decision.blacklisted {
            let suspended = self
                .policy
                .is_enforcement_suspended(&proposal.host, self.clock.now())
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(host = %proposal.host, error = %e, "suspension check failed; enforcing");
                    false
                });
            if suspended {
                tracing::warn!(
                    subject = %actor.subject,
                    host = %proposal.host,
                    reason = %decision.reason_text(),
                    "enforcement suspended; overriding deny"
                );
                decision = AuthorizationDecision::allow(&decision.prefix);
                suspended_override = true;
            }
        }
        self.report(
            actor,
            &proposal.host,
            &proposal.command,
            &decision,
            ActionType::Execute,
        );

        let evaluated = proposal.transition();
        let outcome = if decision.allowed {
            ExecutionDecision::Allow(ExecutionToken::new(
                evaluated.host.clone(),
                evaluated.command.clone(),
                suspended_override,
            ))
        } else {
            ExecutionDecision::Deny(decision)
        };
        Ok((evaluated, outcome))
    }

    /// Every simple command in a chained line has to pass on its own. A
    /// blacklisted segment wins over any other deny so it is never
    /// overridden by an enforcement suspension.
    async fn decide(
        &self,
        subject: &FoldedName,
        host: &FoldedName,
        command: &str,
    ) -> AuthorizationDecision {
        let segments = prefix::command_segments(command);
        let Some(first) = segments.first() else {
            return AuthorizationDecision::deny("", false, DenyReason::Unauthorized);
        };
        if segments.len() > 1 {
            tracing::debug!(%subject, %host, segments = segments.len(), "chained command line");
        }

        let mut denied: Option<AuthorizationDecision> = None;
        for segment in &segments {
            let decision = self.decide_segment(subject, host, segment).await;
            if decision.blacklisted {
                return decision;
            }
            if !decision.allowed && denied.is_none() {
                denied = Some(decision);
            }
        }
        denied.unwrap_or_else(|| AuthorizationDecision::allow(prefix::command_prefix(first)))
    }

    async fn decide_segment(
        &self,
        subject: &FoldedName,
        host: &FoldedName,
        command: &str,
    ) -> AuthorizationDecision {
        let prefix = prefix::command_prefix(command);
        let blacklisted = match self.policy.is_blacklisted(prefix).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(error = %e, "blacklist unavailable; failing closed");
                return AuthorizationDecision::deny(prefix, false, DenyReason::PolicyUnavailable);
            }
        };
        let standing = match self.standing(subject, host, command).await {
            Ok(standing) => standing,
            Err(e) => {
                tracing::warn!(%subject, %host, error = %e, "grant data unavailable; failing closed");
                let reason = if blacklisted {
                    DenyReason::BlacklistedUnauthorized
                } else {
                    DenyReason::PolicyUnavailable
                };
                return AuthorizationDecision::deny(prefix, blacklisted, reason);
            }
        };

        match (blacklisted, standing) {
            (true, Standing::Authorized) => {
                AuthorizationDecision::deny(prefix, true, DenyReason::Blacklisted)
            }
            (true, _) => {
                AuthorizationDecision::deny(prefix, true, DenyReason::BlacklistedUnauthorized)
            }
            (false, Standing::Blocked) => {
                AuthorizationDecision::deny(prefix, false, DenyReason::Blocked)
            }
            (false, Standing::Excluded) => {
                AuthorizationDecision::deny(prefix, false, DenyReason::Excluded)
            }
            (false, Standing::Unauthorized) => {
                AuthorizationDecision::deny(prefix, false, DenyReason::Unauthorized)
            }
            (false, Standing::Authorized) => AuthorizationDecision::allow(prefix),
        }
    }

    /// Union of hosts and command scopes over the subject's unblocked active
    /// grants, less the exclusions those grants pull in.
    async fn standing(
        &self,
        subject: &FoldedName,
        host: &FoldedName,
        command: &str,
    ) -> Result<Standing, BastionError> {
        let now = self.clock.now();
        let grants = self.grants.active_grants_for(subject, now).await?;
        let mut resolver = ScopeResolver::load(self.policy.as_ref(), self.hosts.as_ref()).await?;

        let mut host_match = false;
        let mut included: Vec<String> = Vec::new();
        let mut excluded: Vec<String> = Vec::new();
        for grant in &grants {
            let covers = resolver.covers(&grant.server_scope, host).await?;
            if grant.blocked {
                if covers {
                    return Ok(Standing::Blocked);
                }
                continue;
            }
            host_match |= covers;
            if !grant.commands_apply {
                continue;
            }
            match &grant.command_scope {
                CommandScope::Groups(ids) => {
                    for group in ids.iter().filter_map(|id| resolver.group(id)) {
                        included.extend(group.included_commands.iter().map(|c| c.text.clone()));
                        excluded.extend(group.excluded_commands.iter().map(|c| c.text.clone()));
                    }
                }
                CommandScope::Commands(texts) => {
                    for text in texts.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
                        match resolver.classify(text) {
                            (_, Some(_)) => excluded.push(text.to_owned()),
                            _ => included.push(text.to_owned()),
                        }
                    }
                }
            }
        }

        if !host_match {
            return Ok(Standing::Unauthorized);
        }
        if excluded
            .iter()
            .any(|e| prefix::matches_at_boundary(command, e))
        {
            return Ok(Standing::Excluded);
        }
        let prefix = prefix::command_prefix(command);
        if included
            .iter()
            .any(|c| prefix::matches_at_boundary(c, prefix))
        {
            Ok(Standing::Authorized)
        } else {
            Ok(Standing::Unauthorized)
        }
    }

    fn report(
        &self,
        actor: &Actor,
        host: &FoldedName,
        command: &str,
        decision: &AuthorizationDecision,
        action: ActionType,
    ) {
        let outcome = decision.reason_text();
        if decision.allowed {
            tracing::info!(subject = %actor.subject, %host, prefix = %decision.prefix, "command allowed");
        } else {
            tracing::warn!(subject = %actor.subject, %host, prefix = %decision.prefix, reason = %outcome, "command denied");
        }
        self.audit.record(
            AuditEvent::new(actor, action, Module::Cli, outcome.clone())
                .command(command)
                .host(host),
        );
        if !decision.allowed {
            let kind = if decision.blacklisted {
                NotificationKind::BlacklistHit
            } else {
                NotificationKind::CommandDenied
            };
            self.audit.notify(Notification {
                subject: actor.subject.clone(),
                kind,
                message: format!("{command} on {host}: {outcome}"),
                command: Some(command.to_owned()),
            });
        }
    }

    /// Everything the subject may reason about on `host`, annotated.
    ///
    /// Grant and ticket outages degrade the result and are flagged on it;
    /// policy store failures propagate.
    pub async fn resolve_inventory(
        &self,
        actor: &Actor,
        host: &str,
    ) -> Result<CommandInventory, BastionError> {
        let subject = FoldedName::new(require("subject", actor.subject.as_str())?);
        let host = FoldedName::new(require("host", host)?);
        let now = self.clock.now();

        let mut resolver = ScopeResolver::load(self.policy.as_ref(), self.hosts.as_ref()).await?;

        let mut grant_data_unavailable = false;
        let grants = match self.grants.active_grants_for(&subject, now).await {
            Ok(grants) => grants,
            Err(BastionError::Unavailable(e)) => {
                tracing::warn!(%subject, error = %e, "grant store unavailable; default layer only");
                grant_data_unavailable = true;
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        let mut covering: Vec<AccessGrant> = Vec::new();
        for grant in grants {
            if resolver.covers(&grant.server_scope, &host).await? {
                covering.push(grant);
            }
        }
        covering.sort_by(|a, b| b.valid_until.cmp(&a.valid_until));
        let subject_blocked = covering.iter().any(|g| g.blocked);

        let host_record = self.hosts.host(&host).await.unwrap_or_else(|e| {
            tracing::warn!(%host, error = %e, "host lookup failed");
            None
        });
        let environment = host_record.as_ref().and_then(|h| h.environment.clone());
        let external_id = match self.hosts.subject_external_id(&subject).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(%subject, error = %e, "external id lookup failed");
                None
            }
        }
        .unwrap_or_else(|| subject.to_string());
        let snapshot = match host_record.as_ref().and_then(|h| h.config_item.as_deref()) {
            Some(ci) => {
                tickets::fetch_bounded(self.tickets.as_ref(), ci, &external_id, self.ticket_timeout)
                    .await
            }
            None => TicketSnapshot::default(),
        };

        let mut ticket_data_unavailable = snapshot.errored();
        let index = {
            let group_names = resolver.groups().iter().map(|g| &g.name);
            let group_texts = resolver.groups().iter().flat_map(|g| {
                g.included_commands
                    .iter()
                    .chain(g.excluded_commands.iter())
                    .map(|c| c.text.as_str())
            });
            let explicit_texts = covering.iter().flat_map(|g| match &g.command_scope {
                CommandScope::Commands(texts) => texts.iter().map(String::as_str).collect::<Vec<_>>(),
                CommandScope::Groups(_) => Vec::new(),
            });
            TaskIndex::build(
                &snapshot,
                &subject,
                &external_id,
                group_names,
                group_texts.chain(explicit_texts),
            )
        }
        .unwrap_or_else(|e| {
            tracing::warn!(%subject, %host, error = %e, "ticket matching failed");
            ticket_data_unavailable = true;
            TaskIndex::default()
        });

        let annotator = Annotator {
            index: &index,
            ticket_errored: snapshot.errored(),
            environment: environment.as_deref(),
            subject_blocked,
            now,
        };

        let mut grant_layer = Layer::default();
        for grant in covering.iter().filter(|g| g.commands_apply) {
            for candidate in grant_candidates(&resolver, grant) {
                let candidate = expand(&mut resolver, candidate).await?;
                grant_layer.push(annotator.grant_entry(candidate, grant.valid_until));
            }
        }

        let mut default_layer = Layer::default();
        let defaults: Vec<Candidate> = resolver
            .groups()
            .iter()
            .flat_map(Candidate::from_group)
            .collect();
        for candidate in defaults {
            let candidate = expand(&mut resolver, candidate).await?;
            default_layer.push(annotator.default_entry(candidate));
        }

        let enforcement_suspended = self.policy.is_enforcement_suspended(&host, now).await?;
        let blacklist = self.policy.blacklist().await?.commands;

        let entries = inventory::merge(grant_layer, default_layer);
        tracing::debug!(
            %subject,
            %host,
            entries = entries.len(),
            subject_blocked,
            ticket_data_unavailable,
            grant_data_unavailable,
            "inventory resolved"
        );
        Ok(CommandInventory {
            subject,
            host,
            entries,
            enforcement_suspended,
            blacklist,
            ticket_data_unavailable,
            grant_data_unavailable,
        })
    }

    /// Current time as the authorizer sees it.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn grant_candidates(resolver: &ScopeResolver<'_>, grant: &AccessGrant) -> Vec<Candidate> {
    match &grant.command_scope {
        CommandScope::Groups(ids) => ids
            .iter()
            .filter_map(|id| resolver.group(id))
            .flat_map(Candidate::from_group)
            .collect(),
        CommandScope::Commands(texts) => texts
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(|text| {
                let (including, excluding) = resolver.classify(text);
                Candidate::explicit(text, including, excluding)
            })
            .collect(),
    }
}

async fn expand(
    resolver: &mut ScopeResolver<'_>,
    mut candidate: Candidate,
) -> Result<Candidate, BastionError> {
    if !candidate.entry.directory_group_refs.is_empty() {
        candidate.entry = resolver.expand_directories(&candidate.entry).await?;
    }
    Ok(candidate)
}
