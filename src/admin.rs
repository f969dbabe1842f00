use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::audit::{ActionType, Actor, AuditEvent, AuditSink, Module};
use crate::engine::Backends;
use crate::error::BastionError;
use crate::model::{
    AccessGrant, CommandPolicyGroup, FoldedName, GlobalPolicyConfig, GrantId, GroupId,
    ServerExceptionWindow, WindowId,
};
use crate::store::{GrantStore, PolicyAdminStore};
use crate::time::ValidityWindow;

/// Administrative writes over groups, grants, the blacklist, exception
/// windows, and the enforcement toggle. Every mutation is audited with a
/// before/after diff. Nothing is physically deleted.
pub struct PolicyAdmin {
    policy: Arc<dyn PolicyAdminStore>,
    grants: Arc<dyn GrantStore>,
    audit: Arc<dyn AuditSink>,
}

fn validate_group(group: &CommandPolicyGroup) -> Result<(), BastionError> {
    if group.name.is_empty() {
        return Err(BastionError::validation("name", "must not be empty"));
    }
    let texts = group
        .included_commands
        .iter()
        .chain(group.excluded_commands.iter());
    for entry in texts {
        if entry.text.trim().is_empty() {
            return Err(BastionError::validation(
                "commands",
                format!("group {} has an empty command", group.name),
            ));
        }
    }
    Ok(())
}

impl PolicyAdmin {
    pub fn new(backends: &Backends) -> Self {
        Self {
            policy: backends.policy_admin.clone(),
            grants: backends.grants.clone(),
            audit: backends.audit.clone(),
        }
    }

    fn record<T: serde::Serialize>(
        &self,
        actor: &Actor,
        action: ActionType,
        module: Module,
        before: Option<&T>,
        after: Option<&T>,
    ) {
        self.audit
            .record(AuditEvent::new(actor, action, module, "ok").change(before, after));
    }

    /// Store a new group under a fresh id. Names are unique among live groups.
    pub async fn create_group(
        &self,
        actor: &Actor,
        mut group: CommandPolicyGroup,
    ) -> Result<CommandPolicyGroup, BastionError> {
        validate_group(&group)?;
        group.id = GroupId::generate();
        group.deleted = false;
        self.policy.put_command_group(group.clone()).await?;
        tracing::info!(group = %group.name, id = %group.id, "command group created");
        self.record(actor, ActionType::CreateGroup, Module::Policy, None, Some(&group));
        Ok(group)
    }

    pub async fn update_group(
        &self,
        actor: &Actor,
        group: CommandPolicyGroup,
    ) -> Result<CommandPolicyGroup, BastionError> {
        validate_group(&group)?;
        let before = self.policy.command_group(&group.id).await?;
        self.policy.put_command_group(group.clone()).await?;
        self.record(
            actor,
            ActionType::UpdateGroup,
            Module::Policy,
            Some(&before),
            Some(&group),
        );
        Ok(group)
    }

    pub async fn delete_group(&self, actor: &Actor, id: &GroupId) -> Result<(), BastionError> {
        let before = self.policy.command_group(id).await?;
        let mut after = before.clone();
        after.deleted = true;
        self.policy.put_command_group(after.clone()).await?;
        tracing::info!(group = %before.name, "command group deleted");
        self.record(
            actor,
            ActionType::DeleteGroup,
            Module::Policy,
            Some(&before),
            Some(&after),
        );
        Ok(())
    }

    /// Grant issued directly, outside the approval workflow.
    pub async fn create_grant(
        &self,
        actor: &Actor,
        mut grant: AccessGrant,
    ) -> Result<AccessGrant, BastionError> {
        grant.id = GrantId::generate();
        grant.deleted = false;
        grant.validate()?;
        self.grants.insert_grant(grant.clone()).await?;
        tracing::info!(grant = %grant.id, subjects = grant.subjects.len(), "grant created");
        self.record(actor, ActionType::CreateGrant, Module::Grants, None, Some(&grant));
        Ok(grant)
    }

    pub async fn update_grant(
        &self,
        actor: &Actor,
        grant: AccessGrant,
    ) -> Result<AccessGrant, BastionError> {
        grant.validate()?;
        let before = self.grants.grant(&grant.id).await?;
        self.grants.update_grant(grant.clone()).await?;
        self.record(
            actor,
            ActionType::UpdateGrant,
            Module::Grants,
            Some(&before),
            Some(&grant),
        );
        Ok(grant)
    }

    pub async fn delete_grant(&self, actor: &Actor, id: &GrantId) -> Result<(), BastionError> {
        let before = self.grants.grant(id).await?;
        let mut after = before.clone();
        after.deleted = true;
        self.grants.update_grant(after.clone()).await?;
        tracing::info!(grant = %id, "grant deleted");
        self.record(
            actor,
            ActionType::DeleteGrant,
            Module::Grants,
            Some(&before),
            Some(&after),
        );
        Ok(())
    }

    /// Returns false when the command was already listed.
    pub async fn blacklist_command(&self, actor: &Actor, command: &str) -> Result<bool, BastionError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(BastionError::validation("command", "must not be empty"));
        }
        let Some((before, after)) = self.policy.add_blacklist_entry(command).await? else {
            return Ok(false);
        };
        tracing::info!(command, "blacklisted");
        self.record(
            actor,
            ActionType::UpdateBlacklist,
            Module::Policy,
            Some(&before),
            Some(&after),
        );
        Ok(true)
    }

    pub async fn unblacklist_command(&self, actor: &Actor, command: &str) -> Result<(), BastionError> {
        let command = command.trim();
        let Some((before, after)) = self.policy.remove_blacklist_entry(command).await? else {
            return Err(BastionError::not_found("blacklist entry", command));
        };
        tracing::info!(command, "removed from blacklist");
        self.record(
            actor,
            ActionType::UpdateBlacklist,
            Module::Policy,
            Some(&before),
            Some(&after),
        );
        Ok(())
    }

    /// Suspend enforcement on one host for `[start, end]`.
    pub async fn add_exception_window(
        &self,
        actor: &Actor,
        server: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ServerExceptionWindow, BastionError> {
        let server = FoldedName::new(server);
        if server.is_empty() {
            return Err(BastionError::validation("server", "must not be empty"));
        }
        if !ValidityWindow::new(start, end).is_well_formed() {
            return Err(BastionError::validation(
                "end_date",
                "must be later than start_date",
            ));
        }
        let window = ServerExceptionWindow {
            id: WindowId::generate(),
            server,
            start_date: start,
            end_date: end,
            deleted: false,
        };
        self.policy.put_exception_window(window.clone()).await?;
        tracing::warn!(host = %window.server, %start, %end, "enforcement exception window added");
        self.record(
            actor,
            ActionType::PutExceptionWindow,
            Module::Policy,
            None,
            Some(&window),
        );
        Ok(window)
    }

    pub async fn remove_exception_window(
        &self,
        actor: &Actor,
        id: &WindowId,
    ) -> Result<(), BastionError> {
        let before = self.policy.exception_window(id).await?;
        let mut after = before.clone();
        after.deleted = true;
        self.policy.put_exception_window(after.clone()).await?;
        self.record(
            actor,
            ActionType::DeleteExceptionWindow,
            Module::Policy,
            Some(&before),
            Some(&after),
        );
        Ok(())
    }

    pub async fn set_enforcement(&self, actor: &Actor, enabled: bool) -> Result<(), BastionError> {
        let before = self.policy.global_config().await?;
        let after = GlobalPolicyConfig {
            cli_enforcement_enabled: enabled,
        };
        self.policy.set_global_config(after).await?;
        if enabled {
            tracing::info!("command enforcement enabled");
        } else {
            tracing::warn!("command enforcement disabled globally");
        }
        self.record(
            actor,
            ActionType::SetEnforcement,
            Module::Policy,
            Some(&before),
            Some(&after),
        );
        Ok(())
    }
}
