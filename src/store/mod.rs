pub mod memory;
pub mod seed;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::enforcement::prefix;
use crate::error::BastionError;
use crate::model::{
    AccessGrant, Blacklist, CommandPolicyGroup, DirectoryGroupId, FoldedName, GlobalPolicyConfig,
    GrantId, GroupId, HostRecord, Request, RequestId, ServerExceptionWindow, ServerGroup,
    ServerGroupId, WindowId,
};

pub use memory::MemoryStore;

/// Read side of policy state. Pure reads; a failing backend reports
/// `BastionError::Unavailable`, never a policy answer.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Non-deleted command groups.
    async fn active_command_groups(&self) -> Result<Vec<CommandPolicyGroup>, BastionError>;

    async fn blacklist(&self) -> Result<Blacklist, BastionError>;

    async fn global_config(&self) -> Result<GlobalPolicyConfig, BastionError>;

    async fn exception_windows(&self) -> Result<Vec<ServerExceptionWindow>, BastionError>;

    async fn directory_directories(
        &self,
        id: &DirectoryGroupId,
    ) -> Result<Vec<String>, BastionError>;

    async fn is_blacklisted(&self, command_prefix: &str) -> Result<bool, BastionError> {
        let blacklist = self.blacklist().await?;
        Ok(prefix::blacklist_matches(&blacklist, command_prefix))
    }

    /// True when enforcement is globally off or an active exception window
    /// covers `host`.
    async fn is_enforcement_suspended(
        &self,
        host: &FoldedName,
        now: DateTime<Utc>,
    ) -> Result<bool, BastionError> {
        if !self.global_config().await?.cli_enforcement_enabled {
            return Ok(true);
        }
        let windows = self.exception_windows().await?;
        Ok(windows.iter().any(|w| w.is_active(host, now)))
    }

    /// Flatten directory-group references into directories, preserving
    /// first-seen order without duplicates. Unknown references resolve to nothing.
    async fn resolve_directory_groups(
        &self,
        refs: &[DirectoryGroupId],
    ) -> Result<Vec<String>, BastionError> {
        let mut out: Vec<String> = Vec::new();
        for id in refs {
            for dir in self.directory_directories(id).await? {
                if !out.contains(&dir) {
                    out.push(dir);
                }
            }
        }
        Ok(out)
    }
}

/// Administrative writes against policy collections.
#[async_trait]
pub trait PolicyAdminStore: PolicyStore {
    async fn command_group(&self, id: &GroupId) -> Result<CommandPolicyGroup, BastionError>;

    /// Inserts or replaces. Rejects a name already held by another
    /// non-deleted group with `ConflictReason::DuplicateName`.
    async fn put_command_group(&self, group: CommandPolicyGroup) -> Result<(), BastionError>;

    async fn set_blacklist(&self, blacklist: Blacklist) -> Result<(), BastionError>;

    /// Append `command` in one atomic read-modify-write. Returns the list
    /// before and after, or `None` when it was already listed.
    async fn add_blacklist_entry(
        &self,
        command: &str,
    ) -> Result<Option<(Blacklist, Blacklist)>, BastionError>;

    /// Remove `command` in one atomic read-modify-write. Returns the list
    /// before and after, or `None` when it was not listed.
    async fn remove_blacklist_entry(
        &self,
        command: &str,
    ) -> Result<Option<(Blacklist, Blacklist)>, BastionError>;

    async fn put_exception_window(&self, window: ServerExceptionWindow)
    -> Result<(), BastionError>;

    async fn exception_window(&self, id: &WindowId) -> Result<ServerExceptionWindow, BastionError>;

    async fn set_global_config(&self, config: GlobalPolicyConfig) -> Result<(), BastionError>;
}

#[async_trait]
pub trait GrantStore: Send + Sync {
    /// Non-deleted grants naming `subject` whose window contains `now`.
    async fn active_grants_for(
        &self,
        subject: &FoldedName,
        now: DateTime<Utc>,
    ) -> Result<Vec<AccessGrant>, BastionError>;

    async fn grant(&self, id: &GrantId) -> Result<AccessGrant, BastionError>;

    async fn list_grants(&self) -> Result<Vec<AccessGrant>, BastionError>;

    async fn insert_grant(&self, grant: AccessGrant) -> Result<(), BastionError>;

    async fn update_grant(&self, grant: AccessGrant) -> Result<(), BastionError>;
}

/// A request state change plus the grant it materializes, committed as one
/// unit or not at all.
#[derive(Debug, Clone)]
pub struct RequestTransition {
    pub request: Request,
    /// Version the transition was computed against.
    pub expected_version: u64,
    pub grant: Option<AccessGrant>,
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn request(&self, id: &RequestId) -> Result<Request, BastionError>;

    async fn list_requests(&self) -> Result<Vec<Request>, BastionError>;

    async fn insert_request(&self, request: Request) -> Result<(), BastionError>;

    /// Compare-and-swap on `expected_version`. A mismatch fails with
    /// `ConflictReason::StaleVersion` and changes nothing.
    async fn commit_transition(&self, transition: RequestTransition) -> Result<(), BastionError>;
}

/// Host inventory, server groups, and identity lookups.
#[async_trait]
pub trait HostDirectory: Send + Sync {
    async fn host(&self, name: &FoldedName) -> Result<Option<HostRecord>, BastionError>;

    async fn server_group(&self, id: &ServerGroupId) -> Result<ServerGroup, BastionError>;

    /// Members of an approver (directory) group; unknown groups have none.
    async fn approver_group_members(&self, group: &str) -> Result<Vec<FoldedName>, BastionError>;

    /// Identity the ticket system uses for `subject`, if mapped.
    async fn subject_external_id(
        &self,
        subject: &FoldedName,
    ) -> Result<Option<String>, BastionError>;
}
