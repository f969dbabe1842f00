use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    GrantStore, HostDirectory, PolicyAdminStore, PolicyStore, RequestStore, RequestTransition,
};
use crate::error::{BastionError, ConflictReason};
use crate::model::{
    AccessGrant, ApproverGroup, Blacklist, CommandPolicyGroup, CommandScope, DirectoryGroup,
    DirectoryGroupId, FoldedName, GlobalPolicyConfig, GrantId, GroupId, HostRecord, Request,
    RequestId, ServerExceptionWindow, ServerGroup, ServerGroupId, ServerScope, SubjectRecord,
    WindowId,
};
use crate::protect::{FieldProtector, PassthroughProtector, protect_value, reveal_value};

/// Grant as held at rest: subject names and flag fields are protected strings.
#[derive(Debug, Clone)]
struct StoredGrant {
    id: GrantId,
    subjects: Vec<String>,
    blocked: String,
    server_scope: ServerScope,
    commands_apply: String,
    command_scope: CommandScope,
    valid_from: DateTime<Utc>,
    valid_until: DateTime<Utc>,
    request_number: Option<String>,
    deleted: bool,
}

impl StoredGrant {
    fn protect(grant: &AccessGrant, p: &dyn FieldProtector) -> Result<Self, BastionError> {
        Ok(Self {
            id: grant.id.clone(),
            subjects: grant
                .subjects
                .iter()
                .map(|s| p.protect(s.as_str()))
                .collect::<Result<_, _>>()?,
            blocked: protect_value(p, &grant.blocked)?,
            server_scope: grant.server_scope.clone(),
            commands_apply: protect_value(p, &grant.commands_apply)?,
            command_scope: grant.command_scope.clone(),
            valid_from: grant.valid_from,
            valid_until: grant.valid_until,
            request_number: grant.request_number.clone(),
            deleted: grant.deleted,
        })
    }

    fn reveal(&self, p: &dyn FieldProtector) -> Result<AccessGrant, BastionError> {
        Ok(AccessGrant {
            id: self.id.clone(),
            subjects: self
                .subjects
                .iter()
                .map(|s| p.reveal(s).map(|plain| FoldedName::new(&plain)))
                .collect::<Result<_, _>>()?,
            blocked: reveal_value(p, &self.blocked)?,
            server_scope: self.server_scope.clone(),
            commands_apply: reveal_value(p, &self.commands_apply)?,
            command_scope: self.command_scope.clone(),
            valid_from: self.valid_from,
            valid_until: self.valid_until,
            request_number: self.request_number.clone(),
            deleted: self.deleted,
        })
    }
}

#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) groups: BTreeMap<GroupId, CommandPolicyGroup>,
    pub(crate) directory_groups: HashMap<DirectoryGroupId, DirectoryGroup>,
    pub(crate) blacklist: Blacklist,
    pub(crate) windows: BTreeMap<WindowId, ServerExceptionWindow>,
    pub(crate) global: GlobalPolicyConfig,
    pub(crate) server_groups: HashMap<ServerGroupId, ServerGroup>,
    pub(crate) hosts: HashMap<FoldedName, HostRecord>,
    pub(crate) approver_groups: HashMap<FoldedName, ApproverGroup>,
    pub(crate) subjects: HashMap<FoldedName, SubjectRecord>,
    grants: BTreeMap<GrantId, StoredGrant>,
    requests: BTreeMap<RequestId, Request>,
}

/// Process-local record store behind every store trait.
///
/// One `RwLock` guards all collections, so a request transition and the
/// grant it materializes land together.
pub struct MemoryStore {
    state: RwLock<State>,
    protector: Arc<dyn FieldProtector>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(PassthroughProtector))
    }
}

impl MemoryStore {
    pub fn new(protector: Arc<dyn FieldProtector>) -> Self {
        Self {
            state: RwLock::new(State::default()),
            protector,
        }
    }

    pub(crate) async fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.write().await;
        f(&mut state)
    }

    /// Seed or replace inventory facts. Used by the policy file loader and tests.
    pub async fn put_host(&self, host: HostRecord) {
        self.with_state(|s| {
            s.hosts.insert(host.name.clone(), host);
        })
        .await;
    }

    pub async fn put_server_group(&self, group: ServerGroup) {
        self.with_state(|s| {
            s.server_groups.insert(group.id.clone(), group);
        })
        .await;
    }

    pub async fn put_directory_group(&self, group: DirectoryGroup) {
        self.with_state(|s| {
            s.directory_groups.insert(group.id.clone(), group);
        })
        .await;
    }

    pub async fn put_approver_group(&self, group: ApproverGroup) {
        self.with_state(|s| {
            s.approver_groups.insert(group.name.clone(), group);
        })
        .await;
    }

    pub async fn put_subject(&self, subject: SubjectRecord) {
        self.with_state(|s| {
            s.subjects.insert(subject.username.clone(), subject);
        })
        .await;
    }

    fn reveal_all(&self, state: &State) -> Result<Vec<AccessGrant>, BastionError> {
        state
            .grants
            .values()
            .map(|g| g.reveal(self.protector.as_ref()))
            .collect()
    }
}

fn duplicate_name(state: &State, group: &CommandPolicyGroup) -> bool {
    state
        .groups
        .values()
        .any(|g| g.id != group.id && !g.deleted && g.name == group.name)
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn active_command_groups(&self) -> Result<Vec<CommandPolicyGroup>, BastionError> {
        let state = self.state.read().await;
        Ok(state.groups.values().filter(|g| !g.deleted).cloned().collect())
    }

    async fn blacklist(&self) -> Result<Blacklist, BastionError> {
        Ok(self.state.read().await.blacklist.clone())
    }

    async fn global_config(&self) -> Result<GlobalPolicyConfig, BastionError> {
        Ok(self.state.read().await.global)
    }

    async fn exception_windows(&self) -> Result<Vec<ServerExceptionWindow>, BastionError> {
        Ok(self.state.read().await.windows.values().cloned().collect())
    }

    async fn directory_directories(
        &self,
        id: &DirectoryGroupId,
    ) -> Result<Vec<String>, BastionError> {
        let state = self.state.read().await;
        Ok(state
            .directory_groups
            .get(id)
            .map(|g| g.directories.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl PolicyAdminStore for MemoryStore {
    async fn command_group(&self, id: &GroupId) -> Result<CommandPolicyGroup, BastionError> {
        let state = self.state.read().await;
        state
            .groups
            .get(id)
            .cloned()
            .ok_or_else(|| BastionError::not_found("command group", id))
    }

    async fn put_command_group(&self, group: CommandPolicyGroup) -> Result<(), BastionError> {
        let mut state = self.state.write().await;
        if !group.deleted && duplicate_name(&state, &group) {
            return Err(BastionError::Conflict(ConflictReason::DuplicateName));
        }
        state.groups.insert(group.id.clone(), group);
        Ok(())
    }

    async fn set_blacklist(&self, blacklist: Blacklist) -> Result<(), BastionError> {
        self.state.write().await.blacklist = blacklist;
        Ok(())
    }

    async fn add_blacklist_entry(
        &self,
        command: &str,
    ) -> Result<Option<(Blacklist, Blacklist)>, BastionError> {
        let mut state = self.state.write().await;
        if state.blacklist.commands.iter().any(|c| c == command) {
            return Ok(None);
        }
        let before = state.blacklist.clone();
        state.blacklist.commands.push(command.to_owned());
        Ok(Some((before, state.blacklist.clone())))
    }

    async fn remove_blacklist_entry(
        &self,
        command: &str,
    ) -> Result<Option<(Blacklist, Blacklist)>, BastionError> {
        let mut state = self.state.write().await;
        if !state.blacklist.commands.iter().any(|c| c == command) {
            return Ok(None);
        }
        let before = state.blacklist.clone();
        state.blacklist.commands.retain(|c| c != command);
        Ok(Some((before, state.blacklist.clone())))
    }

    async fn put_exception_window(
        &self,
        window: ServerExceptionWindow,
    ) -> Result<(), BastionError> {
        self.state
            .write()
            .await
            .windows
            .insert(window.id.clone(), window);
        Ok(())
    }

    async fn exception_window(&self, id: &WindowId) -> Result<ServerExceptionWindow, BastionError> {
        let state = self.state.read().await;
        state
            .windows
            .get(id)
            .cloned()
            .ok_or_else(|| BastionError::not_found("exception window", id))
    }

    async fn set_global_config(&self, config: GlobalPolicyConfig) -> Result<(), BastionError> {
        self.state.write().await.global = config;
        Ok(())
    }
}

#[async_trait]
impl GrantStore for MemoryStore {
    async fn active_grants_for(
        &self,
        subject: &FoldedName,
        now: DateTime<Utc>,
    ) -> Result<Vec<AccessGrant>, BastionError> {
        let state = self.state.read().await;
        Ok(self
            .reveal_all(&state)?
            .into_iter()
            .filter(|g| g.is_active(now) && g.names_subject(subject))
            .collect())
    }

    async fn grant(&self, id: &GrantId) -> Result<AccessGrant, BastionError> {
        let state = self.state.read().await;
        state
            .grants
            .get(id)
            .ok_or_else(|| BastionError::not_found("grant", id))?
            .reveal(self.protector.as_ref())
    }

    async fn list_grants(&self) -> Result<Vec<AccessGrant>, BastionError> {
        let state = self.state.read().await;
        self.reveal_all(&state)
    }

    async fn insert_grant(&self, grant: AccessGrant) -> Result<(), BastionError> {
        let stored = StoredGrant::protect(&grant, self.protector.as_ref())?;
        let mut state = self.state.write().await;
        if state.grants.contains_key(&grant.id) {
            return Err(BastionError::Conflict(ConflictReason::DuplicateName));
        }
        state.grants.insert(grant.id, stored);
        Ok(())
    }

    async fn update_grant(&self, grant: AccessGrant) -> Result<(), BastionError> {
        let stored = StoredGrant::protect(&grant, self.protector.as_ref())?;
        let mut state = self.state.write().await;
        match state.grants.get_mut(&grant.id) {
            Some(slot) => {
                *slot = stored;
                Ok(())
            }
            None => Err(BastionError::not_found("grant", &grant.id)),
        }
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn request(&self, id: &RequestId) -> Result<Request, BastionError> {
        let state = self.state.read().await;
        state
            .requests
            .get(id)
            .cloned()
            .ok_or_else(|| BastionError::not_found("request", id))
    }

    async fn list_requests(&self) -> Result<Vec<Request>, BastionError> {
        Ok(self.state.read().await.requests.values().cloned().collect())
    }

    async fn insert_request(&self, request: Request) -> Result<(), BastionError> {
        let mut state = self.state.write().await;
        if state.requests.contains_key(&request.id) {
            return Err(BastionError::Conflict(ConflictReason::DuplicateName));
        }
        state.requests.insert(request.id.clone(), request);
        Ok(())
    }

    async fn commit_transition(&self, transition: RequestTransition) -> Result<(), BastionError> {
        // Protect before taking the lock so a protection failure mutates nothing.
        let stored_grant = transition
            .grant
            .as_ref()
            .map(|g| StoredGrant::protect(g, self.protector.as_ref()))
            .transpose()?;

        let mut state = self.state.write().await;
        let current = state
            .requests
            .get(&transition.request.id)
            .ok_or_else(|| BastionError::not_found("request", &transition.request.id))?;
        if current.version != transition.expected_version {
            return Err(BastionError::Conflict(ConflictReason::StaleVersion));
        }
        if let Some(stored) = stored_grant {
            if state.grants.contains_key(&stored.id) {
                return Err(BastionError::Conflict(ConflictReason::DuplicateName));
            }
            state.grants.insert(stored.id.clone(), stored);
        }
        state
            .requests
            .insert(transition.request.id.clone(), transition.request);
        Ok(())
    }
}

#[async_trait]
impl HostDirectory for MemoryStore {
    async fn host(&self, name: &FoldedName) -> Result<Option<HostRecord>, BastionError> {
        Ok(self.state.read().await.hosts.get(name).cloned())
    }

    async fn server_group(&self, id: &ServerGroupId) -> Result<ServerGroup, BastionError> {
        let state = self.state.read().await;
        state
            .server_groups
            .get(id)
            .cloned()
            .ok_or_else(|| BastionError::not_found("server group", id))
    }

    async fn approver_group_members(&self, group: &str) -> Result<Vec<FoldedName>, BastionError> {
        let state = self.state.read().await;
        Ok(state
            .approver_groups
            .get(&FoldedName::new(group))
            .map(|g| g.members.clone())
            .unwrap_or_default())
    }

    async fn subject_external_id(
        &self,
        subject: &FoldedName,
    ) -> Result<Option<String>, BastionError> {
        let state = self.state.read().await;
        Ok(state.subjects.get(subject).map(|s| s.external_id.clone()))
    }
}
