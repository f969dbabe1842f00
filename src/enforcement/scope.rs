use std::collections::HashMap;

use crate::error::BastionError;
use crate::model::{
    CommandEntry, CommandPolicyGroup, DirectoryGroupId, FoldedName, GroupId, ServerGroupId,
    ServerScope,
};
use crate::store::{HostDirectory, PolicyStore};

/// Memoized reference resolution for a single authorization or inventory
/// call. Active groups load once; server groups and directory groups load
/// on first use.
pub(crate) struct ScopeResolver<'a> {
    policy: &'a dyn PolicyStore,
    hosts: &'a dyn HostDirectory,
    groups: Vec<CommandPolicyGroup>,
    group_index: HashMap<GroupId, usize>,
    server_groups: HashMap<ServerGroupId, Vec<FoldedName>>,
    directories: HashMap<DirectoryGroupId, Vec<String>>,
}

impl<'a> ScopeResolver<'a> {
    pub(crate) async fn load(
        policy: &'a dyn PolicyStore,
        hosts: &'a dyn HostDirectory,
    ) -> Result<Self, BastionError> {
        let mut groups = policy.active_command_groups().await?;
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        let group_index = groups
            .iter()
            .enumerate()
            .map(|(i, g)| (g.id.clone(), i))
            .collect();
        Ok(Self {
            policy,
            hosts,
            groups,
            group_index,
            server_groups: HashMap::new(),
            directories: HashMap::new(),
        })
    }

    /// Active groups, ordered by name.
    pub(crate) fn groups(&self) -> &[CommandPolicyGroup] {
        &self.groups
    }

    /// `None` for unknown or soft-deleted groups.
    pub(crate) fn group(&self, id: &GroupId) -> Option<&CommandPolicyGroup> {
        self.group_index.get(id).map(|&i| &self.groups[i])
    }

    /// First group including / excluding `text`, searching all active groups.
    pub(crate) fn classify(&self, text: &str) -> (Option<&CommandPolicyGroup>, Option<&CommandPolicyGroup>) {
        let including = self.groups.iter().find(|g| g.includes(text).is_some());
        let excluding = self.groups.iter().find(|g| g.excludes(text).is_some());
        (including, excluding)
    }

    pub(crate) async fn hosts_for(
        &mut self,
        scope: &ServerScope,
    ) -> Result<Vec<FoldedName>, BastionError> {
        match scope {
            ServerScope::Hosts(hosts) => Ok(hosts.clone()),
            ServerScope::Group(id) => {
                if let Some(hosts) = self.server_groups.get(id) {
                    return Ok(hosts.clone());
                }
                let hosts = match self.hosts.server_group(id).await {
                    Ok(group) => group.hosts,
                    Err(BastionError::NotFound { .. }) => {
                        tracing::warn!(server_group = %id, "grant references unknown server group");
                        Vec::new()
                    }
                    Err(e) => return Err(e),
                };
                self.server_groups.insert(id.clone(), hosts.clone());
                Ok(hosts)
            }
        }
    }

    pub(crate) async fn covers(
        &mut self,
        scope: &ServerScope,
        host: &FoldedName,
    ) -> Result<bool, BastionError> {
        Ok(self.hosts_for(scope).await?.contains(host))
    }

    /// Copy of `entry` with its directory-group references folded into
    /// `directories`.
    pub(crate) async fn expand_directories(
        &mut self,
        entry: &CommandEntry,
    ) -> Result<CommandEntry, BastionError> {
        let mut expanded = entry.clone();
        for id in &entry.directory_group_refs {
            if !self.directories.contains_key(id) {
                let dirs = self.policy.resolve_directory_groups(std::slice::from_ref(id)).await?;
                self.directories.insert(id.clone(), dirs);
            }
            if let Some(dirs) = self.directories.get(id) {
                for dir in dirs {
                    if !expanded.directories.contains(dir) {
                        expanded.directories.push(dir.clone());
                    }
                }
            }
        }
        Ok(expanded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DirectoryGroup, ServerGroup};
    use crate::store::{MemoryStore, PolicyAdminStore};

    fn group(id: &str, name: &str, include: &[&str], exclude: &[&str]) -> CommandPolicyGroup {
        CommandPolicyGroup {
            id: GroupId::from(id),
            name: FoldedName::new(name),
            description: String::new(),
            included_commands: include.iter().map(|c| CommandEntry::new(c)).collect(),
            excluded_commands: exclude.iter().map(|c| CommandEntry::new(c)).collect(),
            needs_change_request: false,
            deleted: false,
        }
    }

    #[tokio::test]
    async fn server_group_scope_resolves_and_unknown_is_empty() {
        let store = MemoryStore::default();
        store
            .put_server_group(ServerGroup {
                id: ServerGroupId::from("web"),
                name: FoldedName::new("web"),
                hosts: vec![FoldedName::new("web01")],
                approver_levels: Vec::new(),
            })
            .await;
        let mut resolver = ScopeResolver::load(&store, &store).await.unwrap();

        let scope = ServerScope::Group(ServerGroupId::from("web"));
        assert!(resolver.covers(&scope, &FoldedName::new("WEB01")).await.unwrap());
        let missing = ServerScope::Group(ServerGroupId::from("gone"));
        assert!(resolver.hosts_for(&missing).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn classify_finds_inclusion_and_exclusion() {
        let store = MemoryStore::default();
        store
            .put_command_group(group("a", "ops", &["systemctl"], &["systemctl stop"]))
            .await
            .unwrap();
        store
            .put_command_group(group("b", "db", &["psql"], &[]))
            .await
            .unwrap();
        let resolver = ScopeResolver::load(&store, &store).await.unwrap();

        let (inc, exc) = resolver.classify("systemctl stop");
        assert!(inc.is_none());
        assert_eq!(exc.map(|g| g.id.as_str()), Some("a"));
        assert_eq!(resolver.groups()[0].name.as_str(), "db");
        assert!(resolver.group(&GroupId::from("b")).is_some());
    }

    #[tokio::test]
    async fn directories_expand_from_references() {
        let store = MemoryStore::default();
        store
            .put_directory_group(DirectoryGroup {
                id: DirectoryGroupId::from("logs"),
                name: FoldedName::new("logs"),
                directories: vec!["/var/log".into()],
            })
            .await;
        let mut resolver = ScopeResolver::load(&store, &store).await.unwrap();
        let entry = CommandEntry {
            directories: vec!["/srv".into()],
            directory_group_refs: vec![DirectoryGroupId::from("logs")],
            ..CommandEntry::new("tail")
        };
        let expanded = resolver.expand_directories(&entry).await.unwrap();
        assert_eq!(expanded.directories, vec!["/srv", "/var/log"]);
    }
}
