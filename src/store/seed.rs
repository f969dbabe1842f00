use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::MemoryStore;
use crate::error::BastionError;
use crate::model::{
    AccessGrant, ApproverGroup, Blacklist, CommandEntry, CommandPolicyGroup, CommandScope,
    DirectoryGroup, DirectoryGroupId, FoldedName, GlobalPolicyConfig, GrantId, GroupId,
    HostRecord, ServerExceptionWindow, ServerGroup, ServerGroupId, ServerScope, SubjectRecord,
    WindowId,
};

const MAX_POLICY_FILE_SIZE: u64 = 1024 * 1024; // 1 MiB

// --- TOML deserialization structs (private, map 1:1 to TOML schema) ---

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyFile {
    #[serde(default)]
    blacklist: Vec<String>,
    #[serde(default)]
    enforcement: Option<EnforcementConfig>,
    #[serde(default)]
    directory_groups: Vec<DirectoryGroupConfig>,
    #[serde(default)]
    command_groups: Vec<CommandGroupConfig>,
    #[serde(default)]
    exception_windows: Vec<WindowConfig>,
    #[serde(default)]
    server_groups: Vec<ServerGroupConfig>,
    #[serde(default)]
    hosts: Vec<HostConfig>,
    #[serde(default)]
    approver_groups: Vec<ApproverGroupConfig>,
    #[serde(default)]
    subjects: Vec<SubjectConfig>,
    #[serde(default)]
    grants: Vec<GrantConfig>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EnforcementConfig {
    cli_enforcement_enabled: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DirectoryGroupConfig {
    id: String,
    name: String,
    directories: Vec<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandGroupConfig {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    needs_change_request: bool,
    #[serde(default)]
    include: Vec<CommandConfig>,
    #[serde(default)]
    exclude: Vec<CommandConfig>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandConfig {
    text: String,
    #[serde(default)]
    run_as_root: bool,
    #[serde(default)]
    sub_directory_allowed: bool,
    #[serde(default)]
    sudoers: Vec<String>,
    #[serde(default)]
    directories: Vec<String>,
    #[serde(default)]
    directory_groups: Vec<String>,
    #[serde(default)]
    environments: Vec<String>,
    #[serde(default)]
    allowed_sub_users: Vec<String>,
    #[serde(default)]
    allowed_sub_user_groups: Vec<String>,
    #[serde(default)]
    record_enabled: bool,
    #[serde(default)]
    edit_mode: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WindowConfig {
    #[serde(default)]
    id: Option<String>,
    server: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerGroupConfig {
    id: String,
    name: String,
    hosts: Vec<String>,
    #[serde(default)]
    approver_levels: Vec<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct HostConfig {
    name: String,
    #[serde(default)]
    environment: Option<String>,
    #[serde(default)]
    config_item: Option<String>,
    #[serde(default)]
    iam_group: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ApproverGroupConfig {
    name: String,
    members: Vec<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SubjectConfig {
    username: String,
    external_id: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GrantConfig {
    #[serde(default)]
    id: Option<String>,
    subjects: Vec<String>,
    #[serde(default)]
    blocked: bool,
    #[serde(default)]
    hosts: Vec<String>,
    #[serde(default)]
    server_group: Option<String>,
    #[serde(default)]
    commands: Vec<String>,
    #[serde(default)]
    command_groups: Vec<String>,
    valid_from: DateTime<Utc>,
    valid_until: DateTime<Utc>,
}

// --- Compiled document (typed model records, references checked) ---

/// A validated policy file, ready to seed a [`MemoryStore`].
#[derive(Debug, Default)]
pub struct PolicyDocument {
    pub blacklist: Blacklist,
    pub global: GlobalPolicyConfig,
    pub directory_groups: Vec<DirectoryGroup>,
    pub command_groups: Vec<CommandPolicyGroup>,
    pub exception_windows: Vec<ServerExceptionWindow>,
    pub server_groups: Vec<ServerGroup>,
    pub hosts: Vec<HostRecord>,
    pub approver_groups: Vec<ApproverGroup>,
    pub subjects: Vec<SubjectRecord>,
    pub grants: Vec<AccessGrant>,
}

impl FromStr for PolicyDocument {
    type Err = BastionError;

    /// Parse and validate a policy document from a TOML string.
    fn from_str(content: &str) -> Result<Self, BastionError> {
        let file: PolicyFile =
            toml::from_str(content).map_err(|e| BastionError::PolicyLoad(e.to_string()))?;
        compile(file)
    }
}

impl PolicyDocument {
    /// Load a policy document from a TOML file. Checks file size before reading.
    pub fn load(path: &Path) -> Result<Self, BastionError> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            BastionError::PolicyLoad(format!("cannot read {}: {e}", path.display()))
        })?;

        if metadata.len() > MAX_POLICY_FILE_SIZE {
            return Err(BastionError::PolicyLoad(format!(
                "policy file exceeds {MAX_POLICY_FILE_SIZE} byte limit"
            )));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            BastionError::PolicyLoad(format!("cannot read {}: {e}", path.display()))
        })?;

        content.parse()
    }

    /// Replace the store's contents with this document.
    pub async fn seed(self, store: &MemoryStore) -> Result<(), BastionError> {
        use super::{GrantStore, PolicyAdminStore};

        store.set_blacklist(self.blacklist).await?;
        store.set_global_config(self.global).await?;
        for group in self.directory_groups {
            store.put_directory_group(group).await;
        }
        for group in self.command_groups {
            store.put_command_group(group).await?;
        }
        for window in self.exception_windows {
            store.put_exception_window(window).await?;
        }
        for group in self.server_groups {
            store.put_server_group(group).await;
        }
        for host in self.hosts {
            store.put_host(host).await;
        }
        for group in self.approver_groups {
            store.put_approver_group(group).await;
        }
        for subject in self.subjects {
            store.put_subject(subject).await;
        }
        for grant in self.grants {
            store.insert_grant(grant).await?;
        }
        tracing::debug!("policy document seeded into record store");
        Ok(())
    }
}

fn invalid(message: String) -> BastionError {
    BastionError::PolicyValidation(message)
}

fn unique<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> Result<(), BastionError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id.trim().to_lowercase()) {
            return Err(invalid(format!("duplicate {kind} '{id}'")));
        }
    }
    Ok(())
}

fn compile(file: PolicyFile) -> Result<PolicyDocument, BastionError> {
    unique("directory group id", file.directory_groups.iter().map(|g| g.id.as_str()))?;
    unique("command group id", file.command_groups.iter().map(|g| g.id.as_str()))?;
    unique("command group name", file.command_groups.iter().map(|g| g.name.as_str()))?;
    unique("server group id", file.server_groups.iter().map(|g| g.id.as_str()))?;
    unique("host", file.hosts.iter().map(|h| h.name.as_str()))?;

    let directory_ids: HashSet<&str> = file.directory_groups.iter().map(|g| g.id.as_str()).collect();
    let group_ids: HashSet<&str> = file.command_groups.iter().map(|g| g.id.as_str()).collect();
    let server_group_ids: HashSet<&str> = file.server_groups.iter().map(|g| g.id.as_str()).collect();

    let command_groups = file
        .command_groups
        .iter()
        .map(|g| compile_group(g, &directory_ids))
        .collect::<Result<Vec<_>, _>>()?;

    let exception_windows = file
        .exception_windows
        .into_iter()
        .map(|w| {
            if w.start >= w.end {
                return Err(invalid(format!(
                    "exception window for '{}': start must precede end",
                    w.server
                )));
            }
            Ok(ServerExceptionWindow {
                id: w.id.map_or_else(WindowId::generate, WindowId::from),
                server: FoldedName::new(&w.server),
                start_date: w.start,
                end_date: w.end,
                deleted: false,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let grants = file
        .grants
        .into_iter()
        .enumerate()
        .map(|(index, g)| compile_grant(index, g, &group_ids, &server_group_ids))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PolicyDocument {
        blacklist: Blacklist {
            commands: file
                .blacklist
                .into_iter()
                .map(|c| c.trim().to_owned())
                .filter(|c| !c.is_empty())
                .collect(),
        },
        global: file
            .enforcement
            .map(|e| GlobalPolicyConfig {
                cli_enforcement_enabled: e.cli_enforcement_enabled,
            })
            .unwrap_or_default(),
        directory_groups: file
            .directory_groups
            .into_iter()
            .map(|g| DirectoryGroup {
                id: DirectoryGroupId::from(g.id),
                name: FoldedName::new(&g.name),
                directories: g.directories,
            })
            .collect(),
        command_groups,
        exception_windows,
        server_groups: file
            .server_groups
            .into_iter()
            .map(|g| ServerGroup {
                id: ServerGroupId::from(g.id),
                name: FoldedName::new(&g.name),
                hosts: g.hosts.iter().map(|h| FoldedName::new(h)).collect(),
                approver_levels: g.approver_levels,
            })
            .collect(),
        hosts: file
            .hosts
            .into_iter()
            .map(|h| HostRecord {
                name: FoldedName::new(&h.name),
                environment: h.environment,
                config_item: h.config_item,
                iam_group: h.iam_group,
            })
            .collect(),
        approver_groups: file
            .approver_groups
            .into_iter()
            .map(|g| ApproverGroup {
                name: FoldedName::new(&g.name),
                members: g.members.iter().map(|m| FoldedName::new(m)).collect(),
            })
            .collect(),
        subjects: file
            .subjects
            .into_iter()
            .map(|s| SubjectRecord {
                username: FoldedName::new(&s.username),
                external_id: s.external_id,
            })
            .collect(),
        grants,
    })
}

fn compile_group(
    config: &CommandGroupConfig,
    directory_ids: &HashSet<&str>,
) -> Result<CommandPolicyGroup, BastionError> {
    let compile_entries = |entries: &[CommandConfig]| -> Result<Vec<CommandEntry>, BastionError> {
        entries
            .iter()
            .map(|c| compile_command(&config.name, c, directory_ids))
            .collect()
    };
    if config.include.is_empty() && config.exclude.is_empty() {
        return Err(invalid(format!(
            "command group '{}': include and exclude must not both be empty",
            config.name
        )));
    }
    Ok(CommandPolicyGroup {
        id: GroupId::from(config.id.as_str()),
        name: FoldedName::new(&config.name),
        description: config.description.clone(),
        included_commands: compile_entries(&config.include)?,
        excluded_commands: compile_entries(&config.exclude)?,
        needs_change_request: config.needs_change_request,
        deleted: false,
    })
}

fn compile_command(
    group: &str,
    config: &CommandConfig,
    directory_ids: &HashSet<&str>,
) -> Result<CommandEntry, BastionError> {
    if config.text.trim().is_empty() {
        return Err(invalid(format!(
            "command group '{group}': command text must not be empty"
        )));
    }
    if let Some(missing) = config
        .directory_groups
        .iter()
        .find(|d| !directory_ids.contains(d.as_str()))
    {
        return Err(invalid(format!(
            "command group '{group}', command '{}': unknown directory group '{missing}'",
            config.text
        )));
    }
    Ok(CommandEntry {
        text: config.text.trim().to_owned(),
        run_as_root: config.run_as_root,
        sub_directory_allowed: config.sub_directory_allowed,
        sudoers: config.sudoers.clone(),
        directories: config.directories.clone(),
        directory_group_refs: config
            .directory_groups
            .iter()
            .map(|d| DirectoryGroupId::from(d.as_str()))
            .collect(),
        environments: config.environments.clone(),
        allowed_sub_users: config.allowed_sub_users.clone(),
        allowed_sub_user_groups: config.allowed_sub_user_groups.clone(),
        record_enabled: config.record_enabled,
        edit_mode: config.edit_mode,
    })
}

fn compile_grant(
    index: usize,
    config: GrantConfig,
    group_ids: &HashSet<&str>,
    server_group_ids: &HashSet<&str>,
) -> Result<AccessGrant, BastionError> {
    let label = config
        .id
        .clone()
        .unwrap_or_else(|| format!("#{}", index + 1));

    let server_scope = match (config.hosts.is_empty(), config.server_group) {
        (false, None) => ServerScope::Hosts(config.hosts.iter().map(|h| FoldedName::new(h)).collect()),
        (true, Some(group)) if server_group_ids.contains(group.as_str()) => {
            ServerScope::Group(ServerGroupId::from(group))
        }
        (true, Some(group)) => {
            return Err(invalid(format!(
                "grant {label}: unknown server group '{group}'"
            )));
        }
        (false, Some(_)) => {
            return Err(invalid(format!(
                "grant {label}: hosts and server_group are mutually exclusive"
            )));
        }
        (true, None) => {
            return Err(invalid(format!(
                "grant {label}: one of hosts or server_group is required"
            )));
        }
    };

    let (commands_apply, command_scope) =
        match (config.commands.is_empty(), config.command_groups.is_empty()) {
            (true, true) => (false, CommandScope::Commands(Vec::new())),
            (false, true) => (true, CommandScope::Commands(config.commands)),
            (true, false) => {
                if let Some(missing) = config
                    .command_groups
                    .iter()
                    .find(|g| !group_ids.contains(g.as_str()))
                {
                    return Err(invalid(format!(
                        "grant {label}: unknown command group '{missing}'"
                    )));
                }
                (
                    true,
                    CommandScope::Groups(
                        config.command_groups.into_iter().map(GroupId::from).collect(),
                    ),
                )
            }
            (false, false) => {
                return Err(invalid(format!(
                    "grant {label}: commands and command_groups are mutually exclusive"
                )));
            }
        };

    let grant = AccessGrant {
        id: config.id.map_or_else(GrantId::generate, GrantId::from),
        subjects: config.subjects.iter().map(|s| FoldedName::new(s)).collect(),
        blocked: config.blocked,
        server_scope,
        commands_apply,
        command_scope,
        valid_from: config.valid_from,
        valid_until: config.valid_until,
        request_number: None,
        deleted: false,
    };
    grant
        .validate()
        .map_err(|e| invalid(format!("grant {label}: {e}")))?;
    Ok(grant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{GrantStore, HostDirectory, PolicyStore};

    const POLICY: &str = r#"
blacklist = ["rm", "shutdown"]

[enforcement]
cli_enforcement_enabled = true

[[directory_groups]]
id = "logs"
name = "Logs"
directories = ["/var/log"]

[[command_groups]]
id = "web-ops"
name = "Web Ops"
needs_change_request = true

[[command_groups.include]]
text = "systemctl"
run_as_root = true
directory_groups = ["logs"]
environments = ["prod"]

[[command_groups.exclude]]
text = "systemctl stop"

[[server_groups]]
id = "web"
name = "Web Fleet"
hosts = ["WEB01", "web02"]
approver_levels = [["team-leads"], ["change-board"]]

[[hosts]]
name = "web01"
environment = "prod"
config_item = "CI0001"

[[approver_groups]]
name = "team-leads"
members = ["Carol"]

[[subjects]]
username = "alice"
external_id = "u-1001"

[[grants]]
id = "g1"
subjects = ["Alice"]
server_group = "web"
command_groups = ["web-ops"]
valid_from = "2026-03-01T00:00:00Z"
valid_until = "2026-03-31T00:00:00Z"
"#;

    #[test]
    fn parse_full_policy() {
        let doc = PolicyDocument::from_str(POLICY).expect("policy should parse");
        assert_eq!(doc.blacklist.commands, vec!["rm", "shutdown"]);
        assert_eq!(doc.command_groups.len(), 1);
        let group = &doc.command_groups[0];
        assert_eq!(group.name.as_str(), "web ops");
        assert_eq!(group.excluded_commands[0].text, "systemctl stop");
        assert_eq!(
            group.included_commands[0].directory_group_refs,
            vec![DirectoryGroupId::from("logs")]
        );
        assert_eq!(doc.server_groups[0].hosts[0].as_str(), "web01");
        assert!(doc.grants[0].commands_apply);
    }

    #[test]
    fn empty_document_is_valid() {
        let doc = PolicyDocument::from_str("").expect("empty policy should parse");
        assert!(doc.global.cli_enforcement_enabled);
        assert!(doc.grants.is_empty());
    }

    #[test]
    fn unknown_toml_field() {
        let err = PolicyDocument::from_str("surprise = true\n").unwrap_err();
        assert!(matches!(err, BastionError::PolicyLoad(_)));
    }

    #[test]
    fn duplicate_group_names_rejected() {
        let toml = r#"
[[command_groups]]
id = "a"
name = "Ops"
include = [{ text = "ls" }]

[[command_groups]]
id = "b"
name = "OPS"
include = [{ text = "cat" }]
"#;
        let err = PolicyDocument::from_str(toml).unwrap_err();
        assert!(matches!(err, BastionError::PolicyValidation(_)));
    }

    #[test]
    fn unknown_directory_group_rejected() {
        let toml = r#"
[[command_groups]]
id = "a"
name = "Ops"
include = [{ text = "ls", directory_groups = ["nope"] }]
"#;
        let err = PolicyDocument::from_str(toml).unwrap_err();
        assert!(matches!(err, BastionError::PolicyValidation(_)));
    }

    #[test]
    fn grant_scope_must_be_unambiguous() {
        let toml = r#"
[[grants]]
subjects = ["alice"]
hosts = ["h1"]
commands = ["ls"]
command_groups = ["x"]
valid_from = "2026-03-01T00:00:00Z"
valid_until = "2026-03-02T00:00:00Z"
"#;
        let err = PolicyDocument::from_str(toml).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"), "got: {err}");
    }

    #[test]
    fn grant_without_commands_does_not_apply_commands() {
        let toml = r#"
[[grants]]
subjects = ["alice"]
hosts = ["h1"]
valid_from = "2026-03-01T00:00:00Z"
valid_until = "2026-03-02T00:00:00Z"
"#;
        let doc = PolicyDocument::from_str(toml).unwrap();
        assert!(!doc.grants[0].commands_apply);
    }

    #[test]
    fn inverted_exception_window_rejected() {
        let toml = r#"
[[exception_windows]]
server = "h1"
start = "2026-03-02T00:00:00Z"
end = "2026-03-01T00:00:00Z"
"#;
        let err = PolicyDocument::from_str(toml).unwrap_err();
        assert!(matches!(err, BastionError::PolicyValidation(_)));
    }

    #[test]
    fn oversized_file_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let padding = "#".repeat(MAX_POLICY_FILE_SIZE as usize + 1);
        std::fs::write(file.path(), padding).unwrap();
        let err = PolicyDocument::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("byte limit"), "got: {err}");
    }

    #[tokio::test]
    async fn seed_populates_store() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), POLICY).unwrap();
        let doc = PolicyDocument::load(file.path()).unwrap();

        let store = MemoryStore::default();
        doc.seed(&store).await.unwrap();

        assert!(store.is_blacklisted("rm").await.unwrap());
        assert_eq!(store.active_command_groups().await.unwrap().len(), 1);
        assert_eq!(
            store
                .approver_group_members("TEAM-LEADS")
                .await
                .unwrap(),
            vec![FoldedName::new("carol")]
        );
        assert_eq!(
            store
                .subject_external_id(&FoldedName::new("alice"))
                .await
                .unwrap()
                .as_deref(),
            Some("u-1001")
        );
        assert_eq!(store.list_grants().await.unwrap().len(), 1);
    }
}
