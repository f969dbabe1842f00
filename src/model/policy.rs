use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{DirectoryGroupId, GroupId, ServerGroupId, WindowId};
use super::names::FoldedName;
use crate::time::ValidityWindow;

/// One command line in a policy group, plus the execution metadata the
/// operator UI and the executor need.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandEntry {
    pub text: String,
    pub run_as_root: bool,
    pub sub_directory_allowed: bool,
    pub sudoers: Vec<String>,
    pub directories: Vec<String>,
    pub directory_group_refs: Vec<DirectoryGroupId>,
    /// Allow-list of environment tags; empty means unrestricted.
    pub environments: Vec<String>,
    pub allowed_sub_users: Vec<String>,
    pub allowed_sub_user_groups: Vec<String>,
    pub record_enabled: bool,
    pub edit_mode: bool,
}

impl CommandEntry {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.trim().to_owned(),
            ..Self::default()
        }
    }

    /// False only when a non-empty allow-list excludes `environment`.
    pub fn permits_environment(&self, environment: Option<&str>) -> bool {
        if self.environments.is_empty() {
            return true;
        }
        environment.is_some_and(|env| {
            self.environments
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(env.trim()))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPolicyGroup {
    pub id: GroupId,
    pub name: FoldedName,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub included_commands: Vec<CommandEntry>,
    /// Commands denied even when otherwise matched.
    #[serde(default)]
    pub excluded_commands: Vec<CommandEntry>,
    #[serde(default)]
    pub needs_change_request: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl CommandPolicyGroup {
    pub fn includes(&self, text: &str) -> Option<&CommandEntry> {
        let text = text.trim();
        self.included_commands.iter().find(|c| c.text == text)
    }

    pub fn excludes(&self, text: &str) -> Option<&CommandEntry> {
        let text = text.trim();
        self.excluded_commands.iter().find(|c| c.text == text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryGroup {
    pub id: DirectoryGroupId,
    pub name: FoldedName,
    pub directories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Blacklist {
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerExceptionWindow {
    pub id: WindowId,
    pub server: FoldedName,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

impl ServerExceptionWindow {
    pub fn is_active(&self, host: &FoldedName, now: DateTime<Utc>) -> bool {
        !self.deleted
            && &self.server == host
            && ValidityWindow::new(self.start_date, self.end_date).contains(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalPolicyConfig {
    pub cli_enforcement_enabled: bool,
}

impl Default for GlobalPolicyConfig {
    fn default() -> Self {
        Self {
            cli_enforcement_enabled: true,
        }
    }
}

/// Named set of hosts, with the approver directory groups configured per
/// approval level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerGroup {
    pub id: ServerGroupId,
    pub name: FoldedName,
    pub hosts: Vec<FoldedName>,
    #[serde(default)]
    pub approver_levels: Vec<Vec<String>>,
}

/// Inventory facts about a single host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub name: FoldedName,
    #[serde(default)]
    pub environment: Option<String>,
    /// Change-management configuration item the ticket system keys on.
    #[serde(default)]
    pub config_item: Option<String>,
    #[serde(default)]
    pub iam_group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverGroup {
    pub name: FoldedName,
    pub members: Vec<FoldedName>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub username: FoldedName,
    /// Identity the change-ticket system knows this subject by.
    pub external_id: String,
}
