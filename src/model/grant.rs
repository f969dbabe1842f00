use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{GrantId, GroupId, ServerGroupId};
use super::names::FoldedName;
use crate::error::BastionError;
use crate::time::ValidityWindow;

/// Which hosts a grant or request covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ServerScope {
    Hosts(Vec<FoldedName>),
    /// Resolved to a host list through the record store at resolution time.
    Group(ServerGroupId),
}

impl ServerScope {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Hosts(hosts) => hosts.is_empty(),
            Self::Group(id) => id.as_str().trim().is_empty(),
        }
    }
}

/// Which commands a grant or request covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CommandScope {
    Commands(Vec<String>),
    Groups(Vec<GroupId>),
}

impl CommandScope {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Commands(commands) => commands.iter().all(|c| c.trim().is_empty()),
            Self::Groups(groups) => groups.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub id: GrantId,
    pub subjects: Vec<FoldedName>,
    /// Hard override: nothing under this grant is allowed.
    pub blocked: bool,
    pub server_scope: ServerScope,
    /// Whether `command_scope` participates in authorization at all.
    pub commands_apply: bool,
    pub command_scope: CommandScope,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub request_number: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl AccessGrant {
    pub fn window(&self) -> ValidityWindow {
        ValidityWindow::new(self.valid_from, self.valid_until)
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.deleted && self.window().contains(now)
    }

    pub fn names_subject(&self, subject: &FoldedName) -> bool {
        self.subjects.iter().any(|s| s == subject)
    }

    /// Shape checks applied before anything reaches the store.
    pub fn validate(&self) -> Result<(), BastionError> {
        if self.subjects.iter().all(FoldedName::is_empty) {
            return Err(BastionError::validation(
                "subjects",
                "at least one subject is required",
            ));
        }
        if self.server_scope.is_empty() {
            return Err(BastionError::validation(
                "server_scope",
                "must name at least one host or a server group",
            ));
        }
        if self.commands_apply && self.command_scope.is_empty() {
            return Err(BastionError::validation(
                "command_scope",
                "must not be empty when commands apply",
            ));
        }
        if !self.window().is_well_formed() {
            return Err(BastionError::validation(
                "valid_until",
                "must be later than valid_from",
            ));
        }
        Ok(())
    }
}
