use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{CommandEntry, CommandPolicyGroup, FoldedName, GroupId};
use crate::tickets::{TaskIndex, TicketMatch};
use crate::time::expired_marker;

/// Placeholder change-request number shown when a change request is needed
/// but the ticket system could not be asked.
pub const TICKET_SYSTEM_ERROR: &str = "XXXX";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    /// Backed by a standing grant.
    Grant,
    /// From the scan of all active groups; allowed only with a ticket.
    Default,
}

/// One command a subject may reason about on a host, with everything the
/// operator view and the executor need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotatedCommand {
    pub command: CommandEntry,
    pub group: Option<FoldedName>,
    pub group_id: Option<GroupId>,
    pub exclusion: bool,
    pub is_allowed: bool,
    /// Epoch seconds.
    pub valid_upto: i64,
    #[serde(rename = "CRNumber")]
    pub cr_number: Option<String>,
    #[serde(rename = "CTask")]
    pub ctask: Option<String>,
    /// `true` means the host's environment is permitted, i.e. not restricted.
    pub is_env_restricted: bool,
    pub needs_change_request: bool,
    pub source: EntrySource,
}

impl AnnotatedCommand {
    /// Merge key shared by both layers.
    pub fn key(&self) -> (&str, bool) {
        (self.command.text.as_str(), self.exclusion)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInventory {
    pub subject: FoldedName,
    pub host: FoldedName,
    pub entries: Vec<AnnotatedCommand>,
    /// Reported, not applied: callers combine it with the entries.
    pub enforcement_suspended: bool,
    pub blacklist: Vec<String>,
    pub ticket_data_unavailable: bool,
    pub grant_data_unavailable: bool,
}

impl CommandInventory {
    pub fn allowed(&self) -> impl Iterator<Item = &AnnotatedCommand> {
        self.entries.iter().filter(|e| e.is_allowed && !e.exclusion)
    }

    pub fn find(&self, text: &str, exclusion: bool) -> Option<&AnnotatedCommand> {
        let text = text.trim();
        self.entries.iter().find(|e| e.key() == (text, exclusion))
    }
}

#[derive(Debug, Clone)]
pub(super) struct GroupRef {
    id: GroupId,
    name: FoldedName,
    needs_change_request: bool,
}

impl From<&CommandPolicyGroup> for GroupRef {
    fn from(group: &CommandPolicyGroup) -> Self {
        Self {
            id: group.id.clone(),
            name: group.name.clone(),
            needs_change_request: group.needs_change_request,
        }
    }
}

/// A command entry picked for a layer, before annotation.
#[derive(Debug, Clone)]
pub(super) struct Candidate {
    pub entry: CommandEntry,
    pub group: Option<GroupRef>,
    pub exclusion: bool,
}

impl Candidate {
    /// Every inclusion and exclusion of `group`.
    pub fn from_group(group: &CommandPolicyGroup) -> Vec<Self> {
        let group_ref = GroupRef::from(group);
        let included = group.included_commands.iter().map(|c| (c, false));
        let excluded = group.excluded_commands.iter().map(|c| (c, true));
        included
            .chain(excluded)
            .map(|(entry, exclusion)| Self {
                entry: entry.clone(),
                group: Some(group_ref.clone()),
                exclusion,
            })
            .collect()
    }

    /// An explicitly granted command line. Metadata comes from the group
    /// excluding it if there is one, else from a group including it.
    pub fn explicit(
        text: &str,
        including: Option<&CommandPolicyGroup>,
        excluding: Option<&CommandPolicyGroup>,
    ) -> Self {
        if let Some(group) = excluding
            && let Some(entry) = group.excludes(text)
        {
            return Self {
                entry: entry.clone(),
                group: Some(GroupRef::from(group)),
                exclusion: true,
            };
        }
        if let Some(group) = including
            && let Some(entry) = group.includes(text)
        {
            return Self {
                entry: entry.clone(),
                group: Some(GroupRef::from(group)),
                exclusion: false,
            };
        }
        Self {
            entry: CommandEntry::new(text),
            group: None,
            exclusion: false,
        }
    }
}

/// Per-resolution facts every entry is annotated against.
pub(super) struct Annotator<'a> {
    pub index: &'a TaskIndex,
    pub ticket_errored: bool,
    pub environment: Option<&'a str>,
    pub subject_blocked: bool,
    pub now: DateTime<Utc>,
}

impl Annotator<'_> {
    fn ticket(&self, candidate: &Candidate) -> Option<&TicketMatch> {
        self.index.lookup(
            candidate.group.as_ref().map(|g| &g.name),
            &candidate.entry.text,
        )
    }

    fn annotate(
        &self,
        candidate: Candidate,
        ticket: Option<&TicketMatch>,
        is_allowed: bool,
        valid_upto: i64,
        source: EntrySource,
    ) -> AnnotatedCommand {
        let needs_change_request = candidate
            .group
            .as_ref()
            .is_some_and(|g| g.needs_change_request);
        let (cr_number, ctask) = match ticket {
            Some(t) => (t.change_request_number.clone(), Some(t.task_number.clone())),
            None if needs_change_request && self.ticket_errored => (
                Some(TICKET_SYSTEM_ERROR.to_owned()),
                Some(TICKET_SYSTEM_ERROR.to_owned()),
            ),
            None => (None, None),
        };
        let is_env_restricted = candidate.entry.permits_environment(self.environment);
        let (group, group_id) = match candidate.group {
            Some(g) => (Some(g.name), Some(g.id)),
            None => (None, None),
        };
        AnnotatedCommand {
            command: candidate.entry,
            group,
            group_id,
            exclusion: candidate.exclusion,
            is_allowed,
            valid_upto,
            cr_number,
            ctask,
            is_env_restricted,
            needs_change_request,
            source,
        }
    }

    pub fn grant_entry(&self, candidate: Candidate, grant_until: DateTime<Utc>) -> AnnotatedCommand {
        let ticket = self.ticket(&candidate).cloned();
        let valid_upto = ticket
            .as_ref()
            .and_then(|t| t.valid_until)
            .unwrap_or(grant_until)
            .timestamp();
        self.annotate(
            candidate,
            ticket.as_ref(),
            !self.subject_blocked,
            valid_upto,
            EntrySource::Grant,
        )
    }

    pub fn default_entry(&self, candidate: Candidate) -> AnnotatedCommand {
        let ticket = self.ticket(&candidate).cloned();
        let valid_upto = ticket
            .as_ref()
            .and_then(|t| t.valid_until)
            .map_or_else(|| expired_marker(self.now), |t| t.timestamp());
        let is_allowed = ticket.is_some() && !self.subject_blocked;
        self.annotate(
            candidate,
            ticket.as_ref(),
            is_allowed,
            valid_upto,
            EntrySource::Default,
        )
    }
}

/// Entries keyed by `(text, exclusion)`; the first entry for a key wins.
#[derive(Debug, Default)]
pub(super) struct Layer {
    seen: HashSet<(String, bool)>,
    entries: Vec<AnnotatedCommand>,
}

impl Layer {
    pub fn push(&mut self, entry: AnnotatedCommand) {
        let key = (entry.command.text.clone(), entry.exclusion);
        if self.seen.insert(key) {
            self.entries.push(entry);
        }
    }

    pub fn into_entries(self) -> Vec<AnnotatedCommand> {
        self.entries
    }
}

/// Grant-derived entries first, then default entries whose key the grant
/// layer does not already hold.
pub(super) fn merge(grant_layer: Layer, default_layer: Layer) -> Vec<AnnotatedCommand> {
    let mut merged = grant_layer;
    for entry in default_layer.into_entries() {
        merged.push(entry);
    }
    merged.into_entries()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn web_group() -> CommandPolicyGroup {
        CommandPolicyGroup {
            id: GroupId::from("g-web"),
            name: FoldedName::new("web ops"),
            description: String::new(),
            included_commands: vec![
                CommandEntry {
                    environments: vec!["dev".into()],
                    ..CommandEntry::new("systemctl restart nginx")
                },
                CommandEntry::new("tail"),
            ],
            excluded_commands: vec![CommandEntry::new("systemctl stop")],
            needs_change_request: true,
            deleted: false,
        }
    }

    fn annotator(index: &TaskIndex, errored: bool, blocked: bool) -> Annotator<'_> {
        Annotator {
            index,
            ticket_errored: errored,
            environment: Some("prod"),
            subject_blocked: blocked,
            now: now(),
        }
    }

    #[test]
    fn group_candidates_cover_both_lists() {
        let candidates = Candidate::from_group(&web_group());
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates.iter().filter(|c| c.exclusion).count(), 1);
    }

    #[test]
    fn explicit_command_prefers_excluding_group_metadata() {
        let group = web_group();
        let c = Candidate::explicit("systemctl stop", None, Some(&group));
        assert!(c.exclusion);
        assert_eq!(c.group.map(|g| g.id), Some(GroupId::from("g-web")));

        let bare = Candidate::explicit("uptime", None, None);
        assert!(!bare.exclusion);
        assert!(bare.group.is_none());
    }

    #[test]
    fn grant_entry_uses_grant_end_and_environment() {
        let index = TaskIndex::default();
        let a = annotator(&index, false, false);
        let until = now() + chrono::Duration::days(2);
        let entry = a.grant_entry(Candidate::from_group(&web_group()).remove(0), until);
        assert!(entry.is_allowed);
        assert_eq!(entry.valid_upto, until.timestamp());
        assert!(!entry.is_env_restricted);
        assert_eq!(entry.cr_number, None);
        assert_eq!(entry.source, EntrySource::Grant);
    }

    #[test]
    fn ticket_system_error_yields_sentinel() {
        let index = TaskIndex::default();
        let a = annotator(&index, true, false);
        let entry = a.grant_entry(Candidate::from_group(&web_group()).remove(1), now());
        assert_eq!(entry.cr_number.as_deref(), Some(TICKET_SYSTEM_ERROR));
        assert_eq!(entry.ctask.as_deref(), Some(TICKET_SYSTEM_ERROR));
    }

    #[test]
    fn blocked_subject_is_never_allowed() {
        let index = TaskIndex::default();
        let a = annotator(&index, false, true);
        let entry = a.grant_entry(Candidate::explicit("uptime", None, None), now());
        assert!(!entry.is_allowed);
    }

    #[test]
    fn default_entry_without_ticket_is_expired() {
        let index = TaskIndex::default();
        let a = annotator(&index, false, false);
        let entry = a.default_entry(Candidate::from_group(&web_group()).remove(1));
        assert!(!entry.is_allowed);
        assert_eq!(entry.valid_upto, expired_marker(now()));
        assert_eq!(entry.source, EntrySource::Default);
    }

    #[test]
    fn grant_layer_shadows_default_layer() {
        let index = TaskIndex::default();
        let a = annotator(&index, false, false);
        let until = now() + chrono::Duration::hours(4);

        let mut grant_layer = Layer::default();
        grant_layer.push(a.grant_entry(Candidate::explicit("tail", None, None), until));
        grant_layer.push(a.grant_entry(Candidate::explicit("tail", None, None), now()));

        let mut default_layer = Layer::default();
        for c in Candidate::from_group(&web_group()) {
            default_layer.push(a.default_entry(c));
        }

        let merged = merge(grant_layer, default_layer);
        assert_eq!(merged.len(), 3);
        let tail: Vec<_> = merged.iter().filter(|e| e.key() == ("tail", false)).collect();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].source, EntrySource::Grant);
        assert_eq!(tail[0].valid_upto, until.timestamp());
    }
}
