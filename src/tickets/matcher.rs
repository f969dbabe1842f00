use std::collections::HashMap;

use chrono::{DateTime, Utc};
use regex::RegexSetBuilder;

use super::{ChangeTask, TicketSnapshot};
use crate::error::BastionError;
use crate::model::FoldedName;

/// Ticket data attached to an inventory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketMatch {
    pub change_request_number: Option<String>,
    pub task_number: String,
    pub valid_until: Option<DateTime<Utc>>,
}

enum Candidate {
    Group(FoldedName),
    Command(String),
}

/// Which groups and commands the subject's active change tasks name.
///
/// Task descriptions are free text; a candidate matches a line when it
/// appears there as a whole, whitespace- or punctuation-delimited phrase.
#[derive(Debug, Default)]
pub struct TaskIndex {
    by_group: HashMap<FoldedName, TicketMatch>,
    by_command: HashMap<String, TicketMatch>,
}

fn phrase_pattern(phrase: &str) -> String {
    format!(r"(?i)(?:^|[\s,;:(]){}(?:$|[\s,;:)])", regex::escape(phrase.trim()))
}

fn assigned_to(task: &ChangeTask, subject: &FoldedName, external_id: &str) -> bool {
    task.assigned_to.is_empty()
        || task
            .assigned_to
            .iter()
            .any(|a| subject.matches(a) || a.trim().eq_ignore_ascii_case(external_id))
}

impl TaskIndex {
    /// Index `snapshot` against candidate group names and command texts.
    /// The first task naming a candidate wins.
    pub fn build<'a>(
        snapshot: &TicketSnapshot,
        subject: &FoldedName,
        external_id: &str,
        groups: impl IntoIterator<Item = &'a FoldedName>,
        commands: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, BastionError> {
        let mut index = Self::default();
        let tasks: Vec<&ChangeTask> = snapshot
            .tasks
            .tasks
            .iter()
            .filter(|t| assigned_to(t, subject, external_id))
            .collect();
        if tasks.is_empty() {
            return Ok(index);
        }

        let mut candidates = Vec::new();
        for name in groups {
            if !name.is_empty() {
                candidates.push(Candidate::Group(name.clone()));
            }
        }
        for text in commands {
            if !text.trim().is_empty() {
                candidates.push(Candidate::Command(text.trim().to_owned()));
            }
        }
        if candidates.is_empty() {
            return Ok(index);
        }

        let patterns: Vec<String> = candidates
            .iter()
            .map(|c| match c {
                Candidate::Group(name) => phrase_pattern(name.as_str()),
                Candidate::Command(text) => phrase_pattern(text),
            })
            .collect();
        let set = RegexSetBuilder::new(&patterns)
            .size_limit(1 << 22)
            .nest_limit(50)
            .build()
            .map_err(|e| BastionError::PolicyValidation(format!("ticket matcher: {e}")))?;

        for task in tasks {
            let matched = TicketMatch {
                change_request_number: snapshot.tasks.change_request_number.clone(),
                task_number: task.task_number.clone(),
                valid_until: snapshot.tasks.valid_until,
            };
            for line in task.description.lines() {
                for hit in set.matches(line).iter() {
                    match &candidates[hit] {
                        Candidate::Group(name) => {
                            index
                                .by_group
                                .entry(name.clone())
                                .or_insert_with(|| matched.clone());
                        }
                        Candidate::Command(text) => {
                            index
                                .by_command
                                .entry(text.clone())
                                .or_insert_with(|| matched.clone());
                        }
                    }
                }
            }
        }
        Ok(index)
    }

    /// A task naming the group wins over one naming only the command.
    pub fn lookup(&self, group: Option<&FoldedName>, command: &str) -> Option<&TicketMatch> {
        group
            .and_then(|g| self.by_group.get(g))
            .or_else(|| self.by_command.get(command.trim()))
    }

    pub fn is_empty(&self) -> bool {
        self.by_group.is_empty() && self.by_command.is_empty()
    }
}
