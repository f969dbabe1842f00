pub mod http;
pub mod matcher;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BastionError;

pub use http::HttpTicketResolver;
pub use matcher::{TaskIndex, TicketMatch};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeTask {
    pub task_number: String,
    /// Free text. Lines are matched against group names and command text.
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub assigned_to: Vec<String>,
}

/// Active change tasks for one configuration item and subject.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTasks {
    /// The ticket system itself reported a problem answering.
    #[serde(default)]
    pub errors: bool,
    #[serde(default)]
    pub change_request_number: Option<String>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks: Vec<ChangeTask>,
}

/// External change-management system.
#[async_trait]
pub trait ChangeTicketResolver: Send + Sync {
    async fn active_tasks(
        &self,
        config_item: &str,
        subject_external_id: &str,
    ) -> Result<ActiveTasks, BastionError>;
}

/// Resolver for deployments with no ticket system. Never matches anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTicketSystem;

#[async_trait]
impl ChangeTicketResolver for NoTicketSystem {
    async fn active_tasks(&self, _: &str, _: &str) -> Result<ActiveTasks, BastionError> {
        Ok(ActiveTasks::default())
    }
}

/// Ticket data for one resolution, after timeout and failure handling.
#[derive(Debug, Clone, Default)]
pub struct TicketSnapshot {
    pub tasks: ActiveTasks,
    /// The resolver failed or did not answer in time.
    pub unavailable: bool,
}

impl TicketSnapshot {
    /// No valid ticket could be established because the ticket system failed,
    /// as opposed to it answering with nothing.
    pub fn errored(&self) -> bool {
        self.unavailable || self.tasks.errors
    }
}

/// Ask the resolver, but never wait longer than `timeout`. Failure and
/// timeout both degrade to an unavailable snapshot.
pub async fn fetch_bounded(
    resolver: &dyn ChangeTicketResolver,
    config_item: &str,
    subject_external_id: &str,
    timeout: Duration,
) -> TicketSnapshot {
    match tokio::time::timeout(
        timeout,
        resolver.active_tasks(config_item, subject_external_id),
    )
    .await
    {
        Ok(Ok(tasks)) => TicketSnapshot {
            tasks,
            unavailable: false,
        },
        Ok(Err(e)) => {
            tracing::warn!(config_item, error = %e, "change-ticket lookup failed");
            TicketSnapshot {
                tasks: ActiveTasks::default(),
                unavailable: true,
            }
        }
        Err(_) => {
            tracing::warn!(
                config_item,
                timeout_ms = timeout.as_millis() as u64,
                "change-ticket lookup timed out"
            );
            TicketSnapshot {
                tasks: ActiveTasks::default(),
                unavailable: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stalled;

    #[async_trait]
    impl ChangeTicketResolver for Stalled {
        async fn active_tasks(&self, _: &str, _: &str) -> Result<ActiveTasks, BastionError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ActiveTasks::default())
        }
    }

    struct Broken;

    #[async_trait]
    impl ChangeTicketResolver for Broken {
        async fn active_tasks(&self, _: &str, _: &str) -> Result<ActiveTasks, BastionError> {
            Err(BastionError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn slow_resolver_degrades_to_unavailable() {
        let snapshot = fetch_bounded(&Stalled, "CI1", "u1", Duration::from_millis(50)).await;
        assert!(snapshot.unavailable);
        assert!(snapshot.errored());
    }

    #[tokio::test]
    async fn failing_resolver_degrades_to_unavailable() {
        let snapshot = fetch_bounded(&Broken, "CI1", "u1", Duration::from_secs(1)).await;
        assert!(snapshot.unavailable);
        assert!(snapshot.tasks.tasks.is_empty());
    }

    #[tokio::test]
    async fn reported_errors_count_as_errored() {
        struct Reporting;

        #[async_trait]
        impl ChangeTicketResolver for Reporting {
            async fn active_tasks(&self, _: &str, _: &str) -> Result<ActiveTasks, BastionError> {
                Ok(ActiveTasks {
                    errors: true,
                    ..ActiveTasks::default()
                })
            }
        }

        let snapshot = fetch_bounded(&Reporting, "CI1", "u1", Duration::from_secs(1)).await;
        assert!(!snapshot.unavailable);
        assert!(snapshot.errored());
    }

    #[test]
    fn wire_format_is_camel_case() {
        let tasks: ActiveTasks = serde_json::from_value(serde_json::json!({
            "errors": false,
            "changeRequestNumber": "CHG0001",
            "validUntil": "2026-03-02T00:00:00Z",
            "tasks": [{"taskNumber": "CTASK1", "description": "web ops", "assignedTo": ["alice"]}]
        }))
        .unwrap();
        assert_eq!(tasks.change_request_number.as_deref(), Some("CHG0001"));
        assert_eq!(tasks.tasks[0].task_number, "CTASK1");
    }
}
