use std::net::IpAddr;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

use crate::model::FoldedName;

/// Who is acting, and from where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub subject: FoldedName,
    pub ip: Option<IpAddr>,
}

impl Actor {
    pub fn new(subject: &str) -> Self {
        Self {
            subject: FoldedName::new(subject),
            ip: None,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Authorize,
    Execute,
    SubmitRequest,
    Approve,
    Deny,
    Cancel,
    CreateGrant,
    UpdateGrant,
    DeleteGrant,
    CreateGroup,
    UpdateGroup,
    DeleteGroup,
    UpdateBlacklist,
    PutExceptionWindow,
    DeleteExceptionWindow,
    SetEnforcement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Module {
    Cli,
    Workflow,
    Policy,
    Grants,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub subject: FoldedName,
    pub ip: Option<IpAddr>,
    pub action: ActionType,
    pub module: Module,
    pub command: Option<String>,
    pub host: Option<FoldedName>,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub changed_fields: Vec<String>,
    /// Outcome summary, e.g. the deny reason.
    pub outcome: String,
}

impl AuditEvent {
    pub fn new(actor: &Actor, action: ActionType, module: Module, outcome: impl Into<String>) -> Self {
        Self {
            subject: actor.subject.clone(),
            ip: actor.ip,
            action,
            module,
            command: None,
            host: None,
            before: None,
            after: None,
            changed_fields: Vec::new(),
            outcome: outcome.into(),
        }
    }

    pub fn command(mut self, command: &str) -> Self {
        self.command = Some(command.to_owned());
        self
    }

    pub fn host(mut self, host: &FoldedName) -> Self {
        self.host = Some(host.clone());
        self
    }

    /// Attach before/after snapshots and the top-level fields that differ.
    pub fn change<T: Serialize>(mut self, before: Option<&T>, after: Option<&T>) -> Self {
        let before = before.and_then(|b| serde_json::to_value(b).ok());
        let after = after.and_then(|a| serde_json::to_value(a).ok());
        self.changed_fields = changed_fields(before.as_ref(), after.as_ref());
        self.before = before;
        self.after = after;
        self
    }
}

/// Names of top-level object fields whose values differ between snapshots.
pub fn changed_fields(before: Option<&Value>, after: Option<&Value>) -> Vec<String> {
    let empty = serde_json::Map::new();
    let as_object = |v: Option<&Value>| match v {
        Some(Value::Object(map)) => map.clone(),
        _ => empty.clone(),
    };
    let before = as_object(before);
    let after = as_object(after);

    let mut fields: Vec<String> = before
        .keys()
        .chain(after.keys())
        .filter(|k| before.get(*k) != after.get(*k))
        .cloned()
        .collect();
    fields.sort();
    fields.dedup();
    fields
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    CommandDenied,
    BlacklistHit,
    RequestDecided,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub subject: FoldedName,
    pub kind: NotificationKind,
    pub message: String,
    pub command: Option<String>,
}

/// Audit trail and alerting. Fire-and-forget: implementations must not fail
/// the caller.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);

    fn notify(&self, notification: Notification);
}

/// Writes audit events to the `bastion::audit` target and notifications to
/// `bastion::notify`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        tracing::info!(
            target: "bastion::audit",
            subject = %event.subject,
            action = ?event.action,
            module = ?event.module,
            outcome = %event.outcome,
            event = %payload,
            "audit"
        );
    }

    fn notify(&self, notification: Notification) {
        tracing::warn!(
            target: "bastion::notify",
            subject = %notification.subject,
            kind = ?notification.kind,
            command = notification.command.as_deref().unwrap_or(""),
            "{}",
            notification.message
        );
    }
}

/// Keeps everything in memory. Used by tests to assert on the trail.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    notifications: Mutex<Vec<Notification>>,
}

impl MemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications
            .lock()
            .map(|n| n.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(e) => tracing::error!("audit sink: events lock poisoned: {e}"),
        }
    }

    fn notify(&self, notification: Notification) {
        match self.notifications.lock() {
            Ok(mut notifications) => notifications.push(notification),
            Err(e) => tracing::error!("audit sink: notifications lock poisoned: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn changed_fields_lists_differing_keys() {
        let before = json!({"name": "web", "deleted": false, "description": "x"});
        let after = json!({"name": "web", "deleted": true, "extra": 1, "description": "x"});
        assert_eq!(
            changed_fields(Some(&before), Some(&after)),
            vec!["deleted", "extra"]
        );
    }

    #[test]
    fn creation_changes_every_field() {
        let after = json!({"b": 1, "a": 2});
        assert_eq!(changed_fields(None, Some(&after)), vec!["a", "b"]);
    }

    #[test]
    fn memory_sink_collects() {
        let sink = MemoryAuditSink::default();
        let actor = Actor::new("Alice");
        sink.record(
            AuditEvent::new(&actor, ActionType::Authorize, Module::Cli, "allowed")
                .command("ls")
                .host(&FoldedName::new("h1")),
        );
        sink.notify(Notification {
            subject: actor.subject.clone(),
            kind: NotificationKind::CommandDenied,
            message: "unauthorized".into(),
            command: Some("rm".into()),
        });
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subject.as_str(), "alice");
        assert_eq!(sink.notifications().len(), 1);
    }
}
