use std::sync::Arc;
use std::time::Duration;

use crate::admin::PolicyAdmin;
use crate::audit::{AuditSink, TracingAuditSink};
use crate::enforcement::Authorizer;
use crate::store::{
    GrantStore, HostDirectory, MemoryStore, PolicyAdminStore, PolicyStore, RequestStore,
};
use crate::tickets::{ChangeTicketResolver, NoTicketSystem};
use crate::time::{Clock, SystemClock};
use crate::workflow::ApprovalWorkflow;

/// Default bound on a single change-ticket lookup.
pub const DEFAULT_TICKET_TIMEOUT: Duration = Duration::from_secs(3);

/// The collaborators every engine component talks through.
#[derive(Clone)]
pub struct Backends {
    pub policy: Arc<dyn PolicyStore>,
    pub policy_admin: Arc<dyn PolicyAdminStore>,
    pub grants: Arc<dyn GrantStore>,
    pub requests: Arc<dyn RequestStore>,
    pub hosts: Arc<dyn HostDirectory>,
    pub tickets: Arc<dyn ChangeTicketResolver>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
}

impl Backends {
    /// Every store backed by one `MemoryStore`; no ticket system, tracing
    /// audit sink, and the system clock.
    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            policy: store.clone(),
            policy_admin: store.clone(),
            grants: store.clone(),
            requests: store.clone(),
            hosts: store,
            tickets: Arc::new(NoTicketSystem),
            audit: Arc::new(TracingAuditSink),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_tickets(mut self, tickets: Arc<dyn ChangeTicketResolver>) -> Self {
        self.tickets = tickets;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Authorizer, workflow, and admin surface over one set of backends.
pub struct Engine {
    pub authorizer: Authorizer,
    pub workflow: ApprovalWorkflow,
    pub admin: PolicyAdmin,
    backends: Backends,
}

impl Engine {
    pub fn new(backends: Backends, ticket_timeout: Duration) -> Self {
        Self {
            authorizer: Authorizer::new(&backends, ticket_timeout),
            workflow: ApprovalWorkflow::new(&backends),
            admin: PolicyAdmin::new(&backends),
            backends,
        }
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }
}
