//! Time-boxed command access for shared hosts.
//!
//! Subjects hold [`model::AccessGrant`]s naming hosts and commands. The
//! [`enforcement::Authorizer`] answers "may this subject run this command on
//! this host right now", and lists what a subject may run on a host. New
//! grants come out of the multi-level [`workflow::ApprovalWorkflow`].
//!
//! Remote execution is gated by a sealed
//! [`enforcement::capability::ExecutionToken`] that only the authorizer mints.

pub mod admin;
pub mod audit;
pub mod config;
pub mod enforcement;
pub mod engine;
pub mod error;
pub mod exec;
pub mod model;
pub mod protect;
pub mod store;
pub mod tickets;
pub mod time;
pub mod workflow;

pub use engine::{Backends, Engine};
pub use error::{BastionError, ConflictReason};
