pub mod ssh;

use std::marker::PhantomData;

use async_trait::async_trait;

use crate::enforcement::capability::ExecutionToken;
use crate::error::BastionError;
use crate::model::FoldedName;

pub use ssh::SshExecutor;

/// Typestate: command requested by an operator, not yet evaluated.
pub struct Proposed;

/// Typestate: the authorizer has evaluated this invocation.
pub struct Evaluated;

/// A command invocation progressing through enforcement.
///
/// `CommandInvocation<Proposed>` → `Authorizer::evaluate` → `CommandInvocation<Evaluated>`
///
/// `execute()` only exists on `Evaluated`, and only with a token.
pub struct CommandInvocation<State> {
    pub(crate) host: FoldedName,
    pub(crate) command: String,
    _state: PhantomData<State>,
}

impl<State> CommandInvocation<State> {
    pub fn host(&self) -> &FoldedName {
        &self.host
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

impl CommandInvocation<Proposed> {
    pub fn new(host: &str, command: &str) -> Self {
        Self {
            host: FoldedName::new(host),
            command: command.trim().to_owned(),
            _state: PhantomData,
        }
    }

    /// Only the authorizer moves an invocation forward.
    pub(crate) fn transition(self) -> CommandInvocation<Evaluated> {
        CommandInvocation {
            host: self.host,
            command: self.command,
            _state: PhantomData,
        }
    }
}

impl CommandInvocation<Evaluated> {
    /// Run on the remote host. The token is consumed and must have been
    /// issued for exactly this host and command.
    pub async fn execute(
        self,
        executor: &dyn RemoteExecutor,
        token: ExecutionToken,
    ) -> Result<ExecutionOutput, BastionError> {
        if token.host() != &self.host || token.command() != self.command {
            return Err(BastionError::Execution(format!(
                "token issued for `{}` on {}, not `{}` on {}",
                token.command(),
                token.host(),
                self.command,
                self.host
            )));
        }
        tracing::info!(
            host = %self.host,
            command = %self.command,
            suspended_override = token.suspended_override(),
            "executing"
        );
        executor.execute(&self.host, &self.command, token).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Transport that runs an authorized command on a host.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(
        &self,
        host: &FoldedName,
        command: &str,
        token: ExecutionToken,
    ) -> Result<ExecutionOutput, BastionError>;
}
