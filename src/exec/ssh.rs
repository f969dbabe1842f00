use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use super::{ExecutionOutput, RemoteExecutor};
use crate::enforcement::capability::ExecutionToken;
use crate::error::BastionError;
use crate::model::FoldedName;

/// Runs commands through the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    program: String,
    options: Vec<String>,
    user: Option<String>,
    timeout: Duration,
}

impl SshExecutor {
    pub fn new(options: Vec<String>, user: Option<String>, timeout: Duration) -> Self {
        Self {
            program: "ssh".to_owned(),
            options,
            user,
            timeout,
        }
    }

    /// Swap the client binary. Tests point this at a local stand-in.
    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_owned();
        self
    }

    fn destination(&self, host: &FoldedName) -> String {
        match &self.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        }
    }

    fn build(&self, host: &FoldedName, command: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.options)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(self.destination(host))
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(
        &self,
        host: &FoldedName,
        command: &str,
        _token: ExecutionToken,
    ) -> Result<ExecutionOutput, BastionError> {
        let child = self
            .build(host, command)
            .spawn()
            .map_err(|e| BastionError::Execution(format!("failed to spawn {}: {e}", self.program)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                BastionError::Execution(format!(
                    "{command} on {host} timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| BastionError::Execution(format!("{command} on {host}: {e}")))?;

        Ok(ExecutionOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
