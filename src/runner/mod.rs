//! Command execution against the local machine or a remote host.
//!
//! Every runner captures non-zero exits (and spawn failures) into a
//! [`CommandOutput`] instead of returning an error, so orchestration code does
//! not care where it runs.

mod local;
mod ssh;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

pub use local::LocalRunner;
pub use ssh::SshRunner;

/// Exit code reported when a command could not be spawned at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -1;

/// Captured result of one shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub(crate) fn spawn_failure(message: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            exit_code: SPAWN_FAILURE_EXIT_CODE,
        }
    }

    pub(crate) fn from_process(output: &std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(SPAWN_FAILURE_EXIT_CODE),
        }
    }

    /// Turn a non-zero exit into an execution error naming `action`.
    pub fn check(self, action: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(AppError::execution(action, &self))
        }
    }

    /// Stdout and stderr joined, for diagnostics.
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

/// Where an instance is deployed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    #[default]
    Local,
    Remote(RemoteTarget),
}

impl Target {
    pub fn label(&self) -> String {
        match self {
            Self::Local => "local".to_string(),
            Self::Remote(remote) => remote.destination(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTarget {
    pub host: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: default_ssh_user(),
            port: default_ssh_port(),
            identity_file: None,
        }
    }

    /// `user@host` as accepted by ssh and scp.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Shell command execution on one target.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Open the transport. A no-op for local execution.
    async fn connect(&self) -> Result<()>;

    /// Close the transport. Safe to call when not connected.
    async fn disconnect(&self) -> Result<()>;

    /// Run a command through `sh -c` as the connecting user.
    async fn execute(&self, command: &str) -> CommandOutput;

    /// Run a command with root privileges (sudo when not already root).
    async fn execute_privileged(&self, command: &str) -> CommandOutput;

    /// Copy a local file to a path on the target.
    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;
}

/// Builds the runner for a target; swapped out in tests.
pub trait RunnerFactory: Send + Sync {
    fn runner_for(&self, target: &Target) -> Arc<dyn CommandRunner>;
}

/// Options applied to every ssh invocation.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub control_dir: PathBuf,
    pub connect_timeout: Duration,
    pub extra_args: Vec<String>,
}

/// Local processes for [`Target::Local`], ssh for [`Target::Remote`].
pub struct DefaultRunnerFactory {
    ssh: SshOptions,
}

impl DefaultRunnerFactory {
    pub fn new(ssh: SshOptions) -> Self {
        Self { ssh }
    }
}

impl RunnerFactory for DefaultRunnerFactory {
    fn runner_for(&self, target: &Target) -> Arc<dyn CommandRunner> {
        match target {
            Target::Local => Arc::new(LocalRunner::new()),
            Target::Remote(remote) => Arc::new(SshRunner::new(remote.clone(), self.ssh.clone())),
        }
    }
}

/// Quote a value for safe interpolation into a POSIX shell command.
pub fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | ':' | '=' | '@' | ','))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Wrap a command so it runs under `sudo` without prompting.
pub(crate) fn sudo_wrap(command: &str) -> String {
    format!("sudo -n sh -c {}", quote(command))
}
