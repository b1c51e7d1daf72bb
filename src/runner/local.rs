//! Local process execution.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use super::{sudo_wrap, CommandOutput, CommandRunner};
use crate::error::{AppError, Result};

/// Runs commands on the machine hosting the launcher.
pub struct LocalRunner {
    is_root: bool,
}

impl LocalRunner {
    pub fn new() -> Self {
        Self {
            is_root: running_as_root(),
        }
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

pub(crate) async fn run_shell(command: &str) -> CommandOutput {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);

    match cmd.output().await {
        Ok(output) => CommandOutput::from_process(&output),
        Err(e) => CommandOutput::spawn_failure(format!("Failed to spawn shell: {}", e)),
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, command: &str) -> CommandOutput {
        log::debug!("[local] {}", command);
        run_shell(command).await
    }

    async fn execute_privileged(&self, command: &str) -> CommandOutput {
        if self.is_root {
            self.execute(command).await
        } else {
            log::debug!("[local sudo] {}", command);
            run_shell(&sudo_wrap(command)).await
        }
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let dest = Path::new(remote);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::io(format!("Failed to create {:?}: {}", parent, e)))?;
        }
        tokio::fs::copy(local, dest)
            .await
            .map_err(|e| AppError::io(format!("Failed to copy {:?} to {}: {}", local, remote, e)))?;
        Ok(())
    }
}
