//! Remote execution through the system `ssh`/`scp` binaries.
//!
//! `connect()` opens a ControlMaster socket so every later command of the run
//! reuses one authenticated connection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::process::Command;

use super::{quote, sudo_wrap, CommandOutput, CommandRunner, RemoteTarget, SshOptions};
use crate::error::{AppError, Result};

pub struct SshRunner {
    target: RemoteTarget,
    options: SshOptions,
    control_path: PathBuf,
    connected: AtomicBool,
}

impl SshRunner {
    pub fn new(target: RemoteTarget, options: SshOptions) -> Self {
        let socket = format!("{}-{}-{}.sock", target.user, target.host, target.port);
        let control_path = options.control_dir.join(socket);
        Self {
            target,
            options,
            control_path,
            connected: AtomicBool::new(false),
        }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
        ];
        if let Some(identity) = &self.target.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.extend(self.options.extra_args.iter().cloned());
        args
    }

    async fn run(program: &str, args: &[String]) -> CommandOutput {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        match cmd.output().await {
            Ok(output) => CommandOutput::from_process(&output),
            Err(e) => CommandOutput::spawn_failure(format!("Failed to spawn {}: {}", program, e)),
        }
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn connect(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(dir) = self.control_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| AppError::io(format!("Failed to create ssh control dir: {}", e)))?;
        }

        let mut args = self.base_args();
        args.extend([
            "-o".to_string(),
            "ControlMaster=yes".to_string(),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-p".to_string(),
            self.target.port.to_string(),
            "-fN".to_string(),
            self.target.destination(),
        ]);

        log::info!("Connecting to {}", self.target.destination());
        Self::run("ssh", &args)
            .await
            .check(&format!("connect to {}", self.target.destination()))?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut args = self.base_args();
        args.extend([
            "-O".to_string(),
            "exit".to_string(),
            "-p".to_string(),
            self.target.port.to_string(),
            self.target.destination(),
        ]);
        let output = Self::run("ssh", &args).await;
        if !output.success() {
            log::warn!(
                "Failed to close ssh control socket for {}: {}",
                self.target.destination(),
                output.stderr.trim()
            );
        }
        if self.control_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.control_path) {
                log::warn!("Failed to remove control socket {:?}: {}", self.control_path, e);
            }
        }
        Ok(())
    }

    async fn execute(&self, command: &str) -> CommandOutput {
        log::debug!("[{}] {}", self.target.destination(), command);
        let mut args = self.base_args();
        args.extend([
            "-p".to_string(),
            self.target.port.to_string(),
            self.target.destination(),
            "--".to_string(),
            format!("sh -c {}", quote(command)),
        ]);
        Self::run("ssh", &args).await
    }

    async fn execute_privileged(&self, command: &str) -> CommandOutput {
        if self.target.user == "root" {
            self.execute(command).await
        } else {
            self.execute(&sudo_wrap(command)).await
        }
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let mut args = self.base_args();
        args.extend([
            "-P".to_string(),
            self.target.port.to_string(),
            local.display().to_string(),
            format!("{}:{}", self.target.destination(), remote),
        ]);
        Self::run("scp", &args)
            .await
            .check(&format!("upload {}", local.display()))?;
        Ok(())
    }
}
