//! Scripted runner and fixtures shared by unit tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{AppError, Result};
use crate::registry::Instance;
use crate::runner::{CommandOutput, CommandRunner, RunnerFactory, Target};
use crate::validation::slugify;

struct Rule {
    pattern: String,
    output: CommandOutput,
}

/// Records every command and answers from substring rules. The most
/// recently added matching rule wins; unmatched commands succeed silently.
#[derive(Default)]
pub(crate) struct MockRunner {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<String>>,
    uploads: Mutex<Vec<(PathBuf, String)>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    fail_connect: AtomicBool,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// A healthy Ubuntu host: every prerequisite present, plenty of disk,
    /// empty install directories, existing config files, services report
    /// active and every port check succeeds.
    pub fn healthy_host() -> Self {
        let runner = Self::new();
        runner.respond(
            "cat /etc/os-release",
            0,
            "ID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"24.04\"\nPRETTY_NAME=\"Ubuntu 24.04 LTS\"\n",
        );
        runner.respond("df -Pm", 0, "40960\n");
        runner.respond("systemctl is-active", 0, "active\n");
        runner.respond("ls -A", 1, "");
        runner.respond("then echo present", 0, "present\n");
        runner
    }

    pub fn respond(&self, pattern: &str, exit_code: i32, stdout: &str) {
        self.lock_rules().push(Rule {
            pattern: pattern.to_string(),
            output: CommandOutput {
                stdout: stdout.to_string(),
                stderr: if exit_code == 0 {
                    String::new()
                } else {
                    format!("{} failed", pattern)
                },
                exit_code,
            },
        });
    }

    pub fn fail_connect(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.commands().iter().any(|c| c.contains(needle))
    }

    pub fn count(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }

    /// Index of the first command containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.contains(needle))
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.uploads.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    fn lock_rules(&self) -> std::sync::MutexGuard<'_, Vec<Rule>> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn answer(&self, command: &str) -> CommandOutput {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command.to_string());
        self.lock_rules()
            .iter()
            .rev()
            .find(|rule| command.contains(&rule.pattern))
            .map(|rule| rule.output.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(AppError::network("connection refused"));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, command: &str) -> CommandOutput {
        self.answer(command)
    }

    async fn execute_privileged(&self, command: &str) -> CommandOutput {
        self.answer(command)
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((local.to_path_buf(), remote.to_string()));
        let output = self.answer(&format!("upload {}", remote));
        if output.success() {
            Ok(())
        } else {
            Err(AppError::execution("upload", &output))
        }
    }
}

/// Hands out the same scripted runner for every target.
pub(crate) struct MockFactory(pub Arc<MockRunner>);

impl RunnerFactory for MockFactory {
    fn runner_for(&self, _target: &Target) -> Arc<dyn CommandRunner> {
        Arc::clone(&self.0) as Arc<dyn CommandRunner>
    }
}

pub(crate) fn sample_instance(name: &str, port: u16, domain: &str) -> Instance {
    let now = Utc::now();
    let slug = slugify(name);
    Instance {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        port,
        domain: domain.to_string(),
        tls: true,
        version: "1.0.0".to_string(),
        target: Target::Local,
        install_dir: format!("/opt/homeport/{}", slug),
        config_path: format!("/etc/homeport/{}.env", slug),
        created_at: now,
        updated_at: now,
        update_history: Vec::new(),
        backups: Vec::new(),
    }
}

/// Write a minimal built payload (descriptor plus compiled entry point).
pub(crate) fn write_payload(dir: &Path, version: &str) {
    fs::create_dir_all(dir.join("dist")).expect("create payload dist");
    fs::write(
        dir.join("package.json"),
        format!("{{\"name\":\"homeport-server\",\"version\":\"{}\"}}", version),
    )
    .expect("write descriptor");
    fs::write(dir.join("dist/index.js"), "console.log('up')\n").expect("write entry point");
}
