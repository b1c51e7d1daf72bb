//! systemd unit rendering and lifecycle control.

use serde::Serialize;

use crate::config::write_remote_file;
use crate::error::Result;
use crate::payload::exec_start;
use crate::registry::Instance;
use crate::runner::{quote, CommandRunner};

const UNIT_DIR: &str = "/etc/systemd/system";

/// System account the payload process runs as.
pub const SERVICE_USER: &str = "homeport";

/// Inputs for [`render_unit_file`].
#[derive(Debug, Clone)]
pub struct UnitParams {
    pub description: String,
    pub working_dir: String,
    pub env_file: String,
    pub exec_start: String,
    pub user: String,
}

impl UnitParams {
    pub fn for_instance(instance: &Instance) -> Self {
        Self {
            description: format!("homeport: {}", instance.name),
            working_dir: instance.install_dir.clone(),
            env_file: instance.config_path.clone(),
            exec_start: exec_start(&instance.install_dir),
            user: SERVICE_USER.to_string(),
        }
    }
}

pub fn render_unit_file(params: &UnitParams) -> String {
    format!(
        "[Unit]\n\
         Description={description}\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         User={user}\n\
         WorkingDirectory={working_dir}\n\
         EnvironmentFile={env_file}\n\
         ExecStart={exec_start}\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         NoNewPrivileges=true\n\
         ProtectSystem=full\n\
         PrivateTmp=true\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        description = params.description,
        user = params.user,
        working_dir = params.working_dir,
        env_file = params.env_file,
        exec_start = params.exec_start,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Active,
    Activating,
    Deactivating,
    Inactive,
    Failed,
    Unknown,
}

impl ServiceState {
    fn parse(raw: &str) -> Self {
        match raw.trim() {
            "active" | "reloading" => Self::Active,
            "activating" => Self::Activating,
            "deactivating" => Self::Deactivating,
            "inactive" => Self::Inactive,
            "failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub enabled: bool,
    pub pid: Option<u32>,
    /// Time the unit last entered the active state, as reported by systemd.
    pub active_since: Option<String>,
    pub memory_bytes: Option<u64>,
    pub cpu_nanos: Option<u64>,
}

impl ServiceStatus {
    /// Parse `systemctl show --property=...` output.
    pub fn parse_show(output: &str) -> Self {
        let mut status = Self {
            state: ServiceState::Unknown,
            enabled: false,
            pid: None,
            active_since: None,
            memory_bytes: None,
            cpu_nanos: None,
        };
        for line in output.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "ActiveState" => status.state = ServiceState::parse(value),
                "UnitFileState" => status.enabled = value == "enabled",
                "MainPID" => status.pid = value.parse().ok().filter(|pid| *pid != 0),
                "ActiveEnterTimestamp" if !value.is_empty() => {
                    status.active_since = Some(value.to_string());
                }
                "MemoryCurrent" => status.memory_bytes = value.parse().ok(),
                "CPUUsageNSec" => status.cpu_nanos = value.parse().ok(),
                _ => {}
            }
        }
        status
    }
}

/// Controls one systemd unit on a target.
pub struct ServiceController<'a> {
    runner: &'a dyn CommandRunner,
    name: String,
}

impl<'a> ServiceController<'a> {
    pub fn new(runner: &'a dyn CommandRunner, name: impl Into<String>) -> Self {
        Self {
            runner,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit_path(&self) -> String {
        format!("{}/{}.service", UNIT_DIR, self.name)
    }

    async fn systemctl(&self, verb: &str) -> Result<()> {
        self.runner
            .execute_privileged(&format!("systemctl {} {}", verb, quote(&self.name)))
            .await
            .check(&format!("systemctl {} {}", verb, self.name))?;
        Ok(())
    }

    pub async fn status(&self) -> ServiceStatus {
        let output = self
            .runner
            .execute(&format!(
                "systemctl show {} --no-pager --property=ActiveState,UnitFileState,MainPID,ActiveEnterTimestamp,MemoryCurrent,CPUUsageNSec",
                quote(&self.name)
            ))
            .await;
        ServiceStatus::parse_show(&output.stdout)
    }

    pub async fn is_active(&self) -> bool {
        let output = self
            .runner
            .execute(&format!("systemctl is-active {}", quote(&self.name)))
            .await;
        output.success() && output.stdout.trim() == "active"
    }

    pub async fn start(&self) -> Result<()> {
        self.systemctl("start").await
    }

    pub async fn stop(&self) -> Result<()> {
        self.systemctl("stop").await
    }

    pub async fn restart(&self) -> Result<()> {
        self.systemctl("restart").await
    }

    pub async fn enable(&self) -> Result<()> {
        self.systemctl("enable").await
    }

    pub async fn disable(&self) -> Result<()> {
        self.systemctl("disable").await
    }

    /// Last `lines` journal lines for the unit; empty when unavailable.
    pub async fn logs(&self, lines: usize) -> String {
        let output = self
            .runner
            .execute_privileged(&format!(
                "journalctl -u {} -n {} --no-pager",
                quote(&self.name),
                lines
            ))
            .await;
        output.combined()
    }

    pub async fn install_unit(&self, params: &UnitParams) -> Result<()> {
        write_remote_file(self.runner, &self.unit_path(), &render_unit_file(params), "644").await?;
        self.runner
            .execute_privileged("systemctl daemon-reload")
            .await
            .check("systemctl daemon-reload")?;
        Ok(())
    }

    pub async fn unit_exists(&self) -> bool {
        self.runner
            .execute(&format!("test -f {}", quote(&self.unit_path())))
            .await
            .success()
    }

    pub async fn remove_unit(&self) -> Result<()> {
        self.runner
            .execute_privileged(&format!(
                "rm -f {} && systemctl daemon-reload",
                quote(&self.unit_path())
            ))
            .await
            .check("remove service unit")?;
        Ok(())
    }
}

/// Units on the host whose names start with `prefix`.
pub async fn list_units_with_prefix(runner: &dyn CommandRunner, prefix: &str) -> Result<Vec<String>> {
    let output = runner
        .execute(&format!(
            "systemctl list-unit-files {} --no-legend --no-pager --plain",
            quote(&format!("{}*.service", prefix))
        ))
        .await
        .check("list service units")?;
    Ok(output
        .stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|unit| unit.starts_with(prefix))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_instance, MockRunner};

    fn params() -> UnitParams {
        UnitParams::for_instance(&sample_instance("alpha", 8080, "alpha.example.com"))
    }

    #[test]
    fn unit_file_contains_runtime_settings() {
        let unit = render_unit_file(&params());
        assert!(unit.contains("WorkingDirectory=/opt/homeport/alpha\n"));
        assert!(unit.contains("EnvironmentFile=/etc/homeport/alpha.env\n"));
        assert!(unit.contains("ExecStart=/usr/bin/env node /opt/homeport/alpha/dist/index.js\n"));
        assert!(unit.contains("User=homeport\n"));
        assert!(unit.contains("Description=homeport: alpha\n"));
        assert!(unit.ends_with("WantedBy=multi-user.target\n"));
    }

    #[test]
    fn parses_systemctl_show() {
        let status = ServiceStatus::parse_show(
            "ActiveState=active\nUnitFileState=enabled\nMainPID=4242\nActiveEnterTimestamp=Mon 2026-10-19 10:00:00 UTC\nMemoryCurrent=1048576\nCPUUsageNSec=[not set]\n",
        );
        assert_eq!(status.state, ServiceState::Active);
        assert!(status.enabled);
        assert_eq!(status.pid, Some(4242));
        assert_eq!(status.memory_bytes, Some(1_048_576));
        assert_eq!(status.cpu_nanos, None);
        assert!(status.active_since.is_some());
    }

    #[tokio::test]
    async fn lifecycle_commands_are_privileged_systemctl_calls() {
        let runner = MockRunner::new();
        let service = ServiceController::new(&runner, "homeport-abc");
        service.restart().await.expect("restart");

        runner.respond("systemctl stop", 5, "");
        let err = service.stop().await.expect_err("stop fails");
        assert_eq!(err.get("exit_code"), Some("5"));
        assert!(runner.ran("systemctl restart homeport-abc"));
    }

    #[tokio::test]
    async fn lists_units_by_prefix() {
        let runner = MockRunner::new();
        runner.respond(
            "systemctl list-unit-files",
            0,
            "homeport-a.service enabled enabled\nhomeport-b.service disabled enabled\n",
        );
        let units = list_units_with_prefix(&runner, "homeport-").await.expect("list");
        assert_eq!(units, vec!["homeport-a.service", "homeport-b.service"]);
    }
}
