//! Provisioning a new instance as an ordered sequence of steps.
//!
//! Each step moves in-progress -> completed/failed/skipped. The first hard
//! failure stops the run, triggers best-effort cleanup of whatever the run
//! created, and becomes the result. The transport is always disconnected.

mod cleanup;
mod steps;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub use steps::{required_prerequisites, InstallStep};

use crate::config::Settings;
use crate::conflict::ConflictGuard;
use crate::error::{AppError, Result};
use crate::events::{EventBus, Operation, StepRecord, StepRecorder};
use crate::host::ddns::DdnsOptions;
use crate::host::os::OsInfo;
use crate::host::packages::Prerequisite;
use crate::locator::ResourceLocator;
use crate::paths::HostLayout;
use crate::registry::{Instance, Registry};
use crate::runner::{CommandRunner, Target};
use crate::validation::slugify;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallFeatures {
    #[serde(default = "enabled")]
    pub firewall: bool,
    #[serde(default = "enabled")]
    pub intrusion_prevention: bool,
    #[serde(default = "enabled")]
    pub reverse_proxy: bool,
    #[serde(default = "enabled")]
    pub tls: bool,
    #[serde(default = "enabled")]
    pub initial_backup: bool,
    #[serde(default)]
    pub dynamic_dns: Option<DdnsOptions>,
}

fn enabled() -> bool {
    true
}

impl Default for InstallFeatures {
    fn default() -> Self {
        Self {
            firewall: true,
            intrusion_prevention: true,
            reverse_proxy: true,
            tls: true,
            initial_backup: true,
            dynamic_dns: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallOptions {
    pub name: String,
    pub port: u16,
    pub domain: String,
    #[serde(default)]
    pub target: Target,
    #[serde(default)]
    pub features: InstallFeatures,
    #[serde(default)]
    pub tls_email: Option<String>,
    /// Values written over the generated service config.
    #[serde(default)]
    pub config_overrides: BTreeMap<String, String>,
    /// Make this the default instance even if one is already set.
    #[serde(default)]
    pub make_default: bool,
}

impl InstallOptions {
    pub fn new(name: impl Into<String>, port: u16, domain: impl Into<String>, target: Target) -> Self {
        Self {
            name: name.into(),
            port,
            domain: domain.into(),
            target,
            features: InstallFeatures::default(),
            tls_email: None,
            config_overrides: BTreeMap::new(),
            make_default: false,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.features.tls && !self.features.reverse_proxy {
            return Err(AppError::validation("TLS requires the reverse proxy feature"));
        }
        if let Some(ddns) = &self.features.dynamic_dns {
            ddns.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    pub run_id: String,
    pub success: bool,
    pub instance: Option<Instance>,
    pub steps: Vec<StepRecord>,
    pub error: Option<AppError>,
}

/// What a run has put on the host so far.
#[derive(Debug, Default)]
pub(crate) struct Artifacts {
    pub connected: bool,
    pub payload_started: bool,
    pub config_written: bool,
    pub unit_installed: bool,
    pub proxy_site: bool,
    pub ddns_cron: bool,
    pub registered: bool,
}

/// Per-run state threaded through every step.
pub(crate) struct InstallRun {
    pub runner: Arc<dyn CommandRunner>,
    pub options: InstallOptions,
    pub recorder: StepRecorder,
    pub instance: Instance,
    pub os: Option<OsInfo>,
    pub missing: Vec<Prerequisite>,
    pub staging_dir: PathBuf,
    pub artifacts: Artifacts,
}

pub struct Installer<'a> {
    registry: &'a Registry,
    settings: &'a Settings,
    locator: &'a ResourceLocator,
    bus: &'a EventBus,
    staging_root: &'a Path,
}

impl<'a> Installer<'a> {
    pub fn new(
        registry: &'a Registry,
        settings: &'a Settings,
        locator: &'a ResourceLocator,
        bus: &'a EventBus,
        staging_root: &'a Path,
    ) -> Self {
        Self {
            registry,
            settings,
            locator,
            bus,
            staging_root,
        }
    }

    fn draft_instance(&self, options: &InstallOptions) -> Instance {
        let id = uuid::Uuid::new_v4().to_string();
        let layout = HostLayout::new(
            &self.settings.install_root,
            &self.settings.config_root,
            &slugify(&options.name),
        );
        let now = Utc::now();
        Instance {
            id,
            name: options.name.trim().to_string(),
            port: options.port,
            domain: options.domain.trim().to_ascii_lowercase(),
            tls: options.features.tls,
            version: String::new(),
            target: options.target.clone(),
            install_dir: layout.install_dir,
            config_path: layout.config_path,
            created_at: now,
            updated_at: now,
            update_history: Vec::new(),
            backups: Vec::new(),
        }
    }

    /// Validate and provision. Only pre-flight problems (bad input or a
    /// name/port/domain conflict) are returned as `Err`; everything after
    /// that is reported through the [`InstallReport`].
    pub async fn install(&self, runner: Arc<dyn CommandRunner>, options: InstallOptions) -> Result<InstallReport> {
        options.validate()?;
        ConflictGuard::for_target(self.registry, &options.target).validate(
            &options.name,
            options.port,
            &options.domain,
            None,
        )?;

        let instance = self.draft_instance(&options);
        let mut recorder = StepRecorder::new(
            self.bus.clone(),
            Operation::Install,
            Some(instance.id.clone()),
            InstallStep::ALL.len(),
        );
        recorder.set_instance_id(&instance.id);
        let staging_dir = self.staging_root.join(recorder.run_id());
        tokio::fs::create_dir_all(&staging_dir).await?;

        let mut run = InstallRun {
            runner,
            options,
            recorder,
            instance,
            os: None,
            missing: Vec::new(),
            staging_dir,
            artifacts: Artifacts::default(),
        };

        log::info!(
            "Installing {} on {} (run {})",
            run.instance.name,
            run.instance.target.label(),
            run.recorder.run_id()
        );

        let mut failure = None;
        for (index, step) in InstallStep::ALL.into_iter().enumerate() {
            let name = step.as_str();
            if !step.enabled(&run.options.features) {
                run.recorder.skip(name, index, "Disabled by feature flag");
                continue;
            }

            run.recorder.begin(name, index, Self::describe(step));
            match self.run_step(step, &mut run).await {
                Ok(message) => run.recorder.complete(name, index, message),
                Err(e) if step.is_tolerated() => {
                    log::warn!("{} failed, continuing: {}", name, e);
                    run.recorder.skip_with_error(name, index, "Failed, continuing", &e);
                }
                Err(e) => {
                    run.recorder.fail(name, index, &e);
                    failure = Some(e);
                    break;
                }
            }
        }

        if failure.is_some() {
            self.cleanup_failed(&run).await;
            steps::remove_staging_dir(&run).await;
        }
        if let Err(e) = run.runner.disconnect().await {
            log::warn!("Failed to disconnect from {}: {}", run.instance.target.label(), e);
        }

        let success = failure.is_none();
        run.recorder.finish(success);
        Ok(InstallReport {
            run_id: run.recorder.run_id().to_string(),
            success,
            instance: success.then_some(run.instance),
            steps: run.recorder.into_records(),
            error: failure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LivenessSettings;
    use crate::error::ErrorKind;
    use crate::events::{ProgressEvent, StepStatus};
    use crate::locator::LocatorContext;
    use crate::testing::{sample_instance, write_payload, MockRunner};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        registry: Registry,
        settings: Settings,
        locator: ResourceLocator,
        bus: EventBus,
        staging: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().expect("tempdir");
        let payload = tmp.path().join("payload");
        write_payload(&payload, "1.0.0");
        let locator = ResourceLocator::new(
            LocatorContext {
                payload_dir: Some(payload),
                ..LocatorContext::default()
            },
            tmp.path(),
            "",
        );
        let settings = Settings {
            liveness: LivenessSettings {
                attempts: 2,
                interval_ms: 0,
            },
            ..Settings::default()
        };
        Fixture {
            registry: Registry::open(tmp.path().join("registry.json")),
            staging: tmp.path().join("staging"),
            settings,
            locator,
            bus: EventBus::new(),
            _tmp: tmp,
        }
    }

    impl Fixture {
        fn installer(&self) -> Installer<'_> {
            Installer::new(&self.registry, &self.settings, &self.locator, &self.bus, &self.staging)
        }
    }

    fn status_of(report: &InstallReport, step: InstallStep) -> Option<StepStatus> {
        report
            .steps
            .iter()
            .rev()
            .find(|r| r.step == step.as_str())
            .map(|r| r.status)
    }

    fn options() -> InstallOptions {
        InstallOptions::new("Alpha", 8080, "alpha.example.com", Target::Local)
    }

    #[tokio::test]
    async fn successful_install_registers_and_sets_default() {
        let fx = fixture();
        let runner = Arc::new(MockRunner::healthy_host());
        let report = fx
            .installer()
            .install(runner.clone(), options())
            .await
            .expect("preflight");

        assert!(report.success, "{:?}", report.error);
        let instance = report.instance.expect("instance");
        assert_eq!(instance.version, "1.0.0");
        assert_eq!(instance.install_dir, "/opt/homeport/alpha");
        assert_eq!(instance.backups.len(), 1);

        let stored = fx.registry.get(&instance.id).expect("registered");
        assert_eq!(stored.update_history.len(), 1);
        assert_eq!(
            fx.registry.default_instance().expect("load").map(|i| i.id),
            Some(instance.id.clone())
        );
        assert_eq!(status_of_last(&report.steps), Some(("COMPLETE", StepStatus::Completed)));
        assert_eq!(runner.disconnects(), 1);
        assert!(runner.ran("certbot --nginx"));
        assert!(!fx.staging.join(&report.run_id).exists());
    }

    fn status_of_last(steps: &[StepRecord]) -> Option<(&str, StepStatus)> {
        steps.last().map(|r| (r.step.as_str(), r.status))
    }

    #[tokio::test]
    async fn disabled_features_are_skipped_without_commands() {
        let fx = fixture();
        let runner = Arc::new(MockRunner::healthy_host());
        let mut options = options();
        options.features.firewall = false;
        options.features.tls = false;

        let report = fx
            .installer()
            .install(runner.clone(), options)
            .await
            .expect("preflight");

        assert!(report.success, "{:?}", report.error);
        assert_eq!(status_of(&report, InstallStep::SetupFirewall), Some(StepStatus::Skipped));
        assert_eq!(status_of(&report, InstallStep::SetupTls), Some(StepStatus::Skipped));
        assert!(!runner.ran("ufw"));
        assert!(!runner.ran("certbot"));
        assert!(runner.ran("nginx -t"));
    }

    #[tokio::test]
    async fn conflict_fails_before_connecting() {
        let fx = fixture();
        fx.registry
            .create(sample_instance("other", 8080, "other.example.com"))
            .expect("seed");
        let runner = Arc::new(MockRunner::healthy_host());

        let err = fx
            .installer()
            .install(runner.clone(), options())
            .await
            .expect_err("port conflict");
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.get("field"), Some("port"));
        assert_eq!(runner.connects(), 0);
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn not_listening_fails_and_cleans_up() {
        let fx = fixture();
        let runner = Arc::new(MockRunner::healthy_host());
        runner.respond("grep -Eq", 1, "");
        runner.respond("test -f /opt/homeport/alpha/dist/index.js", 1, "");

        let report = fx
            .installer()
            .install(runner.clone(), options())
            .await
            .expect("preflight");

        assert!(!report.success);
        let error = report.error.as_ref().expect("error");
        assert_eq!(error.kind(), ErrorKind::ServiceNotListening);
        assert_eq!(status_of(&report, InstallStep::Verify), Some(StepStatus::Failed));
        assert!(status_of(&report, InstallStep::RegisterInstance).is_none());

        assert!(fx.registry.list().expect("list").is_empty());
        assert!(runner.ran("rm -f /etc/homeport/alpha.env"));
        assert!(runner.ran("systemctl stop homeport-"));
        assert!(runner.ran("rm -f /etc/systemd/system/homeport-"));
        assert!(runner.ran("rm -rf /opt/homeport/alpha"));
        assert_eq!(runner.disconnects(), 1);
    }

    #[tokio::test]
    async fn complete_payload_dir_survives_cleanup() {
        let fx = fixture();
        let runner = Arc::new(MockRunner::healthy_host());
        runner.respond("systemctl start", 1, "");

        let report = fx
            .installer()
            .install(runner.clone(), options())
            .await
            .expect("preflight");

        assert!(!report.success);
        assert_eq!(status_of(&report, InstallStep::StartService), Some(StepStatus::Failed));
        assert!(!runner.ran("rm -rf /opt/homeport/alpha"));
    }

    #[tokio::test]
    async fn connect_failure_still_disconnects() {
        let fx = fixture();
        let runner = Arc::new(MockRunner::healthy_host());
        runner.fail_connect();

        let report = fx
            .installer()
            .install(runner.clone(), options())
            .await
            .expect("preflight");

        assert!(!report.success);
        assert_eq!(status_of(&report, InstallStep::Connect), Some(StepStatus::Failed));
        assert_eq!(report.steps.len(), 2);
        assert_eq!(runner.disconnects(), 1);
    }

    #[tokio::test]
    async fn backup_failure_is_tolerated() {
        let fx = fixture();
        let runner = Arc::new(MockRunner::healthy_host());
        runner.respond("tar -czf", 1, "");

        let report = fx
            .installer()
            .install(runner.clone(), options())
            .await
            .expect("preflight");

        assert!(report.success);
        let backup = report
            .steps
            .iter()
            .rev()
            .find(|r| r.step == "CREATE_INITIAL_BACKUP")
            .expect("record");
        assert_eq!(backup.status, StepStatus::Skipped);
        assert!(backup.error.is_some());
        assert_eq!(fx.registry.list().expect("list").len(), 1);
    }

    #[tokio::test]
    async fn registration_failure_is_tolerated() {
        let mut fx = fixture();
        let blocker = fx._tmp.path().join("blocker");
        std::fs::write(&blocker, "not a directory").expect("write");
        fx.registry = Registry::open(blocker.join("registry.json"));
        let runner = Arc::new(MockRunner::healthy_host());

        let report = fx
            .installer()
            .install(runner.clone(), options())
            .await
            .expect("preflight");

        assert!(report.success, "{:?}", report.error);
        assert!(report.instance.is_some());
        let register = report
            .steps
            .iter()
            .rev()
            .find(|r| r.step == "REGISTER_INSTANCE")
            .expect("record");
        assert_eq!(register.status, StepStatus::Skipped);
        assert!(register.error.is_some());
        assert_eq!(status_of(&report, InstallStep::Complete), Some(StepStatus::Completed));
        assert!(!runner.ran("rm -f /etc/homeport/alpha.env"));
        assert_eq!(runner.disconnects(), 1);
    }

    #[tokio::test]
    async fn progress_events_are_published() {
        let fx = fixture();
        let mut events = fx.bus.subscribe();
        let runner = Arc::new(MockRunner::healthy_host());
        fx.installer()
            .install(runner, options())
            .await
            .expect("preflight");

        let mut finished = false;
        let mut last_progress = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                ProgressEvent::Step { record, .. } => {
                    assert!(record.progress >= last_progress || record.status == StepStatus::InProgress);
                    last_progress = record.progress;
                }
                ProgressEvent::Finished { success, .. } => finished = success,
            }
        }
        assert!(finished);
        assert_eq!(last_progress, 100);
    }
}
