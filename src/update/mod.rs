//! Moving an installed instance to another payload version.
//!
//! Failures before the payload files are replaced leave the instance as it
//! was (the service is started again if this run stopped it). Once the
//! files have been replaced, any failure triggers an automatic rollback
//! before the original error is reported.

mod check;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use check::{check_for_updates, current_version, UpdateInfo};

use crate::backup::{instance_backup_dir, BackupManager};
use crate::config::{ConfigStore, SaveOptions, Settings};
use crate::conflict::ConflictGuard;
use crate::error::{AppError, Result};
use crate::events::{EventBus, Operation, StepRecord, StepRecorder};
use crate::host;
use crate::paths::{join_remote, old_snapshot_dir};
use crate::payload::{self, DATA_DIR};
use crate::registry::{BackupKind, HistoryEntry, HistoryKind, Instance, Registry};
use crate::release::ReleaseCatalog;
use crate::rollback::{RollbackEngine, RollbackMethod, RollbackOptions};
use crate::runner::{quote, CommandRunner};
use crate::service::{ServiceController, UnitParams, SERVICE_USER};
use crate::verify::verify_liveness;
use crate::version::{compare, VersionVerdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStep {
    Validate,
    CreateBackup,
    StopService,
    UpdateFiles,
    InstallDependencies,
    UpdateConfig,
    RestartService,
    Verify,
    UpdateRegistry,
    Cleanup,
}

impl UpdateStep {
    pub const ALL: [UpdateStep; 10] = [
        Self::Validate,
        Self::CreateBackup,
        Self::StopService,
        Self::UpdateFiles,
        Self::InstallDependencies,
        Self::UpdateConfig,
        Self::RestartService,
        Self::Verify,
        Self::UpdateRegistry,
        Self::Cleanup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "VALIDATE",
            Self::CreateBackup => "CREATE_BACKUP",
            Self::StopService => "STOP_SERVICE",
            Self::UpdateFiles => "UPDATE_FILES",
            Self::InstallDependencies => "INSTALL_DEPENDENCIES",
            Self::UpdateConfig => "UPDATE_CONFIG",
            Self::RestartService => "RESTART_SERVICE",
            Self::Verify => "VERIFY",
            Self::UpdateRegistry => "UPDATE_REGISTRY",
            Self::Cleanup => "CLEANUP",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Validate => "Checking instance, disk space and target version",
            Self::CreateBackup => "Backing up current payload",
            Self::StopService => "Stopping service",
            Self::UpdateFiles => "Replacing payload files",
            Self::InstallDependencies => "Installing dependencies",
            Self::UpdateConfig => "Merging new config variables",
            Self::RestartService => "Starting service",
            Self::Verify => "Verifying service",
            Self::UpdateRegistry => "Recording new version",
            Self::Cleanup => "Cleaning up",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOptions {
    /// Defaults to the catalog's newest release.
    #[serde(default)]
    pub target_version: Option<String>,
    #[serde(default)]
    pub skip_backup: bool,
    /// Reinstall the same version, or move to an older one.
    #[serde(default)]
    pub force_update: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// Keep the previous payload as a `.old` sibling after success.
    #[serde(default)]
    pub keep_old_files: bool,
    #[serde(default = "default_true")]
    pub restart_service: bool,
}

fn default_true() -> bool {
    true
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            target_version: None,
            skip_backup: false,
            force_update: false,
            dry_run: false,
            keep_old_files: false,
            restart_service: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    Updated,
    AlreadyCurrent,
    DryRun,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReport {
    pub run_id: String,
    pub success: bool,
    pub outcome: UpdateOutcome,
    pub from_version: String,
    pub to_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<Instance>,
    pub steps: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
    /// Set when a failed update was automatically rolled back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolled_back: Option<RollbackMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
}

/// Per-run state threaded through every step.
struct UpdateRun {
    runner: Arc<dyn CommandRunner>,
    options: UpdateOptions,
    recorder: StepRecorder,
    instance: Instance,
    from_version: String,
    to_version: Option<String>,
    payload_dir: Option<PathBuf>,
    backup_id: Option<String>,
    staging_dir: PathBuf,
    /// Set before connecting so a half-open transport is still torn down.
    connect_attempted: bool,
    service_stopped: bool,
    files_updated: bool,
    early_exit: Option<UpdateOutcome>,
}

pub struct UpdateOrchestrator<'a> {
    registry: &'a Registry,
    settings: &'a Settings,
    catalog: &'a dyn ReleaseCatalog,
    bus: &'a EventBus,
    staging_root: &'a Path,
}

impl<'a> UpdateOrchestrator<'a> {
    pub fn new(
        registry: &'a Registry,
        settings: &'a Settings,
        catalog: &'a dyn ReleaseCatalog,
        bus: &'a EventBus,
        staging_root: &'a Path,
    ) -> Self {
        Self {
            registry,
            settings,
            catalog,
            bus,
            staging_root,
        }
    }

    /// Update instance `id`. An unknown id is returned as `Err`; every
    /// other problem is reported through the [`UpdateReport`].
    pub async fn update(
        &self,
        runner: Arc<dyn CommandRunner>,
        id: &str,
        options: UpdateOptions,
    ) -> Result<UpdateReport> {
        let instance = self.registry.get(id)?;
        let recorder = StepRecorder::new(
            self.bus.clone(),
            Operation::Update,
            Some(instance.id.clone()),
            UpdateStep::ALL.len(),
        );
        let staging_dir = self.staging_root.join(recorder.run_id());

        let mut run = UpdateRun {
            runner,
            options,
            recorder,
            from_version: instance.version.clone(),
            instance,
            to_version: None,
            payload_dir: None,
            backup_id: None,
            staging_dir,
            connect_attempted: false,
            service_stopped: false,
            files_updated: false,
            early_exit: None,
        };
        log::info!("Updating {} (run {})", run.instance.name, run.recorder.run_id());

        let mut failure = None;
        let steps = UpdateStep::ALL;
        for (index, step) in steps.into_iter().enumerate() {
            let name = step.as_str();
            if let Some(reason) = skip_reason(step, &run.options) {
                run.recorder.skip(name, index, reason);
                continue;
            }

            run.recorder.begin(name, index, step.description());
            match self.run_step(step, &mut run).await {
                Ok(message) => run.recorder.complete(name, index, message),
                Err(e) if step == UpdateStep::Cleanup => {
                    log::warn!("{} failed, continuing: {}", name, e);
                    run.recorder.skip_with_error(name, index, "Failed, continuing", &e);
                }
                Err(e) => {
                    run.recorder.fail(name, index, &e);
                    failure = Some(e);
                    break;
                }
            }

            if let Some(outcome) = run.early_exit {
                for (rest, later) in steps.into_iter().enumerate().skip(index + 1) {
                    match outcome {
                        UpdateOutcome::DryRun => run.recorder.pending(later.as_str(), rest, "Would run"),
                        _ => run.recorder.skip(later.as_str(), rest, "Already up to date"),
                    }
                }
                break;
            }
        }

        let mut rolled_back = None;
        if let Some(e) = &failure {
            rolled_back = self.recover(&run, e).await;
        }
        if run.connect_attempted {
            if let Err(e) = run.runner.disconnect().await {
                log::warn!("Failed to disconnect from {}: {}", run.instance.target.label(), e);
            }
        }
        if run.staging_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&run.staging_dir).await {
                log::warn!("Failed to remove staging dir {:?}: {}", run.staging_dir, e);
            }
        }

        let success = failure.is_none();
        let outcome = match (success, run.early_exit) {
            (false, _) => UpdateOutcome::Failed,
            (true, Some(outcome)) => outcome,
            (true, None) => UpdateOutcome::Updated,
        };
        run.recorder.finish(success);
        Ok(UpdateReport {
            run_id: run.recorder.run_id().to_string(),
            success,
            outcome,
            from_version: run.from_version,
            to_version: run.to_version,
            instance: success.then_some(run.instance),
            steps: run.recorder.into_records(),
            error: failure,
            rolled_back,
            backup_id: run.backup_id,
        })
    }

    /// Undo what a failed run did. Errors here are logged and never replace
    /// the update's own error.
    async fn recover(&self, run: &UpdateRun, error: &AppError) -> Option<RollbackMethod> {
        let runner = run.runner.as_ref();
        if run.files_updated {
            log::warn!("Update of {} failed after replacing files, rolling back: {}", run.instance.name, error);
            let mut current = run.instance.clone();
            if let Some(to) = &run.to_version {
                current.version = to.clone();
            }
            let options = RollbackOptions {
                backup_id: run.backup_id.clone(),
                use_fast_rollback: true,
                restart_service: run.service_stopped || run.options.restart_service,
            };
            let engine = RollbackEngine::new(self.registry, self.settings, self.bus);
            return match engine.rollback_instance(runner, &current, &options).await {
                Ok(result) => {
                    log::info!(
                        "Rolled back {} to {} ({:?})",
                        run.instance.name,
                        result.rolled_back_to_version,
                        result.method
                    );
                    Some(result.method)
                }
                Err(e) => {
                    log::error!("Automatic rollback of {} failed: {}", run.instance.name, e);
                    None
                }
            };
        }

        if run.service_stopped {
            let service = ServiceController::new(runner, run.instance.service_name());
            if let Err(e) = service.start().await {
                log::error!("Failed to restart {} after failed update: {}", service.name(), e);
            }
        }
        None
    }

    async fn run_step(&self, step: UpdateStep, run: &mut UpdateRun) -> Result<String> {
        let runner = run.runner.clone();
        let runner = runner.as_ref();
        let service = ServiceController::new(runner, run.instance.service_name());
        let install_dir = run.instance.install_dir.clone();

        match step {
            UpdateStep::Validate => self.validate(runner, run).await,
            UpdateStep::CreateBackup => {
                let manager =
                    BackupManager::new(runner, instance_backup_dir(&self.settings.backup_root, &run.instance.id));
                let entry = manager
                    .create(&install_dir, BackupKind::PreUpdate, &run.from_version)
                    .await?;
                let backup_id = entry.id.clone();
                let instance = self.registry.add_backup(&run.instance.id, entry)?;
                for pruned in manager.prune(&instance, self.settings.max_backups).await {
                    self.registry.remove_backup(&instance.id, &pruned)?;
                }
                run.instance = self.registry.get(&instance.id)?;
                run.backup_id = Some(backup_id.clone());
                Ok(format!("Backup {} created", backup_id))
            }
            UpdateStep::StopService => {
                if !service.is_active().await {
                    return Ok("Service was not running".to_string());
                }
                service.stop().await?;
                run.service_stopped = true;
                Ok(format!("Stopped {}", service.name()))
            }
            UpdateStep::UpdateFiles => {
                let payload_dir = run
                    .payload_dir
                    .clone()
                    .ok_or_else(|| AppError::other("Target payload was not fetched"))?;
                self.replace_files(runner, run, &payload_dir).await?;
                Ok(format!(
                    "Deployed {} to {}",
                    run.to_version.as_deref().unwrap_or_default(),
                    install_dir
                ))
            }
            UpdateStep::InstallDependencies => {
                payload::install_dependencies(runner, &install_dir).await?;
                Ok("Dependencies installed".to_string())
            }
            UpdateStep::UpdateConfig => {
                let store = ConfigStore::new(runner, &run.instance.config_path);
                let config = store.load(&run.instance.var_context()).await?;
                let unit = UnitParams::for_instance(&run.instance);
                store
                    .save(
                        &config,
                        SaveOptions {
                            sync_service_unit: true,
                            restart: false,
                        },
                        Some((&service, &unit)),
                    )
                    .await?;
                Ok(format!("Config and unit synced for {}", service.name()))
            }
            UpdateStep::RestartService => {
                service.restart().await?;
                Ok(format!("Started {}", service.name()))
            }
            UpdateStep::Verify => {
                verify_liveness(runner, &service, run.instance.port, &self.settings.liveness).await?;
                Ok(format!("{} is active and listening on {}", service.name(), run.instance.port))
            }
            UpdateStep::UpdateRegistry => {
                let to_version = run
                    .to_version
                    .clone()
                    .ok_or_else(|| AppError::other("Target version was not resolved"))?;
                let mut entry = HistoryEntry::new(HistoryKind::Update, Some(&run.from_version), &to_version);
                entry.backup_id = run.backup_id.clone();
                run.instance = self.registry.record_version(&run.instance.id, entry)?;
                Ok(format!("{} -> {}", run.from_version, to_version))
            }
            UpdateStep::Cleanup => {
                let snapshot = old_snapshot_dir(&install_dir);
                if run.options.keep_old_files {
                    return Ok(format!("Kept previous payload at {}", snapshot));
                }
                runner
                    .execute_privileged(&format!("rm -rf {}", quote(&snapshot)))
                    .await
                    .check("remove previous payload")?;
                Ok(format!("Removed {}", snapshot))
            }
        }
    }

    async fn validate(&self, runner: &dyn CommandRunner, run: &mut UpdateRun) -> Result<String> {
        let instance = &run.instance;
        ConflictGuard::new(self.registry).validate(&instance.name, instance.port, &instance.domain, Some(&instance.id))?;

        run.connect_attempted = true;
        runner.connect().await?;

        let free = host::free_disk_mb(runner, &run.instance.install_dir).await?;
        if free < self.settings.min_free_disk_mb {
            return Err(AppError::validation(format!(
                "Only {} MiB free under {}, need {} MiB",
                free, run.instance.install_dir, self.settings.min_free_disk_mb
            )));
        }

        run.from_version = current_version(runner, &run.instance).await?;
        let target = match &run.options.target_version {
            Some(version) => version.clone(),
            None => self
                .catalog
                .releases()
                .await?
                .into_iter()
                .next()
                .map(|r| r.version)
                .ok_or_else(|| AppError::validation("No releases available"))?,
        };
        run.to_version = Some(target.clone());

        let comparison = compare(&run.from_version, &target)?;
        match comparison.verdict {
            VersionVerdict::Same if !run.options.force_update => {
                run.early_exit = Some(UpdateOutcome::AlreadyCurrent);
                return Ok(format!("Already at {}", run.from_version));
            }
            VersionVerdict::Older if !run.options.force_update => {
                return Err(AppError::validation(format!(
                    "{} is older than the installed {}; use force to downgrade",
                    target, run.from_version
                )));
            }
            _ => {}
        }

        if run.options.dry_run {
            run.early_exit = Some(UpdateOutcome::DryRun);
            return Ok(format!("Would update {} -> {}", run.from_version, target));
        }

        run.payload_dir = Some(self.catalog.fetch(&target).await?);
        tokio::fs::create_dir_all(&run.staging_dir).await?;
        Ok(format!("Ready to update {} -> {}", run.from_version, target))
    }

    /// Move the current payload to its `.old` sibling and deploy the new one
    /// in its place, carrying the data directory over. A failed deploy puts
    /// the previous payload straight back.
    async fn replace_files(&self, runner: &dyn CommandRunner, run: &mut UpdateRun, payload_dir: &Path) -> Result<()> {
        let dir = run.instance.install_dir.clone();
        let snapshot = old_snapshot_dir(&dir);

        runner
            .execute_privileged(&format!(
                "rm -rf {old} && mv {dir} {old}",
                old = quote(&snapshot),
                dir = quote(&dir)
            ))
            .await
            .check("move previous payload aside")?;

        if let Err(e) = payload::deploy(runner, payload_dir, &dir, &run.staging_dir).await {
            let restored = runner
                .execute_privileged(&format!(
                    "rm -rf {dir} && mv {old} {dir}",
                    old = quote(&snapshot),
                    dir = quote(&dir)
                ))
                .await;
            if !restored.success() {
                log::error!("Failed to put previous payload back at {}: {}", dir, restored.combined());
            }
            return Err(e);
        }
        run.files_updated = true;

        let old_data = join_remote(&snapshot, DATA_DIR);
        runner
            .execute_privileged(&format!(
                "if [ -d {data} ]; then cp -a {data} {dir}/; fi && chown -R {user}:{user} {dir}",
                data = quote(&old_data),
                dir = quote(&dir),
                user = SERVICE_USER,
            ))
            .await
            .check("carry over data directory")?;
        Ok(())
    }
}

fn skip_reason(step: UpdateStep, options: &UpdateOptions) -> Option<&'static str> {
    match step {
        UpdateStep::CreateBackup if options.skip_backup => Some("Backup skipped"),
        UpdateStep::RestartService | UpdateStep::Verify if !options.restart_service => {
            Some("Service restart not requested")
        }
        _ => None,
    }
}
