//! Putting an instance back on its previous payload.
//!
//! Two strategies: swap the sibling `.old` snapshot left by an update back
//! into place (fast, nothing to decompress), or restore a backup archive.

use serde::{Deserialize, Serialize};

use crate::backup::{instance_backup_dir, BackupManager};
use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::events::{EventBus, Operation, StepRecord, StepRecorder};
use crate::paths::old_snapshot_dir;
use crate::payload;
use crate::registry::{BackupEntry, HistoryEntry, HistoryKind, Instance, Registry};
use crate::runner::{quote, CommandRunner};
use crate::service::ServiceController;

const STEPS: [&str; 6] = [
    "SELECT_STRATEGY",
    "STOP_SERVICE",
    "RESTORE_FILES",
    "INSTALL_DEPENDENCIES",
    "START_SERVICE",
    "UPDATE_REGISTRY",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOptions {
    #[serde(default)]
    pub backup_id: Option<String>,
    #[serde(default = "default_true")]
    pub use_fast_rollback: bool,
    #[serde(default = "default_true")]
    pub restart_service: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            backup_id: None,
            use_fast_rollback: true,
            restart_service: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackMethod {
    Fast,
    Backup,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    pub run_id: String,
    pub method: RollbackMethod,
    pub from_version: String,
    pub rolled_back_to_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    pub steps: Vec<StepRecord>,
}

#[derive(Debug, Clone, PartialEq)]
enum Plan {
    Fast { snapshot: String },
    Backup(BackupEntry),
}

impl Plan {
    fn method(&self) -> RollbackMethod {
        match self {
            Self::Fast { .. } => RollbackMethod::Fast,
            Self::Backup(_) => RollbackMethod::Backup,
        }
    }
}

/// Fast when requested and a snapshot exists; otherwise the named backup,
/// else the newest one.
async fn select_plan(runner: &dyn CommandRunner, instance: &Instance, options: &RollbackOptions) -> Result<Plan> {
    let snapshot = old_snapshot_dir(&instance.install_dir);
    if options.use_fast_rollback
        && runner
            .execute_privileged(&format!("test -d {}", quote(&snapshot)))
            .await
            .success()
    {
        return Ok(Plan::Fast { snapshot });
    }

    if let Some(backup_id) = options.backup_id.as_deref() {
        if let Some(entry) = instance.find_backup(backup_id) {
            return Ok(Plan::Backup(entry.clone()));
        }
        let known: Vec<&str> = instance.backups.iter().map(|b| b.id.as_str()).collect();
        log::warn!(
            "Backup {} not found for {} (known: {:?}), using the most recent one",
            backup_id,
            instance.name,
            known
        );
    }

    instance.latest_backup().cloned().map(Plan::Backup).ok_or_else(|| {
        AppError::validation(format!(
            "Nothing to roll back to: {} has no previous snapshot and no backups",
            instance.name
        ))
    })
}

/// Version the instance ran before its most recent update, if recorded.
fn previous_version(instance: &Instance) -> Option<String> {
    instance
        .update_history
        .iter()
        .rev()
        .find(|h| h.kind == HistoryKind::Update)
        .and_then(|h| h.from_version.clone())
}

pub struct RollbackEngine<'a> {
    registry: &'a Registry,
    settings: &'a Settings,
    bus: &'a EventBus,
}

impl<'a> RollbackEngine<'a> {
    pub fn new(registry: &'a Registry, settings: &'a Settings, bus: &'a EventBus) -> Self {
        Self { registry, settings, bus }
    }

    /// Roll back the registered instance `id`. The runner must already be
    /// connected.
    pub async fn rollback(
        &self,
        runner: &dyn CommandRunner,
        id: &str,
        options: &RollbackOptions,
    ) -> Result<RollbackResult> {
        let instance = self.registry.get(id)?;
        self.rollback_instance(runner, &instance, options).await
    }

    /// Roll back using `instance` as the current state; `instance.version`
    /// is what the history entry records as the version being left.
    pub async fn rollback_instance(
        &self,
        runner: &dyn CommandRunner,
        instance: &Instance,
        options: &RollbackOptions,
    ) -> Result<RollbackResult> {
        let mut recorder = StepRecorder::new(
            self.bus.clone(),
            Operation::Rollback,
            Some(instance.id.clone()),
            STEPS.len(),
        );
        let result = self.run(runner, instance, options, &mut recorder).await;
        recorder.finish(result.is_ok());
        let (plan, to_version) = result?;

        Ok(RollbackResult {
            run_id: recorder.run_id().to_string(),
            method: plan.method(),
            from_version: instance.version.clone(),
            rolled_back_to_version: to_version,
            backup_id: match plan {
                Plan::Backup(entry) => Some(entry.id),
                Plan::Fast { .. } => None,
            },
            steps: recorder.into_records(),
        })
    }

    async fn run(
        &self,
        runner: &dyn CommandRunner,
        instance: &Instance,
        options: &RollbackOptions,
        recorder: &mut StepRecorder,
    ) -> Result<(Plan, String)> {
        let service = ServiceController::new(runner, instance.service_name());

        recorder.begin(STEPS[0], 0, "Choosing rollback strategy");
        let plan = match select_plan(runner, instance, options).await {
            Ok(plan) => plan,
            Err(e) => {
                recorder.fail(STEPS[0], 0, &e);
                return Err(e);
            }
        };
        let chosen = match &plan {
            Plan::Fast { snapshot } => format!("Fast rollback from {}", snapshot),
            Plan::Backup(entry) => format!("Restoring backup {} ({})", entry.id, entry.version),
        };
        log::info!("Rolling back {}: {}", instance.name, chosen);
        recorder.complete(STEPS[0], 0, chosen);

        recorder.begin(STEPS[1], 1, "Stopping service");
        if service.is_active().await {
            if let Err(e) = service.stop().await {
                recorder.fail(STEPS[1], 1, &e);
                return Err(e);
            }
            recorder.complete(STEPS[1], 1, format!("Stopped {}", service.name()));
        } else {
            recorder.complete(STEPS[1], 1, "Service was not running");
        }

        recorder.begin(STEPS[2], 2, "Restoring payload files");
        let to_version = match self.restore(runner, instance, &plan).await {
            Ok(version) => version,
            Err(e) => {
                recorder.fail(STEPS[2], 2, &e);
                return Err(e);
            }
        };
        recorder.complete(STEPS[2], 2, format!("Payload is back at {}", to_version));

        match &plan {
            Plan::Fast { .. } => recorder.skip(STEPS[3], 3, "Snapshot already has its dependencies"),
            Plan::Backup(_) => {
                recorder.begin(STEPS[3], 3, "Installing dependencies");
                if let Err(e) = payload::install_dependencies(runner, &instance.install_dir).await {
                    recorder.fail(STEPS[3], 3, &e);
                    return Err(e);
                }
                recorder.complete(STEPS[3], 3, "Dependencies installed");
            }
        }

        if options.restart_service {
            recorder.begin(STEPS[4], 4, "Starting service");
            if let Err(e) = service.start().await {
                recorder.fail(STEPS[4], 4, &e);
                return Err(e);
            }
            recorder.complete(STEPS[4], 4, format!("Started {}", service.name()));
        } else {
            recorder.skip(STEPS[4], 4, "Restart not requested");
        }

        recorder.begin(STEPS[5], 5, "Recording rollback");
        let mut entry = HistoryEntry::new(HistoryKind::Rollback, Some(&instance.version), &to_version);
        if let Plan::Backup(backup) = &plan {
            entry.backup_id = Some(backup.id.clone());
        }
        if let Err(e) = self.registry.record_version(&instance.id, entry) {
            recorder.fail(STEPS[5], 5, &e);
            return Err(e);
        }
        recorder.complete(STEPS[5], 5, format!("{} -> {}", instance.version, to_version));

        Ok((plan, to_version))
    }

    /// Put the planned payload in place and return its version.
    async fn restore(&self, runner: &dyn CommandRunner, instance: &Instance, plan: &Plan) -> Result<String> {
        let dir = &instance.install_dir;
        match plan {
            Plan::Fast { snapshot } => {
                let failed = format!("{}.failed", dir.trim_end_matches('/'));
                let command = format!(
                    "rm -rf {failed} && if [ -d {dir} ]; then mv {dir} {failed}; fi && mv {snapshot} {dir} && rm -rf {failed}",
                    failed = quote(&failed),
                    dir = quote(dir),
                    snapshot = quote(snapshot),
                );
                runner
                    .execute_privileged(&command)
                    .await
                    .check("swap in previous payload")?;
                match payload::remote_version(runner, dir).await {
                    Ok(version) => Ok(version),
                    Err(e) => {
                        log::warn!("Could not read restored payload version: {}", e);
                        Ok(previous_version(instance).unwrap_or_else(|| instance.version.clone()))
                    }
                }
            }
            Plan::Backup(entry) => {
                let manager = BackupManager::new(runner, instance_backup_dir(&self.settings.backup_root, &instance.id));
                manager.restore(entry, dir).await?;
                Ok(entry.version.clone())
            }
        }
    }
}
