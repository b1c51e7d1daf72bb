//! The command surface presentation layers call.
//!
//! Every command takes the shared [`AppState`]; long-running ones also
//! publish progress on `state.events`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::backup::{instance_backup_dir, BackupManager};
use crate::config::{ConfigStore, InstanceConfig, SaveOptions, Settings, SettingsStore};
use crate::conflict;
use crate::download::USER_AGENT;
use crate::env_vars::{self, VarContext};
use crate::error::{AppError, Result};
use crate::events::{EventBus, ProgressEvent};
use crate::github::{self, GitHubCatalog};
use crate::host::{ddns, firewall, os, proxy};
use crate::install::{InstallOptions, InstallReport, Installer};
use crate::locator::{LocatorContext, ResourceLocator};
use crate::paths::{old_snapshot_dir, LauncherPaths};
use crate::registry::{BackupEntry, BackupKind, Instance, Registry};
use crate::release::{LocalPayloadCatalog, ReleaseCatalog};
use crate::rollback::{RollbackEngine, RollbackOptions, RollbackResult};
use crate::runner::{quote, CommandRunner, DefaultRunnerFactory, RunnerFactory, SshOptions, Target};
use crate::service::{ServiceController, ServiceStatus, UnitParams};
use crate::update::{self, UpdateInfo, UpdateOptions, UpdateOrchestrator, UpdateReport};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AppState {
    pub paths: LauncherPaths,
    pub settings: SettingsStore,
    pub registry: Registry,
    pub events: EventBus,
    pub client: Client,
    runners: Arc<dyn RunnerFactory>,
    locator: Arc<ResourceLocator>,
    catalog: Option<Arc<dyn ReleaseCatalog>>,
}

impl AppState {
    /// State rooted at `paths`, with real local/ssh runners and the payload
    /// located from the process environment.
    pub fn new(paths: LauncherPaths) -> Result<Self> {
        paths.ensure_data_dirs()?;
        let settings = SettingsStore::open(paths.config_path());
        let loaded = settings.load()?;
        let runners = Arc::new(DefaultRunnerFactory::new(SshOptions {
            control_dir: paths.ssh_dir(),
            connect_timeout: Duration::from_secs(loaded.ssh.connect_timeout_secs),
            extra_args: loaded.ssh.extra_args.clone(),
        }));
        let locator = Arc::new(ResourceLocator::new(
            LocatorContext::from_process(),
            &paths.cache_dir(),
            loaded.payload_repo_url.clone(),
        ));
        Self::with_parts(paths, settings, runners, locator)
    }

    pub fn with_parts(
        paths: LauncherPaths,
        settings: SettingsStore,
        runners: Arc<dyn RunnerFactory>,
        locator: Arc<ResourceLocator>,
    ) -> Result<Self> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            registry: Registry::open(paths.registry_path()),
            paths,
            settings,
            events: EventBus::new(),
            client,
            runners,
            locator,
            catalog: None,
        })
    }

    /// Use `catalog` instead of the one derived from settings.
    pub fn with_catalog(mut self, catalog: Arc<dyn ReleaseCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    fn catalog(&self, settings: &Settings) -> Arc<dyn ReleaseCatalog> {
        if let Some(catalog) = &self.catalog {
            return Arc::clone(catalog);
        }
        if settings.release_repo.trim().is_empty() {
            Arc::new(LocalPayloadCatalog::new(Arc::clone(&self.locator)))
        } else {
            Arc::new(GitHubCatalog::new(
                self.client.clone(),
                settings.release_repo.clone(),
                settings.github_proxy.clone(),
                self.paths.cache_dir(),
            ))
        }
    }

    fn staging_root(&self) -> PathBuf {
        self.paths.cache_dir().join("staging")
    }

    fn runner_for(&self, instance: &Instance) -> Arc<dyn CommandRunner> {
        self.runners.runner_for(&instance.target)
    }
}

async fn disconnect(runner: &dyn CommandRunner, target: &Target) {
    if let Err(e) = runner.disconnect().await {
        log::warn!("Failed to disconnect from {}: {}", target.label(), e);
    }
}

pub fn subscribe(state: &AppState) -> broadcast::Receiver<ProgressEvent> {
    state.events.subscribe()
}

// === Config ===

pub fn get_settings(state: &AppState) -> Result<Arc<Settings>> {
    state.settings.load()
}

pub async fn save_github_proxy(state: &AppState, github_proxy: String) -> Result<()> {
    let repo = state.settings.load()?.release_repo.clone();
    if !repo.is_empty() {
        // Test connectivity first
        let url = github::build_api_url(&github_proxy, &repo);
        let resp = state
            .client
            .get(&url)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .map_err(|e| AppError::network_with_url(&url, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AppError::network_with_url(&url, resp.status().to_string()));
        }
    }
    state.settings.with_settings_mut(move |settings| {
        settings.github_proxy = github_proxy;
        Ok(())
    })
}

pub fn save_release_repo(state: &AppState, release_repo: String) -> Result<()> {
    let trimmed = release_repo.trim();
    if !trimmed.is_empty() && trimmed.split('/').filter(|p| !p.is_empty()).count() != 2 {
        return Err(AppError::validation(format!(
            "Release repository must look like owner/name, got {:?}",
            release_repo
        )));
    }
    let release_repo = trimmed.to_string();
    state.settings.with_settings_mut(move |settings| {
        settings.release_repo = release_repo;
        Ok(())
    })
}

pub fn save_max_backups(state: &AppState, max_backups: usize) -> Result<()> {
    if max_backups == 0 {
        return Err(AppError::validation("At least one backup must be kept"));
    }
    state.settings.with_settings_mut(move |settings| {
        settings.max_backups = max_backups;
        Ok(())
    })
}

// === Instances ===

pub fn list_instances(state: &AppState) -> Result<Vec<Instance>> {
    state.registry.list()
}

pub fn get_instance(state: &AppState, id: &str) -> Result<Instance> {
    state.registry.get(id)
}

pub fn default_instance(state: &AppState) -> Result<Option<Instance>> {
    state.registry.default_instance()
}

pub fn set_default(state: &AppState, id: &str) -> Result<()> {
    state.registry.set_default(id)
}

pub async fn install(state: &AppState, options: InstallOptions) -> Result<InstallReport> {
    let settings = state.settings.load()?;
    let runner = state.runners.runner_for(&options.target);
    let staging = state.staging_root();
    Installer::new(&state.registry, &settings, &state.locator, &state.events, &staging)
        .install(runner, options)
        .await
}

/// Tear an instance down: service, proxy site, DNS refresh, config and
/// payload, then its registry entry. Host steps are best-effort.
pub async fn uninstall(state: &AppState, id: &str, remove_backups: bool) -> Result<()> {
    let settings = state.settings.load()?;
    let instance = state.registry.get(id)?;
    let runner = state.runner_for(&instance);
    let runner = runner.as_ref();
    runner.connect().await?;

    let service = ServiceController::new(runner, instance.service_name());
    if service.is_active().await {
        if let Err(e) = service.stop().await {
            log::warn!("Uninstall: failed to stop {}: {}", service.name(), e);
        }
    }
    if service.unit_exists().await {
        if let Err(e) = service.disable().await {
            log::warn!("Uninstall: failed to disable {}: {}", service.name(), e);
        }
        if let Err(e) = service.remove_unit().await {
            log::warn!("Uninstall: failed to remove unit: {}", e);
        }
    }

    proxy::remove_site(runner, &instance.slug()).await;
    ddns::remove(runner, &instance.slug()).await;
    match os::detect(runner).await {
        Ok(info) => firewall::close_port(runner, &info, instance.port).await,
        Err(e) => log::warn!("Uninstall: skipping firewall cleanup: {}", e),
    }

    if let Err(e) = ConfigStore::new(runner, &instance.config_path).remove().await {
        log::warn!("Uninstall: failed to remove config: {}", e);
    }
    let output = runner
        .execute_privileged(&format!(
            "rm -rf {} {}",
            quote(&instance.install_dir),
            quote(&old_snapshot_dir(&instance.install_dir))
        ))
        .await;
    if !output.success() {
        log::warn!("Uninstall: failed to remove {}: {}", instance.install_dir, output.combined());
    }
    if remove_backups {
        BackupManager::new(runner, instance_backup_dir(&settings.backup_root, &instance.id))
            .delete_all()
            .await;
    }

    disconnect(runner, &instance.target).await;
    state.registry.delete(id)?;
    log::info!("Uninstalled {} ({})", instance.name, instance.id);
    Ok(())
}

// === Updates ===

pub async fn check_updates(state: &AppState, id: &str) -> Result<UpdateInfo> {
    let settings = state.settings.load()?;
    let instance = state.registry.get(id)?;
    let runner = state.runner_for(&instance);
    let catalog = state.catalog(&settings);
    update::check_for_updates(runner.as_ref(), catalog.as_ref(), &instance).await
}

pub async fn update(state: &AppState, id: &str, options: UpdateOptions) -> Result<UpdateReport> {
    let settings = state.settings.load()?;
    let instance = state.registry.get(id)?;
    let runner = state.runner_for(&instance);
    let catalog = state.catalog(&settings);
    let staging = state.staging_root();
    UpdateOrchestrator::new(&state.registry, &settings, catalog.as_ref(), &state.events, &staging)
        .update(runner, id, options)
        .await
}

pub async fn rollback(state: &AppState, id: &str, options: RollbackOptions) -> Result<RollbackResult> {
    let settings = state.settings.load()?;
    let instance = state.registry.get(id)?;
    let runner = state.runner_for(&instance);
    let runner = runner.as_ref();
    runner.connect().await?;
    let result = RollbackEngine::new(&state.registry, &settings, &state.events)
        .rollback(runner, id, &options)
        .await;
    disconnect(runner, &instance.target).await;
    result
}

// === Service ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

pub async fn service_status(state: &AppState, id: &str) -> Result<ServiceStatus> {
    let instance = state.registry.get(id)?;
    let runner = state.runner_for(&instance);
    let runner = runner.as_ref();
    runner.connect().await?;
    let status = ServiceController::new(runner, instance.service_name()).status().await;
    disconnect(runner, &instance.target).await;
    Ok(status)
}

pub async fn service_logs(state: &AppState, id: &str, lines: usize) -> Result<String> {
    let instance = state.registry.get(id)?;
    let runner = state.runner_for(&instance);
    let runner = runner.as_ref();
    runner.connect().await?;
    let logs = ServiceController::new(runner, instance.service_name()).logs(lines).await;
    disconnect(runner, &instance.target).await;
    Ok(logs)
}

pub async fn control_service(state: &AppState, id: &str, action: ServiceAction) -> Result<()> {
    let instance = state.registry.get(id)?;
    let runner = state.runner_for(&instance);
    let runner = runner.as_ref();
    runner.connect().await?;
    let service = ServiceController::new(runner, instance.service_name());
    let result = match action {
        ServiceAction::Start => service.start().await,
        ServiceAction::Stop => service.stop().await,
        ServiceAction::Restart => service.restart().await,
    };
    disconnect(runner, &instance.target).await;
    result
}

// === Service config ===

/// A fresh config for the given port and domain, as install would write it.
pub fn generate_config(port: u16, domain: &str, tls: bool) -> InstanceConfig {
    InstanceConfig::generate(&VarContext { port, domain, tls })
}

pub fn validate_config(values: &BTreeMap<String, String>) -> Result<()> {
    env_vars::validate_all(values)
}

/// The instance's current config with secrets redacted.
pub async fn get_config(state: &AppState, id: &str) -> Result<BTreeMap<String, String>> {
    let instance = state.registry.get(id)?;
    let runner = state.runner_for(&instance);
    let runner = runner.as_ref();
    runner.connect().await?;
    let config = ConfigStore::new(runner, &instance.config_path)
        .load(&instance.var_context())
        .await;
    disconnect(runner, &instance.target).await;
    Ok(config?.redacted())
}

/// Set the given variables on the instance's config and save it. `PORT`
/// and `PUBLIC_URL` must keep the values the registered port and domain
/// produce.
pub async fn set_config(
    state: &AppState,
    id: &str,
    values: BTreeMap<String, String>,
    options: SaveOptions,
) -> Result<()> {
    let instance = state.registry.get(id)?;
    let ctx = instance.var_context();
    for (key, value) in &values {
        env_vars::check_identity(key, value, &ctx)?;
    }
    let runner = state.runner_for(&instance);
    let runner = runner.as_ref();
    runner.connect().await?;
    let result = async {
        let store = ConfigStore::new(runner, &instance.config_path);
        let mut config = store.load(&instance.var_context()).await?;
        for (key, value) in values {
            config.set(&key, value)?;
        }
        let service = ServiceController::new(runner, instance.service_name());
        let unit = UnitParams::for_instance(&instance);
        store.save(&config, options, Some((&service, &unit))).await
    }
    .await;
    disconnect(runner, &instance.target).await;
    result
}

// === Backup ===

pub fn list_backups(state: &AppState, id: &str) -> Result<Vec<BackupEntry>> {
    let mut backups = state.registry.get(id)?.backups;
    backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(backups)
}

pub async fn create_backup(state: &AppState, id: &str) -> Result<BackupEntry> {
    let settings = state.settings.load()?;
    let instance = state.registry.get(id)?;
    let runner = state.runner_for(&instance);
    let runner = runner.as_ref();
    runner.connect().await?;
    let created = BackupManager::new(runner, instance_backup_dir(&settings.backup_root, &instance.id))
        .create(&instance.install_dir, BackupKind::Manual, &instance.version)
        .await;
    disconnect(runner, &instance.target).await;
    let entry = created?;
    state.registry.add_backup(id, entry.clone())?;
    Ok(entry)
}

pub async fn delete_backup(state: &AppState, id: &str, backup_id: &str) -> Result<()> {
    let settings = state.settings.load()?;
    let instance = state.registry.get(id)?;
    let entry = instance
        .find_backup(backup_id)
        .cloned()
        .ok_or_else(|| AppError::backup_not_found(backup_id))?;
    let runner = state.runner_for(&instance);
    let runner = runner.as_ref();
    runner.connect().await?;
    let deleted = BackupManager::new(runner, instance_backup_dir(&settings.backup_root, &instance.id))
        .delete(&entry)
        .await;
    disconnect(runner, &instance.target).await;
    deleted?;
    state.registry.remove_backup(id, backup_id)?;
    Ok(())
}

// === Troubleshooting ===

/// Units on `target` that follow the naming convention but are not in the
/// registry.
pub async fn detect_orphans(state: &AppState, target: Target) -> Result<Vec<String>> {
    let runner = state.runners.runner_for(&target);
    let runner = runner.as_ref();
    runner.connect().await?;
    let orphans = conflict::detect_orphans(runner, &state.registry, &target).await;
    disconnect(runner, &target).await;
    Ok(orphans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LivenessSettings;
    use crate::error::ErrorKind;
    use crate::events::ProgressEvent;
    use crate::testing::{write_payload, MockFactory, MockRunner};
    use tempfile::TempDir;

    fn state(tmp: &TempDir, runner: &Arc<MockRunner>) -> AppState {
        let paths = LauncherPaths::new(tmp.path().join("home"));
        paths.ensure_data_dirs().expect("data dirs");
        let payload = tmp.path().join("payload");
        write_payload(&payload, "1.0.0");
        let locator = ResourceLocator::new(
            LocatorContext {
                payload_dir: Some(payload),
                ..LocatorContext::default()
            },
            &paths.cache_dir(),
            "",
        );
        let settings = SettingsStore::with_settings(
            paths.config_path(),
            Settings {
                liveness: LivenessSettings {
                    attempts: 1,
                    interval_ms: 0,
                },
                ..Settings::default()
            },
        );
        AppState::with_parts(
            paths,
            settings,
            Arc::new(MockFactory(Arc::clone(runner))),
            Arc::new(locator),
        )
        .expect("state")
    }

    async fn installed(state: &AppState) -> Instance {
        let report = install(
            state,
            InstallOptions::new("alpha", 8080, "alpha.example.com", Target::Local),
        )
        .await
        .expect("install");
        assert!(report.success, "{:?}", report.error);
        report.instance.expect("instance")
    }

    #[tokio::test]
    async fn install_registers_default_and_streams_progress() {
        let tmp = TempDir::new().expect("tempdir");
        let runner = Arc::new(MockRunner::healthy_host());
        let state = state(&tmp, &runner);
        let mut events = subscribe(&state);

        let instance = installed(&state).await;

        let listed = list_instances(&state).expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(
            default_instance(&state).expect("default").map(|i| i.id),
            Some(instance.id.clone())
        );
        let first = events.try_recv().expect("event");
        assert!(matches!(first, ProgressEvent::Step { .. }));
    }

    #[tokio::test]
    async fn manual_backup_is_recorded_and_deleted() {
        let tmp = TempDir::new().expect("tempdir");
        let runner = Arc::new(MockRunner::healthy_host());
        let state = state(&tmp, &runner);
        let instance = installed(&state).await;

        let entry = create_backup(&state, &instance.id).await.expect("backup");
        assert_eq!(entry.kind, BackupKind::Manual);
        let backups = list_backups(&state, &instance.id).expect("list");
        assert_eq!(backups.len(), 2);
        assert_eq!(backups[0].id, entry.id);

        delete_backup(&state, &instance.id, &entry.id).await.expect("delete");
        assert_eq!(list_backups(&state, &instance.id).expect("list").len(), 1);

        let err = delete_backup(&state, &instance.id, "nope").await.expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::BackupNotFound);
    }

    #[tokio::test]
    async fn uninstall_removes_host_artifacts_and_entry() {
        let tmp = TempDir::new().expect("tempdir");
        let runner = Arc::new(MockRunner::healthy_host());
        let state = state(&tmp, &runner);
        let instance = installed(&state).await;

        uninstall(&state, &instance.id, true).await.expect("uninstall");

        assert!(list_instances(&state).expect("list").is_empty());
        assert!(default_instance(&state).expect("default").is_none());
        assert!(runner.ran(&format!("rm -rf {} {}.old", instance.install_dir, instance.install_dir)));
        assert!(runner.ran("rm -f /etc/nginx/conf.d/homeport-alpha.conf"));
        assert!(runner.ran(&format!("ufw delete allow {}/tcp", instance.port)));
        assert!(runner.ran(&format!("rm -rf /var/backups/homeport/{}", instance.id)));
    }

    #[tokio::test]
    async fn update_without_newer_release_is_current() {
        let tmp = TempDir::new().expect("tempdir");
        let runner = Arc::new(MockRunner::healthy_host());
        let state = state(&tmp, &runner);
        let instance = installed(&state).await;

        let info = check_updates(&state, &instance.id).await.expect("check");
        assert!(!info.update_available);
        assert_eq!(info.current_version, "1.0.0");

        let report = update(&state, &instance.id, UpdateOptions::default())
            .await
            .expect("update");
        assert!(report.success);
        assert_eq!(report.outcome, update::UpdateOutcome::AlreadyCurrent);
    }

    #[tokio::test]
    async fn config_edits_keep_port_and_public_url() {
        let tmp = TempDir::new().expect("tempdir");
        let runner = Arc::new(MockRunner::healthy_host());
        let state = state(&tmp, &runner);
        let instance = installed(&state).await;
        let connects = runner.connects();

        let moved_port = BTreeMap::from([("PORT".to_string(), "9090".to_string())]);
        let err = set_config(&state, &instance.id, moved_port, SaveOptions::default())
            .await
            .expect_err("port is pinned");
        assert_eq!(err.kind(), ErrorKind::Validation);

        let moved_url = BTreeMap::from([(
            "PUBLIC_URL".to_string(),
            "https://elsewhere.example.com".to_string(),
        )]);
        assert!(set_config(&state, &instance.id, moved_url, SaveOptions::default())
            .await
            .is_err());
        assert_eq!(runner.connects(), connects);

        let edits = BTreeMap::from([
            ("LOG_LEVEL".to_string(), "debug".to_string()),
            ("PORT".to_string(), instance.port.to_string()),
        ]);
        set_config(&state, &instance.id, edits, SaveOptions::default())
            .await
            .expect("unchanged port with a new log level");
        assert_eq!(runner.connects(), connects + 1);
    }

    #[test]
    fn generated_config_validates() {
        let config = generate_config(8080, "alpha.example.com", true);
        assert_eq!(config.get("PUBLIC_URL"), Some("https://alpha.example.com"));
        assert!(validate_config(&config.values).is_ok());

        let mut bad = config.values.clone();
        bad.insert("PORT".to_string(), "not-a-port".to_string());
        assert!(validate_config(&bad).is_err());
    }

    #[test]
    fn release_repo_must_be_owner_and_name() {
        let tmp = TempDir::new().expect("tempdir");
        let runner = Arc::new(MockRunner::new());
        let state = state(&tmp, &runner);
        assert!(save_release_repo(&state, "nope".to_string()).is_err());
        save_release_repo(&state, "acme/server".to_string()).expect("save");
        assert_eq!(get_settings(&state).expect("settings").release_repo, "acme/server");
    }
}
