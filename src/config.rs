use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env_vars::{self, VarContext};
use crate::error::{AppError, Result};
use crate::paths::remote_parent;
use crate::runner::{quote, CommandRunner};
use crate::service::{ServiceController, UnitParams};

// === Launcher settings ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_install_root")]
    pub install_root: String,
    #[serde(default = "default_config_root")]
    pub config_root: String,
    #[serde(default = "default_backup_root")]
    pub backup_root: String,
    /// `owner/name` of the GitHub repository publishing payload releases.
    #[serde(default)]
    pub release_repo: String,
    #[serde(default)]
    pub github_proxy: String,
    /// Git URL cloned when no pre-built payload is found locally.
    #[serde(default)]
    pub payload_repo_url: String,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    #[serde(default = "default_min_free_disk_mb")]
    pub min_free_disk_mb: u64,
    #[serde(default)]
    pub liveness: LivenessSettings,
    #[serde(default)]
    pub ssh: SshSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessSettings {
    #[serde(default = "default_liveness_attempts")]
    pub attempts: u32,
    #[serde(default = "default_liveness_interval_ms")]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_install_root() -> String {
    "/opt/homeport".to_string()
}

fn default_config_root() -> String {
    "/etc/homeport".to_string()
}

fn default_backup_root() -> String {
    "/var/backups/homeport".to_string()
}

fn default_max_backups() -> usize {
    5
}

fn default_min_free_disk_mb() -> u64 {
    512
}

fn default_liveness_attempts() -> u32 {
    15
}

fn default_liveness_interval_ms() -> u64 {
    2000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            install_root: default_install_root(),
            config_root: default_config_root(),
            backup_root: default_backup_root(),
            release_repo: String::new(),
            github_proxy: String::new(),
            payload_repo_url: String::new(),
            max_backups: default_max_backups(),
            min_free_disk_mb: default_min_free_disk_mb(),
            liveness: LivenessSettings::default(),
            ssh: SshSettings::default(),
        }
    }
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            attempts: default_liveness_attempts(),
            interval_ms: default_liveness_interval_ms(),
        }
    }
}

impl LivenessSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            extra_args: Vec::new(),
        }
    }
}

/// Cached settings file with serialized read-modify-write.
pub struct SettingsStore {
    path: PathBuf,
    lock: Mutex<()>,
    cache: RwLock<Option<Arc<Settings>>>,
}

impl SettingsStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            cache: RwLock::new(None),
        }
    }

    /// Store pre-seeded with `settings`; nothing is read from disk until a write.
    pub fn with_settings(path: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            cache: RwLock::new(Some(Arc::new(settings))),
        }
    }

    fn load_from_disk(&self) -> Result<Settings> {
        if !self.path.exists() {
            let settings = Settings::default();
            self.save_to_disk(&settings)?;
            return Ok(settings);
        }
        let content =
            fs::read_to_string(&self.path).map_err(|e| AppError::config(e.to_string()))?;
        toml::from_str(&content).map_err(|e| AppError::config(e.to_string()))
    }

    fn save_to_disk(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| AppError::config(e.to_string()))?;
        }
        let content =
            toml::to_string_pretty(settings).map_err(|e| AppError::config(e.to_string()))?;
        fs::write(&self.path, content).map_err(|e| AppError::config(e.to_string()))
    }

    pub fn load(&self) -> Result<Arc<Settings>> {
        let cached = self.cache.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(settings) = cached {
            return Ok(settings);
        }

        let settings = Arc::new(self.load_from_disk()?);
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&settings));
        Ok(settings)
    }

    /// Execute a read-modify-write operation on the settings file while holding a lock.
    pub fn with_settings_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Settings) -> Result<T>,
    {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.load()?;

        let mut updated = (*current).clone();
        let result = f(&mut updated)?;
        self.save_to_disk(&updated)?;

        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(updated));

        Ok(result)
    }
}

// === Per-instance service configuration ===

/// KEY=VALUE environment consumed by the service unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub values: BTreeMap<String, String>,
}

impl InstanceConfig {
    pub fn generate(ctx: &VarContext<'_>) -> Self {
        Self {
            values: env_vars::generate(ctx),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Set a value, validating it when the variable is known.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        if let Some(descriptor) = env_vars::descriptor(key) {
            descriptor.validate(&value)?;
        }
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        env_vars::validate_all(&self.values)
    }

    pub fn redacted(&self) -> BTreeMap<String, String> {
        env_vars::redact(&self.values)
    }

    pub fn parse_env(content: &str) -> Self {
        let values = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), unquote(v.trim())))
            .collect();
        Self { values }
    }

    pub fn render_env(&self) -> String {
        let mut out = String::from("# Managed by homeport\n");
        for (key, value) in &self.values {
            out.push_str(key);
            out.push('=');
            out.push_str(&quote_env(value));
            out.push('\n');
        }
        out
    }
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value[1..value.len() - 1]
            .replace("\\\"", "\"")
            .replace("\\\\", "\\")
    } else {
        value.to_string()
    }
}

fn quote_env(value: &str) -> String {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '@'))
    {
        value.to_string()
    } else {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    /// Re-render and reinstall the unit file from `unit`.
    pub sync_service_unit: bool,
    pub restart: bool,
}

/// Reads and writes an instance's env file on its target host.
const CONFIG_PRESENT: &str = "present";
const CONFIG_ABSENT: &str = "absent";

pub struct ConfigStore<'a> {
    runner: &'a dyn CommandRunner,
    path: &'a str,
}

impl<'a> ConfigStore<'a> {
    pub fn new(runner: &'a dyn CommandRunner, path: &'a str) -> Self {
        Self { runner, path }
    }

    /// Load the env file merged with table defaults. Only an absent file
    /// yields a fully generated config; a file that exists but cannot be
    /// read is an error.
    pub async fn load(&self, ctx: &VarContext<'_>) -> Result<InstanceConfig> {
        let mut config = if self.exists().await? {
            let output = self
                .runner
                .execute_privileged(&format!("cat {}", quote(self.path)))
                .await
                .check(&format!("read {}", self.path))?;
            InstanceConfig::parse_env(&output.stdout)
        } else {
            log::warn!("No existing config at {}, generating defaults", self.path);
            InstanceConfig::default()
        };
        env_vars::merge_missing(&mut config.values, ctx);
        Ok(config)
    }

    /// Asks the host for an explicit answer so a failed check (ssh or sudo
    /// trouble) is never mistaken for a missing file.
    async fn exists(&self) -> Result<bool> {
        let output = self
            .runner
            .execute_privileged(&format!(
                "if [ -e {path} ]; then echo {present}; else echo {absent}; fi",
                path = quote(self.path),
                present = CONFIG_PRESENT,
                absent = CONFIG_ABSENT,
            ))
            .await
            .check(&format!("check {}", self.path))?;
        match output.stdout.trim() {
            CONFIG_PRESENT => Ok(true),
            CONFIG_ABSENT => Ok(false),
            other => Err(AppError::config(format!(
                "Unexpected answer checking {}: {:?}",
                self.path, other
            ))),
        }
    }

    pub async fn save(
        &self,
        config: &InstanceConfig,
        options: SaveOptions,
        service: Option<(&ServiceController<'_>, &UnitParams)>,
    ) -> Result<()> {
        config.validate()?;
        write_remote_file(self.runner, self.path, &config.render_env(), "600").await?;
        log::info!("Saved config {} {:?}", self.path, config.redacted());

        if let Some((controller, unit)) = service {
            if options.sync_service_unit {
                controller.install_unit(unit).await?;
            }
            if options.restart {
                controller.restart().await?;
            }
        }
        Ok(())
    }

    pub async fn remove(&self) -> Result<()> {
        self.runner
            .execute_privileged(&format!("rm -f {}", quote(self.path)))
            .await
            .check("remove config")?;
        Ok(())
    }
}

/// Write `content` to `path` on the target through a local temp file upload.
pub async fn write_remote_file(
    runner: &dyn CommandRunner,
    path: &str,
    content: &str,
    mode: &str,
) -> Result<()> {
    let tmp = tempfile_path();
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| AppError::io(format!("Failed to stage {}: {}", path, e)))?;

    let staged = format!("/tmp/{}.upload", tmp_file_name(&tmp));
    let upload = runner.upload(&tmp, &staged).await;
    if let Err(e) = tokio::fs::remove_file(&tmp).await {
        log::warn!("Failed to remove staging file {:?}: {}", tmp, e);
    }
    upload?;

    let command = format!(
        "mkdir -p {dir} && install -m {mode} {staged} {path} && rm -f {staged}",
        dir = quote(&remote_parent(path)),
        mode = mode,
        staged = quote(&staged),
        path = quote(path),
    );
    runner
        .execute_privileged(&command)
        .await
        .check(&format!("write {}", path))?;
    Ok(())
}

fn tempfile_path() -> PathBuf {
    std::env::temp_dir().join(format!("homeport-{}", uuid::Uuid::new_v4().simple()))
}

fn tmp_file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("homeport-staged")
        .to_string()
}
