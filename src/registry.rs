//! Persistent catalog of managed instances.
//!
//! The registry document is read fresh for every operation; mutations go
//! through [`Registry::with_registry_mut`], which serializes the
//! load-mutate-save cycle inside this process. Concurrent writers in other
//! processes are not coordinated (last writer wins).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conflict::find_collision;
use crate::env_vars::VarContext;
use crate::error::{AppError, Result};
use crate::runner::Target;
use crate::validation::{service_name, slugify};

pub const REGISTRY_FORMAT_VERSION: u32 = 1;

/// One managed deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub domain: String,
    /// Served over HTTPS through the reverse proxy.
    #[serde(default)]
    pub tls: bool,
    pub version: String,
    #[serde(default)]
    pub target: Target,
    pub install_dir: String,
    pub config_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub update_history: Vec<HistoryEntry>,
    #[serde(default)]
    pub backups: Vec<BackupEntry>,
}

impl Instance {
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }

    pub fn service_name(&self) -> String {
        service_name(&self.id)
    }

    pub fn var_context(&self) -> VarContext<'_> {
        VarContext {
            port: self.port,
            domain: &self.domain,
            tls: self.tls,
        }
    }

    /// Most recent backup by creation time.
    pub fn latest_backup(&self) -> Option<&BackupEntry> {
        self.backups.iter().max_by_key(|b| b.created_at)
    }

    pub fn find_backup(&self, backup_id: &str) -> Option<&BackupEntry> {
        self.backups.iter().find(|b| b.id == backup_id)
    }

    fn is_structurally_valid(&self) -> bool {
        !self.id.trim().is_empty()
            && !self.name.trim().is_empty()
            && self.port != 0
            && !self.install_dir.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Install,
    Update,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub kind: HistoryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_version: Option<String>,
    pub to_version: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
}

impl HistoryEntry {
    pub fn new(kind: HistoryKind, from_version: Option<&str>, to_version: &str) -> Self {
        Self {
            kind,
            from_version: from_version.map(str::to_string),
            to_version: to_version.to_string(),
            timestamp: Utc::now(),
            backup_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Initial,
    PreUpdate,
    Manual,
}

impl BackupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::PreUpdate => "pre-update",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub kind: BackupKind,
    pub version: String,
    pub compression: String,
    pub path: String,
}

/// On-disk registry document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryDocument {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_instance_id: Option<String>,
    #[serde(default)]
    pub instances: Vec<Instance>,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            version: REGISTRY_FORMAT_VERSION,
            default_instance_id: None,
            instances: Vec::new(),
        }
    }
}

impl RegistryDocument {
    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Instance> {
        self.instances.iter_mut().find(|i| i.id == id)
    }
}

/// Loose shape used to salvage valid entries from a damaged document.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDocument {
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    default_instance_id: Option<String>,
    #[serde(default)]
    instances: Vec<serde_json::Value>,
}

pub struct Registry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Registry {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. A missing file yields an empty registry; a corrupt
    /// one is preserved under a timestamped name and replaced by an empty
    /// registry. Invalid entries are dropped and the cleaned document saved.
    pub fn load(&self) -> Result<RegistryDocument> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.load_unlocked()
    }

    fn load_unlocked(&self) -> Result<RegistryDocument> {
        if !self.path.exists() {
            return Ok(RegistryDocument::default());
        }

        let bytes = fs::read(&self.path)
            .map_err(|e| AppError::registry(format!("Failed to read registry: {}", e)))?;

        let raw: RawDocument = match serde_json::from_slice(&bytes) {
            Ok(raw) => raw,
            Err(e) => {
                log::error!("Registry {:?} is corrupt ({}), reinitializing", self.path, e);
                self.preserve_corrupt(&bytes);
                let doc = RegistryDocument::default();
                if let Err(e) = self.save_unlocked(&doc) {
                    log::warn!("Failed to write fresh registry: {}", e);
                }
                return Ok(doc);
            }
        };

        let total = raw.instances.len();
        let mut instances: Vec<Instance> = Vec::with_capacity(total);
        for value in raw.instances {
            match serde_json::from_value::<Instance>(value) {
                Ok(instance) if instance.is_structurally_valid() => {
                    if instances.iter().any(|i| i.id == instance.id) {
                        log::warn!("Dropping duplicate registry entry {}", instance.id);
                    } else {
                        instances.push(instance);
                    }
                }
                Ok(instance) => {
                    log::warn!("Dropping incomplete registry entry {:?}", instance.id);
                }
                Err(e) => log::warn!("Dropping malformed registry entry: {}", e),
            }
        }

        let default_instance_id = raw
            .default_instance_id
            .filter(|id| instances.iter().any(|i| &i.id == id));
        let doc = RegistryDocument {
            version: raw.version.unwrap_or(REGISTRY_FORMAT_VERSION),
            default_instance_id,
            instances,
        };

        if doc.instances.len() != total {
            log::warn!(
                "Filtered {} invalid registry entries",
                total - doc.instances.len()
            );
            self.save_unlocked(&doc)?;
        }

        Ok(doc)
    }

    fn preserve_corrupt(&self, bytes: &[u8]) {
        let timestamp = Utc::now().format("%Y%m%d%H%M%S%3f");
        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("registry.json");
        let backup = self
            .path
            .with_file_name(format!("{}.corrupt-{}", file_name, timestamp));
        match fs::write(&backup, bytes) {
            Ok(()) => log::warn!("Preserved corrupt registry as {:?}", backup),
            Err(e) => log::error!("Failed to preserve corrupt registry: {}", e),
        }
    }

    fn save_unlocked(&self, doc: &RegistryDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| AppError::registry(format!("Failed to create registry dir: {}", e)))?;
        }
        let content = serde_json::to_string_pretty(doc)
            .map_err(|e| AppError::registry(format!("Failed to serialize registry: {}", e)))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .map_err(|e| AppError::registry(format!("Failed to write registry: {}", e)))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| AppError::registry(format!("Failed to replace registry: {}", e)))
    }

    /// Execute a read-modify-write operation on the registry while holding a lock.
    /// The document is only saved when `f` succeeds.
    pub fn with_registry_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut RegistryDocument) -> Result<T>,
    {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut doc = self.load_unlocked()?;
        let result = f(&mut doc)?;
        self.save_unlocked(&doc)?;
        Ok(result)
    }

    pub fn list(&self) -> Result<Vec<Instance>> {
        Ok(self.load()?.instances)
    }

    pub fn find(&self, id: &str) -> Result<Option<Instance>> {
        Ok(self.load()?.get(id).cloned())
    }

    pub fn get(&self, id: &str) -> Result<Instance> {
        self.find(id)?
            .ok_or_else(|| AppError::instance_not_found(id))
    }

    /// Insert a new instance. Rejects a duplicate id, and re-checks name,
    /// port and domain uniqueness under the lock since the document may have
    /// changed since the caller's pre-flight check.
    pub fn create(&self, instance: Instance) -> Result<()> {
        if !instance.is_structurally_valid() {
            return Err(AppError::registry("Instance is missing required fields"));
        }
        self.with_registry_mut(move |doc| {
            if doc.get(&instance.id).is_some() {
                return Err(AppError::registry(format!(
                    "Instance {} already exists",
                    instance.id
                )));
            }
            if let Some(collision) =
                find_collision(&doc.instances, &instance.name, instance.port, &instance.domain)
            {
                return Err(AppError::conflict(
                    collision.field(),
                    &collision.value_of(&instance),
                    None,
                ));
            }
            doc.instances.push(instance);
            Ok(())
        })
    }

    /// Mutate an instance in place. `updated_at` never moves backwards.
    pub fn update<F>(&self, id: &str, f: F) -> Result<Instance>
    where
        F: FnOnce(&mut Instance),
    {
        self.with_registry_mut(|doc| {
            let instance = doc
                .get_mut(id)
                .ok_or_else(|| AppError::instance_not_found(id))?;
            let previous = instance.updated_at;
            f(instance);
            instance.id = id.to_string();
            instance.updated_at = Utc::now().max(previous);
            Ok(instance.clone())
        })
    }

    /// Remove an instance, clearing the default pointer if it held it.
    pub fn delete(&self, id: &str) -> Result<Instance> {
        self.with_registry_mut(|doc| {
            let idx = doc
                .instances
                .iter()
                .position(|i| i.id == id)
                .ok_or_else(|| AppError::instance_not_found(id))?;
            let removed = doc.instances.remove(idx);
            if doc.default_instance_id.as_deref() == Some(id) {
                doc.default_instance_id = None;
            }
            Ok(removed)
        })
    }

    pub fn set_default(&self, id: &str) -> Result<()> {
        self.with_registry_mut(|doc| {
            if doc.get(id).is_none() {
                return Err(AppError::instance_not_found(id));
            }
            doc.default_instance_id = Some(id.to_string());
            Ok(())
        })
    }

    pub fn default_instance(&self) -> Result<Option<Instance>> {
        let doc = self.load()?;
        Ok(doc
            .default_instance_id
            .as_deref()
            .and_then(|id| doc.get(id))
            .cloned())
    }

    pub fn add_backup(&self, id: &str, entry: BackupEntry) -> Result<Instance> {
        self.update(id, move |instance| instance.backups.push(entry))
    }

    pub fn remove_backup(&self, id: &str, backup_id: &str) -> Result<Instance> {
        self.update(id, |instance| instance.backups.retain(|b| b.id != backup_id))
    }

    /// Set the recorded version and append a history entry.
    pub fn record_version(&self, id: &str, entry: HistoryEntry) -> Result<Instance> {
        self.update(id, move |instance| {
            instance.version = entry.to_version.clone();
            instance.update_history.push(entry);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_instance;
    use tempfile::TempDir;

    fn registry(tmp: &TempDir) -> Registry {
        Registry::open(tmp.path().join("registry.json"))
    }

    #[test]
    fn missing_file_loads_empty() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let doc = registry(&tmp).load().expect("load should succeed");
        assert!(doc.instances.is_empty());
        assert_eq!(doc.version, REGISTRY_FORMAT_VERSION);
    }

    #[test]
    fn duplicate_create_is_rejected_until_deleted() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let reg = registry(&tmp);
        let instance = sample_instance("alpha", 8080, "alpha.example.com");

        reg.create(instance.clone()).expect("first create");
        let err = reg.create(instance.clone()).expect_err("duplicate");
        assert_eq!(err.kind(), crate::error::ErrorKind::Registry);

        reg.delete(&instance.id).expect("delete");
        reg.create(instance).expect("create after delete");
    }

    #[test]
    fn create_rejects_name_port_and_domain_reuse() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let reg = registry(&tmp);
        reg.create(sample_instance("alpha", 8080, "alpha.example.com"))
            .expect("first create");

        let err = reg
            .create(sample_instance("Alpha", 9000, "other.example.com"))
            .expect_err("same name");
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
        assert_eq!(err.get("field"), Some("name"));

        let err = reg
            .create(sample_instance("beta", 8080, "beta.example.com"))
            .expect_err("same port");
        assert_eq!(err.get("field"), Some("port"));

        let err = reg
            .create(sample_instance("gamma", 8082, "ALPHA.example.com"))
            .expect_err("same domain");
        assert_eq!(err.get("field"), Some("domain"));

        assert_eq!(reg.list().expect("list").len(), 1);
        reg.create(sample_instance("delta", 8083, "delta.example.com"))
            .expect("unique instance");
    }

    #[test]
    fn round_trip_preserves_fields() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let reg = registry(&tmp);
        let mut instance = sample_instance("alpha", 8080, "alpha.example.com");
        instance.backups.push(BackupEntry {
            id: "b1".to_string(),
            created_at: Utc::now(),
            kind: BackupKind::Manual,
            version: "1.0.0".to_string(),
            compression: "gzip".to_string(),
            path: "/var/backups/homeport/x/b1.tar.gz".to_string(),
        });
        reg.create(instance.clone()).expect("create");

        let loaded = reg.get(&instance.id).expect("get");
        assert_eq!(loaded, instance);
        assert_eq!(loaded.slug(), "alpha");
        assert_eq!(loaded.service_name(), format!("homeport-{}", instance.id));
    }

    #[test]
    fn updated_at_is_monotonic() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let reg = registry(&tmp);
        let mut instance = sample_instance("alpha", 8080, "alpha.example.com");
        instance.updated_at = Utc::now() + chrono::Duration::hours(1);
        let future = instance.updated_at;
        reg.create(instance.clone()).expect("create");

        let updated = reg
            .record_version(&instance.id, HistoryEntry::new(HistoryKind::Update, Some("1.0.0"), "1.1.0"))
            .expect("update");
        assert!(updated.updated_at >= future);
        assert_eq!(updated.version, "1.1.0");
        assert_eq!(updated.update_history.len(), 1);
    }

    #[test]
    fn corrupt_file_is_backed_up_and_reset() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let reg = registry(&tmp);
        let garbage = b"{ this is not json";
        fs::write(reg.path(), garbage).expect("write");

        let doc = reg.load().expect("load never raises on corruption");
        assert!(doc.instances.is_empty());

        let backups: Vec<_> = fs::read_dir(tmp.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read(backups[0].path()).expect("read"), garbage);

        reg.create(sample_instance("beta", 8081, "beta.example.com"))
            .expect("registry usable after reset");
    }

    #[test]
    fn invalid_entries_are_filtered_and_persisted() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let reg = registry(&tmp);
        let valid = sample_instance("alpha", 8080, "alpha.example.com");
        let doc = serde_json::json!({
            "version": 1,
            "defaultInstanceId": "missing",
            "instances": [
                serde_json::to_value(&valid).expect("to_value"),
                { "id": "broken", "name": "no port" },
            ]
        });
        fs::write(reg.path(), doc.to_string()).expect("write");

        let loaded = reg.load().expect("load");
        assert_eq!(loaded.instances.len(), 1);
        assert_eq!(loaded.default_instance_id, None);

        let on_disk: serde_json::Value =
            serde_json::from_slice(&fs::read(reg.path()).expect("read")).expect("parse");
        assert_eq!(on_disk["instances"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn delete_clears_default_pointer() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let reg = registry(&tmp);
        let instance = sample_instance("alpha", 8080, "alpha.example.com");
        reg.create(instance.clone()).expect("create");
        reg.set_default(&instance.id).expect("set default");
        assert_eq!(
            reg.default_instance().expect("default").map(|i| i.id),
            Some(instance.id.clone())
        );

        reg.delete(&instance.id).expect("delete");
        assert_eq!(reg.load().expect("load").default_instance_id, None);
    }

    #[test]
    fn set_default_requires_existing_instance() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let err = registry(&tmp).set_default("nope").expect_err("unknown id");
        assert_eq!(err.kind(), crate::error::ErrorKind::InstanceNotFound);
    }
}
