//! Payload backups stored as gzip tarballs on the target host.

use chrono::Utc;

use crate::error::{AppError, Result};
use crate::paths::join_remote;
use crate::registry::{BackupEntry, BackupKind, Instance};
use crate::runner::{quote, CommandRunner};

pub const COMPRESSION: &str = "gzip";

/// Per-instance backup directory under the configured backup root.
pub fn instance_backup_dir(backup_root: &str, instance_id: &str) -> String {
    join_remote(backup_root, instance_id)
}

pub struct BackupManager<'a> {
    runner: &'a dyn CommandRunner,
    backup_dir: String,
}

impl<'a> BackupManager<'a> {
    pub fn new(runner: &'a dyn CommandRunner, backup_dir: impl Into<String>) -> Self {
        Self {
            runner,
            backup_dir: backup_dir.into(),
        }
    }

    /// Archive `install_dir` (without installed dependencies).
    pub async fn create(&self, install_dir: &str, kind: BackupKind, version: &str) -> Result<BackupEntry> {
        let created_at = Utc::now();
        let id = format!(
            "{}-{}-{}",
            created_at.format("%Y%m%d%H%M%S"),
            kind.as_str(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let path = join_remote(&self.backup_dir, &format!("{}.tar.gz", id));

        let command = format!(
            "mkdir -p {dir} && chmod 700 {dir} && tar -czf {path} --exclude=./node_modules -C {src} .",
            dir = quote(&self.backup_dir),
            path = quote(&path),
            src = quote(install_dir),
        );
        let output = self.runner.execute_privileged(&command).await;
        if !output.success() {
            let cleanup = self
                .runner
                .execute_privileged(&format!("rm -f {}", quote(&path)))
                .await;
            if !cleanup.success() {
                log::warn!("Failed to remove partial backup {}: {}", path, cleanup.combined());
            }
            return Err(AppError::backup(format!(
                "Failed to create backup of {}: {}",
                install_dir,
                output.combined()
            )));
        }

        log::info!("Created {} backup {} of {}", kind.as_str(), id, install_dir);
        Ok(BackupEntry {
            id,
            created_at,
            kind,
            version: version.to_string(),
            compression: COMPRESSION.to_string(),
            path,
        })
    }

    /// Replace `install_dir` with the backup's contents. The archive is
    /// unpacked beside the target first so a broken archive leaves the
    /// current payload untouched.
    pub async fn restore(&self, entry: &BackupEntry, install_dir: &str) -> Result<()> {
        let staging = format!("{}.restore", install_dir.trim_end_matches('/'));
        let command = format!(
            "test -f {archive} && rm -rf {staging} && mkdir -p {staging} && tar -xzf {archive} -C {staging} && rm -rf {dir} && mv {staging} {dir}",
            archive = quote(&entry.path),
            staging = quote(&staging),
            dir = quote(install_dir),
        );
        let output = self.runner.execute_privileged(&command).await;
        if !output.success() {
            let cleanup = self
                .runner
                .execute_privileged(&format!("rm -rf {}", quote(&staging)))
                .await;
            if !cleanup.success() {
                log::warn!("Failed to remove restore staging {}: {}", staging, cleanup.combined());
            }
            return Err(AppError::backup(format!(
                "Failed to restore backup {}: {}",
                entry.id,
                output.combined()
            )));
        }
        log::info!("Restored backup {} into {}", entry.id, install_dir);
        Ok(())
    }

    pub async fn delete(&self, entry: &BackupEntry) -> Result<()> {
        self.runner
            .execute_privileged(&format!("rm -f {}", quote(&entry.path)))
            .await
            .check(&format!("delete backup {}", entry.id))?;
        Ok(())
    }

    pub async fn delete_all(&self) {
        let output = self
            .runner
            .execute_privileged(&format!("rm -rf {}", quote(&self.backup_dir)))
            .await;
        if !output.success() {
            log::warn!("Failed to remove {}: {}", self.backup_dir, output.combined());
        }
    }

    /// Delete automatic backups beyond the newest `keep`. Manual backups are
    /// never pruned. Returns the ids that were removed from the host.
    pub async fn prune(&self, instance: &Instance, keep: usize) -> Vec<String> {
        let mut removed = Vec::new();
        for entry in prune_candidates(&instance.backups, keep) {
            match self.delete(entry).await {
                Ok(()) => removed.push(entry.id.clone()),
                Err(e) => log::warn!("Failed to prune backup {}: {}", entry.id, e),
            }
        }
        removed
    }
}

/// Automatic backups that fall outside the newest `keep`.
pub fn prune_candidates(backups: &[BackupEntry], keep: usize) -> Vec<&BackupEntry> {
    let mut automatic: Vec<&BackupEntry> = backups
        .iter()
        .filter(|b| b.kind != BackupKind::Manual)
        .collect();
    automatic.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    automatic.into_iter().skip(keep).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_instance, MockRunner};
    use chrono::Duration;

    fn entry(id: &str, kind: BackupKind, age_minutes: i64) -> BackupEntry {
        BackupEntry {
            id: id.to_string(),
            created_at: Utc::now() - Duration::minutes(age_minutes),
            kind,
            version: "1.0.0".to_string(),
            compression: COMPRESSION.to_string(),
            path: format!("/var/backups/homeport/x/{}.tar.gz", id),
        }
    }

    #[tokio::test]
    async fn create_archives_install_dir() {
        let runner = MockRunner::new();
        let manager = BackupManager::new(&runner, "/var/backups/homeport/abc");
        let backup = manager
            .create("/opt/homeport/app", BackupKind::PreUpdate, "1.0.0")
            .await
            .expect("create");

        assert!(backup.id.contains("pre-update"));
        assert!(backup.path.starts_with("/var/backups/homeport/abc/"));
        assert!(runner.ran("--exclude=./node_modules -C /opt/homeport/app ."));
    }

    #[tokio::test]
    async fn failed_create_removes_partial_archive() {
        let runner = MockRunner::new();
        runner.respond("tar -czf", 2, "");
        let manager = BackupManager::new(&runner, "/var/backups/homeport/abc");
        let err = manager
            .create("/opt/homeport/app", BackupKind::Manual, "1.0.0")
            .await
            .expect_err("tar fails");
        assert_eq!(err.kind(), crate::error::ErrorKind::Backup);
        assert!(runner.ran("rm -f /var/backups/homeport/abc/"));
    }

    #[tokio::test]
    async fn restore_swaps_in_staged_copy() {
        let runner = MockRunner::new();
        let manager = BackupManager::new(&runner, "/var/backups/homeport/abc");
        let backup = entry("b1", BackupKind::PreUpdate, 1);
        manager.restore(&backup, "/opt/homeport/app").await.expect("restore");
        assert!(runner.ran("mv /opt/homeport/app.restore /opt/homeport/app"));
    }

    #[tokio::test]
    async fn failed_restore_cleans_staging_and_keeps_original_error() {
        let runner = MockRunner::new();
        runner.respond("tar -xzf", 2, "corrupt archive");
        runner.respond("rm -rf /opt/homeport/app.restore", 1, "");
        let manager = BackupManager::new(&runner, "/var/backups/homeport/abc");
        let backup = entry("b1", BackupKind::PreUpdate, 1);

        let err = manager
            .restore(&backup, "/opt/homeport/app")
            .await
            .expect_err("restore fails");

        assert_eq!(err.kind(), crate::error::ErrorKind::Backup);
        assert!(err.to_string().contains("b1"));
        assert_eq!(runner.count("rm -rf /opt/homeport/app.restore"), 2);
    }

    #[tokio::test]
    async fn prune_keeps_newest_automatic_and_all_manual() {
        let runner = MockRunner::new();
        let manager = BackupManager::new(&runner, "/var/backups/homeport/x");
        let mut instance = sample_instance("app", 8080, "app.example.com");
        instance.backups = vec![
            entry("old", BackupKind::PreUpdate, 30),
            entry("manual", BackupKind::Manual, 40),
            entry("newer", BackupKind::PreUpdate, 10),
            entry("initial", BackupKind::Initial, 50),
        ];

        let removed = manager.prune(&instance, 2).await;
        assert_eq!(removed, vec!["initial".to_string()]);
        assert!(!runner.ran("manual.tar.gz"));
    }
}
