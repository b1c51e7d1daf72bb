//! The deployable payload: its descriptor file and the target-side
//! operations that place it on a host.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::archive::{self, PACK_EXCLUDES};
use crate::error::{AppError, Result};
use crate::paths::join_remote;
use crate::runner::{quote, CommandRunner};
use crate::service::SERVICE_USER;

pub const DESCRIPTOR_FILE: &str = "package.json";
pub const OUTPUT_DIR: &str = "dist";
pub const ENTRY_POINT: &str = "dist/index.js";
/// Directory inside the payload holding runtime state carried across updates.
pub const DATA_DIR: &str = "data";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PayloadDescriptor {
    #[serde(default)]
    pub name: String,
    pub version: String,
}

impl PayloadDescriptor {
    pub fn parse(content: &str) -> Result<Self> {
        let descriptor: Self = serde_json::from_str(content)
            .map_err(|e| AppError::validation(format!("Invalid {}: {}", DESCRIPTOR_FILE, e)))?;
        if descriptor.version.trim().is_empty() {
            return Err(AppError::validation(format!("{} has no version", DESCRIPTOR_FILE)));
        }
        Ok(descriptor)
    }
}

/// Accepted payload layout: a descriptor plus compiled output.
pub fn is_payload_dir(dir: &Path) -> bool {
    dir.join(DESCRIPTOR_FILE).is_file() && dir.join(OUTPUT_DIR).is_dir()
}

pub fn read_descriptor(dir: &Path) -> Result<PayloadDescriptor> {
    let path = dir.join(DESCRIPTOR_FILE);
    let content = fs::read_to_string(&path)
        .map_err(|e| AppError::io(format!("Failed to read {:?}: {}", path, e)))?;
    PayloadDescriptor::parse(&content)
}

/// Version from the descriptor of a payload deployed at `install_dir`.
pub async fn remote_version(runner: &dyn CommandRunner, install_dir: &str) -> Result<String> {
    let path = join_remote(install_dir, DESCRIPTOR_FILE);
    let output = runner
        .execute_privileged(&format!("cat {}", quote(&path)))
        .await
        .check(&format!("read {}", path))?;
    Ok(PayloadDescriptor::parse(&output.stdout)?.version)
}

pub async fn has_entry_point(runner: &dyn CommandRunner, install_dir: &str) -> bool {
    runner
        .execute_privileged(&format!(
            "test -f {}",
            quote(&join_remote(install_dir, ENTRY_POINT))
        ))
        .await
        .success()
}

/// True when `dir` exists and has any entries.
pub async fn dir_in_use(runner: &dyn CommandRunner, dir: &str) -> bool {
    runner
        .execute_privileged(&format!(
            "[ -d {dir} ] && [ -n \"$(ls -A {dir})\" ]",
            dir = quote(dir)
        ))
        .await
        .success()
}

pub async fn ensure_service_user(runner: &dyn CommandRunner) -> Result<()> {
    let command = format!(
        "id -u {user} >/dev/null 2>&1 || useradd --system --no-create-home --shell /usr/sbin/nologin {user} || adduser -S -D -H {user}",
        user = SERVICE_USER
    );
    runner
        .execute_privileged(&command)
        .await
        .check("create service user")?;
    Ok(())
}

/// Pack `local_dir`, upload it and unpack it into `install_dir`.
/// The staging tarball lives in `staging_dir` and is removed afterwards.
pub async fn deploy(
    runner: &dyn CommandRunner,
    local_dir: &Path,
    install_dir: &str,
    staging_dir: &Path,
) -> Result<()> {
    let archive_name = format!("homeport-payload-{}.tar.gz", uuid::Uuid::new_v4().simple());
    let local_archive = staging_dir.join(&archive_name);
    let source = local_dir.to_path_buf();
    let packed = local_archive.clone();
    let files = tokio::task::spawn_blocking(move || archive::pack_dir(&source, &packed, PACK_EXCLUDES))
        .await
        .map_err(|e| AppError::other(format!("Payload packing task failed: {}", e)))??;
    log::info!("Packed {} payload files from {:?}", files, local_dir);

    let remote_archive = format!("/tmp/{}", archive_name);
    let uploaded = runner.upload(&local_archive, &remote_archive).await;
    if let Err(e) = fs::remove_file(&local_archive) {
        log::warn!("Failed to remove staged payload {:?}: {}", local_archive, e);
    }
    uploaded?;

    let command = format!(
        "mkdir -p {dir} && tar -xzf {archive} -C {dir} && rm -f {archive} && chown -R {user}:{user} {dir}",
        dir = quote(install_dir),
        archive = quote(&remote_archive),
        user = SERVICE_USER,
    );
    let output = runner.execute_privileged(&command).await;
    if !output.success() {
        let cleanup = runner
            .execute_privileged(&format!("rm -f {}", quote(&remote_archive)))
            .await;
        if !cleanup.success() {
            log::warn!("Failed to remove uploaded payload {}: {}", remote_archive, cleanup.combined());
        }
        return Err(AppError::execution("unpack payload", &output));
    }
    Ok(())
}

/// Install production dependencies, using the lockfile when present.
pub async fn install_dependencies(runner: &dyn CommandRunner, install_dir: &str) -> Result<()> {
    let command = format!(
        "cd {dir} && if [ -f package-lock.json ]; then npm ci --omit=dev; else npm install --omit=dev; fi && chown -R {user}:{user} {dir}",
        dir = quote(install_dir),
        user = SERVICE_USER,
    );
    runner
        .execute_privileged(&command)
        .await
        .check("install dependencies")?;
    Ok(())
}

pub fn exec_start(install_dir: &str) -> String {
    format!("/usr/bin/env node {}", join_remote(install_dir, ENTRY_POINT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_payload, MockRunner};
    use tempfile::TempDir;

    #[test]
    fn descriptor_requires_version() {
        assert_eq!(
            PayloadDescriptor::parse("{\"name\":\"x\",\"version\":\"2.1.0\"}")
                .expect("parse")
                .version,
            "2.1.0"
        );
        assert!(PayloadDescriptor::parse("{\"name\":\"x\"}").is_err());
        assert!(PayloadDescriptor::parse("not json").is_err());
    }

    #[test]
    fn payload_dir_needs_descriptor_and_output() {
        let tmp = TempDir::new().expect("tempdir");
        assert!(!is_payload_dir(tmp.path()));
        write_payload(tmp.path(), "1.0.0");
        assert!(is_payload_dir(tmp.path()));
        assert_eq!(read_descriptor(tmp.path()).expect("read").version, "1.0.0");
    }

    #[tokio::test]
    async fn deploy_uploads_and_unpacks() {
        let tmp = TempDir::new().expect("tempdir");
        let payload = tmp.path().join("payload");
        write_payload(&payload, "1.0.0");
        let runner = MockRunner::new();

        deploy(&runner, &payload, "/opt/homeport/app", tmp.path())
            .await
            .expect("deploy");

        let uploads = runner.uploads();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].1.starts_with("/tmp/homeport-payload-"));
        assert!(!uploads[0].0.exists());
        assert!(runner.ran("tar -xzf /tmp/homeport-payload-"));
        assert!(runner.ran("-C /opt/homeport/app"));
    }

    #[tokio::test]
    async fn failed_unpack_removes_uploaded_archive() {
        let tmp = TempDir::new().expect("tempdir");
        let payload = tmp.path().join("payload");
        write_payload(&payload, "1.0.0");
        let runner = MockRunner::new();
        runner.respond("tar -xzf /tmp/homeport-payload-", 2, "");

        let err = deploy(&runner, &payload, "/opt/homeport/app", tmp.path())
            .await
            .expect_err("unpack fails");

        assert_eq!(err.kind(), crate::error::ErrorKind::Execution);
        assert_eq!(runner.count("rm -f /tmp/homeport-payload-"), 2);
    }

    #[tokio::test]
    async fn reads_remote_version() {
        let runner = MockRunner::new();
        runner.respond("cat /opt/homeport/app/package.json", 0, "{\"version\":\"1.4.2\"}");
        assert_eq!(
            remote_version(&runner, "/opt/homeport/app").await.expect("version"),
            "1.4.2"
        );
    }
}
