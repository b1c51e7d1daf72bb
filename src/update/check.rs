use serde::Serialize;

use crate::error::Result;
use crate::payload;
use crate::registry::Instance;
use crate::release::{ReleaseCatalog, ReleaseInfo};
use crate::runner::CommandRunner;
use crate::version::{compare, VersionVerdict};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub current_version: String,
    pub latest_version: Option<String>,
    /// Every known release, newest first.
    pub available_versions: Vec<String>,
    pub update_available: bool,
    /// Releases newer than the current version, newest first.
    pub change_list: Vec<ReleaseInfo>,
}

/// The registry's version, or the deployed descriptor's when the registry
/// has none. Reading the descriptor needs a connected runner.
pub async fn current_version(runner: &dyn CommandRunner, instance: &Instance) -> Result<String> {
    if !instance.version.trim().is_empty() {
        return Ok(instance.version.clone());
    }
    payload::remote_version(runner, &instance.install_dir).await
}

fn is_newer(current: &str, candidate: &str) -> bool {
    match compare(current, candidate) {
        Ok(comparison) => comparison.verdict == VersionVerdict::Newer,
        Err(e) => {
            log::warn!("Ignoring release {}: {}", candidate, e);
            false
        }
    }
}

pub async fn check_for_updates(
    runner: &dyn CommandRunner,
    catalog: &dyn ReleaseCatalog,
    instance: &Instance,
) -> Result<UpdateInfo> {
    let current_version = if instance.version.trim().is_empty() {
        runner.connect().await?;
        let version = current_version(runner, instance).await;
        if let Err(e) = runner.disconnect().await {
            log::warn!("Failed to disconnect from {}: {}", instance.target.label(), e);
        }
        version?
    } else {
        instance.version.clone()
    };

    let releases = catalog.releases().await?;
    let change_list: Vec<ReleaseInfo> = releases
        .iter()
        .filter(|r| is_newer(&current_version, &r.version))
        .cloned()
        .collect();

    log::info!(
        "{} is at {}; {} newer release(s) available",
        instance.name,
        current_version,
        change_list.len()
    );
    Ok(UpdateInfo {
        latest_version: releases.first().map(|r| r.version.clone()),
        available_versions: releases.into_iter().map(|r| r.version).collect(),
        update_available: !change_list.is_empty(),
        change_list,
        current_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_instance, MockRunner};
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct FixedCatalog(Vec<&'static str>);

    #[async_trait]
    impl ReleaseCatalog for FixedCatalog {
        async fn releases(&self) -> Result<Vec<ReleaseInfo>> {
            Ok(self
                .0
                .iter()
                .map(|v| ReleaseInfo {
                    version: v.to_string(),
                    notes: Some(format!("Changes in {}", v)),
                    published_at: None,
                })
                .collect())
        }

        async fn fetch(&self, _version: &str) -> Result<PathBuf> {
            Ok(PathBuf::from("/nonexistent"))
        }
    }

    #[tokio::test]
    async fn lists_newer_releases() {
        let runner = MockRunner::new();
        let mut instance = sample_instance("alpha", 8080, "alpha.example.com");
        instance.version = "1.1.0".to_string();
        let catalog = FixedCatalog(vec!["v1.3.0", "v1.2.0", "v1.1.0", "v1.0.0"]);

        let info = check_for_updates(&runner, &catalog, &instance).await.expect("check");
        assert!(info.update_available);
        assert_eq!(info.latest_version.as_deref(), Some("v1.3.0"));
        assert_eq!(info.available_versions.len(), 4);
        let changes: Vec<&str> = info.change_list.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(changes, vec!["v1.3.0", "v1.2.0"]);
        assert_eq!(runner.connects(), 0);
    }

    #[tokio::test]
    async fn falls_back_to_deployed_descriptor() {
        let runner = MockRunner::new();
        runner.respond("cat /opt/homeport/alpha/package.json", 0, r#"{"version":"1.3.0"}"#);
        let mut instance = sample_instance("alpha", 8080, "alpha.example.com");
        instance.version = String::new();
        let catalog = FixedCatalog(vec!["1.3.0"]);

        let info = check_for_updates(&runner, &catalog, &instance).await.expect("check");
        assert_eq!(info.current_version, "1.3.0");
        assert!(!info.update_available);
        assert_eq!(runner.connects(), 1);
        assert_eq!(runner.disconnects(), 1);
    }
}
