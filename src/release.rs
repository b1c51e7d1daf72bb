//! Where payload versions come from.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::locator::ResourceLocator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
}

#[async_trait]
pub trait ReleaseCatalog: Send + Sync {
    /// Known releases, newest first.
    async fn releases(&self) -> Result<Vec<ReleaseInfo>>;

    /// Local directory holding the built payload for `version`.
    async fn fetch(&self, version: &str) -> Result<PathBuf>;
}

/// The single payload the locator finds on this machine.
pub struct LocalPayloadCatalog {
    locator: Arc<ResourceLocator>,
}

impl LocalPayloadCatalog {
    pub fn new(locator: Arc<ResourceLocator>) -> Self {
        Self { locator }
    }
}

#[async_trait]
impl ReleaseCatalog for LocalPayloadCatalog {
    async fn releases(&self) -> Result<Vec<ReleaseInfo>> {
        let located = self.locator.locate_or_fetch().await?;
        Ok(vec![ReleaseInfo {
            version: located.version,
            notes: None,
            published_at: None,
        }])
    }

    async fn fetch(&self, version: &str) -> Result<PathBuf> {
        let located = self.locator.locate_or_fetch().await?;
        if located.version.trim_start_matches('v') != version.trim_start_matches('v') {
            return Err(AppError::validation(format!(
                "Local payload is version {}, not {}",
                located.version, version
            )));
        }
        Ok(located.dir)
    }
}
