use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::archive;
use crate::download::{download_file, USER_AGENT};
use crate::error::{AppError, Result};
use crate::locator::build_payload;
use crate::payload::is_payload_dir;
use crate::release::{ReleaseCatalog, ReleaseInfo};
use crate::runner::LocalRunner;
use crate::validation::validate_version_tag;
use crate::version::sort_versions_desc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubRelease {
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub assets: Vec<GitHubAsset>,
    pub html_url: String,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubAsset {
    pub name: String,
    pub browser_download_url: String,
    pub size: u64,
}

impl GitHubRelease {
    /// A pre-built payload tarball attached to the release, if any.
    pub fn payload_asset(&self) -> Option<&GitHubAsset> {
        self.assets.iter().find(|a| a.name.ends_with(".tar.gz"))
    }
}

/// Wrap a URL with the GitHub proxy prefix.
/// If proxy is empty, returns the original URL unchanged.
fn wrap_with_proxy(proxy: &str, url: &str) -> String {
    if proxy.is_empty() {
        url.to_string()
    } else {
        let base = proxy.trim_end_matches('/');
        format!("{}/{}", base, url)
    }
}

/// Build the releases API URL, optionally using a GitHub proxy.
/// Proxy wraps the full original URL, e.g. `https://cdn.gh-proxy.org/https://api.github.com/...`.
pub fn build_api_url(proxy: &str, repo: &str) -> String {
    let raw = format!("https://api.github.com/repos/{}/releases?per_page=30", repo);
    wrap_with_proxy(proxy, &raw)
}

/// Source tarball URL for a tag, optionally using a GitHub proxy.
pub fn build_source_url(proxy: &str, repo: &str, tag: &str) -> String {
    let raw = format!("https://github.com/{}/archive/refs/tags/{}.tar.gz", repo, tag);
    wrap_with_proxy(proxy, &raw)
}

pub async fn fetch_releases(client: &Client, proxy: &str, repo: &str) -> Result<Vec<GitHubRelease>> {
    let url = build_api_url(proxy, repo);
    let resp = client
        .get(&url)
        .header("User-Agent", USER_AGENT)
        .header("Accept", "application/vnd.github.v3+json")
        .send()
        .await
        .map_err(|e| AppError::network_with_url(&url, format!("Failed to fetch releases: {}", e)))?;

    if !resp.status().is_success() {
        return Err(AppError::network_with_url(
            &url,
            format!("GitHub API returned status: {}", resp.status()),
        ));
    }

    resp.json::<Vec<GitHubRelease>>()
        .await
        .map_err(|e| AppError::network_with_url(&url, format!("Failed to parse releases: {}", e)))
}

/// Payload releases published on a GitHub repository.
pub struct GitHubCatalog {
    client: Client,
    repo: String,
    proxy: String,
    cache_dir: PathBuf,
}

impl GitHubCatalog {
    pub fn new(client: Client, repo: impl Into<String>, proxy: impl Into<String>, cache_dir: PathBuf) -> Self {
        Self {
            client,
            repo: repo.into(),
            proxy: proxy.into(),
            cache_dir: cache_dir.join("releases"),
        }
    }

    async fn stable_releases(&self) -> Result<Vec<GitHubRelease>> {
        Ok(fetch_releases(&self.client, &self.proxy, &self.repo)
            .await?
            .into_iter()
            .filter(|r| !r.draft && !r.prerelease)
            .collect())
    }
}

#[async_trait]
impl ReleaseCatalog for GitHubCatalog {
    async fn releases(&self) -> Result<Vec<ReleaseInfo>> {
        let releases = self.stable_releases().await?;
        let mut versions: Vec<String> = releases
            .iter()
            .map(|r| r.tag_name.trim_start_matches('v').to_string())
            .collect();
        sort_versions_desc(&mut versions);

        Ok(versions
            .into_iter()
            .filter_map(|version| {
                releases
                    .iter()
                    .find(|r| r.tag_name.trim_start_matches('v') == version)
                    .map(|r| ReleaseInfo {
                        version,
                        notes: r.body.clone(),
                        published_at: r.published_at.clone(),
                    })
            })
            .collect())
    }

    async fn fetch(&self, version: &str) -> Result<PathBuf> {
        validate_version_tag(version)?;
        let releases = self.stable_releases().await?;
        let release = releases
            .iter()
            .find(|r| r.tag_name.trim_start_matches('v') == version.trim_start_matches('v'))
            .ok_or_else(|| AppError::validation(format!("Release {} not found in {}", version, self.repo)))?;

        let dest = self.cache_dir.join(&release.tag_name);
        if is_payload_dir(&dest) {
            return Ok(dest);
        }

        let url = match release.payload_asset() {
            Some(asset) => wrap_with_proxy(&self.proxy, &asset.browser_download_url),
            None => build_source_url(&self.proxy, &self.repo, &release.tag_name),
        };
        let archive_path = self.cache_dir.join(format!("{}.tar.gz", release.tag_name));
        download_file(&self.client, &url, &archive_path).await?;

        if dest.exists() {
            std::fs::remove_dir_all(&dest)?;
        }
        let (from, to) = (archive_path.clone(), dest.clone());
        tokio::task::spawn_blocking(move || archive::extract_tar_gz(&from, &to))
            .await
            .map_err(|e| AppError::other(format!("Extraction task failed: {}", e)))??;
        if let Err(e) = std::fs::remove_file(&archive_path) {
            log::warn!("Failed to remove {:?}: {}", archive_path, e);
        }

        if !is_payload_dir(&dest) {
            log::info!("Release {} ships sources only, building", release.tag_name);
            build_payload(&LocalRunner::new(), &dest).await?;
        }
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_wraps_full_url() {
        assert_eq!(
            build_api_url("", "acme/server"),
            "https://api.github.com/repos/acme/server/releases?per_page=30"
        );
        assert_eq!(
            build_source_url("https://gh.example.org/", "acme/server", "v1.2.0"),
            "https://gh.example.org/https://github.com/acme/server/archive/refs/tags/v1.2.0.tar.gz"
        );
    }

    #[test]
    fn prefers_tarball_asset() {
        let release: GitHubRelease = serde_json::from_str(
            r#"{"tag_name":"v1.2.0","html_url":"https://github.com/acme/server/releases/v1.2.0","body":null,
                "assets":[{"name":"checksums.txt","browser_download_url":"https://x/c","size":1},
                          {"name":"server-1.2.0.tar.gz","browser_download_url":"https://x/s","size":2}]}"#,
        )
        .expect("parse");
        assert_eq!(release.payload_asset().map(|a| a.name.as_str()), Some("server-1.2.0.tar.gz"));
    }
}
