//! Finds a pre-built payload regardless of how the launcher was shipped.
//!
//! Candidates come from one ordered table of `(root, relative path)` pairs
//! covering the desktop-packaged, CLI-packaged and source-tree layouts. The
//! first directory passing [`is_payload_dir`] wins; with no match the payload
//! is cloned and built into the cache.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{AppError, Result};
use crate::payload::{is_payload_dir, read_descriptor};
use crate::runner::{quote, CommandRunner, LocalRunner};

pub const PAYLOAD_DIR_ENV: &str = "HOMEPORT_PAYLOAD_DIR";
pub const RESOURCES_DIR_ENV: &str = "HOMEPORT_RESOURCES_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Environment,
    Resources,
    WorkingDir,
    InstallLocation,
    SourceTree,
    Clone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    PayloadEnv,
    ResourcesEnv,
    Cwd,
    ExeDir,
    ManifestDir,
}

/// Ordered search table; earlier rows win.
const CANDIDATES: &[(Root, &str, CandidateSource)] = &[
    (Root::PayloadEnv, "", CandidateSource::Environment),
    (Root::ResourcesEnv, "payload", CandidateSource::Environment),
    // desktop bundles
    (Root::ExeDir, "resources/payload", CandidateSource::Resources),
    (Root::ExeDir, "../Resources/payload", CandidateSource::Resources),
    (Root::ExeDir, "../lib/homeport/resources/payload", CandidateSource::Resources),
    // CLI packages
    (Root::ExeDir, "payload", CandidateSource::InstallLocation),
    (Root::ExeDir, "../share/homeport/payload", CandidateSource::InstallLocation),
    (Root::ExeDir, "../lib/homeport/payload", CandidateSource::InstallLocation),
    // running from a checkout
    (Root::Cwd, "payload", CandidateSource::WorkingDir),
    (Root::Cwd, "", CandidateSource::WorkingDir),
    (Root::Cwd, "packages/server", CandidateSource::WorkingDir),
    (Root::ExeDir, "../../packages/server", CandidateSource::SourceTree),
    (Root::ManifestDir, "../packages/server", CandidateSource::SourceTree),
    (Root::ManifestDir, "payload", CandidateSource::SourceTree),
];

/// Roots the candidate table is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct LocatorContext {
    pub payload_dir: Option<PathBuf>,
    pub resources_dir: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub exe_dir: Option<PathBuf>,
    pub manifest_dir: Option<PathBuf>,
}

impl LocatorContext {
    pub fn from_process() -> Self {
        let non_empty = |name: &str| {
            std::env::var_os(name)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        };
        Self {
            payload_dir: non_empty(PAYLOAD_DIR_ENV),
            resources_dir: non_empty(RESOURCES_DIR_ENV),
            cwd: std::env::current_dir().ok(),
            exe_dir: std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf)),
            manifest_dir: option_env!("CARGO_MANIFEST_DIR").map(PathBuf::from),
        }
    }

    fn root(&self, root: Root) -> Option<&Path> {
        match root {
            Root::PayloadEnv => self.payload_dir.as_deref(),
            Root::ResourcesEnv => self.resources_dir.as_deref(),
            Root::Cwd => self.cwd.as_deref(),
            Root::ExeDir => self.exe_dir.as_deref(),
            Root::ManifestDir => self.manifest_dir.as_deref(),
        }
    }

    /// Candidate directories in priority order.
    pub fn candidates(&self) -> Vec<(PathBuf, CandidateSource)> {
        CANDIDATES
            .iter()
            .filter_map(|(root, relative, source)| {
                let base = self.root(*root)?;
                let path = if relative.is_empty() {
                    base.to_path_buf()
                } else {
                    base.join(relative)
                };
                Some((path, *source))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocatedPayload {
    pub dir: PathBuf,
    pub version: String,
    pub source: CandidateSource,
}

pub struct ResourceLocator {
    context: LocatorContext,
    clone_dir: PathBuf,
    repo_url: String,
}

impl ResourceLocator {
    pub fn new(context: LocatorContext, cache_dir: &Path, repo_url: impl Into<String>) -> Self {
        Self {
            context,
            clone_dir: cache_dir.join("payload-src"),
            repo_url: repo_url.into(),
        }
    }

    /// First acceptable candidate, including a previous clone in the cache.
    pub fn locate(&self) -> Option<LocatedPayload> {
        let mut candidates = self.context.candidates();
        candidates.push((self.clone_dir.clone(), CandidateSource::Clone));
        candidates.into_iter().find_map(|(dir, source)| {
            if !is_payload_dir(&dir) {
                return None;
            }
            match read_descriptor(&dir) {
                Ok(descriptor) => {
                    let dir = dir.canonicalize().unwrap_or(dir);
                    log::info!("Using payload {} from {:?} ({:?})", descriptor.version, dir, source);
                    Some(LocatedPayload {
                        dir,
                        version: descriptor.version,
                        source,
                    })
                }
                Err(e) => {
                    log::warn!("Ignoring payload candidate {:?}: {}", dir, e);
                    None
                }
            }
        })
    }

    /// [`locate`](Self::locate), falling back to cloning and building.
    pub async fn locate_or_fetch(&self) -> Result<LocatedPayload> {
        if let Some(found) = self.locate() {
            return Ok(found);
        }
        if self.repo_url.trim().is_empty() {
            return Err(AppError::validation(format!(
                "No pre-built payload found and no payload repository configured (set {} or payload_repo_url)",
                PAYLOAD_DIR_ENV
            )));
        }

        log::warn!("No pre-built payload found, cloning {}", self.repo_url);
        let runner = LocalRunner::new();
        let dir = self.clone_dir.to_string_lossy().into_owned();
        runner
            .execute(&format!(
                "rm -rf {dir} && git clone --depth 1 {url} {dir}",
                dir = quote(&dir),
                url = quote(&self.repo_url)
            ))
            .await
            .check("clone payload repository")?;
        build_payload(&runner, &self.clone_dir).await?;

        let descriptor = read_descriptor(&self.clone_dir)?;
        Ok(LocatedPayload {
            dir: self.clone_dir.clone(),
            version: descriptor.version,
            source: CandidateSource::Clone,
        })
    }
}

/// Install dev dependencies and compile a source checkout in place.
pub async fn build_payload(runner: &dyn CommandRunner, dir: &Path) -> Result<()> {
    runner
        .execute(&format!(
            "cd {} && npm install && npm run build",
            quote(&dir.to_string_lossy())
        ))
        .await
        .check("build payload")?;
    if !is_payload_dir(dir) {
        return Err(AppError::validation(format!(
            "Build of {:?} produced no compiled output",
            dir
        )));
    }
    Ok(())
}
