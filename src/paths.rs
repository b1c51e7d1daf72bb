//! Centralized path utilities for the launcher and for managed hosts.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Local data layout rooted at `~/.homeport` (or an explicit root in tests).
#[derive(Debug, Clone)]
pub struct LauncherPaths {
    root: PathBuf,
}

impl LauncherPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default per-user location (~/.homeport).
    pub fn from_home() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| AppError::io("Cannot find home directory"))?;
        Ok(Self::new(home.join(".homeport")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the path to the settings file.
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// Get the path to the instance registry document.
    pub fn registry_path(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    /// Packed payloads, downloaded releases and clones.
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// SSH control sockets.
    pub fn ssh_dir(&self) -> PathBuf {
        self.root.join("ssh")
    }

    /// Ensure all required data directories exist.
    pub fn ensure_data_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| AppError::io(e.to_string()))?;
        for dir in [self.cache_dir(), self.ssh_dir()] {
            fs::create_dir_all(&dir).map_err(|e| AppError::io(e.to_string()))?;
        }
        Ok(())
    }
}

/// Where one instance lives on its target host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    pub install_dir: String,
    pub config_path: String,
}

impl HostLayout {
    pub fn new(install_root: &str, config_root: &str, slug: &str) -> Self {
        Self {
            install_dir: join_remote(install_root, slug),
            config_path: join_remote(config_root, &format!("{slug}.env")),
        }
    }
}

/// Sibling directory holding the previous payload during an update.
pub fn old_snapshot_dir(install_dir: &str) -> String {
    format!("{}.old", install_dir.trim_end_matches('/'))
}

/// Parent directory of a remote path ("/" for top-level entries).
pub fn remote_parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

/// Join remote POSIX path segments regardless of the local platform.
pub fn join_remote(base: &str, child: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        child.trim_start_matches('/')
    )
}
