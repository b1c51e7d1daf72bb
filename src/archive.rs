//! Payload tarballs: packing a local payload for upload and unpacking
//! downloaded release archives.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{AppError, Result};

/// Directory names never shipped to a target.
pub const PACK_EXCLUDES: &[&str] = &["node_modules", ".git"];

/// Normalize an archive entry path into safe components.
///
/// Returns `None` if the path contains traversal (`..`) or absolute components.
pub fn normalize_archive_components(raw_path: &str) -> Option<Vec<String>> {
    let normalized = raw_path.replace('\\', "/");
    let mut components = Vec::new();

    for part in normalized.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        if part == ".." || Path::new(part).is_absolute() {
            return None;
        }
        components.push(part.to_string());
    }

    Some(components)
}

/// Build an output path below `dest_dir`, refusing anything that escapes it.
pub fn build_output_path(dest_dir: &Path, components: &[String]) -> Option<PathBuf> {
    let mut out_path = dest_dir.to_path_buf();
    for component in components {
        let component_path = Path::new(component);
        if component_path.is_absolute()
            || component_path
                .components()
                .any(|part| matches!(part, Component::ParentDir))
        {
            return None;
        }
        out_path.push(component);
    }
    if !out_path.starts_with(dest_dir) {
        return None;
    }
    Some(out_path)
}

/// Detect a common top-level directory shared by all archive entries
/// (e.g. `server-1.4.0/dist/...` -> `server-1.4.0`).
pub fn detect_common_top_dir(paths: &[Vec<String>]) -> Option<String> {
    let candidate = paths.first()?.first()?;

    if !paths.iter().all(|path| path.first() == Some(candidate)) {
        return None;
    }

    if paths.iter().any(|path| path.len() > 1) {
        Some(candidate.to_string())
    } else {
        None
    }
}

fn is_excluded(relative: &Path, excludes: &[&str]) -> bool {
    relative.components().any(|c| match c {
        Component::Normal(name) => excludes.iter().any(|e| name == *e),
        _ => false,
    })
}

/// Pack the contents of `dir` (not the directory itself) into a gzip tarball.
pub fn pack_dir(dir: &Path, archive_path: &Path, excludes: &[&str]) -> Result<u64> {
    if let Some(parent) = archive_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(archive_path)?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut files = 0u64;
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(dir)
                .map(|rel| !is_excluded(rel, excludes))
                .unwrap_or(false)
        });
    for entry in walker {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| AppError::io(e.to_string()))?;
        if entry.file_type().is_dir() {
            builder.append_dir(relative, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), relative)?;
            files += 1;
        }
    }

    builder.into_inner()?.finish()?;
    Ok(files)
}

/// Extract a tar.gz archive into `dest_dir`, stripping a shared top-level
/// directory. Unsafe or non-regular entries are skipped.
pub fn extract_tar_gz(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let mut all_paths = Vec::new();
    {
        let file = fs::File::open(archive_path)?;
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
        for entry in archive.entries()? {
            let entry = entry?;
            let entry_path = entry.path()?;
            if let Some(components) = entry_path
                .to_str()
                .and_then(normalize_archive_components)
                .filter(|components| !components.is_empty())
            {
                all_paths.push(components);
            }
        }
    }
    let top_dir = detect_common_top_dir(&all_paths);

    fs::create_dir_all(dest_dir)?;
    let file = fs::File::open(archive_path)?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.to_string_lossy().into_owned();
        let Some(mut components) = normalize_archive_components(&raw) else {
            log::warn!("Skipping unsafe archive path: {:?}", raw);
            continue;
        };
        if let Some(top) = top_dir.as_deref() {
            if components.first().map(String::as_str) == Some(top) {
                components.remove(0);
            }
        }
        if components.is_empty() {
            continue;
        }
        let Some(out_path) = build_output_path(dest_dir, &components) else {
            log::warn!("Skipping archive path outside destination: {:?}", raw);
            continue;
        };

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            fs::create_dir_all(&out_path)?;
        } else if entry_type.is_file() {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = fs::File::create(&out_path)?;
            io::copy(&mut entry, &mut out)?;
            set_unix_permissions(&out_path, entry.header().mode().ok());
        } else {
            log::warn!("Skipping unsupported archive entry type at {:?}", raw);
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_unix_permissions(path: &Path, mode: Option<u32>) {
    use std::os::unix::fs::PermissionsExt as _;

    if let Some(mode) = mode {
        if let Err(error) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
            log::warn!("Failed to set permissions on {path:?}: {error}");
        }
    }
}

#[cfg(not(unix))]
fn set_unix_permissions(_path: &Path, _mode: Option<u32>) {}
