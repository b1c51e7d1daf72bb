//! Input validation and the pure naming rules derived from instance identity.

use uuid::Uuid;

use crate::error::{AppError, Result};

/// Prefix for every service unit this tool manages.
pub const SERVICE_PREFIX: &str = "homeport-";

const MAX_NAME_LEN: usize = 64;

pub fn validate_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation("Instance name must not be empty"));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(AppError::validation(format!(
            "Instance name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(AppError::validation("Instance name contains control characters"));
    }
    Ok(())
}

pub fn validate_port(port: u16) -> Result<()> {
    if port < 1024 {
        return Err(AppError::validation(format!(
            "Port {} is reserved; choose a port between 1024 and 65535",
            port
        )));
    }
    Ok(())
}

pub fn validate_domain(domain: &str) -> Result<()> {
    let domain = domain.trim();
    if domain.is_empty() || domain.len() > 253 {
        return Err(AppError::validation("Domain must be between 1 and 253 characters"));
    }
    for label in domain.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(AppError::validation(format!("Invalid domain: {}", domain)));
        }
    }
    Ok(())
}

pub fn validate_version_tag(version: &str) -> Result<()> {
    let is_safe = !version.is_empty()
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'));

    if !is_safe {
        return Err(AppError::validation(format!("Invalid version tag: {}", version)));
    }

    Ok(())
}

/// Deterministic directory-safe slug for a display name. Names with no ASCII
/// alphanumerics fall back to `instance-` plus a hash of the name.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        // Names without ASCII letters still need distinct directories.
        let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.trim().as_bytes()).simple().to_string();
        format!("instance-{}", &digest[..8])
    } else {
        slug
    }
}

/// Service unit name for an instance id.
pub fn service_name(instance_id: &str) -> String {
    format!("{}{}", SERVICE_PREFIX, instance_id)
}

/// Reverse of [`service_name`]; accepts an optional `.service` suffix.
pub fn instance_id_from_service(unit: &str) -> Option<&str> {
    let unit = unit.strip_suffix(".service").unwrap_or(unit);
    unit.strip_prefix(SERVICE_PREFIX).filter(|id| !id.is_empty())
}
