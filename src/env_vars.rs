//! Environment variables understood by the deployed service.
//!
//! One fixed table drives generation of fresh configs, validation of user
//! edits, redaction for logs and the merge performed during updates.

use std::collections::BTreeMap;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Port,
    Integer { min: i64, max: i64 },
    Bool,
    Text,
    Url,
    Choice(&'static [&'static str]),
    Secret { min_len: usize },
}

/// Values the generators and defaults may depend on.
#[derive(Debug, Clone)]
pub struct VarContext<'a> {
    pub port: u16,
    pub domain: &'a str,
    pub tls: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct VarDescriptor {
    pub name: &'static str,
    pub kind: VarKind,
    pub required: bool,
    pub sensitive: bool,
    pub default: Option<&'static str>,
    pub generator: Option<fn(&VarContext<'_>) -> String>,
    pub description: &'static str,
}

fn generate_port(ctx: &VarContext<'_>) -> String {
    ctx.port.to_string()
}

fn generate_public_url(ctx: &VarContext<'_>) -> String {
    let scheme = if ctx.tls { "https" } else { "http" };
    format!("{}://{}", scheme, ctx.domain)
}

fn generate_secret(_ctx: &VarContext<'_>) -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

pub const VARIABLES: &[VarDescriptor] = &[
    VarDescriptor {
        name: "PORT",
        kind: VarKind::Port,
        required: true,
        sensitive: false,
        default: None,
        generator: Some(generate_port),
        description: "TCP port the service listens on",
    },
    VarDescriptor {
        name: "HOST",
        kind: VarKind::Text,
        required: true,
        sensitive: false,
        default: Some("127.0.0.1"),
        generator: None,
        description: "Bind address",
    },
    VarDescriptor {
        name: "PUBLIC_URL",
        kind: VarKind::Url,
        required: true,
        sensitive: false,
        default: None,
        generator: Some(generate_public_url),
        description: "Externally reachable base URL",
    },
    VarDescriptor {
        name: "NODE_ENV",
        kind: VarKind::Choice(&["production", "development"]),
        required: true,
        sensitive: false,
        default: Some("production"),
        generator: None,
        description: "Runtime mode",
    },
    VarDescriptor {
        name: "LOG_LEVEL",
        kind: VarKind::Choice(&["error", "warn", "info", "debug", "trace"]),
        required: false,
        sensitive: false,
        default: Some("info"),
        generator: None,
        description: "Service log verbosity",
    },
    VarDescriptor {
        name: "SESSION_SECRET",
        kind: VarKind::Secret { min_len: 32 },
        required: true,
        sensitive: true,
        default: None,
        generator: Some(generate_secret),
        description: "Key used to sign session cookies",
    },
    VarDescriptor {
        name: "ADMIN_TOKEN",
        kind: VarKind::Secret { min_len: 24 },
        required: true,
        sensitive: true,
        default: None,
        generator: Some(generate_secret),
        description: "Bearer token for the admin API",
    },
    VarDescriptor {
        name: "MAX_UPLOAD_MB",
        kind: VarKind::Integer { min: 1, max: 4096 },
        required: false,
        sensitive: false,
        default: Some("50"),
        generator: None,
        description: "Largest accepted upload in MiB",
    },
    VarDescriptor {
        name: "TRUST_PROXY",
        kind: VarKind::Bool,
        required: false,
        sensitive: false,
        default: Some("true"),
        generator: None,
        description: "Honor X-Forwarded-* headers from the reverse proxy",
    },
];

/// Variables pinned to the instance's registered port and domain.
pub const IDENTITY_VARIABLES: &[&str] = &["PORT", "PUBLIC_URL"];

/// Reject a value for an identity variable that differs from what the
/// registered port and domain generate. Other variables always pass.
pub fn check_identity(name: &str, value: &str, ctx: &VarContext<'_>) -> Result<()> {
    if !IDENTITY_VARIABLES.contains(&name) {
        return Ok(());
    }
    let expected = descriptor(name).and_then(|d| d.initial_value(ctx));
    if expected.as_deref() == Some(value) {
        return Ok(());
    }
    Err(AppError::validation(format!(
        "{} follows the instance's registered port and domain and cannot be edited in its config",
        name
    )))
}

pub fn descriptor(name: &str) -> Option<&'static VarDescriptor> {
    VARIABLES.iter().find(|d| d.name == name)
}

impl VarDescriptor {
    /// Default or generated value, if the variable has either.
    pub fn initial_value(&self, ctx: &VarContext<'_>) -> Option<String> {
        if let Some(generator) = self.generator {
            return Some(generator(ctx));
        }
        self.default.map(str::to_string)
    }

    pub fn validate(&self, value: &str) -> Result<()> {
        let invalid = |reason: &str| -> Result<()> {
            Err(AppError::validation(format!(
                "{} {}: {:?}",
                self.name,
                reason,
                if self.sensitive { "<redacted>" } else { value }
            )))
        };

        match self.kind {
            VarKind::Port => match value.parse::<u16>() {
                Ok(port) if port > 0 => Ok(()),
                _ => invalid("must be a port number"),
            },
            VarKind::Integer { min, max } => match value.parse::<i64>() {
                Ok(n) if (min..=max).contains(&n) => Ok(()),
                _ => invalid(&format!("must be an integer in {}..={}", min, max)),
            },
            VarKind::Bool => match value {
                "true" | "false" => Ok(()),
                _ => invalid("must be true or false"),
            },
            VarKind::Text => {
                if value.contains('\n') {
                    invalid("must be a single line")
                } else {
                    Ok(())
                }
            }
            VarKind::Url => {
                if (value.starts_with("http://") || value.starts_with("https://"))
                    && !value.contains(char::is_whitespace)
                {
                    Ok(())
                } else {
                    invalid("must be an http(s) URL")
                }
            }
            VarKind::Choice(choices) => {
                if choices.contains(&value) {
                    Ok(())
                } else {
                    invalid(&format!("must be one of {}", choices.join(", ")))
                }
            }
            VarKind::Secret { min_len } => {
                if value.len() >= min_len && !value.contains(char::is_whitespace) {
                    Ok(())
                } else {
                    invalid(&format!("must be at least {} non-blank characters", min_len))
                }
            }
        }
    }
}

/// A complete set of values for a new instance.
pub fn generate(ctx: &VarContext<'_>) -> BTreeMap<String, String> {
    VARIABLES
        .iter()
        .filter_map(|d| d.initial_value(ctx).map(|v| (d.name.to_string(), v)))
        .collect()
}

/// Fill in variables missing from `values`. Existing values are kept.
/// Returns the names that were added.
pub fn merge_missing(values: &mut BTreeMap<String, String>, ctx: &VarContext<'_>) -> Vec<String> {
    let mut added = Vec::new();
    for d in VARIABLES {
        if values.contains_key(d.name) {
            continue;
        }
        if let Some(value) = d.initial_value(ctx) {
            values.insert(d.name.to_string(), value);
            added.push(d.name.to_string());
        }
    }
    added
}

/// Validate known variables and require every required one. Unknown
/// variables are passed through untouched.
pub fn validate_all(values: &BTreeMap<String, String>) -> Result<()> {
    for d in VARIABLES {
        match values.get(d.name) {
            Some(value) => d.validate(value)?,
            None if d.required => {
                return Err(AppError::validation(format!("{} is required", d.name)));
            }
            None => {}
        }
    }
    Ok(())
}

/// Copy with sensitive values masked.
pub fn redact(values: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    values
        .iter()
        .map(|(k, v)| {
            let sensitive = descriptor(k).map(|d| d.sensitive).unwrap_or(false);
            let shown = if sensitive { "********".to_string() } else { v.clone() };
            (k.clone(), shown)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> VarContext<'static> {
        VarContext {
            port: 8080,
            domain: "app.example.com",
            tls: true,
        }
    }

    #[test]
    fn generated_config_is_valid() {
        let values = generate(&ctx());
        assert_eq!(values.get("PORT").map(String::as_str), Some("8080"));
        assert_eq!(
            values.get("PUBLIC_URL").map(String::as_str),
            Some("https://app.example.com")
        );
        assert!(values.get("SESSION_SECRET").map(|s| s.len() >= 32).unwrap_or(false));
        validate_all(&values).expect("generated values validate");
    }

    #[test]
    fn merge_keeps_existing_values() {
        let mut values = BTreeMap::from([
            ("PORT".to_string(), "9000".to_string()),
            ("CUSTOM".to_string(), "x".to_string()),
        ]);
        let added = merge_missing(&mut values, &ctx());
        assert_eq!(values.get("PORT").map(String::as_str), Some("9000"));
        assert_eq!(values.get("CUSTOM").map(String::as_str), Some("x"));
        assert!(added.contains(&"ADMIN_TOKEN".to_string()));
        assert!(!added.contains(&"PORT".to_string()));
    }

    #[test]
    fn validation_checks_kinds_and_bounds() {
        let max_upload = descriptor("MAX_UPLOAD_MB").expect("known");
        assert!(max_upload.validate("10").is_ok());
        assert!(max_upload.validate("0").is_err());
        assert!(descriptor("NODE_ENV").expect("known").validate("staging").is_err());
        assert!(descriptor("TRUST_PROXY").expect("known").validate("yes").is_err());

        let err = descriptor("ADMIN_TOKEN")
            .expect("known")
            .validate("short")
            .expect_err("too short");
        assert!(err.to_string().contains("<redacted>"));
    }

    #[test]
    fn missing_required_variable_fails() {
        let mut values = generate(&ctx());
        values.remove("SESSION_SECRET");
        assert!(validate_all(&values).is_err());
    }

    #[test]
    fn identity_variables_follow_registered_values() {
        assert!(check_identity("PORT", "8080", &ctx()).is_ok());
        assert!(check_identity("PORT", "9090", &ctx()).is_err());
        assert!(check_identity("PUBLIC_URL", "https://app.example.com", &ctx()).is_ok());
        assert!(check_identity("PUBLIC_URL", "https://other.example.com", &ctx()).is_err());
        assert!(check_identity("LOG_LEVEL", "debug", &ctx()).is_ok());
    }

    #[test]
    fn redact_masks_sensitive_values() {
        let values = generate(&ctx());
        let redacted = redact(&values);
        assert_eq!(redacted.get("ADMIN_TOKEN").map(String::as_str), Some("********"));
        assert_eq!(redacted.get("PORT").map(String::as_str), Some("8080"));
    }
}
