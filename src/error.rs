//! Application error types.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::runner::CommandOutput;

/// Maximum number of output characters kept in an execution error payload.
const OUTPUT_TAIL_CHARS: usize = 2000;

/// Application error that can be serialized for presentation layers.
#[derive(Debug, Clone)]
pub struct AppError {
    payload: BTreeMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid input or unmet precondition
    Validation,
    /// Name, port or domain already taken by another instance
    Conflict,
    /// External command exited non-zero
    Execution,
    /// Service never reached the active state
    ServiceNotActive,
    /// Service reports active but nothing listens on its port
    ServiceNotListening,
    /// Registry persistence or integrity error
    Registry,
    /// Instance not found
    InstanceNotFound,
    /// Backup not found
    BackupNotFound,
    /// Configuration error
    Config,
    /// File system error
    Io,
    /// Network error
    Network,
    /// Backup error
    Backup,
    /// General error
    Other,
}

/// Coarse error taxonomy shared by every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Execution,
    Verification,
    Registry,
    NotFound,
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::Validation => 1001,
            Self::Conflict => 1002,
            Self::Execution => 2001,
            Self::ServiceNotActive => 3001,
            Self::ServiceNotListening => 3002,
            Self::Registry => 4001,
            Self::InstanceNotFound => 5001,
            Self::BackupNotFound => 5002,
            Self::Config => 6001,
            Self::Io => 6002,
            Self::Network => 6003,
            Self::Backup => 6004,
            Self::Other => 9999,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation | Self::Conflict => ErrorCategory::Validation,
            Self::Execution => ErrorCategory::Execution,
            Self::ServiceNotActive | Self::ServiceNotListening => ErrorCategory::Verification,
            Self::Registry => ErrorCategory::Registry,
            Self::InstanceNotFound | Self::BackupNotFound => ErrorCategory::NotFound,
            Self::Config | Self::Io | Self::Network | Self::Backup | Self::Other => {
                ErrorCategory::Other
            }
        }
    }
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= OUTPUT_TAIL_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - OUTPUT_TAIL_CHARS).collect()
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: BTreeMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            BTreeMap::new()
        } else {
            BTreeMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Validation, message)
    }

    /// A uniqueness collision on one field, with a suggested free alternative.
    pub fn conflict(field: &str, value: &str, suggestion: Option<String>) -> Self {
        let mut payload = BTreeMap::from([
            ("field".to_string(), field.to_string()),
            ("value".to_string(), value.to_string()),
        ]);
        if let Some(suggestion) = suggestion {
            payload.insert("suggestion".to_string(), suggestion);
        }
        Self::new(ErrorKind::Conflict, payload)
    }

    /// A command that exited non-zero, keeping the tail of its output.
    pub fn execution(action: &str, output: &CommandOutput) -> Self {
        let mut payload = BTreeMap::from([
            ("action".to_string(), action.to_string()),
            ("exit_code".to_string(), output.exit_code.to_string()),
        ]);
        let stdout = tail(&output.stdout);
        if !stdout.is_empty() {
            payload.insert("stdout".to_string(), stdout);
        }
        let stderr = tail(&output.stderr);
        if !stderr.is_empty() {
            payload.insert("stderr".to_string(), stderr);
        }
        Self::new(ErrorKind::Execution, payload)
    }

    pub fn service_not_active(service: &str, logs: &str) -> Self {
        let mut payload = BTreeMap::from([("service".to_string(), service.to_string())]);
        let logs = tail(logs);
        if !logs.is_empty() {
            payload.insert("logs".to_string(), logs);
        }
        Self::new(ErrorKind::ServiceNotActive, payload)
    }

    pub fn service_not_listening(service: &str, port: u16, listeners: &str, logs: &str) -> Self {
        let mut payload = BTreeMap::from([
            ("service".to_string(), service.to_string()),
            ("port".to_string(), port.to_string()),
        ]);
        let listeners = tail(listeners);
        if !listeners.is_empty() {
            payload.insert("listeners".to_string(), listeners);
        }
        let logs = tail(logs);
        if !logs.is_empty() {
            payload.insert("logs".to_string(), logs);
        }
        Self::new(ErrorKind::ServiceNotListening, payload)
    }

    pub fn registry(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Registry, message)
    }

    pub fn instance_not_found(id: &str) -> Self {
        Self::new(
            ErrorKind::InstanceNotFound,
            BTreeMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn backup_not_found(backup_id: &str) -> Self {
        Self::new(
            ErrorKind::BackupNotFound,
            BTreeMap::from([("backup_id".to_string(), backup_id.to_string())]),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Network, message)
    }

    pub fn network_with_url(url: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Network,
            BTreeMap::from([
                ("url".to_string(), url.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn backup(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Backup, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    pub fn payload(&self) -> &BTreeMap<String, String> {
        &self.payload
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 3)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("category", &self.kind.category())?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::network(err.to_string())
    }
}

impl From<walkdir::Error> for AppError {
    fn from(err: walkdir::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_error_names_field_and_suggestion() {
        let err = AppError::conflict("port", "8080", Some("8081".to_string()));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert_eq!(err.get("field"), Some("port"));
        assert_eq!(err.get("suggestion"), Some("8081"));
        assert_eq!(
            err.to_string(),
            "Conflict: field=port, suggestion=8081, value=8080"
        );
    }

    #[test]
    fn execution_error_keeps_output() {
        let output = CommandOutput {
            stdout: "partial\n".to_string(),
            stderr: "boom\n".to_string(),
            exit_code: 2,
        };
        let err = AppError::execution("install dependencies", &output);
        assert_eq!(err.category(), ErrorCategory::Execution);
        assert_eq!(err.get("exit_code"), Some("2"));
        assert_eq!(err.get("stderr"), Some("boom"));
        assert_eq!(err.get("stdout"), Some("partial"));
    }

    #[test]
    fn serializes_code_and_payload() {
        let err = AppError::instance_not_found("abc");
        let value = serde_json::to_value(&err).expect("serialize");
        assert_eq!(value["code"], 5001);
        assert_eq!(value["category"], "not_found");
        assert_eq!(value["payload"]["id"], "abc");
    }
}
