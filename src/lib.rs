mod archive;
mod backup;
pub mod commands;
mod config;
mod conflict;
mod download;
mod env_vars;
mod error;
mod events;
mod github;
mod host;
mod install;
mod locator;
mod paths;
mod payload;
mod registry;
mod release;
mod rollback;
mod runner;
mod service;
#[cfg(test)]
mod testing;
mod update;
mod validation;
mod verify;
mod version;

pub use commands::{AppState, ServiceAction};
pub use config::{InstanceConfig, SaveOptions, Settings};
pub use error::{AppError, ErrorCategory, ErrorKind, Result};
pub use events::{Operation, ProgressEvent, StepRecord, StepStatus};
pub use host::ddns::DdnsOptions;
pub use install::{InstallFeatures, InstallOptions, InstallReport, InstallStep};
pub use paths::LauncherPaths;
pub use registry::{BackupEntry, BackupKind, HistoryEntry, HistoryKind, Instance};
pub use release::{ReleaseCatalog, ReleaseInfo};
pub use rollback::{RollbackMethod, RollbackOptions, RollbackResult};
pub use runner::{CommandOutput, CommandRunner, RemoteTarget, RunnerFactory, Target};
pub use service::{ServiceState, ServiceStatus};
pub use update::{UpdateInfo, UpdateOptions, UpdateOutcome, UpdateReport, UpdateStep};
pub use version::{compare as compare_versions, VersionComparison, VersionDifference, VersionVerdict};

/// Install the `env_logger` backend: `info` unless `RUST_LOG` says
/// otherwise. Calling it again is harmless.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
