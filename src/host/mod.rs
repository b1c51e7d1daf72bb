//! Templated host configuration: OS detection, packages, firewall, proxy, DNS.

pub mod ddns;
pub mod firewall;
pub mod os;
pub mod packages;
pub mod proxy;

use crate::error::{AppError, Result};
use crate::runner::{quote, CommandRunner};

/// Free space in MiB on the filesystem holding `path`, or its nearest
/// existing ancestor.
pub async fn free_disk_mb(runner: &dyn CommandRunner, path: &str) -> Result<u64> {
    let command = format!(
        "p={}; while [ ! -e \"$p\" ] && [ \"$p\" != / ]; do p=$(dirname \"$p\"); done; df -Pm \"$p\" | awk 'NR==2 {{print $4}}'",
        quote(path)
    );
    let output = runner.execute(&command).await.check("check free disk space")?;
    output
        .stdout
        .trim()
        .parse()
        .map_err(|_| AppError::other(format!("Unexpected df output: {:?}", output.stdout.trim())))
}
