//! Dynamic DNS refresh through a cron entry.

use serde::{Deserialize, Serialize};

use crate::config::write_remote_file;
use crate::error::{AppError, Result};
use crate::runner::{quote, CommandRunner};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DdnsOptions {
    /// Provider URL that updates the record when fetched.
    pub update_url: String,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,
}

fn default_interval_minutes() -> u32 {
    5
}

impl DdnsOptions {
    pub fn validate(&self) -> Result<()> {
        if !self.update_url.starts_with("https://") && !self.update_url.starts_with("http://") {
            return Err(AppError::validation("Dynamic DNS update URL must be http(s)"));
        }
        if !(1..=59).contains(&self.interval_minutes) {
            return Err(AppError::validation("Dynamic DNS interval must be 1-59 minutes"));
        }
        Ok(())
    }
}

pub fn cron_path(slug: &str) -> String {
    format!("/etc/cron.d/homeport-{}-ddns", slug)
}

fn refresh_command(options: &DdnsOptions) -> String {
    format!("curl -fsS --max-time 30 {}", quote(&options.update_url))
}

/// cron turns a bare `%` into a newline, so the command is escaped here only.
pub fn render_cron(options: &DdnsOptions) -> String {
    format!(
        "# Managed by homeport\n*/{} * * * * root {} >/dev/null 2>&1\n",
        options.interval_minutes,
        refresh_command(options).replace('%', "\\%")
    )
}

/// Install the cron entry and refresh the record once.
pub async fn setup(runner: &dyn CommandRunner, slug: &str, options: &DdnsOptions) -> Result<()> {
    options.validate()?;
    write_remote_file(runner, &cron_path(slug), &render_cron(options), "644").await?;
    runner
        .execute(&refresh_command(options))
        .await
        .check("refresh dynamic DNS record")?;
    Ok(())
}

pub async fn remove(runner: &dyn CommandRunner, slug: &str) {
    let output = runner
        .execute_privileged(&format!("rm -f {}", quote(&cron_path(slug))))
        .await;
    if !output.success() {
        log::warn!("Failed to remove dynamic DNS cron for {}: {}", slug, output.combined());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_line_runs_every_interval() {
        let options = DdnsOptions {
            update_url: "https://dyn.example.net/update?token=abc&host=home".to_string(),
            interval_minutes: 10,
        };
        let cron = render_cron(&options);
        assert!(cron.contains("*/10 * * * * root curl -fsS --max-time 30 'https://dyn.example.net/update?token=abc&host=home'"));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn percent_signs_are_escaped_for_cron_only() {
        let options = DdnsOptions {
            update_url: "https://dyn.example.net/update?key=a%2Bb".to_string(),
            interval_minutes: 5,
        };
        let cron = render_cron(&options);
        assert!(cron.contains("'https://dyn.example.net/update?key=a\\%2Bb'"));
        assert!(refresh_command(&options).ends_with("'https://dyn.example.net/update?key=a%2Bb'"));
    }

    #[test]
    fn rejects_bad_options() {
        let options = DdnsOptions {
            update_url: "ftp://x".to_string(),
            interval_minutes: 5,
        };
        assert!(options.validate().is_err());
    }
}
