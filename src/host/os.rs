//! `/etc/os-release` probing.

use serde::Serialize;

use crate::error::{AppError, Result};
use crate::runner::CommandRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Debian,
    RedHat,
    Arch,
    Alpine,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageManager {
    Apt,
    Dnf,
    Pacman,
    Apk,
}

impl PackageManager {
    /// Non-interactive install command for `packages`.
    pub fn install_command(self, packages: &[&str]) -> String {
        let list = packages.join(" ");
        match self {
            Self::Apt => format!(
                "DEBIAN_FRONTEND=noninteractive apt-get update -y && DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
                list
            ),
            Self::Dnf => format!("dnf install -y {}", list),
            Self::Pacman => format!("pacman -Sy --noconfirm --needed {}", list),
            Self::Apk => format!("apk add --no-cache {}", list),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsInfo {
    pub id: String,
    pub version_id: String,
    pub pretty_name: String,
    pub family: OsFamily,
}

impl OsInfo {
    pub fn parse(os_release: &str) -> Self {
        let mut id = String::new();
        let mut id_like = String::new();
        let mut version_id = String::new();
        let mut pretty_name = String::new();

        for line in os_release.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "ID" => id = value.to_ascii_lowercase(),
                "ID_LIKE" => id_like = value.to_ascii_lowercase(),
                "VERSION_ID" => version_id = value,
                "PRETTY_NAME" => pretty_name = value,
                _ => {}
            }
        }

        let family = family_of(&id, &id_like);
        Self {
            id,
            version_id,
            pretty_name,
            family,
        }
    }

    pub fn package_manager(&self) -> Option<PackageManager> {
        match self.family {
            OsFamily::Debian => Some(PackageManager::Apt),
            OsFamily::RedHat => Some(PackageManager::Dnf),
            OsFamily::Arch => Some(PackageManager::Pacman),
            OsFamily::Alpine => Some(PackageManager::Apk),
            OsFamily::Unknown => None,
        }
    }

    /// Human readable label for step messages.
    pub fn label(&self) -> String {
        if self.pretty_name.is_empty() {
            format!("{} {}", self.id, self.version_id).trim().to_string()
        } else {
            self.pretty_name.clone()
        }
    }
}

fn family_of(id: &str, id_like: &str) -> OsFamily {
    let matches = |needle: &str| id == needle || id_like.split_whitespace().any(|l| l == needle);
    if matches("debian") || matches("ubuntu") {
        OsFamily::Debian
    } else if matches("rhel") || matches("fedora") || matches("centos") {
        OsFamily::RedHat
    } else if matches("arch") {
        OsFamily::Arch
    } else if matches("alpine") {
        OsFamily::Alpine
    } else {
        OsFamily::Unknown
    }
}

pub async fn detect(runner: &dyn CommandRunner) -> Result<OsInfo> {
    let output = runner
        .execute("cat /etc/os-release")
        .await
        .check("read /etc/os-release")?;
    let info = OsInfo::parse(&output.stdout);
    if info.package_manager().is_none() {
        return Err(AppError::validation(format!(
            "Unsupported operating system: {}",
            info.label()
        )));
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ubuntu() {
        let info = OsInfo::parse(
            "NAME=\"Ubuntu\"\nVERSION_ID=\"24.04\"\nID=ubuntu\nID_LIKE=debian\nPRETTY_NAME=\"Ubuntu 24.04 LTS\"\n",
        );
        assert_eq!(info.family, OsFamily::Debian);
        assert_eq!(info.version_id, "24.04");
        assert_eq!(info.package_manager(), Some(PackageManager::Apt));
        assert_eq!(info.label(), "Ubuntu 24.04 LTS");
    }

    #[test]
    fn parses_rocky_via_id_like() {
        let info = OsInfo::parse("ID=\"rocky\"\nID_LIKE=\"rhel centos fedora\"\nVERSION_ID=\"9.3\"\n");
        assert_eq!(info.family, OsFamily::RedHat);
        assert_eq!(info.package_manager(), Some(PackageManager::Dnf));
    }

    #[test]
    fn unknown_family_has_no_package_manager() {
        let info = OsInfo::parse("ID=plan9\n");
        assert_eq!(info.family, OsFamily::Unknown);
        assert_eq!(info.package_manager(), None);
    }
}
