//! Prerequisite binaries and the packages that provide them.

use super::os::{OsFamily, OsInfo};
use crate::error::{AppError, Result};
use crate::runner::{quote, CommandRunner};

/// A binary the install needs, and the package providing it per family.
#[derive(Debug, Clone, Copy)]
pub struct Prerequisite {
    pub binary: &'static str,
    debian: &'static str,
    redhat: &'static str,
    arch: &'static str,
    alpine: &'static str,
}

impl Prerequisite {
    const fn same(binary: &'static str, package: &'static str) -> Self {
        Self {
            binary,
            debian: package,
            redhat: package,
            arch: package,
            alpine: package,
        }
    }

    pub fn package_for(&self, family: OsFamily) -> Option<&'static str> {
        match family {
            OsFamily::Debian => Some(self.debian),
            OsFamily::RedHat => Some(self.redhat),
            OsFamily::Arch => Some(self.arch),
            OsFamily::Alpine => Some(self.alpine),
            OsFamily::Unknown => None,
        }
    }
}

pub const TAR: Prerequisite = Prerequisite::same("tar", "tar");
pub const CURL: Prerequisite = Prerequisite::same("curl", "curl");
pub const NODE: Prerequisite = Prerequisite::same("node", "nodejs");
pub const NPM: Prerequisite = Prerequisite::same("npm", "npm");
pub const NGINX: Prerequisite = Prerequisite::same("nginx", "nginx");
pub const CERTBOT: Prerequisite = Prerequisite {
    binary: "certbot",
    debian: "certbot python3-certbot-nginx",
    redhat: "certbot python3-certbot-nginx",
    arch: "certbot certbot-nginx",
    alpine: "certbot certbot-nginx",
};
pub const UFW: Prerequisite = Prerequisite::same("ufw", "ufw");
pub const FIREWALLD: Prerequisite = Prerequisite::same("firewall-cmd", "firewalld");
pub const FAIL2BAN: Prerequisite = Prerequisite::same("fail2ban-client", "fail2ban");
pub const CRON: Prerequisite = Prerequisite {
    binary: "crontab",
    debian: "cron",
    redhat: "cronie",
    arch: "cronie",
    alpine: "dcron",
};

/// Binaries from `wanted` that are not on the target's PATH.
pub async fn find_missing(runner: &dyn CommandRunner, wanted: &[Prerequisite]) -> Vec<Prerequisite> {
    let mut missing = Vec::new();
    for prerequisite in wanted {
        let output = runner
            .execute(&format!("command -v {}", quote(prerequisite.binary)))
            .await;
        if !output.success() {
            missing.push(*prerequisite);
        }
    }
    missing
}

pub async fn install(runner: &dyn CommandRunner, os: &OsInfo, prerequisites: &[Prerequisite]) -> Result<Vec<&'static str>> {
    let manager = os
        .package_manager()
        .ok_or_else(|| AppError::validation(format!("No package manager for {}", os.label())))?;
    let mut packages: Vec<&'static str> = Vec::new();
    for prerequisite in prerequisites {
        if let Some(pkgs) = prerequisite.package_for(os.family) {
            for pkg in pkgs.split_whitespace() {
                if !packages.contains(&pkg) {
                    packages.push(pkg);
                }
            }
        }
    }
    if packages.is_empty() {
        return Ok(packages);
    }

    runner
        .execute_privileged(&manager.install_command(&packages))
        .await
        .check("install prerequisites")?;
    Ok(packages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRunner;

    #[tokio::test]
    async fn reports_only_missing_binaries() {
        let runner = MockRunner::new();
        runner.respond("command -v nginx", 1, "");
        let missing = find_missing(&runner, &[TAR, NGINX]).await;
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].binary, "nginx");
    }

    #[tokio::test]
    async fn installs_family_packages_once() {
        let runner = MockRunner::new();
        let os = OsInfo::parse("ID=fedora\n");
        let packages = install(&runner, &os, &[CERTBOT, NGINX, CRON])
            .await
            .expect("install");
        assert_eq!(packages, vec!["certbot", "python3-certbot-nginx", "nginx", "cronie"]);
        assert!(runner.ran("dnf install -y certbot python3-certbot-nginx nginx cronie"));
    }
}
