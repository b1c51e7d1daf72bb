//! Firewall and intrusion prevention templating.

use super::os::{OsFamily, OsInfo};
use super::packages::{Prerequisite, FIREWALLD, UFW};
use crate::config::write_remote_file;
use crate::error::Result;
use crate::runner::CommandRunner;

const SSH_PORT: u16 = 22;
const FAIL2BAN_JAIL_PATH: &str = "/etc/fail2ban/jail.d/homeport-sshd.local";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallBackend {
    Ufw,
    Firewalld,
}

impl FirewallBackend {
    pub fn for_os(os: &OsInfo) -> Self {
        match os.family {
            OsFamily::RedHat => Self::Firewalld,
            _ => Self::Ufw,
        }
    }

    pub fn prerequisite(self) -> Prerequisite {
        match self {
            Self::Ufw => UFW,
            Self::Firewalld => FIREWALLD,
        }
    }

    /// Commands that allow ssh plus `ports` and turn the firewall on.
    pub fn allow_commands(self, ports: &[u16]) -> Vec<String> {
        let mut all = vec![SSH_PORT];
        all.extend(ports.iter().copied().filter(|p| *p != SSH_PORT));
        match self {
            Self::Ufw => {
                let mut commands: Vec<String> =
                    all.iter().map(|p| format!("ufw allow {}/tcp", p)).collect();
                commands.push("ufw --force enable".to_string());
                commands
            }
            Self::Firewalld => {
                let mut commands = vec!["systemctl enable --now firewalld".to_string()];
                commands.extend(
                    all.iter()
                        .map(|p| format!("firewall-cmd --permanent --add-port={}/tcp", p)),
                );
                commands.push("firewall-cmd --reload".to_string());
                commands
            }
        }
    }

    pub fn deny_command(self, port: u16) -> String {
        match self {
            Self::Ufw => format!("ufw delete allow {}/tcp", port),
            Self::Firewalld => format!(
                "firewall-cmd --permanent --remove-port={}/tcp && firewall-cmd --reload",
                port
            ),
        }
    }
}

/// Ports exposed for an instance: the proxy's 80/443 when it sits behind
/// nginx, otherwise the service port itself.
pub fn exposed_ports(service_port: u16, reverse_proxy: bool) -> Vec<u16> {
    if reverse_proxy {
        vec![80, 443]
    } else {
        vec![service_port]
    }
}

pub async fn setup_firewall(runner: &dyn CommandRunner, os: &OsInfo, ports: &[u16]) -> Result<()> {
    let backend = FirewallBackend::for_os(os);
    for command in backend.allow_commands(ports) {
        runner
            .execute_privileged(&command)
            .await
            .check("configure firewall")?;
    }
    log::info!("Firewall ({:?}) allows ports {:?}", backend, ports);
    Ok(())
}

/// Best-effort removal of a port rule.
pub async fn close_port(runner: &dyn CommandRunner, os: &OsInfo, port: u16) {
    let output = runner
        .execute_privileged(&FirewallBackend::for_os(os).deny_command(port))
        .await;
    if !output.success() {
        log::warn!("Failed to close firewall port {}: {}", port, output.combined());
    }
}

pub fn render_fail2ban_jail() -> String {
    "[sshd]\n\
     enabled = true\n\
     port = ssh\n\
     maxretry = 5\n\
     findtime = 10m\n\
     bantime = 1h\n"
        .to_string()
}

pub async fn setup_fail2ban(runner: &dyn CommandRunner) -> Result<()> {
    write_remote_file(runner, FAIL2BAN_JAIL_PATH, &render_fail2ban_jail(), "644").await?;
    runner
        .execute_privileged("systemctl enable --now fail2ban && systemctl restart fail2ban")
        .await
        .check("start fail2ban")?;
    Ok(())
}
