//! The install step table and each step's work.

use super::{InstallFeatures, InstallRun, Installer};
use crate::backup::{instance_backup_dir, BackupManager};
use crate::config::{ConfigStore, InstanceConfig, SaveOptions};
use crate::conflict::detect_orphans;
use crate::error::{AppError, Result};
use crate::host::packages::{self, Prerequisite, CERTBOT, CRON, CURL, FAIL2BAN, NGINX, NODE, NPM, TAR};
use crate::host::{self, ddns, firewall, os, proxy};
use crate::payload;
use crate::registry::{BackupKind, HistoryEntry, HistoryKind};
use crate::service::{ServiceController, UnitParams};
use crate::verify::verify_liveness;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStep {
    Connect,
    DetectOs,
    CheckPrerequisites,
    InstallPrerequisites,
    SetupFirewall,
    SetupIntrusionPrevention,
    DeployPayload,
    InstallDependencies,
    SetupReverseProxy,
    SetupTls,
    CreateServiceUnit,
    StartService,
    ConfigureDynamicDns,
    CreateInitialBackup,
    Verify,
    RegisterInstance,
    Cleanup,
    Complete,
}

impl InstallStep {
    pub const ALL: [InstallStep; 18] = [
        Self::Connect,
        Self::DetectOs,
        Self::CheckPrerequisites,
        Self::InstallPrerequisites,
        Self::SetupFirewall,
        Self::SetupIntrusionPrevention,
        Self::DeployPayload,
        Self::InstallDependencies,
        Self::SetupReverseProxy,
        Self::SetupTls,
        Self::CreateServiceUnit,
        Self::StartService,
        Self::ConfigureDynamicDns,
        Self::CreateInitialBackup,
        Self::Verify,
        Self::RegisterInstance,
        Self::Cleanup,
        Self::Complete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::DetectOs => "DETECT_OS",
            Self::CheckPrerequisites => "CHECK_PREREQUISITES",
            Self::InstallPrerequisites => "INSTALL_PREREQUISITES",
            Self::SetupFirewall => "SETUP_FIREWALL",
            Self::SetupIntrusionPrevention => "SETUP_INTRUSION_PREVENTION",
            Self::DeployPayload => "DEPLOY_PAYLOAD",
            Self::InstallDependencies => "INSTALL_DEPENDENCIES",
            Self::SetupReverseProxy => "SETUP_REVERSE_PROXY",
            Self::SetupTls => "SETUP_TLS",
            Self::CreateServiceUnit => "CREATE_SERVICE_UNIT",
            Self::StartService => "START_SERVICE",
            Self::ConfigureDynamicDns => "CONFIGURE_DYNAMIC_DNS",
            Self::CreateInitialBackup => "CREATE_INITIAL_BACKUP",
            Self::Verify => "VERIFY",
            Self::RegisterInstance => "REGISTER_INSTANCE",
            Self::Cleanup => "CLEANUP",
            Self::Complete => "COMPLETE",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Connect => "Connecting to target",
            Self::DetectOs => "Detecting operating system",
            Self::CheckPrerequisites => "Checking prerequisites",
            Self::InstallPrerequisites => "Installing prerequisites",
            Self::SetupFirewall => "Configuring firewall",
            Self::SetupIntrusionPrevention => "Configuring fail2ban",
            Self::DeployPayload => "Deploying payload",
            Self::InstallDependencies => "Installing dependencies",
            Self::SetupReverseProxy => "Configuring nginx",
            Self::SetupTls => "Issuing TLS certificate",
            Self::CreateServiceUnit => "Writing config and service unit",
            Self::StartService => "Starting service",
            Self::ConfigureDynamicDns => "Configuring dynamic DNS",
            Self::CreateInitialBackup => "Creating initial backup",
            Self::Verify => "Verifying service",
            Self::RegisterInstance => "Registering instance",
            Self::Cleanup => "Cleaning up",
            Self::Complete => "Finishing",
        }
    }

    /// False when the step's feature flag is off.
    pub fn enabled(self, features: &InstallFeatures) -> bool {
        match self {
            Self::SetupFirewall => features.firewall,
            Self::SetupIntrusionPrevention => features.intrusion_prevention,
            Self::SetupReverseProxy => features.reverse_proxy,
            Self::SetupTls => features.tls,
            Self::ConfigureDynamicDns => features.dynamic_dns.is_some(),
            Self::CreateInitialBackup => features.initial_backup,
            _ => true,
        }
    }

    /// Steps whose failure is recorded and swallowed: the host is already
    /// provisioned when they run.
    pub fn is_tolerated(self) -> bool {
        matches!(self, Self::CreateInitialBackup | Self::RegisterInstance)
    }
}

/// Binaries the enabled features need on the target.
pub fn required_prerequisites(features: &InstallFeatures, os: &os::OsInfo) -> Vec<Prerequisite> {
    let mut wanted = vec![TAR, CURL, NODE, NPM];
    if features.firewall {
        wanted.push(firewall::FirewallBackend::for_os(os).prerequisite());
    }
    if features.intrusion_prevention {
        wanted.push(FAIL2BAN);
    }
    if features.reverse_proxy {
        wanted.push(NGINX);
    }
    if features.tls {
        wanted.push(CERTBOT);
    }
    if features.dynamic_dns.is_some() {
        wanted.push(CRON);
    }
    wanted
}

fn detected_os(run: &InstallRun) -> Result<&os::OsInfo> {
    run.os
        .as_ref()
        .ok_or_else(|| AppError::other("Operating system was not detected"))
}

impl Installer<'_> {
    pub(super) fn describe(step: InstallStep) -> &'static str {
        step.description()
    }

    /// Run one step; the returned text becomes the completion message.
    pub(super) async fn run_step(&self, step: InstallStep, run: &mut InstallRun) -> Result<String> {
        let runner = run.runner.clone();
        let runner = runner.as_ref();
        let service = ServiceController::new(runner, run.instance.service_name());

        match step {
            InstallStep::Connect => {
                runner.connect().await?;
                run.artifacts.connected = true;
                let orphans = detect_orphans(runner, self.registry, &run.instance.target).await;
                if orphans.is_empty() {
                    Ok(format!("Connected to {}", run.instance.target.label()))
                } else {
                    Ok(format!(
                        "Connected to {} ({} orphaned services found)",
                        run.instance.target.label(),
                        orphans.len()
                    ))
                }
            }
            InstallStep::DetectOs => {
                let info = os::detect(runner).await?;
                let label = info.label();
                run.os = Some(info);
                Ok(format!("Detected {}", label))
            }
            InstallStep::CheckPrerequisites => {
                let free = host::free_disk_mb(runner, &self.settings.install_root).await?;
                if free < self.settings.min_free_disk_mb {
                    return Err(AppError::validation(format!(
                        "Only {} MiB free under {}, need {} MiB",
                        free, self.settings.install_root, self.settings.min_free_disk_mb
                    )));
                }
                let wanted = required_prerequisites(&run.options.features, detected_os(run)?);
                run.missing = packages::find_missing(runner, &wanted).await;
                if run.missing.is_empty() {
                    Ok("All prerequisites present".to_string())
                } else {
                    let names: Vec<&str> = run.missing.iter().map(|p| p.binary).collect();
                    Ok(format!("Missing: {}", names.join(", ")))
                }
            }
            InstallStep::InstallPrerequisites => {
                if run.missing.is_empty() {
                    return Ok("Nothing to install".to_string());
                }
                let installed = packages::install(runner, detected_os(run)?, &run.missing).await?;
                Ok(format!("Installed {}", installed.join(", ")))
            }
            InstallStep::SetupFirewall => {
                let ports = firewall::exposed_ports(run.instance.port, run.options.features.reverse_proxy);
                firewall::setup_firewall(runner, detected_os(run)?, &ports).await?;
                Ok(format!("Allowed ports {:?}", ports))
            }
            InstallStep::SetupIntrusionPrevention => {
                firewall::setup_fail2ban(runner).await?;
                Ok("fail2ban protects sshd".to_string())
            }
            InstallStep::DeployPayload => {
                let install_dir = run.instance.install_dir.clone();
                if payload::dir_in_use(runner, &install_dir).await {
                    return Err(AppError::validation(format!(
                        "Install directory {} already exists and is not empty",
                        install_dir
                    )));
                }
                let located = self.locator.locate_or_fetch().await?;
                payload::ensure_service_user(runner).await?;
                run.artifacts.payload_started = true;
                payload::deploy(runner, &located.dir, &install_dir, &run.staging_dir).await?;
                run.instance.version = located.version;
                Ok(format!("Deployed version {} to {}", run.instance.version, install_dir))
            }
            InstallStep::InstallDependencies => {
                payload::install_dependencies(runner, &run.instance.install_dir).await?;
                Ok("Dependencies installed".to_string())
            }
            InstallStep::SetupReverseProxy => {
                run.artifacts.proxy_site = true;
                proxy::setup_site(runner, &run.instance.slug(), &run.instance.domain, run.instance.port).await?;
                Ok(format!("nginx proxies {} to port {}", run.instance.domain, run.instance.port))
            }
            InstallStep::SetupTls => {
                proxy::issue_certificate(runner, &run.instance.domain, run.options.tls_email.as_deref()).await?;
                Ok(format!("Certificate issued for {}", run.instance.domain))
            }
            InstallStep::CreateServiceUnit => {
                let config = build_config(run)?;
                let unit = UnitParams::for_instance(&run.instance);
                run.artifacts.config_written = true;
                run.artifacts.unit_installed = true;
                ConfigStore::new(runner, &run.instance.config_path)
                    .save(
                        &config,
                        SaveOptions {
                            sync_service_unit: true,
                            restart: false,
                        },
                        Some((&service, &unit)),
                    )
                    .await?;
                service.enable().await?;
                Ok(format!("Installed {}", service.unit_path()))
            }
            InstallStep::StartService => {
                service.start().await?;
                Ok(format!("Started {}", service.name()))
            }
            InstallStep::ConfigureDynamicDns => {
                let Some(options) = run.options.features.dynamic_dns.clone() else {
                    return Ok("Dynamic DNS not requested".to_string());
                };
                run.artifacts.ddns_cron = true;
                ddns::setup(runner, &run.instance.slug(), &options).await?;
                Ok(format!("Refreshing every {} minutes", options.interval_minutes))
            }
            InstallStep::CreateInitialBackup => {
                let manager = BackupManager::new(
                    runner,
                    instance_backup_dir(&self.settings.backup_root, &run.instance.id),
                );
                let entry = manager
                    .create(&run.instance.install_dir, BackupKind::Initial, &run.instance.version)
                    .await?;
                let message = format!("Backup {} created", entry.id);
                run.instance.backups.push(entry);
                Ok(message)
            }
            InstallStep::Verify => {
                verify_liveness(runner, &service, run.instance.port, &self.settings.liveness).await?;
                Ok(format!("{} is active and listening on {}", service.name(), run.instance.port))
            }
            InstallStep::RegisterInstance => {
                run.instance
                    .update_history
                    .push(HistoryEntry::new(HistoryKind::Install, None, &run.instance.version));
                self.registry.create(run.instance.clone())?;
                run.artifacts.registered = true;
                let has_default = self.registry.default_instance()?.is_some();
                if run.options.make_default || !has_default {
                    self.registry.set_default(&run.instance.id)?;
                }
                Ok(format!("Registered {}", run.instance.id))
            }
            InstallStep::Cleanup => {
                remove_staging_dir(run).await;
                Ok("Removed staging files".to_string())
            }
            InstallStep::Complete => Ok(format!(
                "Installed {} {} on {}",
                run.instance.name,
                run.instance.version,
                run.instance.target.label()
            )),
        }
    }
}

/// Generated config with caller overrides applied. Without a reverse proxy
/// the service has to listen on every interface to be reachable.
fn build_config(run: &InstallRun) -> Result<InstanceConfig> {
    let mut config = InstanceConfig::generate(&run.instance.var_context());
    if !run.options.features.reverse_proxy {
        config.set("HOST", "0.0.0.0")?;
    }
    for (key, value) in &run.options.config_overrides {
        config.set(key, value.clone())?;
    }
    Ok(config)
}

pub(super) async fn remove_staging_dir(run: &InstallRun) {
    if run.staging_dir.exists() {
        if let Err(e) = tokio::fs::remove_dir_all(&run.staging_dir).await {
            log::warn!("Failed to remove staging dir {:?}: {}", run.staging_dir, e);
        }
    }
}
