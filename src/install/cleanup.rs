//! Best-effort teardown after a failed install. Every action runs on its
//! own; a failure is logged and the next action still runs.

use super::{InstallRun, Installer};
use crate::config::ConfigStore;
use crate::host::{ddns, proxy};
use crate::payload;
use crate::runner::quote;
use crate::service::ServiceController;

impl Installer<'_> {
    pub(super) async fn cleanup_failed(&self, run: &InstallRun) {
        let runner = run.runner.as_ref();
        let instance = &run.instance;
        let artifacts = &run.artifacts;
        log::warn!("Cleaning up failed install of {} ({})", instance.name, instance.id);

        if artifacts.registered {
            if let Err(e) = self.registry.delete(&instance.id) {
                log::warn!("Cleanup: failed to remove registry entry: {}", e);
            }
        }

        if !artifacts.connected {
            return;
        }

        if artifacts.config_written {
            if let Err(e) = ConfigStore::new(runner, &instance.config_path).remove().await {
                log::warn!("Cleanup: failed to remove config: {}", e);
            }
        }

        let service = ServiceController::new(runner, instance.service_name());
        if service.is_active().await {
            if let Err(e) = service.stop().await {
                log::warn!("Cleanup: failed to stop service: {}", e);
            }
        }
        if artifacts.unit_installed || service.unit_exists().await {
            if let Err(e) = service.disable().await {
                log::warn!("Cleanup: failed to disable service: {}", e);
            }
            if let Err(e) = service.remove_unit().await {
                log::warn!("Cleanup: failed to remove unit file: {}", e);
            }
        }

        if artifacts.proxy_site {
            proxy::remove_site(runner, &instance.slug()).await;
        }
        if artifacts.ddns_cron {
            ddns::remove(runner, &instance.slug()).await;
        }

        // Only a directory without an entry point is ours to delete; a
        // complete payload at this path may predate this run.
        if artifacts.payload_started && !payload::has_entry_point(runner, &instance.install_dir).await {
            let output = runner
                .execute_privileged(&format!("rm -rf {}", quote(&instance.install_dir)))
                .await;
            if !output.success() {
                log::warn!("Cleanup: failed to remove {}: {}", instance.install_dir, output.combined());
            }
        }
    }
}
