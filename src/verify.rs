//! Post-start liveness: the unit must be active and its port bound.

use crate::config::LivenessSettings;
use crate::error::{AppError, Result};
use crate::runner::CommandRunner;
use crate::service::ServiceController;

const LOG_LINES: usize = 50;

fn port_bound_command(port: u16) -> String {
    format!(
        "(ss -ltnH 2>/dev/null || netstat -ltn 2>/dev/null) | awk '{{print $4}}' | grep -Eq '[:.]{}$'",
        port
    )
}

const LISTENERS_COMMAND: &str = "ss -ltn 2>/dev/null || netstat -ltn 2>/dev/null";

pub async fn port_bound(runner: &dyn CommandRunner, port: u16) -> bool {
    runner.execute(&port_bound_command(port)).await.success()
}

/// Poll until the unit is active, then until its port is bound. A unit that
/// never activates and one that is active without listening fail with
/// different errors, both carrying recent journal lines.
pub async fn verify_liveness(
    runner: &dyn CommandRunner,
    service: &ServiceController<'_>,
    port: u16,
    settings: &LivenessSettings,
) -> Result<()> {
    let attempts = settings.attempts.max(1);

    let mut active = false;
    for attempt in 1..=attempts {
        if service.is_active().await {
            active = true;
            break;
        }
        log::info!("{} not active yet ({}/{})", service.name(), attempt, attempts);
        if attempt < attempts {
            tokio::time::sleep(settings.interval()).await;
        }
    }
    if !active {
        let logs = service.logs(LOG_LINES).await;
        return Err(AppError::service_not_active(service.name(), &logs));
    }

    for attempt in 1..=attempts {
        if port_bound(runner, port).await {
            log::info!("{} is listening on port {}", service.name(), port);
            return Ok(());
        }
        log::info!("{} not listening on {} yet ({}/{})", service.name(), port, attempt, attempts);
        if attempt < attempts {
            tokio::time::sleep(settings.interval()).await;
        }
    }

    let listeners = runner.execute(LISTENERS_COMMAND).await.combined();
    let logs = service.logs(LOG_LINES).await;
    Err(AppError::service_not_listening(service.name(), port, &listeners, &logs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::MockRunner;

    fn quick() -> LivenessSettings {
        LivenessSettings {
            attempts: 2,
            interval_ms: 0,
        }
    }

    #[tokio::test]
    async fn active_and_listening_passes() {
        let runner = MockRunner::healthy_host();
        let service = ServiceController::new(&runner, "homeport-a");
        verify_liveness(&runner, &service, 8080, &quick()).await.expect("live");
        assert!(runner.ran("grep -Eq '[:.]8080$'"));
    }

    #[tokio::test]
    async fn inactive_unit_reports_not_active_with_logs() {
        let runner = MockRunner::new();
        runner.respond("systemctl is-active", 3, "failed\n");
        runner.respond("journalctl", 0, "boom: cannot find module\n");
        let service = ServiceController::new(&runner, "homeport-a");

        let err = verify_liveness(&runner, &service, 8080, &quick())
            .await
            .expect_err("not active");
        assert_eq!(err.kind(), ErrorKind::ServiceNotActive);
        assert!(err.get("logs").unwrap_or_default().contains("cannot find module"));
        assert_eq!(runner.count("systemctl is-active"), 2);
        assert!(!runner.ran("grep -Eq"));
    }

    #[tokio::test]
    async fn active_but_not_listening_is_distinct() {
        let runner = MockRunner::healthy_host();
        runner.respond("grep -Eq", 1, "");
        runner.respond("ss -ltn 2>/dev/null ||", 0, "LISTEN 0 128 0.0.0.0:22\n");
        let service = ServiceController::new(&runner, "homeport-a");

        let err = verify_liveness(&runner, &service, 8080, &quick())
            .await
            .expect_err("not listening");
        assert_eq!(err.kind(), ErrorKind::ServiceNotListening);
        assert_eq!(err.get("port"), Some("8080"));
        assert!(err.get("listeners").unwrap_or_default().contains("0.0.0.0:22"));
    }
}
