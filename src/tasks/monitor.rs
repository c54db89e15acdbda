use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::process::Command;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::core::config::ServiceDescriptor;
use crate::core::shutdown::cancelled;
use crate::core::state::AppState;
use crate::schemas::grading::ServiceSnapshot;
use crate::services::availability::ServiceProbe;

pub(crate) const WAIT_INTERVAL: Duration = Duration::from_secs(2);
pub(crate) const MONITOR_INTERVAL: Duration = Duration::from_secs(30);
const PORT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

const STATUS_PENDING: &str = "Waiting for first check.";
const STATUS_UP: &str = "Service is reachable.";
const STATUS_DOWN: &str = "Service is unreachable. Trying again shortly.";

/// Last known status per service: `{name -> (host, status)}`.
#[derive(Debug, Default)]
pub(crate) struct ServiceBoard {
    entries: RwLock<BTreeMap<String, (String, String)>>,
}

impl ServiceBoard {
    pub(crate) fn new(services: &[ServiceDescriptor]) -> Self {
        let entries = services
            .iter()
            .map(|service| {
                (service.name.clone(), (service.host.clone(), STATUS_PENDING.to_string()))
            })
            .collect();
        Self { entries: RwLock::new(entries) }
    }

    async fn record(&self, service: &ServiceDescriptor, reachable: bool) {
        let status = if reachable { STATUS_UP } else { STATUS_DOWN };
        self.entries
            .write()
            .await
            .insert(service.name.clone(), (service.host.clone(), status.to_string()));
    }

    pub(crate) async fn snapshot(&self) -> ServiceSnapshot {
        self.entries.read().await.clone()
    }
}

/// Polls until the service answers. `max_attempts == 0` never gives up.
/// Returns `false` when attempts run out or shutdown fires first.
pub(crate) async fn wait_for_service(
    probe: &dyn ServiceProbe,
    board: &ServiceBoard,
    service: &ServiceDescriptor,
    interval: Duration,
    max_attempts: u32,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let mut attempts: u32 = 0;
    loop {
        attempts = attempts.saturating_add(1);
        let reachable = probe.check(service).await;
        board.record(service, reachable).await;
        if reachable {
            tracing::info!(service = %service.name, attempts, "Blocking service is available");
            return true;
        }
        if max_attempts != 0 && attempts >= max_attempts {
            tracing::warn!(service = %service.name, attempts, "Gave up waiting for service");
            return false;
        }

        tokio::select! {
            _ = cancelled(shutdown) => return false,
            _ = sleep(interval) => {}
        }
    }
}

/// Observes a service forever, or `max_checks` times when non-zero. Never gates anything.
pub(crate) async fn check_service_loop(
    probe: Arc<dyn ServiceProbe>,
    board: Arc<ServiceBoard>,
    service: ServiceDescriptor,
    interval: Duration,
    max_checks: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut checks: u32 = 0;
    loop {
        checks = checks.saturating_add(1);
        let reachable = probe.check(&service).await;
        board.record(&service, reachable).await;
        if max_checks != 0 && checks >= max_checks {
            break;
        }

        tokio::select! {
            _ = cancelled(&mut shutdown) => break,
            _ = sleep(interval) => {}
        }
    }
    tracing::debug!(service = %service.name, checks, "Service monitor stopped");
}

/// Waits for every blocking service concurrently, then runs startup scripts in order
/// and marks the server ready. A failing startup script is an error.
pub(crate) async fn run_startup_gate(state: &AppState, shutdown: watch::Receiver<bool>) -> Result<()> {
    let blocking: Vec<ServiceDescriptor> =
        state.settings().services().iter().filter(|service| service.blocking).cloned().collect();

    if !blocking.is_empty() {
        tracing::info!(count = blocking.len(), "Waiting for blocking services");
        let mut waits = JoinSet::new();
        for service in blocking {
            let probe = state.probe().clone();
            let board = state.services().clone();
            let mut shutdown = shutdown.clone();
            waits.spawn(async move {
                wait_for_service(probe.as_ref(), &board, &service, WAIT_INTERVAL, 0, &mut shutdown)
                    .await
            });
        }

        let mut all_up = true;
        while let Some(joined) = waits.join_next().await {
            match joined {
                Ok(up) => all_up &= up,
                Err(err) => {
                    tracing::error!(error = %err, "Service wait task failed");
                    all_up = false;
                }
            }
        }
        if !all_up {
            tracing::info!("Startup interrupted before every blocking service was available");
            return Ok(());
        }
    }

    for script in &state.settings().startup().scripts {
        tracing::info!(script = %script, "Running startup script");
        let output = match state.runner().invoke(script, &[]).await {
            Ok(output) => output,
            Err(err) => bail!("startup script {script} failed: {err}"),
        };
        if !output.succeeded() {
            bail!(
                "startup script {script} exited with status {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }
        tracing::info!(script = %script, stdout = %output.stdout.trim(), "Startup script finished");
    }

    state.flags().mark_ready();
    tracing::info!("Server marked ready");
    Ok(())
}

/// Logs listening sockets periodically.
pub(crate) async fn run_port_checker(mut shutdown: watch::Receiver<bool>) {
    loop {
        let output = Command::new("ss")
            .arg("-nltup")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;
        match output {
            Ok(output) => {
                tracing::info!(ports = %String::from_utf8_lossy(&output.stdout), "Local listening ports");
            }
            Err(err) => tracing::warn!(error = %err, "Failed to run ss"),
        }

        tokio::select! {
            _ = cancelled(&mut shutdown) => break,
            _ = sleep(PORT_CHECK_INTERVAL) => {}
        }
    }
}
