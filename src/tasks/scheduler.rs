use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::core::shutdown::{cancelled, ShutdownTrigger};
use crate::core::state::AppState;
use crate::tasks::grading::run_cron_loop;
use crate::tasks::monitor;

const RECORD_SOLVES_INTERVAL: Duration = Duration::from_secs(10);

/// Startup gate first, then every background loop until shutdown.
pub(crate) async fn run(state: AppState, trigger: ShutdownTrigger) -> Result<()> {
    let mut shutdown = trigger.subscribe();
    if let Err(err) = monitor::run_startup_gate(&state, trigger.subscribe()).await {
        tracing::error!(error = %err, "Startup failed");
        trigger.trigger();
        return Err(err);
    }
    if *shutdown.borrow() {
        return Ok(());
    }

    let handles = spawn_background(&state, &trigger);
    cancelled(&mut shutdown).await;

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Background task join failed");
        }
    }
    Ok(())
}

pub(crate) fn spawn_background(state: &AppState, trigger: &ShutdownTrigger) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    if state.settings().grading().cron_enabled() {
        handles.push(tokio::spawn(run_cron_loop(state.clone(), trigger.subscribe())));
    }

    for service in state.settings().services().iter().filter(|service| !service.blocking) {
        handles.push(tokio::spawn(monitor::check_service_loop(
            state.probe().clone(),
            state.services().clone(),
            service.clone(),
            monitor::MONITOR_INTERVAL,
            0,
            trigger.subscribe(),
        )));
    }

    if state.settings().grading().enabled {
        handles.push(tokio::spawn(record_solves_loop(state.clone(), trigger.subscribe())));
    }

    if state.settings().startup().port_checker {
        handles.push(tokio::spawn(monitor::run_port_checker(trigger.subscribe())));
    }

    tracing::info!(tasks = handles.len(), "Background tasks started");
    handles
}

async fn record_solves_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(RECORD_SOLVES_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancelled(&mut shutdown) => break,
            _ = tick.tick() => {
                if let Err(err) = state.registry().record_solves().await {
                    tracing::error!(error = %err, "record_solves failed");
                }
            }
        }
    }
}
