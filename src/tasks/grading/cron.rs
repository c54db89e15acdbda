use tokio::sync::watch;
use tokio::time::sleep;

use crate::core::shutdown::cancelled;
use crate::core::state::AppState;
use crate::core::time::{cron_start_delay, now_local};

use super::Lane;

/// Timer-driven cron grading. Stops for good once the configured limit is spent.
pub(crate) async fn run_cron_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let Some(cron) = state.settings().grading().cron.clone() else {
        return;
    };

    let delay = cron_start_delay(cron.delay, cron.at, now_local());
    tracing::info!(
        delay_secs = delay.as_secs(),
        interval_secs = cron.interval.as_secs(),
        limit = ?cron.limit,
        "Cron grading scheduled"
    );
    tokio::select! {
        _ = cancelled(&mut shutdown) => return,
        _ = sleep(delay) => {}
    }

    let mut attempt: u64 = 0;
    loop {
        if cron.limit.is_some_and(|limit| attempt >= limit) {
            tracing::info!(attempts = attempt, "Cron grading attempts exhausted; no more grading will take place");
            break;
        }
        attempt += 1;

        let submitted = state.clock().now();
        state.board().mark_submitted(Lane::Cron, submitted).await;
        tracing::info!(attempt, "Starting cron grading attempt");

        let outcome = state.engine().grade_cron().await;
        tracing::info!(attempt, results = ?outcome.results, "Cron grading attempt finished");
        state.board().publish(Lane::Cron, outcome).await;

        if let Err(err) = state.registry().record_solves().await {
            tracing::error!(error = %err, "Failed to record solves after cron grading");
        }

        tokio::select! {
            _ = cancelled(&mut shutdown) => break,
            _ = sleep(cron.interval) => {}
        }
    }
}
