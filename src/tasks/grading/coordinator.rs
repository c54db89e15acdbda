use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::metrics;
use crate::core::time::Clock;

use super::engine::GradingEngine;
use super::results::ResultBoard;
use super::Lane;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum RunStatus {
    Running,
    Done,
}

/// Caller-facing view of one manual run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct RunView {
    pub(crate) id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) submit_time: OffsetDateTime,
    pub(crate) status: RunStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SubmitOutcome {
    Started(RunView),
    InFlight(RunView),
    RateLimited { wait_seconds: u64 },
}

struct InFlightRun {
    view: RunView,
    handle: JoinHandle<()>,
}

impl InFlightRun {
    fn view(&self) -> RunView {
        let mut view = self.view.clone();
        if self.handle.is_finished() {
            view.status = RunStatus::Done;
        }
        view
    }
}

#[derive(Default)]
struct LaneState {
    last_submit: Option<OffsetDateTime>,
    current: Option<InFlightRun>,
}

/// Single-flight, rate-limited manual grading. Rejections never wait.
pub(crate) struct ManualCoordinator {
    engine: Arc<GradingEngine>,
    board: Arc<ResultBoard>,
    clock: Arc<dyn Clock>,
    rate_limit: Duration,
    lane: Mutex<LaneState>,
}

impl ManualCoordinator {
    pub(crate) fn new(
        engine: Arc<GradingEngine>,
        board: Arc<ResultBoard>,
        clock: Arc<dyn Clock>,
        rate_limit: Duration,
    ) -> Self {
        Self { engine, board, clock, rate_limit, lane: Mutex::new(LaneState::default()) }
    }

    pub(crate) async fn submit(&self, inputs: BTreeMap<String, String>) -> SubmitOutcome {
        let mut lane = self.lane.lock().await;

        if let Some(current) = &lane.current {
            if !current.handle.is_finished() {
                tracing::info!(run_id = %current.view.id, "Grading task is still running");
                return SubmitOutcome::InFlight(current.view());
            }
        }

        let now = self.clock.now();
        if let Some(wait_seconds) = self.remaining_wait(lane.last_submit, now) {
            tracing::info!(wait_seconds, "Hit rate limit");
            metrics::record_rate_limited();
            return SubmitOutcome::RateLimited { wait_seconds };
        }

        lane.last_submit = Some(now);
        self.board.mark_submitted(Lane::Manual, now).await;

        let view = RunView { id: Uuid::new_v4(), submit_time: now, status: RunStatus::Running };
        tracing::info!(run_id = %view.id, "Submitting a grading task");

        let engine = self.engine.clone();
        let board = self.board.clone();
        let handle = tokio::spawn(async move {
            let outcome = engine.grade_manual(&inputs).await;
            board.publish(Lane::Manual, outcome).await;
        });
        lane.current = Some(InFlightRun { view: view.clone(), handle });

        SubmitOutcome::Started(view)
    }

    /// The latest run, if any was started.
    pub(crate) async fn status(&self) -> Option<RunView> {
        self.lane.lock().await.current.as_ref().map(InFlightRun::view)
    }

    // Whole seconds left in the window, floored.
    fn remaining_wait(&self, last: Option<OffsetDateTime>, now: OffsetDateTime) -> Option<u64> {
        let last = last?;
        let limit = time::Duration::seconds(i64::try_from(self.rate_limit.as_secs()).unwrap_or(i64::MAX));
        let elapsed = now - last;
        if elapsed >= limit {
            return None;
        }
        Some(u64::try_from((limit - elapsed).whole_seconds()).unwrap_or(0))
    }
}
