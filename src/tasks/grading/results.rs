use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::core::config::GradingSettings;
use crate::core::time::format_offset;
use crate::db::models::{QuestionRecord, NO_RESPONSE};
use crate::repositories::store::StoreError;
use crate::schemas::grading::{LaneValues, ResultsView};
use crate::services::registry::{Registry, PHASES_COMPLETED};
use crate::services::tokens::{TokenDispenser, NO_TOKEN_MESSAGE};

use super::{Lane, LaneOutcome};

const NOT_GRADED_YET: &str = "Failure -- Has not been graded yet.";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct LaneSnapshot {
    pub(crate) submit_time: Option<OffsetDateTime>,
    pub(crate) outcome: LaneOutcome,
}

/// Latest submit time and outcome for each lane.
#[derive(Debug, Default)]
pub(crate) struct ResultBoard {
    manual: RwLock<LaneSnapshot>,
    cron: RwLock<LaneSnapshot>,
}

impl ResultBoard {
    fn slot(&self, lane: Lane) -> &RwLock<LaneSnapshot> {
        match lane {
            Lane::Manual => &self.manual,
            Lane::Cron => &self.cron,
        }
    }

    pub(crate) async fn mark_submitted(&self, lane: Lane, at: OffsetDateTime) {
        self.slot(lane).write().await.submit_time = Some(at);
    }

    pub(crate) async fn publish(&self, lane: Lane, outcome: LaneOutcome) {
        self.slot(lane).write().await.outcome = outcome;
    }

    pub(crate) async fn snapshot(&self, lane: Lane) -> LaneSnapshot {
        self.slot(lane).read().await.clone()
    }
}

/// Builds the results view. With phasing, questions in every phase up to and
/// including the current one are reported from stored state instead of the last run.
pub(crate) async fn results_view(
    registry: &Registry,
    board: &ResultBoard,
    tokens: &TokenDispenser,
    grading: &GradingSettings,
    fatal_error: bool,
) -> Result<ResultsView, StoreError> {
    let manual = board.snapshot(Lane::Manual).await;
    let cron = board.snapshot(Lane::Cron).await;

    let mut results =
        LaneValues { manual: manual.outcome.results, cron: cron.outcome.results };
    let mut lane_tokens = LaneValues { manual: manual.outcome.tokens, cron: cron.outcome.tokens };

    let current_phase = registry.current_phase().await;
    if let (Some(plan), Some(current)) = (registry.phase_plan(), current_phase.as_deref()) {
        for phase in plan.order() {
            for label in plan.members(phase) {
                let Some(part) = registry.parts().get(label) else {
                    continue;
                };
                let Some(record) = registry.question(label).await? else {
                    continue;
                };
                let (lane_results, lane_token_map) = if part.kind.is_cron() {
                    (&mut results.cron, &mut lane_tokens.cron)
                } else {
                    (&mut results.manual, &mut lane_tokens.manual)
                };

                // Reuse a token the last run already resolved; only stored solves are looked up.
                let resolved = lane_token_map.get(label).is_some_and(|token| token != NO_TOKEN_MESSAGE);
                if record.solved && !resolved {
                    lane_token_map.insert(label.clone(), tokens.read_token(label).await);
                }
                lane_results.insert(label.clone(), stored_status(&record));
            }

            if current != PHASES_COMPLETED && phase == current {
                break;
            }
        }
    }

    Ok(ResultsView {
        manual_enabled: grading.manual_enabled(),
        cron_enabled: grading.cron_enabled(),
        current_phase,
        results,
        tokens: lane_tokens,
        fatal_error,
        submit_times: LaneValues {
            manual: manual.submit_time.map(format_offset),
            cron: cron.submit_time.map(format_offset),
        },
    })
}

fn stored_status(record: &QuestionRecord) -> String {
    let response = record.response.as_str();
    match (record.solved, response) {
        (true, "" | NO_RESPONSE) => "Success".to_string(),
        (true, response) => format!("Success -- {response}"),
        (false, NO_RESPONSE) => "Failure".to_string(),
        (false, "") => NOT_GRADED_YET.to_string(),
        (false, response) => format!("Failure -- {response}"),
    }
}
