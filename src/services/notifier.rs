use async_trait::async_trait;
use serde_json::json;

use crate::db::types::EventKind;
use crate::services::events::EventLog;

/// A question that was graded while still unsolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SolveNotice {
    pub(crate) label: String,
    pub(crate) task: String,
    pub(crate) mode: String,
    pub(crate) answer: String,
    pub(crate) solved: bool,
}

/// Receives edge-triggered grading notices. Never sees an already-solved question.
#[async_trait]
pub(crate) trait SolveNotifier: Send + Sync {
    async fn notify(&self, notice: &SolveNotice);
}

pub(crate) struct EventLogNotifier {
    events: EventLog,
}

impl EventLogNotifier {
    pub(crate) fn new(events: EventLog) -> Self {
        Self { events }
    }
}

#[async_trait]
impl SolveNotifier for EventLogNotifier {
    async fn notify(&self, notice: &SolveNotice) {
        tracing::info!(label = %notice.label, solved = notice.solved, "Question graded");
        self.events
            .record_or_log(
                EventKind::QuestionGraded,
                json!({
                    "label": notice.label,
                    "task": notice.task,
                    "mode": notice.mode,
                    "answer": notice.answer,
                    "success": notice.solved,
                }),
            )
            .await;
    }
}
