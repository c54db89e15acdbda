use serde::Serialize;
use sqlx::types::Json;
use sqlx::FromRow;
use time::OffsetDateTime;

/// Placeholder response for a question nobody has answered.
pub(crate) const NO_RESPONSE: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub(crate) struct QuestionRecord {
    pub(crate) label: String,
    pub(crate) task: String,
    pub(crate) response: String,
    pub(crate) mode: String,
    pub(crate) solved: bool,
    pub(crate) solved_at: Option<OffsetDateTime>,
}

impl QuestionRecord {
    pub(crate) fn unsolved(label: &str, task: &str, mode: &str) -> Self {
        Self {
            label: label.to_string(),
            task: task.to_string(),
            response: String::new(),
            mode: mode.to_string(),
            solved: false,
            solved_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub(crate) struct PhaseRecord {
    pub(crate) label: String,
    pub(crate) tasks: Vec<String>,
    pub(crate) solved: bool,
    pub(crate) solved_at: Option<OffsetDateTime>,
}

impl PhaseRecord {
    pub(crate) fn unsolved(label: &str, tasks: &[String]) -> Self {
        Self { label: label.to_string(), tasks: tasks.to_vec(), solved: false, solved_at: None }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub(crate) struct EventRecord {
    pub(crate) id: i64,
    pub(crate) recorded_at: OffsetDateTime,
    pub(crate) data: Json<serde_json::Value>,
}
