use std::collections::BTreeMap;

use serde::Serialize;

use crate::tasks::grading::RunView;

/// A value per grading lane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct LaneValues<T> {
    pub(crate) manual: T,
    pub(crate) cron: T,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ResultsView {
    pub(crate) manual_enabled: bool,
    pub(crate) cron_enabled: bool,
    pub(crate) current_phase: Option<String>,
    pub(crate) results: LaneValues<BTreeMap<String, String>>,
    pub(crate) tokens: LaneValues<BTreeMap<String, String>>,
    pub(crate) fatal_error: bool,
    pub(crate) submit_times: LaneValues<Option<String>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct GradeResponse {
    pub(crate) state: &'static str,
    pub(crate) run: RunView,
}

#[derive(Debug, Serialize)]
pub(crate) struct RunStatusResponse {
    pub(crate) run: Option<RunView>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct TaskEntry {
    pub(crate) label: String,
    pub(crate) text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) opts: Option<BTreeMap<String, String>>,
    pub(crate) solved: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct TasksResponse {
    pub(crate) challenge: String,
    pub(crate) current_phase: Option<String>,
    /// Parts grouped by mode.
    pub(crate) parts: BTreeMap<String, Vec<TaskEntry>>,
}

/// Service name to `[host, status]`.
pub(crate) type ServiceSnapshot = BTreeMap<String, (String, String)>;
