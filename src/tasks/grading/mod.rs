mod coordinator;
mod cron;
mod engine;
mod output;
mod results;

use std::collections::BTreeMap;

use serde::Serialize;

pub(crate) use coordinator::{ManualCoordinator, RunView, SubmitOutcome};
pub(crate) use cron::run_cron_loop;
pub(crate) use engine::GradingEngine;
pub(crate) use results::{results_view, ResultBoard};

/// The two independent grading streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Lane {
    Manual,
    Cron,
}

impl Lane {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Cron => "cron",
        }
    }
}

/// What one run produced: a status per known label and the matching token or placeholder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct LaneOutcome {
    pub(crate) results: BTreeMap<String, String>,
    pub(crate) tokens: BTreeMap<String, String>,
}
