use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use crate::core::config::{GradingPart, GradingSettings, PartKind};
use crate::core::metrics;
use crate::core::state::RuntimeFlags;
use crate::db::types::EventKind;
use crate::services::events::EventLog;
use crate::services::grader_client::GraderClient;
use crate::services::registry::{is_success, CommitEntry, Registry, PHASES_COMPLETED};
use crate::services::script_runner::{run_checked, ScriptRunner};
use crate::services::tokens::{TokenDispenser, NO_TOKEN_MESSAGE};
use crate::services::uploads::latest_upload;

use super::output::parse_output;
use super::{Lane, LaneOutcome};

const DEFAULT_STATUS: &str = "Failed";

/// Runs grading scripts for both lanes and turns their output into committed state and tokens.
pub(crate) struct GradingEngine {
    registry: Arc<Registry>,
    runner: Arc<dyn ScriptRunner>,
    tokens: TokenDispenser,
    grader: Option<GraderClient>,
    flags: Arc<RuntimeFlags>,
    events: EventLog,
    manual_script: Option<String>,
    cron_script: Option<String>,
    upload_dir: PathBuf,
}

impl GradingEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: Arc<Registry>,
        runner: Arc<dyn ScriptRunner>,
        tokens: TokenDispenser,
        grader: Option<GraderClient>,
        flags: Arc<RuntimeFlags>,
        events: EventLog,
        grading: &GradingSettings,
        upload_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            runner,
            tokens,
            grader,
            flags,
            events,
            manual_script: grading.manual_script.clone(),
            cron_script: grading.cron.as_ref().map(|cron| cron.script.clone()),
            upload_dir,
        }
    }

    /// One manual run. `inputs` are the submitted form values keyed by label.
    pub(crate) async fn grade_manual(&self, inputs: &BTreeMap<String, String>) -> LaneOutcome {
        self.flags.set_fatal(false);
        let Some(script) = self.manual_script.as_deref() else {
            tracing::warn!("Manual grading requested without a manual grading script");
            return LaneOutcome::default();
        };

        let args = self.script_args(inputs).await;
        let mut argv = Vec::new();
        if !args.is_empty() {
            match serde_json::to_string(&args) {
                Ok(encoded) => argv.push(encoded),
                Err(err) => tracing::error!(error = %err, "Failed to encode grading arguments"),
            }
        }

        let phase = self.registry.current_phase().await;
        if let Some(phase) = &phase {
            if phase == PHASES_COMPLETED {
                tracing::info!("Every phase is solved; reporting success without running the script");
                metrics::record_grading_run(Lane::Manual.as_str(), "completed");
                let results = self
                    .registry
                    .parts()
                    .iter()
                    .map(|part| (part.label.clone(), "Success".to_string()))
                    .collect();
                return self.finish(Lane::Manual, results).await;
            }
            argv.push(phase.clone());
        }

        let mut results = self.execute(Lane::Manual, script, &argv).await;
        for part in self.defaulted_manual_parts(phase.as_deref()) {
            results.entry(part.label.clone()).or_insert_with(|| {
                tracing::info!(label = %part.label, script, "No result for grading part; assigning Failed");
                DEFAULT_STATUS.to_string()
            });
        }

        let entries: Vec<CommitEntry> = results
            .iter()
            .map(|(label, status)| {
                let mut entry = CommitEntry::parse(label, status);
                if entry.answer.is_none() {
                    entry.answer = args.get(label).cloned();
                }
                entry
            })
            .collect();
        self.commit(Lane::Manual, &entries).await;

        self.finish(Lane::Manual, results).await
    }

    /// One cron iteration over cron-mode parts.
    pub(crate) async fn grade_cron(&self) -> LaneOutcome {
        self.flags.set_fatal(false);
        let Some(script) = self.cron_script.as_deref() else {
            tracing::warn!("Cron grading requested without a cron grading script");
            return LaneOutcome::default();
        };

        let mut results = self.execute(Lane::Cron, script, &[]).await;
        for part in self.registry.parts().iter().filter(|part| part.kind.is_cron()) {
            results.entry(part.label.clone()).or_insert_with(|| {
                tracing::info!(label = %part.label, script, "No result for grading part; assigning Failed");
                DEFAULT_STATUS.to_string()
            });
        }

        let entries: Vec<CommitEntry> =
            results.iter().map(|(label, status)| CommitEntry::parse(label, status)).collect();
        self.commit(Lane::Cron, &entries).await;

        self.finish(Lane::Cron, results).await
    }

    // Button parts carry no value; upload parts pass the newest uploaded file.
    async fn script_args(&self, inputs: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut args = BTreeMap::new();
        for part in self.registry.parts().iter() {
            match &part.kind {
                PartKind::Button | PartKind::Cron => {}
                PartKind::Upload { upload_key } => {
                    args.insert(part.label.clone(), latest_upload(&self.upload_dir, upload_key).await);
                }
                _ => {
                    if let Some(value) = inputs.get(&part.label) {
                        args.insert(part.label.clone(), value.clone());
                    }
                }
            }
        }
        for label in inputs.keys().filter(|label| !self.registry.parts().contains(label)) {
            tracing::debug!(label = %label, "Ignoring form field that is not a grading part");
        }
        args
    }

    // Every manual part is defaulted unless a later phase is still expected to grade it.
    fn defaulted_manual_parts(&self, phase: Option<&str>) -> Vec<&GradingPart> {
        let mid_sequence = match (phase, self.registry.phase_plan()) {
            (Some(phase), Some(plan)) => !plan.is_terminal(phase),
            _ => false,
        };
        if mid_sequence {
            return Vec::new();
        }
        self.registry.parts().iter().filter(|part| part.kind.is_manual()).collect()
    }

    async fn execute(&self, lane: Lane, script: &str, argv: &[String]) -> BTreeMap<String, String> {
        tracing::debug!(lane = lane.as_str(), script, args = ?argv, "Starting grading script");
        let results = match run_checked(self.runner.as_ref(), script, argv).await {
            Ok(output) => {
                metrics::record_script_duration(lane.as_str(), output.elapsed);
                metrics::record_grading_run(lane.as_str(), "ok");
                parse_output(&output.stdout)
            }
            Err(err) => {
                tracing::error!(lane = lane.as_str(), script, error = %err, "Grading script failed");
                metrics::record_grading_run(lane.as_str(), "script_error");
                self.flags.set_fatal(true);
                BTreeMap::new()
            }
        };

        self.events
            .record_or_log(
                EventKind::GradingResult,
                json!({ "lane": lane.as_str(), "output": results }),
            )
            .await;
        results
    }

    async fn commit(&self, lane: Lane, entries: &[CommitEntry]) {
        match self.registry.commit(entries).await {
            Ok(newly_solved) if !newly_solved.is_empty() => {
                tracing::info!(lane = lane.as_str(), labels = ?newly_solved, "Questions newly solved");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(lane = lane.as_str(), error = %err, "Failed to commit grading results");
                self.flags.set_fatal(true);
            }
        }
    }

    /// Drops unknown labels and resolves tokens. A part solved in an earlier run
    /// keeps reporting success and its token.
    async fn finish(&self, lane: Lane, results: BTreeMap<String, String>) -> LaneOutcome {
        let mut outcome = LaneOutcome::default();
        for (label, status) in results {
            if !self.registry.parts().contains(&label) {
                tracing::debug!(label = %label, "Dropping result for unknown grading part");
                continue;
            }

            if is_success(&status) {
                outcome.tokens.insert(label.clone(), self.tokens.read_token(&label).await);
                outcome.results.insert(label, status);
            } else if self.previously_solved(&label).await {
                outcome.tokens.insert(label.clone(), self.tokens.read_token(&label).await);
                outcome.results.insert(label, "Success".to_string());
            } else {
                outcome.tokens.insert(label.clone(), NO_TOKEN_MESSAGE.to_string());
                outcome.results.insert(label, status);
            }
        }

        tracing::info!(lane = lane.as_str(), results = ?outcome.results, "Grading finished");
        if let Some(grader) = &self.grader {
            grader.post_submission(&outcome.tokens).await;
        }
        outcome
    }

    async fn previously_solved(&self, label: &str) -> bool {
        match self.registry.is_solved(label).await {
            Ok(solved) => solved,
            Err(err) => {
                tracing::error!(label, error = %err, "Failed to read question state");
                false
            }
        }
    }
}
