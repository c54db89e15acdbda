use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{Mutex, RwLock};

use crate::core::config::{GradingParts, GradingSettings, PhasePlan};
use crate::core::time::{format_offset, Clock};
use crate::db::models::{PhaseRecord, QuestionRecord, NO_RESPONSE};
use crate::db::types::EventKind;
use crate::repositories::store::{RecordStore, StoreError};
use crate::services::events::EventLog;
use crate::services::notifier::{SolveNotice, SolveNotifier};

/// Reported as the current phase once every phase is solved.
pub(crate) const PHASES_COMPLETED: &str = "completed";

/// Case-insensitive substring match on a free-text status.
pub(crate) fn is_success(status: &str) -> bool {
    status.to_lowercase().contains("success")
}

/// One graded label, ready to be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommitEntry {
    pub(crate) label: String,
    pub(crate) status: String,
    pub(crate) answer: Option<String>,
}

impl CommitEntry {
    /// Accepts the `status--answer` form some scripts emit; a bare status has no answer.
    pub(crate) fn parse(label: &str, value: &str) -> Self {
        match value.split_once("--") {
            Some((status, answer)) => Self {
                label: label.to_string(),
                status: status.trim().to_string(),
                answer: Some(answer.trim().to_string()).filter(|answer| !answer.is_empty()),
            },
            None => Self { label: label.to_string(), status: value.trim().to_string(), answer: None },
        }
    }
}

/// Question and phase state. Every read-modify-write goes through the commit lock.
pub(crate) struct Registry {
    store: Arc<dyn RecordStore>,
    parts: GradingParts,
    phases: Option<PhasePlan>,
    notifier: Arc<dyn SolveNotifier>,
    events: EventLog,
    clock: Arc<dyn Clock>,
    commit_lock: Mutex<()>,
    current_phase: RwLock<Option<String>>,
    completion_recorded: AtomicBool,
}

impl Registry {
    pub(crate) fn new(
        store: Arc<dyn RecordStore>,
        grading: &GradingSettings,
        notifier: Arc<dyn SolveNotifier>,
        events: EventLog,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            parts: grading.parts.clone(),
            phases: grading.phases.clone(),
            notifier,
            events,
            clock,
            commit_lock: Mutex::new(()),
            current_phase: RwLock::new(None),
            completion_recorded: AtomicBool::new(false),
        }
    }

    /// Seeds one record per part and per phase. Returns `true` when question records were created.
    pub(crate) async fn initialize(&self) -> Result<bool, StoreError> {
        let _guard = self.commit_lock.lock().await;

        let expected = self.parts.len() as i64;
        let existing = self.store.count_questions().await?;
        let seeded = if existing == expected {
            tracing::debug!(count = existing, "Question records already seeded");
            false
        } else {
            for label in self.parts.question_order() {
                let Some(part) = self.parts.get(&label) else {
                    continue;
                };
                let record = QuestionRecord::unsolved(&label, &part.text, part.kind.as_str());
                self.store.insert_question(&record).await?;
            }
            tracing::info!(count = expected, "Seeded question records");
            true
        };

        if let Some(plan) = &self.phases {
            let expected = plan.len() as i64;
            if self.store.count_phases().await? != expected {
                for phase in plan.order() {
                    let record = PhaseRecord::unsolved(phase, plan.members(phase));
                    self.store.insert_phase(&record).await?;
                }
                tracing::info!(count = expected, "Seeded phase records");
            }
        }

        self.recompute_phases_locked().await?;
        Ok(seeded)
    }

    /// Applies graded statuses, then recomputes phases. Notices fire after the lock is released.
    /// Returns the labels that became solved in this commit.
    pub(crate) async fn commit(&self, entries: &[CommitEntry]) -> Result<Vec<String>, StoreError> {
        let mut notices = Vec::new();
        let mut newly_solved = Vec::new();

        {
            let _guard = self.commit_lock.lock().await;
            let now = self.clock.now();

            for entry in entries {
                let Some(part) = self.parts.get(&entry.label) else {
                    tracing::debug!(label = %entry.label, "Skipping result for unknown grading part");
                    continue;
                };
                let mut record = self.store.find_question(&entry.label).await?.ok_or_else(|| {
                    StoreError::Missing { kind: "question", label: entry.label.clone() }
                })?;

                let was_solved = record.solved;
                let solved_now = is_success(&entry.status);

                record.response = entry
                    .answer
                    .as_deref()
                    .map(str::trim)
                    .filter(|answer| !answer.is_empty())
                    .unwrap_or(NO_RESPONSE)
                    .to_string();
                if solved_now && !was_solved {
                    record.solved = true;
                    record.solved_at = Some(now);
                    newly_solved.push(entry.label.clone());
                }
                self.store.update_question(&record).await?;

                if !was_solved {
                    notices.push(SolveNotice {
                        label: entry.label.clone(),
                        task: part.text.clone(),
                        mode: part.kind.as_str().to_string(),
                        answer: record.response.clone(),
                        solved: solved_now,
                    });
                }
            }

            self.recompute_phases_locked().await?;
        }

        for notice in &notices {
            self.notifier.notify(notice).await;
        }

        Ok(newly_solved)
    }

    // Short-circuits at the first phase that is still unsolved.
    async fn recompute_phases_locked(&self) -> Result<(), StoreError> {
        let Some(plan) = &self.phases else {
            return Ok(());
        };

        let mut current = PHASES_COMPLETED.to_string();
        for label in plan.order() {
            let mut phase = self
                .store
                .find_phase(label)
                .await?
                .ok_or_else(|| StoreError::Missing { kind: "phase", label: label.clone() })?;
            if phase.solved {
                continue;
            }

            let mut all_solved = true;
            for question in &phase.tasks {
                let record = self.store.find_question(question).await?.ok_or_else(|| {
                    StoreError::Missing { kind: "question", label: question.clone() }
                })?;
                if !record.solved {
                    all_solved = false;
                    break;
                }
            }

            if !all_solved {
                current = label.clone();
                break;
            }

            phase.solved = true;
            phase.solved_at = Some(self.clock.now());
            self.store.update_phase(&phase).await?;
            tracing::info!(phase = %label, "Phase solved");
        }

        *self.current_phase.write().await = Some(current);
        Ok(())
    }

    /// `None` when phasing is disabled, otherwise a phase label or [`PHASES_COMPLETED`].
    pub(crate) async fn current_phase(&self) -> Option<String> {
        if self.phases.is_none() {
            return None;
        }
        self.current_phase.read().await.clone()
    }

    pub(crate) fn phase_plan(&self) -> Option<&PhasePlan> {
        self.phases.as_ref()
    }

    pub(crate) fn parts(&self) -> &GradingParts {
        &self.parts
    }

    pub(crate) async fn is_solved(&self, label: &str) -> Result<bool, StoreError> {
        Ok(self.store.find_question(label).await?.is_some_and(|record| record.solved))
    }

    pub(crate) async fn question(&self, label: &str) -> Result<Option<QuestionRecord>, StoreError> {
        self.store.find_question(label).await
    }

    pub(crate) async fn questions(&self) -> Result<Vec<QuestionRecord>, StoreError> {
        self.store.list_questions().await
    }

    /// Snapshots every solved question and phase into the event log, and records completion once.
    pub(crate) async fn record_solves(&self) -> Result<(), StoreError> {
        let questions = self.store.list_questions().await?;
        for question in questions.iter().filter(|question| question.solved) {
            self.events
                .record(
                    EventKind::QuestionSolved,
                    json!({
                        "label": question.label,
                        "solved_at": question.solved_at.map(format_offset),
                    }),
                )
                .await?;
        }

        if self.phases.is_some() {
            for phase in self.store.list_phases().await?.iter().filter(|phase| phase.solved) {
                self.events
                    .record(
                        EventKind::PhaseSolved,
                        json!({
                            "label": phase.label,
                            "solved_at": phase.solved_at.map(format_offset),
                        }),
                    )
                    .await?;
            }
        }

        let all_solved = !questions.is_empty() && questions.iter().all(|question| question.solved);
        if all_solved && !self.completion_recorded.swap(true, Ordering::SeqCst) {
            tracing::info!("All questions solved; challenge completed");
            self.events
                .record(EventKind::ChallengeCompleted, json!({ "questions": questions.len() }))
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::GradingSettings;
    use crate::test_support::{self, RecordingNotifier};

    const PHASED: &str = r#"
        [grading]
        enabled = true
        manual_grading = true
        manual_grading_script = "grade.py"
        phases = true
        phase_info = { mini_challenge = ["GradingCheck3"], phase1 = ["GradingCheck1", "GradingCheck2"] }

        [grading.parts.GradingCheck1]
        mode = "text"
        text = "First"
        token_name = "token1"

        [grading.parts.GradingCheck2]
        mode = "button"
        text = "Second"
        token_name = "token2"

        [grading.parts.GradingCheck3]
        mode = "text"
        text = "Third"
        token_name = "token3"
    "#;

    fn entry(label: &str, status: &str) -> CommitEntry {
        CommitEntry { label: label.to_string(), status: status.to_string(), answer: None }
    }

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let grading = GradingSettings::from_toml_str(test_support::MANUAL_CHALLENGE);
        let (registry, store, _) = test_support::registry(&grading);

        assert!(registry.initialize().await.expect("first seed"));
        registry.commit(&[entry("GradingCheck1", "Success")]).await.expect("commit");
        assert!(!registry.initialize().await.expect("second seed"));

        assert_eq!(store.count_questions().await.expect("count"), grading.parts.len() as i64);
        assert!(registry.is_solved("GradingCheck1").await.expect("solved"));
    }

    #[tokio::test]
    async fn notifications_are_edge_triggered() {
        let grading = GradingSettings::from_toml_str(test_support::MANUAL_CHALLENGE);
        let (registry, _, notifier) = test_support::registry(&grading);
        registry.initialize().await.expect("seed");

        registry.commit(&[entry("GradingCheck1", "Failure")]).await.expect("fail");
        let first = registry.commit(&[entry("GradingCheck1", "Success")]).await.expect("solve");
        let second = registry.commit(&[entry("GradingCheck1", "Success")]).await.expect("again");
        registry.commit(&[entry("GradingCheck1", "Failure")]).await.expect("regress");

        assert_eq!(first, vec!["GradingCheck1".to_string()]);
        assert!(second.is_empty());
        let notices = notifier.notices().await;
        assert_eq!(notices.len(), 2);
        assert!(!notices[0].solved);
        assert!(notices[1].solved);
        assert!(registry.is_solved("GradingCheck1").await.expect("still solved"));
    }

    #[tokio::test]
    async fn response_records_answer_or_placeholder() {
        let grading = GradingSettings::from_toml_str(test_support::MANUAL_CHALLENGE);
        let (registry, _, _) = test_support::registry(&grading);
        registry.initialize().await.expect("seed");

        registry
            .commit(&[
                CommitEntry::parse("GradingCheck1", "Failure -- 10.0.0.1"),
                entry("GradingCheck2", "Failure"),
            ])
            .await
            .expect("commit");

        let first = registry.question("GradingCheck1").await.expect("find").expect("record");
        let second = registry.question("GradingCheck2").await.expect("find").expect("record");
        assert_eq!(first.response, "10.0.0.1");
        assert_eq!(second.response, NO_RESPONSE);
    }

    #[tokio::test]
    async fn phases_advance_and_complete() {
        let grading = GradingSettings::from_toml_str(PHASED);
        let (registry, _, _) = test_support::registry(&grading);
        registry.initialize().await.expect("seed");
        assert_eq!(registry.current_phase().await.as_deref(), Some("phase1"));

        registry.commit(&[entry("GradingCheck1", "Success")]).await.expect("commit");
        assert_eq!(registry.current_phase().await.as_deref(), Some("phase1"));

        registry.commit(&[entry("GradingCheck2", "success!")]).await.expect("commit");
        assert_eq!(registry.current_phase().await.as_deref(), Some("mini_challenge"));

        registry.commit(&[entry("GradingCheck3", "Success")]).await.expect("commit");
        assert_eq!(registry.current_phase().await.as_deref(), Some(PHASES_COMPLETED));
    }

    #[tokio::test]
    async fn concurrent_commits_do_not_lose_phase_completion() {
        let grading = GradingSettings::from_toml_str(PHASED);
        let (registry, store, _) = test_support::registry(&grading);
        registry.initialize().await.expect("seed");
        let registry = Arc::new(registry);

        let first = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.commit(&[entry("GradingCheck1", "Success")]).await })
        };
        let second = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.commit(&[entry("GradingCheck2", "Success")]).await })
        };
        first.await.expect("join").expect("commit");
        second.await.expect("join").expect("commit");

        let phase = store.find_phase("phase1").await.expect("find").expect("phase");
        assert!(phase.solved);
        assert_eq!(registry.current_phase().await.as_deref(), Some("mini_challenge"));
    }

    #[tokio::test]
    async fn current_phase_is_none_without_phasing() {
        let grading = GradingSettings::from_toml_str(test_support::MANUAL_CHALLENGE);
        let (registry, _, _) = test_support::registry(&grading);
        registry.initialize().await.expect("seed");

        assert_eq!(registry.current_phase().await, None);
    }

    #[tokio::test]
    async fn record_solves_snapshots_and_completes_once() {
        let grading = GradingSettings::from_toml_str(test_support::MANUAL_CHALLENGE);
        let (registry, store, _) = test_support::registry(&grading);
        registry.initialize().await.expect("seed");

        let all: Vec<CommitEntry> =
            grading.parts.question_order().iter().map(|label| entry(label, "Success")).collect();
        registry.commit(&all).await.expect("commit");
        registry.record_solves().await.expect("record");
        registry.record_solves().await.expect("record again");

        let events = store.recent_events(100).await.expect("events");
        let completed = events
            .iter()
            .filter(|event| event.data.0["event_type"] == "Challenge Completed")
            .count();
        let solved = events
            .iter()
            .filter(|event| event.data.0["event_type"] == "Question Solved")
            .count();
        assert_eq!(completed, 1);
        assert_eq!(solved, grading.parts.len() * 2);
    }

    #[test]
    fn success_detection_is_case_insensitive_substring() {
        assert!(is_success("Success"));
        assert!(is_success("SUCCESS -- flag accepted"));
        assert!(is_success("partial success"));
        assert!(!is_success("Failure"));
        assert!(!is_success("Failed"));
    }
}
