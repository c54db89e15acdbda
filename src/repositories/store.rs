use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::db::models::{EventRecord, PhaseRecord, QuestionRecord};
use crate::db::types::EventKind;
use crate::repositories::{events, health, phases, questions};

#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("no {kind} record for label {label}")]
    Missing { kind: &'static str, label: String },
}

/// Keyed persistence for question and phase state plus the append-only event log.
#[async_trait]
pub(crate) trait RecordStore: Send + Sync {
    async fn count_questions(&self) -> Result<i64, StoreError>;
    async fn insert_question(&self, record: &QuestionRecord) -> Result<(), StoreError>;
    async fn find_question(&self, label: &str) -> Result<Option<QuestionRecord>, StoreError>;
    async fn update_question(&self, record: &QuestionRecord) -> Result<(), StoreError>;
    async fn list_questions(&self) -> Result<Vec<QuestionRecord>, StoreError>;

    async fn count_phases(&self) -> Result<i64, StoreError>;
    async fn insert_phase(&self, record: &PhaseRecord) -> Result<(), StoreError>;
    async fn find_phase(&self, label: &str) -> Result<Option<PhaseRecord>, StoreError>;
    async fn update_phase(&self, record: &PhaseRecord) -> Result<(), StoreError>;
    async fn list_phases(&self) -> Result<Vec<PhaseRecord>, StoreError>;

    async fn append_event(&self, data: Value) -> Result<(), StoreError>;
    async fn recent_events(&self, limit: usize) -> Result<Vec<EventRecord>, StoreError>;
    /// Returns false when a counter row already exists.
    async fn seed_submission_counter(&self, data: Value) -> Result<bool, StoreError>;
    /// Bumps the counter in place and returns the new total.
    async fn increment_submission_counter(&self, recorded_at: &str) -> Result<i64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub(crate) struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn count_questions(&self) -> Result<i64, StoreError> {
        Ok(questions::count(&self.pool).await?)
    }

    async fn insert_question(&self, record: &QuestionRecord) -> Result<(), StoreError> {
        Ok(questions::insert(&self.pool, record).await?)
    }

    async fn find_question(&self, label: &str) -> Result<Option<QuestionRecord>, StoreError> {
        Ok(questions::find_by_label(&self.pool, label).await?)
    }

    async fn update_question(&self, record: &QuestionRecord) -> Result<(), StoreError> {
        if questions::update(&self.pool, record).await? == 0 {
            return Err(StoreError::Missing { kind: "question", label: record.label.clone() });
        }
        Ok(())
    }

    async fn list_questions(&self) -> Result<Vec<QuestionRecord>, StoreError> {
        Ok(questions::list(&self.pool).await?)
    }

    async fn count_phases(&self) -> Result<i64, StoreError> {
        Ok(phases::count(&self.pool).await?)
    }

    async fn insert_phase(&self, record: &PhaseRecord) -> Result<(), StoreError> {
        Ok(phases::insert(&self.pool, record).await?)
    }

    async fn find_phase(&self, label: &str) -> Result<Option<PhaseRecord>, StoreError> {
        Ok(phases::find_by_label(&self.pool, label).await?)
    }

    async fn update_phase(&self, record: &PhaseRecord) -> Result<(), StoreError> {
        if phases::update(&self.pool, record).await? == 0 {
            return Err(StoreError::Missing { kind: "phase", label: record.label.clone() });
        }
        Ok(())
    }

    async fn list_phases(&self) -> Result<Vec<PhaseRecord>, StoreError> {
        Ok(phases::list(&self.pool).await?)
    }

    async fn append_event(&self, data: Value) -> Result<(), StoreError> {
        events::insert(&self.pool, &data).await?;
        Ok(())
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<EventRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(events::list_recent(&self.pool, limit).await?)
    }

    async fn seed_submission_counter(&self, data: Value) -> Result<bool, StoreError> {
        Ok(events::seed_submission_counter(&self.pool, &data).await?)
    }

    async fn increment_submission_counter(&self, recorded_at: &str) -> Result<i64, StoreError> {
        events::increment_submission_counter(&self.pool, recorded_at)
            .await?
            .ok_or_else(submission_counter_missing)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(health::ping(&self.pool).await?)
    }
}

/// Process-local store for single-node runs and tests.
#[derive(Default)]
pub(crate) struct MemoryRecordStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    questions: BTreeMap<String, QuestionRecord>,
    phases: BTreeMap<String, PhaseRecord>,
    events: Vec<EventRecord>,
}

impl MemoryRecordStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn count_questions(&self) -> Result<i64, StoreError> {
        Ok(self.inner.lock().await.questions.len() as i64)
    }

    async fn insert_question(&self, record: &QuestionRecord) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        state.questions.entry(record.label.clone()).or_insert_with(|| record.clone());
        Ok(())
    }

    async fn find_question(&self, label: &str) -> Result<Option<QuestionRecord>, StoreError> {
        Ok(self.inner.lock().await.questions.get(label).cloned())
    }

    async fn update_question(&self, record: &QuestionRecord) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        match state.questions.get_mut(&record.label) {
            Some(existing) => {
                existing.response = record.response.clone();
                existing.solved = record.solved;
                existing.solved_at = record.solved_at;
                Ok(())
            }
            None => Err(StoreError::Missing { kind: "question", label: record.label.clone() }),
        }
    }

    async fn list_questions(&self) -> Result<Vec<QuestionRecord>, StoreError> {
        Ok(self.inner.lock().await.questions.values().cloned().collect())
    }

    async fn count_phases(&self) -> Result<i64, StoreError> {
        Ok(self.inner.lock().await.phases.len() as i64)
    }

    async fn insert_phase(&self, record: &PhaseRecord) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        state.phases.entry(record.label.clone()).or_insert_with(|| record.clone());
        Ok(())
    }

    async fn find_phase(&self, label: &str) -> Result<Option<PhaseRecord>, StoreError> {
        Ok(self.inner.lock().await.phases.get(label).cloned())
    }

    async fn update_phase(&self, record: &PhaseRecord) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        match state.phases.get_mut(&record.label) {
            Some(existing) => {
                existing.solved = record.solved;
                existing.solved_at = record.solved_at;
                Ok(())
            }
            None => Err(StoreError::Missing { kind: "phase", label: record.label.clone() }),
        }
    }

    async fn list_phases(&self) -> Result<Vec<PhaseRecord>, StoreError> {
        Ok(self.inner.lock().await.phases.values().cloned().collect())
    }

    async fn append_event(&self, data: Value) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        let id = state.events.len() as i64 + 1;
        state.events.push(EventRecord { id, recorded_at: OffsetDateTime::now_utc(), data: Json(data) });
        Ok(())
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<EventRecord>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state.events.iter().rev().take(limit).cloned().collect())
    }

    async fn seed_submission_counter(&self, data: Value) -> Result<bool, StoreError> {
        let mut state = self.inner.lock().await;
        if state.events.iter().any(is_submission_counter) {
            return Ok(false);
        }
        let id = state.events.len() as i64 + 1;
        state.events.push(EventRecord { id, recorded_at: OffsetDateTime::now_utc(), data: Json(data) });
        Ok(true)
    }

    async fn increment_submission_counter(&self, recorded_at: &str) -> Result<i64, StoreError> {
        let mut state = self.inner.lock().await;
        let counter = state
            .events
            .iter_mut()
            .find(|event| is_submission_counter(event))
            .ok_or_else(submission_counter_missing)?;
        let total = counter.data.0["number_submissions"].as_i64().unwrap_or(0) + 1;
        counter.data.0["number_submissions"] = Value::from(total);
        counter.data.0["recorded_at"] = Value::from(recorded_at);
        Ok(total)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn is_submission_counter(event: &EventRecord) -> bool {
    event.data.0["event_type"] == EventKind::SubmissionCounter.as_str()
}

fn submission_counter_missing() -> StoreError {
    StoreError::Missing { kind: "event", label: EventKind::SubmissionCounter.as_str().to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_insert_is_first_writer_wins() {
        let store = MemoryRecordStore::new();
        let mut record = QuestionRecord::unsolved("GradingCheck1", "Find the flag", "text");
        store.insert_question(&record).await.expect("insert");

        record.task = "changed".to_string();
        store.insert_question(&record).await.expect("insert again");

        assert_eq!(store.count_questions().await.expect("count"), 1);
        let stored = store.find_question("GradingCheck1").await.expect("find").expect("record");
        assert_eq!(stored.task, "Find the flag");
    }

    #[tokio::test]
    async fn memory_update_of_unknown_label_is_missing() {
        let store = MemoryRecordStore::new();
        let record = QuestionRecord::unsolved("Nope", "", "text");

        let err = store.update_question(&record).await.expect_err("missing");
        assert!(matches!(err, StoreError::Missing { kind: "question", .. }));
    }

    #[tokio::test]
    async fn memory_events_are_listed_newest_first() {
        let store = MemoryRecordStore::new();
        store.append_event(json!({"event_type": "first"})).await.expect("append");
        store.append_event(json!({"event_type": "second"})).await.expect("append");

        let events = store.recent_events(1).await.expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data.0["event_type"], "second");
    }

    #[tokio::test]
    async fn memory_submission_counter_is_seeded_once() {
        let store = MemoryRecordStore::new();
        let seed = json!({"event_type": "Submission Counter", "number_submissions": 0});

        assert!(store.seed_submission_counter(seed.clone()).await.expect("seed"));
        assert!(!store.seed_submission_counter(seed).await.expect("seed again"));
        assert_eq!(store.increment_submission_counter("2024-05-01 12:00:00").await.expect("bump"), 1);
        assert_eq!(store.increment_submission_counter("2024-05-01 12:00:05").await.expect("bump"), 2);

        let events = store.recent_events(10).await.expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data.0["number_submissions"], 2);
        assert_eq!(events[0].data.0["recorded_at"], "2024-05-01 12:00:05");
    }

    #[tokio::test]
    async fn memory_counter_must_be_seeded_first() {
        let store = MemoryRecordStore::new();

        let err = store.increment_submission_counter("now").await.expect_err("missing");
        assert!(matches!(err, StoreError::Missing { kind: "event", .. }));
    }
}
