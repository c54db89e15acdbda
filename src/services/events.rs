use std::sync::Arc;

use serde_json::{json, Value};

use crate::core::config::ChallengeSettings;
use crate::core::time::{format_offset, now_local};
use crate::db::types::EventKind;
use crate::repositories::store::{RecordStore, StoreError};

/// Appends analytics events tagged with the challenge identity.
#[derive(Clone)]
pub(crate) struct EventLog {
    store: Arc<dyn RecordStore>,
    challenge: String,
    support_code: String,
}

impl EventLog {
    pub(crate) fn new(store: Arc<dyn RecordStore>, challenge: &ChallengeSettings) -> Self {
        Self {
            store,
            challenge: challenge.name.clone(),
            support_code: challenge.support_code.clone(),
        }
    }

    fn tagged(&self, kind: EventKind, fields: Value) -> Value {
        let mut data = json!({
            "challenge": self.challenge,
            "support_code": self.support_code,
            "event_type": kind.as_str(),
            "recorded_at": format_offset(now_local()),
        });
        if let (Value::Object(target), Value::Object(extra)) = (&mut data, fields) {
            target.extend(extra);
        }
        data
    }

    pub(crate) async fn record(&self, kind: EventKind, fields: Value) -> Result<(), StoreError> {
        self.store.append_event(self.tagged(kind, fields)).await
    }

    /// Creates the running submission counter at zero. Existing counters are kept.
    pub(crate) async fn seed_submission_counter(&self) -> Result<bool, StoreError> {
        let seed = self.tagged(EventKind::SubmissionCounter, json!({ "number_submissions": 0 }));
        self.store.seed_submission_counter(seed).await
    }

    pub(crate) async fn count_submission(&self) -> Result<i64, StoreError> {
        self.store.increment_submission_counter(&format_offset(now_local())).await
    }

    /// Like [`EventLog::record`], but failures are only logged.
    pub(crate) async fn record_or_log(&self, kind: EventKind, fields: Value) {
        if let Err(err) = self.record(kind, fields).await {
            tracing::error!(event = kind.as_str(), error = %err, "Failed to record event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::store::MemoryRecordStore;

    #[tokio::test]
    async fn record_merges_identity_and_fields() {
        let store = Arc::new(MemoryRecordStore::new());
        let challenge = ChallengeSettings {
            id: "abc".to_string(),
            name: "Demo".to_string(),
            support_code: "abc".to_string(),
        };
        let events = EventLog::new(store.clone(), &challenge);

        events.record(EventKind::GradingResult, json!({"output": {"Q1": "Success"}})).await.expect("record");

        let stored = store.recent_events(1).await.expect("events");
        let data = &stored[0].data.0;
        assert_eq!(data["event_type"], "Grading Result");
        assert_eq!(data["challenge"], "Demo");
        assert_eq!(data["output"]["Q1"], "Success");
        assert!(data["recorded_at"].is_string());
    }

    #[tokio::test]
    async fn submission_counter_starts_at_zero_and_counts() {
        let store = Arc::new(MemoryRecordStore::new());
        let challenge = ChallengeSettings {
            id: "abc".to_string(),
            name: "Demo".to_string(),
            support_code: "abc".to_string(),
        };
        let events = EventLog::new(store.clone(), &challenge);

        assert!(events.seed_submission_counter().await.expect("seed"));
        assert!(!events.seed_submission_counter().await.expect("seed again"));
        assert_eq!(events.count_submission().await.expect("count"), 1);

        let stored = store.recent_events(1).await.expect("events");
        assert_eq!(stored[0].data.0["event_type"], "Submission Counter");
        assert_eq!(stored[0].data.0["challenge"], "Demo");
        assert_eq!(stored[0].data.0["number_submissions"], 1);
    }
}
