use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::config::SubmissionSettings;
use crate::core::metrics;
use crate::core::state::RuntimeFlags;

const MAX_ATTEMPTS: u32 = 4;
const RETRY_DELAY: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub(crate) enum SubmissionError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("grader rejected {verb} with 405")]
    MethodNotAllowed { verb: &'static str },
    #[error("grader returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Posts earned tokens to the external grader.
#[derive(Clone)]
pub(crate) struct GraderClient {
    client: Client,
    url: String,
    api_key: String,
    challenge_id: String,
    use_put: Arc<AtomicBool>,
    flags: Arc<RuntimeFlags>,
    retry_delay: Duration,
}

impl GraderClient {
    pub(crate) fn new(
        submission: &SubmissionSettings,
        challenge_id: &str,
        flags: Arc<RuntimeFlags>,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build grader HTTP client")?;

        Ok(Self {
            client,
            url: submission.grader_url.clone(),
            api_key: submission.grader_key.clone(),
            challenge_id: challenge_id.to_string(),
            use_put: Arc::new(AtomicBool::new(false)),
            flags,
            retry_delay: RETRY_DELAY,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Verb used for the next request. Flips to PUT for good after a 405 on POST.
    pub(crate) fn verb(&self) -> &'static str {
        if self.use_put.load(Ordering::SeqCst) {
            "PUT"
        } else {
            "POST"
        }
    }

    /// Tokens in case-insensitive label order.
    pub(crate) fn payload(&self, tokens: &BTreeMap<String, String>) -> Value {
        let mut labels: Vec<&String> = tokens.keys().collect();
        labels.sort_by_key(|label| label.to_lowercase());
        let questions: Vec<Value> =
            labels.into_iter().map(|label| json!({ "answer": tokens[label] })).collect();

        json!({
            "id": self.challenge_id,
            "sectionIndex": 0,
            "questions": questions,
        })
    }

    /// Never fails the caller: exhausted retries only raise the fatal flag. Returns whether the grader accepted.
    pub(crate) async fn post_submission(&self, tokens: &BTreeMap<String, String>) -> bool {
        let payload = self.payload(tokens);

        for attempt in 1..=MAX_ATTEMPTS {
            let verb = self.verb();
            match self.send(verb, &payload).await {
                Ok(()) => {
                    tracing::info!(url = %self.url, verb, attempt, "Grader accepted submission");
                    metrics::record_submission("accepted");
                    self.flags.set_fatal(false);
                    return true;
                }
                Err(SubmissionError::MethodNotAllowed { verb: "POST" }) => {
                    tracing::info!(url = %self.url, attempt, "Grader returned 405 for POST; switching to PUT");
                    self.use_put.store(true, Ordering::SeqCst);
                }
                Err(err) => {
                    tracing::error!(
                        url = %self.url,
                        verb,
                        attempt,
                        payload = %payload,
                        error = %err,
                        "Grader submission attempt failed"
                    );
                }
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        tracing::error!(
            url = %self.url,
            verb = self.verb(),
            payload = %payload,
            attempts = MAX_ATTEMPTS,
            "All attempts to submit results to the grader failed"
        );
        metrics::record_submission("failed");
        self.flags.set_fatal(true);
        false
    }

    async fn send(&self, verb: &'static str, payload: &Value) -> Result<(), SubmissionError> {
        let request = if verb == "PUT" { self.client.put(&self.url) } else { self.client.post(&self.url) };
        let response = request
            .header(ACCEPT, "text/plain")
            .header(CONTENT_TYPE, "application/json")
            .header("x-api-key", &self.api_key)
            .body(payload.to_string())
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::METHOD_NOT_ALLOWED => Err(SubmissionError::MethodNotAllowed { verb }),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(SubmissionError::Status { status: status.as_u16(), body })
            }
        }
    }
}
