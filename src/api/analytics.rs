use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{Method, Request};
use axum::middleware::Next;
use axum::response::Response;
use serde_json::{json, Map, Value};

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::db::types::EventKind;

const MAX_RECORDED_BODY: usize = 1024 * 1024;

// Polling and health-check endpoints would drown the log.
const UNRECORDED_PATHS: &[&str] = &["/challenge/update", "/healthz", "/metrics"];

/// Writes a `Request` event for every GET and a `Submission` event for anything
/// else, with the submitted answers and the prompt of each answered part.
/// Submissions also bump the submission counter.
pub(crate) async fn record_request(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let path = match request.uri().path().trim_end_matches('/') {
        "" => "/".to_string(),
        trimmed => trimmed.to_string(),
    };
    if UNRECORDED_PATHS.contains(&path.as_str()) {
        return Ok(next.run(request).await);
    }

    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_RECORDED_BODY)
        .await
        .map_err(|err| ApiError::BadRequest(format!("Failed to read request body: {err}")))?;

    let kind = if parts.method == Method::GET { EventKind::Request } else { EventKind::Submission };
    let client = parts
        .headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let events = state.events();
    events
        .record_or_log(
            kind,
            json!({
                "client": client,
                "method": parts.method.as_str(),
                "path": path,
                "submitted_form_data": submitted_form_data(&state, &bytes),
            }),
        )
        .await;

    if kind == EventKind::Submission {
        match events.count_submission().await {
            Ok(total) => tracing::debug!(total, "Submission counted"),
            Err(err) => tracing::error!(error = %err, "Failed to increment the submission counter"),
        }
    }

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

// Each answered part also carries its prompt under `<label>_text`.
fn submitted_form_data(state: &AppState, body: &[u8]) -> Value {
    let Ok(Value::Object(inputs)) = serde_json::from_slice::<Value>(body) else {
        return Value::Object(Map::new());
    };

    let parts = &state.settings().grading().parts;
    let mut data = Map::new();
    for (label, answer) in inputs {
        if let Some(part) = parts.get(&label) {
            data.insert(format!("{label}_text"), Value::String(part.text.clone()));
        }
        data.insert(label, answer);
    }
    Value::Object(data)
}
