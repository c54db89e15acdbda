use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: u16,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait_seconds: Option<u64>,
}

#[derive(Debug)]
pub(crate) enum ApiError {
    BadRequest(String),
    NotFound(String),
    RateLimited { wait_seconds: u64 },
    NotReady,
    Internal(String),
}

impl ApiError {
    /// Log the underlying error with context and return an `Internal` variant.
    pub(crate) fn internal(err: impl std::fmt::Display, context: &str) -> Self {
        tracing::error!(error = %err, "{context}");
        Self::Internal(context.to_string())
    }
}

fn body(status: StatusCode, detail: String, wait_seconds: Option<u64>) -> Json<ErrorResponse> {
    Json(ErrorResponse { status: status.as_u16(), detail, wait_seconds })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                let status = StatusCode::BAD_REQUEST;
                (status, body(status, message, None)).into_response()
            }
            ApiError::NotFound(message) => {
                let status = StatusCode::NOT_FOUND;
                (status, body(status, message, None)).into_response()
            }
            ApiError::RateLimited { wait_seconds } => {
                let status = StatusCode::TOO_MANY_REQUESTS;
                let detail = format!("Grading is rate limited. Try again in {wait_seconds} seconds.");
                let mut response = (status, body(status, detail, Some(wait_seconds))).into_response();
                if let Ok(value) = HeaderValue::from_str(&wait_seconds.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            ApiError::NotReady => {
                let status = StatusCode::SERVICE_UNAVAILABLE;
                let detail = "The challenge environment is still starting up.".to_string();
                (status, body(status, detail, None)).into_response()
            }
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Internal server error");
                let status = StatusCode::INTERNAL_SERVER_ERROR;
                (status, body(status, message, None)).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_sets_retry_after() {
        let response = ApiError::RateLimited { wait_seconds: 17 }.into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "17");
    }

    #[test]
    fn not_ready_is_503() {
        assert_eq!(ApiError::NotReady.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
