use std::collections::BTreeMap;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::{routing::get, Json, Router};

use crate::api::errors::ApiError;
use crate::core::config::PartKind;
use crate::core::state::AppState;
use crate::schemas::grading::{
    GradeResponse, ResultsView, RunStatusResponse, ServiceSnapshot, TaskEntry, TasksResponse,
};
use crate::services::registry::PHASES_COMPLETED;
use crate::tasks::grading::{results_view, SubmitOutcome};

pub(crate) fn challenge_router() -> Router<AppState> {
    Router::new()
        .route("/tasks", get(list_tasks))
        .route("/grade", get(grade_without_inputs).post(grade))
        .route("/grade/status", get(grade_status))
        .route("/update", get(update))
}

pub(crate) fn info_router() -> Router<AppState> {
    Router::new().route("/services", get(services))
}

async fn list_tasks(State(state): State<AppState>) -> Result<Json<TasksResponse>, ApiError> {
    let registry = state.registry();
    let current_phase = registry.current_phase().await;

    // Only the active phase is visible until every phase is done.
    let visible: Option<&[String]> = match (registry.phase_plan(), current_phase.as_deref()) {
        (Some(plan), Some(phase)) if phase != PHASES_COMPLETED => Some(plan.members(phase)),
        _ => None,
    };

    let mut parts: BTreeMap<String, Vec<TaskEntry>> = BTreeMap::new();
    for part in registry.parts().iter() {
        if visible.is_some_and(|labels| !labels.contains(&part.label)) {
            continue;
        }
        let solved = registry
            .is_solved(&part.label)
            .await
            .map_err(|err| ApiError::internal(err, "Failed to read question state"))?;
        let opts = match &part.kind {
            PartKind::MultipleChoice { opts } => Some(opts.clone()),
            _ => None,
        };
        parts.entry(part.kind.as_str().to_string()).or_default().push(TaskEntry {
            label: part.label.clone(),
            text: part.text.clone(),
            opts,
            solved,
        });
    }

    Ok(Json(TasksResponse {
        challenge: state.settings().challenge().name.clone(),
        current_phase,
        parts,
    }))
}

async fn grade(
    State(state): State<AppState>,
    payload: Result<Json<BTreeMap<String, String>>, JsonRejection>,
) -> Result<Json<GradeResponse>, ApiError> {
    let Json(inputs) = payload.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    submit(&state, inputs).await
}

async fn grade_without_inputs(State(state): State<AppState>) -> Result<Json<GradeResponse>, ApiError> {
    submit(&state, BTreeMap::new()).await
}

async fn submit(
    state: &AppState,
    inputs: BTreeMap<String, String>,
) -> Result<Json<GradeResponse>, ApiError> {
    let grading = state.settings().grading();
    if !grading.enabled || !grading.manual_enabled() {
        return Err(ApiError::NotFound("Manual grading is not enabled for this challenge".to_string()));
    }
    if !state.flags().is_ready() {
        return Err(ApiError::NotReady);
    }

    match state.manual().submit(inputs).await {
        SubmitOutcome::Started(run) => Ok(Json(GradeResponse { state: "started", run })),
        SubmitOutcome::InFlight(run) => Ok(Json(GradeResponse { state: "running", run })),
        SubmitOutcome::RateLimited { wait_seconds } => Err(ApiError::RateLimited { wait_seconds }),
    }
}

async fn grade_status(State(state): State<AppState>) -> Json<RunStatusResponse> {
    Json(RunStatusResponse { run: state.manual().status().await })
}

async fn update(State(state): State<AppState>) -> Result<Json<ResultsView>, ApiError> {
    let view = results_view(
        state.registry(),
        state.board(),
        state.tokens(),
        state.settings().grading(),
        state.flags().fatal(),
    )
    .await
    .map_err(|err| ApiError::internal(err, "Failed to build grading results"))?;

    Ok(Json(view))
}

async fn services(State(state): State<AppState>) -> Json<ServiceSnapshot> {
    Json(state.services().snapshot().await)
}
