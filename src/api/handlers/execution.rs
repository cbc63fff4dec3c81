use crate::api::dto::execution::{
    ExecutionResponse, ExecutionsListResponse, HistoryEntryResponse, HistoryResponse,
    ListExecutionsQuery, ResumeExecutionRequest, StartExecutionRequest,
};
use crate::api::routes::AppState;
use crate::error::Result;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};

const DEFAULT_INVOCATION_SOURCE: &str = "api";

pub async fn start_execution(
    State(state): State<AppState>,
    Json(req): Json<StartExecutionRequest>,
) -> Result<(StatusCode, Json<ExecutionResponse>)> {
    let source = req
        .invocation_source
        .as_deref()
        .unwrap_or(DEFAULT_INVOCATION_SOURCE);

    let execution = state
        .coordinator
        .start_execution(&req.plan_id, req.mode, source)
        .await?;
    Ok((StatusCode::CREATED, Json(ExecutionResponse::from(execution))))
}

pub async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<ExecutionsListResponse>> {
    let executions = state.coordinator.list_executions(query.status).await?;
    let response = ExecutionsListResponse {
        data: executions
            .into_iter()
            .map(ExecutionResponse::from)
            .collect(),
    };
    Ok(Json(response))
}

pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionResponse>> {
    let execution = state.coordinator.get_execution(&id).await?;
    Ok(Json(ExecutionResponse::from(execution)))
}

pub async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HistoryResponse>> {
    let records = state.coordinator.execution_history(&id).await?;
    Ok(Json(HistoryResponse {
        execution_id: id,
        data: records.into_iter().map(HistoryEntryResponse::from).collect(),
    }))
}

pub async fn resume_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResumeExecutionRequest>,
) -> Result<Json<ExecutionResponse>> {
    let execution = state
        .coordinator
        .resume_execution(&id, &req.resume_handle)
        .await?;
    Ok(Json(ExecutionResponse::from(execution)))
}

pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionResponse>> {
    let execution = state.coordinator.cancel_execution(&id).await?;
    Ok(Json(ExecutionResponse::from(execution)))
}
