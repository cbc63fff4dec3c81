use crate::models::{AdmissionDenial, ExecutionStatus};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Recovery plan not found: {0}")]
    PlanNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Admission denied: {0}")]
    AdmissionDenied(AdmissionDenial),

    #[error("Invalid resume handle for execution {0}")]
    InvalidResumeHandle(String),

    #[error("Invalid server: {0}")]
    InvalidServer(String),

    #[error("Recovery service error: {0}")]
    Service(String),

    #[error("Execution {id} already finished as {status:?}")]
    ExecutionTerminal { id: String, status: ExecutionStatus },

    #[error("Execution {0} was modified concurrently")]
    ConcurrentModification(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Database(_) | AppError::Serialization(_) | AppError::Io(_) => {
                tracing::error!("{}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::PlanNotFound(_) | AppError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
            AppError::AdmissionDenied(_)
            | AppError::InvalidResumeHandle(_)
            | AppError::ExecutionTerminal { .. }
            | AppError::ConcurrentModification(_)
            | AppError::InvalidTransition(_) => StatusCode::CONFLICT,
            AppError::InvalidServer(_) => StatusCode::BAD_REQUEST,
            AppError::Service(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let body = match self {
            AppError::AdmissionDenied(denial) => json!({
                "error": format!("Admission denied: {}", denial.message),
                "reason": denial.reason,
                "limit": denial.limit,
                "current": denial.current,
                "conflicts": denial.conflicts,
            }),
            other => json!({
                "error": other.to_string()
            }),
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
