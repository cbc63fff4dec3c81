//! Contract with the external recovery service that actually launches
//! recovery instances.

#[cfg(test)]
pub mod fake;
mod http_client;

pub use http_client::HttpRecoveryService;

use crate::models::{CapacityReport, LaunchStatus};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecoveryServiceError {
    #[error("recovery service error: {0}")]
    Service(String),

    #[error("invalid server: {0}")]
    InvalidServer(String),

    #[error("recovery service call timed out after {0:?}")]
    Timeout(Duration),
}

impl RecoveryServiceError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RecoveryServiceError::InvalidServer(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartJobRequest {
    pub server_ids: Vec<String>,
    pub drill: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobEventKind {
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "snapshot-start")]
    SnapshotStart,
    #[serde(rename = "snapshot-end")]
    SnapshotEnd,
    #[serde(rename = "conversion-start")]
    ConversionStart,
    #[serde(rename = "conversion-end")]
    ConversionEnd,
    #[serde(rename = "launch-start")]
    LaunchStart,
    #[serde(rename = "launch-end")]
    LaunchEnd,
    #[serde(rename = "cleanup-start")]
    CleanupStart,
    #[serde(rename = "cleanup-end")]
    CleanupEnd,
    #[serde(rename = "failed")]
    Failed,
}

impl JobEventKind {
    /// Launch status implied by an event. Cleanup events carry no status.
    pub fn launch_status(self) -> Option<LaunchStatus> {
        match self {
            JobEventKind::Queued => Some(LaunchStatus::Queued),
            JobEventKind::SnapshotStart | JobEventKind::SnapshotEnd => Some(LaunchStatus::Snapshot),
            JobEventKind::ConversionStart | JobEventKind::ConversionEnd => {
                Some(LaunchStatus::Conversion)
            }
            JobEventKind::LaunchStart => Some(LaunchStatus::Launch),
            JobEventKind::LaunchEnd => Some(LaunchStatus::Launched),
            JobEventKind::Failed => Some(LaunchStatus::Failed),
            JobEventKind::CleanupStart | JobEventKind::CleanupEnd => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEvent {
    pub server_id: String,
    pub event: JobEventKind,
    pub timestamp: i64,
}

/// Status implied by the most recent status-bearing event for `server_id`.
/// Ties on timestamp go to the later entry in the log.
pub fn latest_launch_status(events: &[JobEvent], server_id: &str) -> Option<LaunchStatus> {
    events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.server_id == server_id)
        .filter_map(|(i, e)| e.event.launch_status().map(|status| (e.timestamp, i, status)))
        .max_by_key(|(timestamp, i, _)| (*timestamp, *i))
        .map(|(_, _, status)| status)
}

#[async_trait::async_trait]
pub trait RecoveryService: Send + Sync {
    async fn start_job(&self, request: &StartJobRequest) -> Result<String, RecoveryServiceError>;

    async fn describe_job(&self, job_id: &str) -> Result<Vec<JobEvent>, RecoveryServiceError>;

    async fn terminate_instances(&self, server_ids: &[String]) -> Result<(), RecoveryServiceError>;

    async fn capacity(&self) -> Result<CapacityReport, RecoveryServiceError>;
}

pub type SharedRecoveryService = Arc<dyn RecoveryService>;

/// Runs an external call under `limit`; running out of time is a transient
/// failure like any other service error.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, RecoveryServiceError>
where
    F: Future<Output = Result<T, RecoveryServiceError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RecoveryServiceError::Timeout(limit)),
    }
}
