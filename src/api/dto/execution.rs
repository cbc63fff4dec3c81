use crate::models::{
    Execution, ExecutionMode, ExecutionStatus, HistoryRecord, LaunchStatus, ServerExecution,
    WaveExecution, WaveStatus,
};
use chrono::DateTime;
use serde::{Deserialize, Serialize};

fn rfc3339(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
pub struct StartExecutionRequest {
    pub plan_id: String,
    pub mode: ExecutionMode,
    pub invocation_source: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResumeExecutionRequest {
    pub resume_handle: String,
}

#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    pub status: Option<ExecutionStatus>,
}

#[derive(Debug, Serialize)]
pub struct ServerResponse {
    pub server_id: String,
    pub protection_group_id: String,
    pub job_id: Option<String>,
    pub launch_status: LaunchStatus,
}

impl From<ServerExecution> for ServerResponse {
    fn from(server: ServerExecution) -> Self {
        Self {
            server_id: server.server_id,
            protection_group_id: server.protection_group_id,
            job_id: server.external_job_id,
            launch_status: server.launch_status,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WaveResponse {
    pub wave_number: u32,
    pub name: String,
    pub pause_before_wave: bool,
    pub status: WaveStatus,
    pub job_ids: Vec<String>,
    pub servers: Vec<ServerResponse>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
}

impl From<WaveExecution> for WaveResponse {
    fn from(wave: WaveExecution) -> Self {
        Self {
            wave_number: wave.wave_number,
            name: wave.wave_name,
            pause_before_wave: wave.pause_before_wave,
            status: wave.status,
            job_ids: wave.job_ids,
            servers: wave.servers.into_iter().map(ServerResponse::from).collect(),
            started_at: wave.started_at.map(rfc3339),
            ended_at: wave.ended_at.map(rfc3339),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExecutionResponse {
    pub id: String,
    pub plan_id: String,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub current_wave_index: u32,
    pub resume_handle: Option<String>,
    pub resume_handle_expires_at: Option<String>,
    pub invocation_source: String,
    pub waves: Vec<WaveResponse>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Execution> for ExecutionResponse {
    fn from(execution: Execution) -> Self {
        Self {
            id: execution.id,
            plan_id: execution.recovery_plan_id,
            mode: execution.mode,
            status: execution.status,
            current_wave_index: execution.current_wave_index,
            resume_handle: execution.resume_handle,
            resume_handle_expires_at: execution.resume_handle_expires_at.map(rfc3339),
            invocation_source: execution.invocation_source,
            waves: execution.waves.into_iter().map(WaveResponse::from).collect(),
            created_at: rfc3339(execution.created_at),
            updated_at: rfc3339(execution.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExecutionsListResponse {
    pub data: Vec<ExecutionResponse>,
}

#[derive(Debug, Serialize)]
pub struct HistoryEntryResponse {
    pub kind: String,
    pub wave_number: Option<i64>,
    pub server_id: Option<String>,
    pub message: String,
    pub created_at: String,
}

impl From<HistoryRecord> for HistoryEntryResponse {
    fn from(record: HistoryRecord) -> Self {
        Self {
            kind: record.kind,
            wave_number: record.wave_number,
            server_id: record.server_id,
            message: record.message,
            created_at: rfc3339(record.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub execution_id: String,
    pub data: Vec<HistoryEntryResponse>,
}
