use crate::models::plan::{PlanWave, RecoveryPlan};
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[repr(i32)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Drill = 0,
    Recovery = 1,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[repr(i32)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending = 0,
    Launching = 1,
    Polling = 2,
    Paused = 3,
    Completed = 4,
    Partial = 5,
    Failed = 6,
    Cancelled = 7,
}

impl ExecutionStatus {
    pub const TERMINAL: [ExecutionStatus; 4] = [
        ExecutionStatus::Completed,
        ExecutionStatus::Partial,
        ExecutionStatus::Failed,
        ExecutionStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Edges of the execution state machine. `Launching -> Launching` is the
    /// retry of a wave whose job start hit a transient error.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;

        if self.is_terminal() {
            return false;
        }
        if next == Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Launching)
                | (Pending, Failed)
                | (Launching, Launching)
                | (Launching, Polling)
                | (Launching, Failed)
                | (Polling, Launching)
                | (Polling, Paused)
                | (Polling, Completed)
                | (Polling, Partial)
                | (Polling, Failed)
                | (Paused, Launching)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaveStatus {
    Pending,
    Launching,
    Polling,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl WaveStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WaveStatus::Completed | WaveStatus::Partial | WaveStatus::Failed | WaveStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LaunchStatus {
    Pending,
    Queued,
    Snapshot,
    Conversion,
    Launch,
    Launched,
    Failed,
}

impl LaunchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, LaunchStatus::Launched | LaunchStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerExecution {
    pub server_id: String,
    pub protection_group_id: String,
    pub external_job_id: Option<String>,
    pub launch_status: LaunchStatus,
}

impl ServerExecution {
    fn new(server_id: &str, protection_group_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            protection_group_id: protection_group_id.to_string(),
            external_job_id: None,
            launch_status: LaunchStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaveExecution {
    pub wave_number: u32,
    pub wave_name: String,
    pub protection_group_ids: Vec<String>,
    pub pause_before_wave: bool,
    pub status: WaveStatus,
    pub servers: Vec<ServerExecution>,
    pub job_ids: Vec<String>,
    #[serde(default)]
    pub launch_attempts: u32,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
}

impl WaveExecution {
    fn from_plan(wave: &PlanWave) -> Self {
        let servers = wave
            .protection_groups
            .iter()
            .flat_map(|group| {
                group
                    .server_ids
                    .iter()
                    .map(|server_id| ServerExecution::new(server_id, &group.id))
            })
            .collect();

        Self {
            wave_number: wave.wave_number,
            wave_name: wave.name.clone(),
            protection_group_ids: wave.protection_groups.iter().map(|g| g.id.clone()).collect(),
            pause_before_wave: wave.pause_before_wave,
            status: WaveStatus::Pending,
            servers,
            job_ids: Vec::new(),
            launch_attempts: 0,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.server_id.clone()).collect()
    }

    /// Server ids grouped per protection group, i.e. one entry per job this
    /// wave issues.
    pub fn jobs(&self) -> Vec<(String, Vec<String>)> {
        self.protection_group_ids
            .iter()
            .map(|group_id| {
                let servers: Vec<String> = self
                    .servers
                    .iter()
                    .filter(|s| &s.protection_group_id == group_id)
                    .map(|s| s.server_id.clone())
                    .collect();
                (group_id.clone(), servers)
            })
            .filter(|(_, servers)| !servers.is_empty())
            .collect()
    }

    pub fn is_settled(&self) -> bool {
        !self.servers.is_empty() && self.servers.iter().all(|s| s.launch_status.is_terminal())
    }

    /// Outcome of a settled wave.
    pub fn outcome(&self) -> WaveStatus {
        let launched = self
            .servers
            .iter()
            .filter(|s| s.launch_status == LaunchStatus::Launched)
            .count();
        if launched == self.servers.len() {
            WaveStatus::Completed
        } else if launched == 0 {
            WaveStatus::Failed
        } else {
            WaveStatus::Partial
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub recovery_plan_id: String,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub current_wave_index: u32,
    pub waves: Vec<WaveExecution>,
    pub resume_handle: Option<String>,
    pub resume_handle_expires_at: Option<i64>,
    pub invocation_source: String,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Execution {
    pub fn new(id: String, plan: &RecoveryPlan, mode: ExecutionMode, invocation_source: &str) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id,
            recovery_plan_id: plan.id.clone(),
            mode,
            status: ExecutionStatus::Pending,
            current_wave_index: 0,
            waves: plan.waves.iter().map(WaveExecution::from_plan).collect(),
            resume_handle: None,
            resume_handle_expires_at: None,
            invocation_source: invocation_source.to_string(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_drill(&self) -> bool {
        self.mode == ExecutionMode::Drill
    }

    pub fn active_wave(&self) -> Option<&WaveExecution> {
        self.waves.get(self.current_wave_index as usize)
    }

    pub fn active_wave_mut(&mut self) -> Option<&mut WaveExecution> {
        self.waves.get_mut(self.current_wave_index as usize)
    }

    pub fn next_wave(&self) -> Option<&WaveExecution> {
        self.waves.get(self.current_wave_index as usize + 1)
    }

    pub fn transition_to(&mut self, next: ExecutionStatus) -> crate::error::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(crate::error::AppError::InvalidTransition(format!(
                "{:?} -> {:?} for execution {}",
                self.status, next, self.id
            )));
        }
        self.status = next;
        self.updated_at = Utc::now().timestamp_millis();
        Ok(())
    }

    /// Moves to the next wave. The index never goes backwards.
    pub fn advance_wave(&mut self) -> crate::error::Result<()> {
        if self.next_wave().is_none() {
            return Err(crate::error::AppError::InvalidTransition(format!(
                "execution {} has no wave after {}",
                self.id, self.current_wave_index
            )));
        }
        self.current_wave_index += 1;
        Ok(())
    }

    pub fn accepts_resume_handle(&self, handle: &str, now: i64) -> bool {
        if self.status != ExecutionStatus::Paused {
            return false;
        }
        let Some(expected) = self.resume_handle.as_deref() else {
            return false;
        };
        if expected != handle {
            return false;
        }
        self.resume_handle_expires_at
            .is_none_or(|expires_at| now < expires_at)
    }

    pub fn clear_resume_handle(&mut self) {
        self.resume_handle = None;
        self.resume_handle_expires_at = None;
    }

    /// Servers that already had a job issued for them.
    pub fn launched_server_ids(&self) -> Vec<String> {
        self.waves
            .iter()
            .flat_map(|w| w.servers.iter())
            .filter(|s| s.external_job_id.is_some())
            .map(|s| s.server_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Created,
    WaveLaunching,
    JobStarted,
    ServiceError,
    ServerStatusChanged,
    PollLimitExceeded,
    WaveSettled,
    Paused,
    Resumed,
    AdmissionDenied,
    Finished,
    Cancelled,
}

impl HistoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryKind::Created => "created",
            HistoryKind::WaveLaunching => "wave_launching",
            HistoryKind::JobStarted => "job_started",
            HistoryKind::ServiceError => "service_error",
            HistoryKind::ServerStatusChanged => "server_status_changed",
            HistoryKind::PollLimitExceeded => "poll_limit_exceeded",
            HistoryKind::WaveSettled => "wave_settled",
            HistoryKind::Paused => "paused",
            HistoryKind::Resumed => "resumed",
            HistoryKind::AdmissionDenied => "admission_denied",
            HistoryKind::Finished => "finished",
            HistoryKind::Cancelled => "cancelled",
        }
    }
}

/// A row of the execution status history as stored.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HistoryRecord {
    pub id: i64,
    pub execution_id: String,
    pub wave_number: Option<i64>,
    pub server_id: Option<String>,
    pub kind: String,
    pub message: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub wave_number: Option<u32>,
    pub server_id: Option<String>,
    pub kind: HistoryKind,
    pub message: String,
    pub created_at: i64,
}

impl HistoryEntry {
    pub fn new(kind: HistoryKind, message: impl Into<String>) -> Self {
        Self {
            wave_number: None,
            server_id: None,
            kind,
            message: message.into(),
            created_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn wave(mut self, wave_number: u32) -> Self {
        self.wave_number = Some(wave_number);
        self
    }

    pub fn server(mut self, server_id: &str) -> Self {
        self.server_id = Some(server_id.to_string());
        self
    }
}
