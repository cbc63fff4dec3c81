use serde::{Deserialize, Serialize};
use std::fmt;

/// Account-level usage as reported by the recovery service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CapacityReport {
    pub replicating_server_count: u64,
    #[serde(default)]
    pub active_jobs: Vec<ActiveJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveJob {
    pub job_id: String,
    pub server_count: u64,
}

/// Derived at admission time from a [`CapacityReport`] and the proposed
/// wave. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapacitySnapshot {
    pub replicating_server_count: u64,
    pub concurrent_job_count: u64,
    pub per_job_server_count: u64,
    pub total_servers_across_active_jobs: u64,
}

impl CapacitySnapshot {
    pub fn derive(report: &CapacityReport, proposed_jobs: &[Vec<String>]) -> Self {
        Self {
            replicating_server_count: report.replicating_server_count,
            concurrent_job_count: report.active_jobs.len() as u64,
            per_job_server_count: proposed_jobs
                .iter()
                .map(|servers| servers.len() as u64)
                .max()
                .unwrap_or(0),
            total_servers_across_active_jobs: report
                .active_jobs
                .iter()
                .map(|job| job.server_count)
                .sum(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, sqlx::FromRow)]
pub struct ServerClaim {
    pub server_id: String,
    pub execution_id: String,
    pub claimed_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    ServerConflict,
    ReplicatingServers,
    ServersPerJob,
    ConcurrentJobs,
    TotalServersInActiveJobs,
    InvalidPlan,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConflict {
    pub server_id: String,
    pub blocking_execution_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdmissionDenial {
    pub reason: DenialReason,
    pub message: String,
    pub limit: Option<u64>,
    pub current: Option<u64>,
    pub conflicts: Vec<ServerConflict>,
}

impl AdmissionDenial {
    pub fn quota(reason: DenialReason, limit: u64, current: u64, message: String) -> Self {
        Self {
            reason,
            message,
            limit: Some(limit),
            current: Some(current),
            conflicts: Vec::new(),
        }
    }

    pub fn conflict(conflicts: Vec<ServerConflict>) -> Self {
        let servers = conflicts
            .iter()
            .map(|c| format!("{} (held by {})", c.server_id, c.blocking_execution_id))
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            reason: DenialReason::ServerConflict,
            message: format!("servers already claimed by active executions: {}", servers),
            limit: None,
            current: None,
            conflicts,
        }
    }
}

impl fmt::Display for AdmissionDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.reason, self.message)?;
        if let (Some(limit), Some(current)) = (self.limit, self.current) {
            write!(f, " (limit {}, current {})", limit, current)?;
        }
        Ok(())
    }
}
