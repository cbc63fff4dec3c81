use crate::error::{AppError, Result};
use crate::models::{AdmissionDenial, CapacitySnapshot, DenialReason, ServerClaim, ServerConflict};
use crate::recovery::{SharedRecoveryService, bounded};
use crate::repository::ClaimRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const MAX_REPLICATING_SERVERS: u64 = 300;
pub const MAX_SERVERS_PER_JOB: u64 = 100;
pub const MAX_CONCURRENT_JOBS: u64 = 20;
pub const MAX_SERVERS_IN_ACTIVE_JOBS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admitted,
    Denied(AdmissionDenial),
}

/// Decides whether a wave issuing `proposed_jobs` (one server list per job)
/// may start. Conflicts are checked first and block the whole wave; quota
/// limits follow in a fixed order so the reported reason is stable.
pub fn evaluate(
    proposed_jobs: &[Vec<String>],
    snapshot: &CapacitySnapshot,
    claims: &[ServerClaim],
) -> AdmissionDecision {
    if !claims.is_empty() {
        let conflicts = claims
            .iter()
            .map(|claim| ServerConflict {
                server_id: claim.server_id.clone(),
                blocking_execution_id: claim.execution_id.clone(),
            })
            .collect();
        return AdmissionDecision::Denied(AdmissionDenial::conflict(conflicts));
    }

    if snapshot.replicating_server_count > MAX_REPLICATING_SERVERS {
        return AdmissionDecision::Denied(AdmissionDenial::quota(
            DenialReason::ReplicatingServers,
            MAX_REPLICATING_SERVERS,
            snapshot.replicating_server_count,
            "too many replicating servers in this account and region".to_string(),
        ));
    }

    if snapshot.per_job_server_count > MAX_SERVERS_PER_JOB {
        return AdmissionDecision::Denied(AdmissionDenial::quota(
            DenialReason::ServersPerJob,
            MAX_SERVERS_PER_JOB,
            snapshot.per_job_server_count,
            "a protection group exceeds the servers allowed in one job".to_string(),
        ));
    }

    let proposed_job_count = proposed_jobs.len() as u64;
    let jobs_after = snapshot.concurrent_job_count + proposed_job_count;
    if jobs_after > MAX_CONCURRENT_JOBS {
        return AdmissionDecision::Denied(AdmissionDenial::quota(
            DenialReason::ConcurrentJobs,
            MAX_CONCURRENT_JOBS,
            snapshot.concurrent_job_count,
            format!(
                "starting {} job(s) would exceed the concurrent job limit",
                proposed_job_count
            ),
        ));
    }

    let proposed_servers: u64 = proposed_jobs.iter().map(|job| job.len() as u64).sum();
    let servers_after = snapshot.total_servers_across_active_jobs + proposed_servers;
    if servers_after > MAX_SERVERS_IN_ACTIVE_JOBS {
        return AdmissionDecision::Denied(AdmissionDenial::quota(
            DenialReason::TotalServersInActiveJobs,
            MAX_SERVERS_IN_ACTIVE_JOBS,
            snapshot.total_servers_across_active_jobs,
            format!(
                "adding {} server(s) would exceed the servers allowed across active jobs",
                proposed_servers
            ),
        ));
    }

    AdmissionDecision::Admitted
}

/// Admission control backed by the conflict index and live capacity from
/// the recovery service.
#[derive(Clone)]
pub struct AdmissionGuard {
    claims: ClaimRepository,
    recovery: SharedRecoveryService,
    call_timeout: Duration,
    lock: Arc<Mutex<()>>,
}

impl AdmissionGuard {
    pub fn new(claims: ClaimRepository, recovery: SharedRecoveryService, call_timeout: Duration) -> Self {
        Self {
            claims,
            recovery,
            call_timeout,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Admits the wave for `execution_id` and claims its servers, or denies it
    /// without claiming anything. Admissions are serialized in-process and
    /// the claim itself is a conditional write, so two callers contending for
    /// a server cannot both get through.
    pub async fn admit(&self, execution_id: &str, proposed_jobs: &[Vec<String>]) -> Result<()> {
        let _admission = self.lock.lock().await;
        let server_ids: Vec<String> = proposed_jobs.iter().flatten().cloned().collect();

        let claims = self.claims.find_conflicts(execution_id, &server_ids).await?;
        let snapshot = if claims.is_empty() {
            let report = bounded(self.call_timeout, self.recovery.capacity())
                .await
                .map_err(|e| AppError::Service(format!("capacity query failed: {}", e)))?;
            CapacitySnapshot::derive(&report, proposed_jobs)
        } else {
            CapacitySnapshot::default()
        };

        if let AdmissionDecision::Denied(denial) = evaluate(proposed_jobs, &snapshot, &claims) {
            tracing::warn!("Admission denied for execution {}: {}", execution_id, denial);
            return Err(AppError::AdmissionDenied(denial));
        }

        let lost = self.claims.claim(execution_id, &server_ids).await?;
        if !lost.is_empty() {
            let denial = match evaluate(proposed_jobs, &snapshot, &lost) {
                AdmissionDecision::Denied(denial) => denial,
                AdmissionDecision::Admitted => AdmissionDenial::conflict(Vec::new()),
            };
            tracing::warn!("Admission lost claim race for execution {}: {}", execution_id, denial);
            return Err(AppError::AdmissionDenied(denial));
        }

        tracing::debug!(
            "Admitted {} server(s) in {} job(s) for execution {}",
            server_ids.len(),
            proposed_jobs.len(),
            execution_id
        );
        Ok(())
    }

    pub async fn release_servers(&self, execution_id: &str, server_ids: &[String]) -> Result<()> {
        self.claims.release_servers(execution_id, server_ids).await
    }

    pub async fn release_execution(&self, execution_id: &str) -> Result<()> {
        self.claims.release_execution(execution_id).await
    }
}
