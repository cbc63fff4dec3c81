use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{
    Execution, ExecutionMode, ExecutionStatus, HistoryEntry, HistoryKind, HistoryRecord,
    WaveExecution, WaveStatus,
};
use crate::recovery::{SharedRecoveryService, StartJobRequest, bounded};
use crate::repository::{ExecutionRepository, PlanRepository};
use crate::services::AdmissionGuard;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

const CANCEL_RETRY_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub call_timeout: Duration,
    pub max_launch_attempts: u32,
    /// How long a wave may be polled before its unfinished servers fail.
    pub poll_window: Duration,
    pub resume_handle_ttl: Duration,
}

impl From<&Config> for CoordinatorSettings {
    fn from(config: &Config) -> Self {
        Self {
            call_timeout: config.request_timeout(),
            max_launch_attempts: config.max_launch_attempts,
            poll_window: config.poll_window(),
            resume_handle_ttl: config.resume_handle_ttl(),
        }
    }
}

/// Per-execution mutex registry. Start, resume and poll of one execution run
/// one at a time; different executions never wait on each other.
#[derive(Clone, Default)]
struct ExecutionLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ExecutionLocks {
    async fn acquire(&self, execution_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(execution_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Every server in the wave has a job; the wave is being polled.
    Polling,
    /// Some job starts failed transiently; retried on a later poll tick.
    Retrying,
    /// The recovery service refused a server. The execution has failed.
    Rejected(String),
    /// Transient failures outlasted the launch attempt budget.
    Exhausted,
}

fn job_server_lists(wave: &WaveExecution) -> Vec<Vec<String>> {
    wave.jobs().into_iter().map(|(_, servers)| servers).collect()
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Clone)]
pub struct ExecutionCoordinator {
    exec_repo: ExecutionRepository,
    plan_repo: PlanRepository,
    guard: AdmissionGuard,
    recovery: SharedRecoveryService,
    settings: CoordinatorSettings,
    locks: ExecutionLocks,
}

impl ExecutionCoordinator {
    pub fn new(
        exec_repo: ExecutionRepository,
        plan_repo: PlanRepository,
        guard: AdmissionGuard,
        recovery: SharedRecoveryService,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            exec_repo,
            plan_repo,
            guard,
            recovery,
            settings,
            locks: ExecutionLocks::default(),
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub(crate) async fn lock(&self, execution_id: &str) -> OwnedMutexGuard<()> {
        self.locks.acquire(execution_id).await
    }

    pub async fn start_execution(
        &self,
        plan_id: &str,
        mode: ExecutionMode,
        invocation_source: &str,
    ) -> Result<Execution> {
        let plan = self.plan_repo.get(plan_id).await?;
        if let Err(denial) = plan.validate() {
            tracing::warn!("Refusing to start plan {}: {}", plan_id, denial);
            return Err(AppError::AdmissionDenied(denial));
        }

        let execution_id = uuid::Uuid::new_v4().to_string();
        let mut execution = Execution::new(execution_id.clone(), &plan, mode, invocation_source);
        let _lock = self.locks.acquire(&execution_id).await;

        let first_jobs = job_server_lists(&execution.waves[0]);
        self.guard.admit(&execution_id, &first_jobs).await?;

        let created = HistoryEntry::new(
            HistoryKind::Created,
            format!("{:?} of plan {} requested by {}", mode, plan.id, invocation_source),
        );
        if let Err(err) = self.exec_repo.create(&execution, &[created]).await {
            self.release_claims(&execution_id).await;
            return Err(err);
        }
        tracing::info!(
            "Execution {} created for plan {} ({:?}, {} waves)",
            execution_id,
            plan.id,
            mode,
            execution.waves.len()
        );

        let mut history = Vec::new();
        let outcome = self.launch_active_wave(&mut execution, &mut history).await?;
        if !self.persist_or_reconcile(&mut execution, &history).await? {
            return self.exec_repo.get(&execution_id).await;
        }

        match outcome {
            LaunchOutcome::Rejected(message) => Err(AppError::InvalidServer(message)),
            _ => Ok(execution),
        }
    }

    pub async fn resume_execution(&self, execution_id: &str, resume_handle: &str) -> Result<Execution> {
        let _lock = self.locks.acquire(execution_id).await;
        let mut execution = self.exec_repo.get(execution_id).await?;

        if !execution.accepts_resume_handle(resume_handle, now_millis()) {
            tracing::warn!("Rejected resume handle for execution {}", execution_id);
            return Err(AppError::InvalidResumeHandle(execution_id.to_string()));
        }
        let Some(next) = execution.next_wave() else {
            return Err(AppError::InvalidResumeHandle(execution_id.to_string()));
        };
        let next_jobs = job_server_lists(next);
        let next_servers = next.server_ids();

        // Capacity may have moved while paused. A denial leaves the handle
        // usable for a later attempt.
        self.guard.admit(execution_id, &next_jobs).await?;

        execution.clear_resume_handle();
        execution.advance_wave()?;
        execution.transition_to(ExecutionStatus::Launching)?;
        let resumed = HistoryEntry::new(HistoryKind::Resumed, "resumed at pause checkpoint")
            .wave(execution.current_wave_index);
        match self.exec_repo.save(&mut execution, &[resumed]).await {
            Ok(()) => {}
            Err(AppError::ConcurrentModification(_)) => {
                self.release_servers(execution_id, &next_servers).await;
                return Err(AppError::InvalidResumeHandle(execution_id.to_string()));
            }
            Err(err) => {
                self.release_servers(execution_id, &next_servers).await;
                return Err(err);
            }
        }
        tracing::info!(
            "Execution {} resumed into wave {}",
            execution_id,
            execution.current_wave_index
        );

        let mut history = Vec::new();
        let outcome = self.launch_active_wave(&mut execution, &mut history).await?;
        if !self.persist_or_reconcile(&mut execution, &history).await? {
            return self.exec_repo.get(execution_id).await;
        }

        match outcome {
            LaunchOutcome::Rejected(message) => Err(AppError::InvalidServer(message)),
            _ => Ok(execution),
        }
    }

    /// Cancels a non-terminal execution. Does not wait for an in-flight poll:
    /// the poll loses its optimistic-lock check and its result is dropped.
    /// A cancel that loses a version race itself re-reads and retries until
    /// the record is cancelled or has finished some other way.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<Execution> {
        loop {
            let mut execution = self.exec_repo.get(execution_id).await?;
            if execution.status == ExecutionStatus::Cancelled {
                return Ok(execution);
            }
            if execution.status.is_terminal() {
                return Err(AppError::ExecutionTerminal {
                    id: execution.id,
                    status: execution.status,
                });
            }

            let previous = execution.status;
            execution.transition_to(ExecutionStatus::Cancelled)?;
            execution.clear_resume_handle();
            if let Some(wave) = execution.active_wave_mut() {
                if !wave.status.is_terminal() && wave.status != WaveStatus::Pending {
                    wave.status = WaveStatus::Cancelled;
                    wave.ended_at = Some(now_millis());
                }
            }

            let cancelled = HistoryEntry::new(
                HistoryKind::Cancelled,
                format!("cancelled while {:?}", previous),
            );
            match self.exec_repo.save(&mut execution, &[cancelled]).await {
                Ok(()) => {
                    tracing::info!("Execution {} cancelled (was {:?})", execution_id, previous);
                    self.release_claims(execution_id).await;
                    if execution.is_drill() {
                        self.terminate_quietly(execution_id, &execution.launched_server_ids())
                            .await;
                    }
                    return Ok(execution);
                }
                Err(AppError::ConcurrentModification(_)) => {
                    tracing::debug!("Cancel of {} raced with an update, retrying", execution_id);
                    tokio::time::sleep(CANCEL_RETRY_BACKOFF).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Execution> {
        self.exec_repo.get(execution_id).await
    }

    pub async fn list_executions(&self, status: Option<ExecutionStatus>) -> Result<Vec<Execution>> {
        self.exec_repo.list(status).await
    }

    pub async fn execution_history(&self, execution_id: &str) -> Result<Vec<HistoryRecord>> {
        self.exec_repo.get(execution_id).await?;
        self.exec_repo.history(execution_id).await
    }

    /// Issues start-job calls for every protection group of the active wave
    /// that has no job yet. Mutates `execution` in memory only.
    pub(crate) async fn launch_active_wave(
        &self,
        execution: &mut Execution,
        history: &mut Vec<HistoryEntry>,
    ) -> Result<LaunchOutcome> {
        execution.transition_to(ExecutionStatus::Launching)?;
        let drill = execution.is_drill();
        let execution_id = execution.id.clone();
        let Some(wave) = execution.active_wave_mut() else {
            return Err(AppError::InvalidTransition(format!(
                "execution {} has no active wave",
                execution_id
            )));
        };

        let wave_number = wave.wave_number;
        if wave.status == WaveStatus::Pending {
            wave.started_at = Some(now_millis());
            history.push(
                HistoryEntry::new(
                    HistoryKind::WaveLaunching,
                    format!("launching wave '{}'", wave.wave_name),
                )
                .wave(wave_number),
            );
        }
        wave.status = WaveStatus::Launching;
        wave.launch_attempts += 1;
        let attempts = wave.launch_attempts;

        let mut transient = false;
        let mut rejected = None;
        for (group_id, _) in wave.jobs() {
            let pending: Vec<String> = wave
                .servers
                .iter()
                .filter(|s| s.protection_group_id == group_id && s.external_job_id.is_none())
                .map(|s| s.server_id.clone())
                .collect();
            if pending.is_empty() {
                continue;
            }

            let request = StartJobRequest {
                server_ids: pending,
                drill,
            };
            match bounded(self.settings.call_timeout, self.recovery.start_job(&request)).await {
                Ok(job_id) => {
                    for server in wave
                        .servers
                        .iter_mut()
                        .filter(|s| request.server_ids.contains(&s.server_id))
                    {
                        server.external_job_id = Some(job_id.clone());
                    }
                    history.push(
                        HistoryEntry::new(
                            HistoryKind::JobStarted,
                            format!(
                                "job {} started for group {} ({} servers)",
                                job_id,
                                group_id,
                                request.server_ids.len()
                            ),
                        )
                        .wave(wave_number),
                    );
                    wave.job_ids.push(job_id);
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(
                        "Start job for group {} of execution {} failed, will retry: {}",
                        group_id,
                        execution_id,
                        err
                    );
                    history.push(
                        HistoryEntry::new(
                            HistoryKind::ServiceError,
                            format!("start job for group {}: {}", group_id, err),
                        )
                        .wave(wave_number),
                    );
                    transient = true;
                }
                Err(err) => {
                    rejected = Some(format!("group {}: {}", group_id, err));
                    break;
                }
            }
        }

        if let Some(message) = rejected {
            wave.status = WaveStatus::Failed;
            wave.ended_at = Some(now_millis());
            self.finish(
                execution,
                ExecutionStatus::Failed,
                history,
                format!("recovery service rejected wave {}: {}", wave_number, message),
            )?;
            return Ok(LaunchOutcome::Rejected(message));
        }

        if !transient {
            wave.status = WaveStatus::Polling;
            execution.transition_to(ExecutionStatus::Polling)?;
            tracing::info!("Execution {} polling wave {}", execution_id, wave_number);
            return Ok(LaunchOutcome::Polling);
        }

        if attempts >= self.settings.max_launch_attempts {
            wave.status = WaveStatus::Failed;
            wave.ended_at = Some(now_millis());
            self.finish(
                execution,
                ExecutionStatus::Failed,
                history,
                format!("wave {} could not be launched after {} attempts", wave_number, attempts),
            )?;
            return Ok(LaunchOutcome::Exhausted);
        }

        Ok(LaunchOutcome::Retrying)
    }

    /// Applies the outcome of a wave whose servers are all terminal: stop on
    /// partial or failed, pause before a checkpoint wave, otherwise admit and
    /// launch the next wave or complete the execution.
    pub(crate) async fn settle_active_wave(
        &self,
        execution: &mut Execution,
        history: &mut Vec<HistoryEntry>,
    ) -> Result<()> {
        let Some(wave) = execution.active_wave_mut() else {
            return Ok(());
        };
        let outcome = wave.outcome();
        let wave_number = wave.wave_number;
        wave.status = outcome;
        wave.ended_at = Some(now_millis());
        history.push(
            HistoryEntry::new(HistoryKind::WaveSettled, format!("wave settled as {:?}", outcome))
                .wave(wave_number),
        );

        match outcome {
            WaveStatus::Partial => self.finish(
                execution,
                ExecutionStatus::Partial,
                history,
                format!("wave {} launched only some of its servers", wave_number),
            ),
            WaveStatus::Completed => self.continue_after(execution, history).await,
            _ => self.finish(
                execution,
                ExecutionStatus::Failed,
                history,
                format!("no server in wave {} launched", wave_number),
            ),
        }
    }

    async fn continue_after(
        &self,
        execution: &mut Execution,
        history: &mut Vec<HistoryEntry>,
    ) -> Result<()> {
        let Some(next) = execution.next_wave() else {
            return self.finish(
                execution,
                ExecutionStatus::Completed,
                history,
                "all waves launched".to_string(),
            );
        };
        let next_number = next.wave_number;

        if next.pause_before_wave {
            let ttl = i64::try_from(self.settings.resume_handle_ttl.as_millis()).unwrap_or(i64::MAX);
            execution.resume_handle = Some(uuid::Uuid::new_v4().to_string());
            execution.resume_handle_expires_at = Some(now_millis().saturating_add(ttl));
            execution.transition_to(ExecutionStatus::Paused)?;
            history.push(
                HistoryEntry::new(
                    HistoryKind::Paused,
                    format!("paused before wave {}", next_number),
                )
                .wave(next_number),
            );
            tracing::info!("Execution {} paused before wave {}", execution.id, next_number);
            return Ok(());
        }

        let next_jobs = job_server_lists(next);
        let admitted = self.guard.admit(&execution.id, &next_jobs).await;
        match admitted {
            Ok(()) => {
                execution.advance_wave()?;
                self.launch_active_wave(execution, history).await?;
                Ok(())
            }
            Err(AppError::AdmissionDenied(denial)) => {
                history.push(
                    HistoryEntry::new(HistoryKind::AdmissionDenied, denial.to_string())
                        .wave(next_number),
                );
                self.finish(
                    execution,
                    ExecutionStatus::Failed,
                    history,
                    format!("wave {} was not admitted", next_number),
                )
            }
            Err(err) => Err(err),
        }
    }

    fn finish(
        &self,
        execution: &mut Execution,
        status: ExecutionStatus,
        history: &mut Vec<HistoryEntry>,
        message: String,
    ) -> Result<()> {
        execution.transition_to(status)?;
        execution.clear_resume_handle();
        tracing::info!("Execution {} finished as {:?}: {}", execution.id, status, message);
        history.push(HistoryEntry::new(HistoryKind::Finished, message));
        Ok(())
    }

    /// Saves `execution` and drops its claims once it is terminal. Until then
    /// it keeps every server of every wave it has admitted, paused or not.
    /// Returns `false` when a concurrent change (typically a cancel) won; the
    /// in-memory result is then discarded.
    pub(crate) async fn persist_or_reconcile(
        &self,
        execution: &mut Execution,
        history: &[HistoryEntry],
    ) -> Result<bool> {
        match self.exec_repo.save(execution, history).await {
            Ok(()) => {}
            Err(AppError::ConcurrentModification(_)) => {
                self.reconcile_lost_update(execution).await?;
                return Ok(false);
            }
            Err(err) => return Err(err),
        }

        if execution.status.is_terminal() {
            self.release_claims(&execution.id).await;
        }
        Ok(true)
    }

    async fn reconcile_lost_update(&self, attempted: &Execution) -> Result<()> {
        let stored = self.exec_repo.get(&attempted.id).await?;
        tracing::warn!(
            "Discarding update of execution {}: stored record is now {:?}",
            attempted.id,
            stored.status
        );
        if stored.status == ExecutionStatus::Cancelled && attempted.is_drill() {
            let known = stored.launched_server_ids();
            let orphaned: Vec<String> = attempted
                .launched_server_ids()
                .into_iter()
                .filter(|s| !known.contains(s))
                .collect();
            self.terminate_quietly(&attempted.id, &orphaned).await;
        }
        Ok(())
    }

    async fn terminate_quietly(&self, execution_id: &str, server_ids: &[String]) {
        if server_ids.is_empty() {
            return;
        }
        match bounded(
            self.settings.call_timeout,
            self.recovery.terminate_instances(server_ids),
        )
        .await
        {
            Ok(()) => tracing::info!(
                "Requested termination of {} drill instance(s) for execution {}",
                server_ids.len(),
                execution_id
            ),
            Err(err) => tracing::warn!(
                "Terminating drill instances for execution {} failed: {}",
                execution_id,
                err
            ),
        }
    }

    async fn release_claims(&self, execution_id: &str) {
        if let Err(err) = self.guard.release_execution(execution_id).await {
            tracing::warn!("Failed to release claims of execution {}: {}", execution_id, err);
        }
    }

    async fn release_servers(&self, execution_id: &str, server_ids: &[String]) {
        if let Err(err) = self.guard.release_servers(execution_id, server_ids).await {
            tracing::warn!("Failed to release servers of execution {}: {}", execution_id, err);
        }
    }
}
