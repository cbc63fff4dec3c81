use crate::error::Result;
use crate::models::{Execution, ExecutionStatus, HistoryEntry, HistoryKind, LaunchStatus};
use crate::recovery::{SharedRecoveryService, bounded, latest_launch_status};
use crate::repository::ExecutionRepository;
use crate::services::ExecutionCoordinator;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Saved,
    /// Polled, but nothing changed; the record was not written.
    Unchanged,
    /// Lost to a concurrent change, typically a cancel.
    Discarded,
    /// Not in a state the poller drives.
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub discovered: usize,
    pub saved: usize,
    pub unchanged: usize,
    pub discarded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Drives executions forward from the recovery service's job status. Each
/// tick discovers executions that are launching or polling and advances each
/// one in its own task.
#[derive(Clone)]
pub struct JobPoller {
    coordinator: ExecutionCoordinator,
    exec_repo: ExecutionRepository,
    recovery: SharedRecoveryService,
}

impl JobPoller {
    pub fn new(
        coordinator: ExecutionCoordinator,
        exec_repo: ExecutionRepository,
        recovery: SharedRecoveryService,
    ) -> Self {
        Self {
            coordinator,
            exec_repo,
            recovery,
        }
    }

    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!("Job poller started, interval {:?}", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(summary) if summary.discovered > 0 => {
                            tracing::debug!("Poll tick: {:?}", summary);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!("Poll discovery failed: {}", e),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!("Job poller stopped");
    }

    pub async fn tick(&self) -> Result<TickSummary> {
        let ids = self
            .exec_repo
            .list_ids_by_status(&[
                ExecutionStatus::Pending,
                ExecutionStatus::Launching,
                ExecutionStatus::Polling,
            ])
            .await?;

        let mut summary = TickSummary {
            discovered: ids.len(),
            ..TickSummary::default()
        };

        let mut tasks = JoinSet::new();
        for id in ids {
            let poller = self.clone();
            tasks.spawn(async move {
                let result = poller.advance(&id).await;
                (id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(AdvanceOutcome::Saved))) => summary.saved += 1,
                Ok((_, Ok(AdvanceOutcome::Unchanged))) => summary.unchanged += 1,
                Ok((_, Ok(AdvanceOutcome::Discarded))) => summary.discarded += 1,
                Ok((_, Ok(AdvanceOutcome::Skipped))) => summary.skipped += 1,
                Ok((id, Err(e))) => {
                    tracing::warn!("Advancing execution {} failed, retrying next tick: {}", id, e);
                    summary.failed += 1;
                }
                Err(e) => {
                    tracing::error!("Poll task panicked: {}", e);
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    pub async fn advance(&self, execution_id: &str) -> Result<AdvanceOutcome> {
        let _lock = self.coordinator.lock(execution_id).await;
        let mut execution = self.exec_repo.get(execution_id).await?;
        let mut history = Vec::new();

        match execution.status {
            ExecutionStatus::Pending | ExecutionStatus::Launching => {
                self.coordinator
                    .launch_active_wave(&mut execution, &mut history)
                    .await?;
            }
            ExecutionStatus::Polling => {
                self.poll_active_wave(&mut execution, &mut history).await;
                if execution.active_wave().is_some_and(|w| w.is_settled()) {
                    self.coordinator
                        .settle_active_wave(&mut execution, &mut history)
                        .await?;
                }
                if history.is_empty() {
                    return Ok(AdvanceOutcome::Unchanged);
                }
            }
            _ => return Ok(AdvanceOutcome::Skipped),
        }

        if self
            .coordinator
            .persist_or_reconcile(&mut execution, &history)
            .await?
        {
            Ok(AdvanceOutcome::Saved)
        } else {
            Ok(AdvanceOutcome::Discarded)
        }
    }

    /// Refreshes every non-terminal server of the active wave from its job's
    /// event log. Status and history change only when the mapped status
    /// differs from the stored one, so an unchanged job leaves `history`
    /// empty. Servers still running once the poll window has passed since
    /// the wave started are marked failed.
    async fn poll_active_wave(&self, execution: &mut Execution, history: &mut Vec<HistoryEntry>) {
        let timeout = self.coordinator.settings().call_timeout;
        let poll_window = self.coordinator.settings().poll_window;
        let window = i64::try_from(poll_window.as_millis()).unwrap_or(i64::MAX);
        let execution_id = execution.id.clone();
        let Some(wave) = execution.active_wave_mut() else {
            return;
        };
        let wave_number = wave.wave_number;
        let now = Utc::now().timestamp_millis();
        let expired = wave
            .started_at
            .is_some_and(|started| now >= started.saturating_add(window));

        let mut job_ids: Vec<String> = Vec::new();
        for server in wave.servers.iter().filter(|s| !s.launch_status.is_terminal()) {
            if let Some(job_id) = &server.external_job_id {
                if !job_ids.contains(job_id) {
                    job_ids.push(job_id.clone());
                }
            }
        }

        for job_id in job_ids {
            let result = bounded(timeout, self.recovery.describe_job(&job_id)).await;
            if let Err(err) = &result {
                tracing::warn!(
                    "Describe job {} for execution {} failed: {}",
                    job_id,
                    execution_id,
                    err
                );
                history.push(
                    HistoryEntry::new(
                        HistoryKind::ServiceError,
                        format!("describe job {}: {}", job_id, err),
                    )
                    .wave(wave_number),
                );
            }

            for server in wave.servers.iter_mut().filter(|s| {
                s.external_job_id.as_deref() == Some(job_id.as_str())
                    && !s.launch_status.is_terminal()
            }) {
                if let Ok(events) = &result {
                    if let Some(status) = latest_launch_status(events, &server.server_id) {
                        if status != server.launch_status {
                            history.push(
                                HistoryEntry::new(
                                    HistoryKind::ServerStatusChanged,
                                    format!("{:?} -> {:?}", server.launch_status, status),
                                )
                                .wave(wave_number)
                                .server(&server.server_id),
                            );
                            server.launch_status = status;
                        }
                    }
                }

                if expired && !server.launch_status.is_terminal() {
                    history.push(
                        HistoryEntry::new(
                            HistoryKind::PollLimitExceeded,
                            format!(
                                "no terminal status within {:?} of wave start, marking failed",
                                poll_window
                            ),
                        )
                        .wave(wave_number)
                        .server(&server.server_id),
                    );
                    server.launch_status = LaunchStatus::Failed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionMode, WaveStatus};
    use crate::recovery::JobEventKind;
    use crate::services::test_support::Harness;

    #[tokio::test]
    async fn test_three_wave_drill_with_checkpoint() {
        let h = Harness::new().await;
        h.add_plan(
            "erp",
            &[(&["db"], false), (&["app"], false), (&["web"], true)],
        )
        .await;
        let execution = h
            .coordinator
            .start_execution("erp", ExecutionMode::Drill, "ui")
            .await
            .unwrap();
        let id = execution.id.clone();
        let mut indexes = vec![execution.current_wave_index];

        h.fake.launch(&["db"]);
        h.poller.tick().await.unwrap();
        let execution = h.coordinator.get_execution(&id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Polling);
        assert_eq!(execution.current_wave_index, 1);
        indexes.push(execution.current_wave_index);

        // servers of finished waves stay claimed while the execution runs
        let claimed: Vec<String> = h
            .claims
            .claims_for(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.server_id)
            .collect();
        assert_eq!(claimed, vec!["app".to_string(), "db".to_string()]);

        h.fake.launch(&["app"]);
        h.poller.tick().await.unwrap();
        let paused = h.coordinator.get_execution(&id).await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.current_wave_index, 1);
        indexes.push(paused.current_wave_index);
        let handle = paused.resume_handle.clone().unwrap();

        let err = h
            .coordinator
            .resume_execution(&id, "not-the-handle")
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::AppError::InvalidResumeHandle(_)));
        let still = h.coordinator.get_execution(&id).await.unwrap();
        assert_eq!(still.status, ExecutionStatus::Paused);
        assert_eq!(still.resume_handle.as_deref(), Some(handle.as_str()));

        let resumed = h.coordinator.resume_execution(&id, &handle).await.unwrap();
        assert_eq!(resumed.current_wave_index, 2);
        indexes.push(resumed.current_wave_index);

        h.fake.launch(&["web"]);
        h.poller.tick().await.unwrap();
        let done = h.coordinator.get_execution(&id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(done.waves.iter().all(|w| w.status == WaveStatus::Completed));
        indexes.push(done.current_wave_index);

        assert!(indexes.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(h.fake.started().len(), 3);
        assert!(h.claims.claims_for(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_wave_stops_execution() {
        let h = Harness::new().await;
        h.add_plan("erp", &[(&["a", "b", "c"], false), (&["d"], false)])
            .await;
        let execution = h
            .coordinator
            .start_execution("erp", ExecutionMode::Recovery, "cli")
            .await
            .unwrap();

        h.fake.launch(&["a", "b"]);
        h.fake.fail(&["c"]);
        let summary = h.poller.tick().await.unwrap();
        assert_eq!(summary.discovered, 1);
        assert_eq!(summary.saved, 1);

        let execution = h.coordinator.get_execution(&execution.id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Partial);
        assert_eq!(execution.waves[0].status, WaveStatus::Partial);
        assert_eq!(execution.waves[1].status, WaveStatus::Pending);
        assert_eq!(h.fake.started().len(), 1);

        let summary = h.poller.tick().await.unwrap();
        assert_eq!(summary, TickSummary::default());
    }

    #[tokio::test]
    async fn test_all_servers_failed_fails_execution() {
        let h = Harness::new().await;
        h.add_plan("erp", &[(&["a", "b"], false)]).await;
        let execution = h
            .coordinator
            .start_execution("erp", ExecutionMode::Recovery, "cli")
            .await
            .unwrap();

        h.fake.fail(&["a", "b"]);
        h.poller.tick().await.unwrap();
        let execution = h.coordinator.get_execution(&execution.id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.waves[0].status, WaveStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_during_poll_discards_poll_result() {
        let h = Harness::new().await;
        h.add_plan("erp", &[(&["a"], false)]).await;
        let execution = h
            .coordinator
            .start_execution("erp", ExecutionMode::Drill, "ui")
            .await
            .unwrap();
        let id = execution.id.clone();

        let (entered, release) = h.fake.hold_next_describe();
        let poller = h.poller.clone();
        let poll_id = id.clone();
        let poll = tokio::spawn(async move { poller.advance(&poll_id).await });

        entered.notified().await;
        let cancelled = h.coordinator.cancel_execution(&id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        h.fake.launch(&["a"]);
        release.notify_one();

        let outcome = poll.await.unwrap().unwrap();
        assert_eq!(outcome, AdvanceOutcome::Discarded);

        let stored = h.coordinator.get_execution(&id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
        assert_eq!(stored.waves[0].servers[0].launch_status, LaunchStatus::Pending);
        assert_eq!(stored.waves[0].status, WaveStatus::Cancelled);
        assert!(h.claims.claims_for(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_polls_without_new_events_change_nothing() {
        let h = Harness::new().await;
        h.add_plan("erp", &[(&["a"], false)]).await;
        let execution = h
            .coordinator
            .start_execution("erp", ExecutionMode::Drill, "ui")
            .await
            .unwrap();
        h.fake.emit("a", JobEventKind::Queued);

        let summary = h.poller.tick().await.unwrap();
        assert_eq!(summary.saved, 1);
        let first = h.coordinator.get_execution(&execution.id).await.unwrap();
        let first_history = h.coordinator.execution_history(&execution.id).await.unwrap();
        assert_eq!(first.waves[0].servers[0].launch_status, LaunchStatus::Queued);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let summary = h.poller.tick().await.unwrap();
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.saved, 0);
        let second = h.coordinator.get_execution(&execution.id).await.unwrap();
        let second_history = h.coordinator.execution_history(&execution.id).await.unwrap();

        assert_eq!(second.version, first.version);
        assert_eq!(second.updated_at, first.updated_at);
        assert_eq!(second.status, first.status);
        assert_eq!(second.waves, first.waves);
        assert_eq!(second_history.len(), first_history.len());
        assert_eq!(h.fake.started().len(), 1);
        assert!(h.fake.terminated().is_empty());
    }

    #[tokio::test]
    async fn test_stranded_pending_execution_is_launched() {
        let h = Harness::new().await;
        let plan = h.add_plan("erp", &[(&["a"], false)]).await;

        // A start that claimed its servers and wrote the record, then died.
        let stranded = Execution::new("stranded".to_string(), &plan, ExecutionMode::Drill, "cli");
        assert!(h.claims.claim("stranded", &["a".to_string()]).await.unwrap().is_empty());
        h.executions.create(&stranded, &[]).await.unwrap();

        let summary = h.poller.tick().await.unwrap();
        assert_eq!(summary.discovered, 1);
        assert_eq!(summary.saved, 1);

        let launched = h.coordinator.get_execution("stranded").await.unwrap();
        assert_eq!(launched.status, ExecutionStatus::Polling);
        assert_eq!(launched.waves[0].job_ids.len(), 1);

        h.fake.launch(&["a"]);
        h.poller.tick().await.unwrap();
        assert_eq!(
            h.coordinator.get_execution("stranded").await.unwrap().status,
            ExecutionStatus::Completed
        );
        assert!(h.claims.claims_for("stranded").await.unwrap().is_empty());
        h.coordinator
            .start_execution("erp", ExecutionMode::Drill, "cli")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_events_do_not_change_status() {
        let h = Harness::new().await;
        h.add_plan("erp", &[(&["a"], false)]).await;
        let execution = h
            .coordinator
            .start_execution("erp", ExecutionMode::Drill, "ui")
            .await
            .unwrap();
        h.fake.emit("a", JobEventKind::Queued);
        h.fake.emit("a", JobEventKind::ConversionStart);
        h.fake.emit("a", JobEventKind::CleanupStart);

        h.poller.tick().await.unwrap();
        let execution = h.coordinator.get_execution(&execution.id).await.unwrap();
        assert_eq!(
            execution.waves[0].servers[0].launch_status,
            LaunchStatus::Conversion
        );
    }

    #[tokio::test]
    async fn test_poll_window_marks_server_failed() {
        let mut settings = crate::services::test_support::settings();
        settings.poll_window = Duration::from_millis(500);
        let h = Harness::with_settings(settings).await;
        h.add_plan("erp", &[(&["a"], false)]).await;
        let execution = h
            .coordinator
            .start_execution("erp", ExecutionMode::Drill, "ui")
            .await
            .unwrap();

        h.poller.tick().await.unwrap();
        let polling = h.coordinator.get_execution(&execution.id).await.unwrap();
        assert_eq!(polling.status, ExecutionStatus::Polling);

        tokio::time::sleep(Duration::from_millis(600)).await;
        h.poller.tick().await.unwrap();
        let failed = h.coordinator.get_execution(&execution.id).await.unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.waves[0].servers[0].launch_status, LaunchStatus::Failed);

        let kinds: Vec<String> = h
            .coordinator
            .execution_history(&execution.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.kind)
            .collect();
        assert!(kinds.contains(&"poll_limit_exceeded".to_string()));
    }

    #[tokio::test]
    async fn test_describe_failure_is_retried_next_tick() {
        let h = Harness::new().await;
        h.add_plan("erp", &[(&["a"], false)]).await;
        let execution = h
            .coordinator
            .start_execution("erp", ExecutionMode::Drill, "ui")
            .await
            .unwrap();
        h.fake.launch(&["a"]);
        h.fake.fail_next_describes(2);

        h.poller.tick().await.unwrap();
        h.poller.tick().await.unwrap();
        let still = h.coordinator.get_execution(&execution.id).await.unwrap();
        assert_eq!(still.status, ExecutionStatus::Polling);

        h.poller.tick().await.unwrap();
        let done = h.coordinator.get_execution(&execution.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(h.fake.describe_calls(), 3);

        let errors = h
            .coordinator
            .execution_history(&execution.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.kind == "service_error")
            .count();
        assert_eq!(errors, 2);
    }

    #[tokio::test]
    async fn test_next_wave_denied_fails_execution() {
        let h = Harness::new().await;
        h.add_plan("first", &[(&["a"], false), (&["b"], false)]).await;
        h.add_plan("other", &[(&["b"], false)]).await;

        let holder = h
            .coordinator
            .start_execution("other", ExecutionMode::Drill, "cli")
            .await
            .unwrap();
        let execution = h
            .coordinator
            .start_execution("first", ExecutionMode::Drill, "cli")
            .await
            .unwrap();

        h.fake.launch(&["a"]);
        let summary = h.poller.tick().await.unwrap();
        assert_eq!(summary.discovered, 2);

        let execution = h.coordinator.get_execution(&execution.id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.current_wave_index, 0);
        let history = h.coordinator.execution_history(&execution.id).await.unwrap();
        let denied = history
            .iter()
            .find(|r| r.kind == "admission_denied")
            .unwrap();
        assert!(denied.message.contains(&holder.id));
        assert_eq!(
            h.coordinator.get_execution(&holder.id).await.unwrap().status,
            ExecutionStatus::Polling
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = Harness::new().await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.poller.clone().run(Duration::from_millis(10), rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
