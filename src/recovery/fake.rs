use super::{JobEvent, JobEventKind, RecoveryService, RecoveryServiceError, StartJobRequest};
use crate::models::CapacityReport;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Default)]
struct FakeState {
    next_job: u32,
    clock: i64,
    jobs: HashMap<String, Vec<JobEvent>>,
    server_jobs: HashMap<String, String>,
    started: Vec<StartJobRequest>,
    terminated: Vec<Vec<String>>,
    capacity: CapacityReport,
    start_failures: VecDeque<RecoveryServiceError>,
    describe_failures: u32,
    describe_calls: u32,
}

struct DescribeGate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

/// Scripted stand-in for the recovery service.
#[derive(Default)]
pub struct FakeRecoveryService {
    state: Mutex<FakeState>,
    gate: Mutex<Option<DescribeGate>>,
}

impl FakeRecoveryService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_capacity(&self, capacity: CapacityReport) {
        self.state.lock().unwrap().capacity = capacity;
    }

    pub fn fail_next_start(&self, err: RecoveryServiceError) {
        self.state.lock().unwrap().start_failures.push_back(err);
    }

    pub fn fail_next_describes(&self, count: u32) {
        self.state.lock().unwrap().describe_failures = count;
    }

    /// Makes the next `describe_job` call wait. `entered` fires once the call
    /// is in flight; notifying `release` lets it finish.
    pub fn hold_next_describe(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(DescribeGate {
            entered: entered.clone(),
            release: release.clone(),
        });
        (entered, release)
    }

    pub fn emit(&self, server_id: &str, event: JobEventKind) {
        let mut state = self.state.lock().unwrap();
        let Some(job_id) = state.server_jobs.get(server_id).cloned() else {
            panic!("no job started for server {}", server_id);
        };
        state.clock += 1;
        let timestamp = state.clock;
        state.jobs.entry(job_id).or_default().push(JobEvent {
            server_id: server_id.to_string(),
            event,
            timestamp,
        });
    }

    pub fn launch(&self, server_ids: &[&str]) {
        for server_id in server_ids {
            for event in [
                JobEventKind::Queued,
                JobEventKind::SnapshotStart,
                JobEventKind::ConversionEnd,
                JobEventKind::LaunchStart,
                JobEventKind::LaunchEnd,
                JobEventKind::CleanupEnd,
            ] {
                self.emit(server_id, event);
            }
        }
    }

    pub fn fail(&self, server_ids: &[&str]) {
        for server_id in server_ids {
            self.emit(server_id, JobEventKind::Queued);
            self.emit(server_id, JobEventKind::Failed);
        }
    }

    pub fn started(&self) -> Vec<StartJobRequest> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn terminated(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().terminated.clone()
    }

    pub fn describe_calls(&self) -> u32 {
        self.state.lock().unwrap().describe_calls
    }
}

#[async_trait::async_trait]
impl RecoveryService for FakeRecoveryService {
    async fn start_job(&self, request: &StartJobRequest) -> Result<String, RecoveryServiceError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.start_failures.pop_front() {
            return Err(err);
        }
        state.next_job += 1;
        let job_id = format!("drsjob-{}", state.next_job);
        for server_id in &request.server_ids {
            state.server_jobs.insert(server_id.clone(), job_id.clone());
        }
        state.jobs.insert(job_id.clone(), Vec::new());
        state.started.push(request.clone());
        Ok(job_id)
    }

    async fn describe_job(&self, job_id: &str) -> Result<Vec<JobEvent>, RecoveryServiceError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let mut state = self.state.lock().unwrap();
        state.describe_calls += 1;
        if state.describe_failures > 0 {
            state.describe_failures -= 1;
            return Err(RecoveryServiceError::Service("throttled".to_string()));
        }
        state
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| RecoveryServiceError::Service(format!("unknown job {}", job_id)))
    }

    async fn terminate_instances(&self, server_ids: &[String]) -> Result<(), RecoveryServiceError> {
        self.state.lock().unwrap().terminated.push(server_ids.to_vec());
        Ok(())
    }

    async fn capacity(&self) -> Result<CapacityReport, RecoveryServiceError> {
        Ok(self.state.lock().unwrap().capacity.clone())
    }
}
