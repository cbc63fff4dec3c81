use crate::models::{PlanWave, ProtectionGroup, RecoveryPlan};
use crate::recovery::fake::FakeRecoveryService;
use crate::repository::{ClaimRepository, ExecutionRepository, PlanRepository, establish_connection};
use crate::services::{AdmissionGuard, CoordinatorSettings, ExecutionCoordinator, JobPoller};
use std::sync::Arc;
use std::time::Duration;

pub fn settings() -> CoordinatorSettings {
    CoordinatorSettings {
        call_timeout: Duration::from_secs(2),
        max_launch_attempts: 3,
        poll_window: Duration::from_secs(3600),
        resume_handle_ttl: Duration::from_secs(3600),
    }
}

/// A coordinator and poller wired to a throwaway SQLite file and a scripted
/// recovery service.
pub struct Harness {
    pub coordinator: ExecutionCoordinator,
    pub poller: JobPoller,
    pub fake: Arc<FakeRecoveryService>,
    pub plans: PlanRepository,
    pub claims: ClaimRepository,
    pub executions: ExecutionRepository,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(settings()).await
    }

    pub async fn with_settings(settings: CoordinatorSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("orchestrator.db").display());
        let pool = establish_connection(&url).await.unwrap();

        let fake = FakeRecoveryService::new();
        let plans = PlanRepository::new(pool.clone());
        let claims = ClaimRepository::new(pool.clone());
        let executions = ExecutionRepository::new(pool);
        let guard = AdmissionGuard::new(claims.clone(), fake.clone(), settings.call_timeout);
        let coordinator = ExecutionCoordinator::new(
            executions.clone(),
            plans.clone(),
            guard,
            fake.clone(),
            settings,
        );
        let poller = JobPoller::new(coordinator.clone(), executions.clone(), fake.clone());

        Self {
            coordinator,
            poller,
            fake,
            plans,
            claims,
            executions,
            _dir: dir,
        }
    }

    /// Registers a plan with one protection group per wave. Each wave is
    /// `(servers, pause_before_wave)`.
    pub async fn add_plan(&self, id: &str, waves: &[(&[&str], bool)]) -> RecoveryPlan {
        let plan = RecoveryPlan {
            id: id.to_string(),
            name: format!("{} plan", id),
            waves: waves
                .iter()
                .enumerate()
                .map(|(i, (servers, pause))| PlanWave {
                    wave_number: i as u32,
                    name: format!("wave-{}", i),
                    pause_before_wave: *pause,
                    depends_on: if i == 0 { vec![] } else { vec![i as u32 - 1] },
                    protection_groups: vec![ProtectionGroup {
                        id: format!("{}-pg-{}", id, i),
                        server_ids: servers.iter().map(|s| s.to_string()).collect(),
                    }],
                })
                .collect(),
        };
        self.plans.upsert(&plan).await.unwrap();
        plan
    }
}
