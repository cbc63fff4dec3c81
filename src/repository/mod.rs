mod claim_repository;
mod connection;
mod execution_repository;
mod plan_repository;

pub use claim_repository::ClaimRepository;
pub use connection::establish_connection;
pub use execution_repository::ExecutionRepository;
pub use plan_repository::PlanRepository;

pub type DbPool = sqlx::SqlitePool;
