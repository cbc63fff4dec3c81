use super::handlers::{execution, health};
use super::middleware::cors::add_cors;
use crate::services::ExecutionCoordinator;
use axum::{
    Router,
    routing::{get, post},
};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: ExecutionCoordinator,
}

pub fn create_router(coordinator: ExecutionCoordinator) -> Router {
    let state = AppState { coordinator };

    let api_routes = Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Executions
        .route("/api/executions", get(execution::list_executions))
        .route("/api/executions", post(execution::start_execution))
        .route("/api/executions/{id}", get(execution::get_execution))
        .route("/api/executions/{id}/history", get(execution::get_history))
        .route("/api/executions/{id}/resume", post(execution::resume_execution))
        .route("/api/executions/{id}/cancel", post(execution::cancel_execution))
        .with_state(state);

    add_cors(api_routes)
}
