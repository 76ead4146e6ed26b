use axum::{extract::State, response::Json};
use serde_json::json;
use std::sync::Arc;

use crate::AppState;

pub mod automations;
pub mod executions;
pub mod webhooks;

pub use automations::automation_routes;
pub use executions::execution_routes;
pub use webhooks::webhook_routes;

/// Liveness probe: reports database reachability and engine state.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let database = crate::database::health_check(&state.db_pool).await;
    Json(json!({
        "status": if database { "ok" } else { "degraded" },
        "database": database,
        "engineRunning": state.manager.is_running(),
        "activeExecutions": state.executor.active_count(),
    }))
}
