//! Execution history endpoints.

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::automation::Execution;
use crate::error::{ApiResult, AppError};
use crate::pagination::PaginationParams;
use crate::store::ExecutionStats;
use crate::AppState;

pub fn execution_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_executions))
        .route("/:id", get(get_execution))
        .route("/stats/:automation_id", get(execution_stats))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionQuery {
    #[serde(default)]
    pub automation_id: Option<Uuid>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub per_page: Option<i64>,
}

async fn list_executions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExecutionQuery>,
    _auth: AuthUser,
) -> ApiResult<Json<Vec<Execution>>> {
    let pagination = PaginationParams {
        page: query.page.unwrap_or(1),
        per_page: query.per_page.unwrap_or(crate::pagination::DEFAULT_PAGE_SIZE),
    };
    let executions = state
        .executions
        .list(query.automation_id, pagination.limit(), pagination.offset())
        .await?;
    Ok(Json(executions))
}

async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    _auth: AuthUser,
) -> ApiResult<Json<Execution>> {
    let execution = state
        .executions
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Execution".to_string()))?;
    Ok(Json(execution))
}

async fn execution_stats(
    State(state): State<Arc<AppState>>,
    Path(automation_id): Path<Uuid>,
    _auth: AuthUser,
) -> ApiResult<Json<ExecutionStats>> {
    Ok(Json(state.executions.stats(automation_id).await?))
}
