//! Rule CRUD plus manual execution, dry runs, and enable/disable toggles.

use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::automation::executor::ExecutorError;
use crate::automation::rule::{
    components_from_legacy, validate_rule, ActionSpec, Component, ConditionNode, Rule, Trigger,
};
use crate::error::{ApiResult, AppError};
use crate::AppState;

pub fn automation_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_automations).post(create_automation))
        .route(
            "/:id",
            get(get_automation)
                .put(update_automation)
                .delete(delete_automation),
        )
        .route("/:id/execute", post(execute_automation))
        .route("/:id/test", post(test_automation))
        .route("/:id/enable", post(enable_automation))
        .route("/:id/disable", post(disable_automation))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationPayload {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub workspace_id: Uuid,
    #[serde(default)]
    pub workspace_key: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub trigger: Trigger,
    /// Unified program shape.
    #[serde(default)]
    pub components: Option<Vec<Component>>,
    /// Legacy shape, accepted on write and migrated immediately.
    #[serde(default)]
    pub conditions: Option<ConditionNode>,
    #[serde(default)]
    pub actions: Option<Vec<ActionSpec>>,
    #[serde(default)]
    pub execution_order: i32,
}

fn default_enabled() -> bool {
    true
}

impl AutomationPayload {
    fn into_rule(self, id: Uuid, created_by: Option<String>) -> Rule {
        let components = match self.components {
            Some(components) => components,
            None => components_from_legacy(self.conditions, self.actions.unwrap_or_default()),
        };
        Rule {
            id,
            name: self.name,
            description: self.description,
            workspace_id: self.workspace_id,
            workspace_key: self.workspace_key,
            enabled: self.enabled,
            trigger: self.trigger,
            components,
            execution_order: self.execution_order,
            created_by,
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

async fn list_automations(
    State(state): State<Arc<AppState>>,
    _auth: AuthUser,
) -> ApiResult<Json<Vec<Rule>>> {
    Ok(Json(state.rules.list().await?))
}

async fn get_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    _auth: AuthUser,
) -> ApiResult<Json<Rule>> {
    let rule = state
        .rules
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Automation".to_string()))?;
    Ok(Json(rule))
}

async fn create_automation(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(payload): Json<AutomationPayload>,
) -> ApiResult<Json<Rule>> {
    let rule = payload.into_rule(Uuid::new_v4(), Some(user.email));
    if let Err(problems) = validate_rule(&rule) {
        return Err(AppError::ValidationError {
            details: json!({ "components": problems }),
        });
    }

    state.rules.insert(&rule).await?;
    state.manager.start_one(&rule).await;
    Ok(Json(rule))
}

async fn update_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    AuthUser(user): AuthUser,
    Json(payload): Json<AutomationPayload>,
) -> ApiResult<Json<Rule>> {
    let existing = state
        .rules
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Automation".to_string()))?;

    let mut rule = payload.into_rule(id, existing.created_by.clone());
    rule.created_at = existing.created_at;
    rule.created_by = existing.created_by.or(Some(user.email));
    if let Err(problems) = validate_rule(&rule) {
        return Err(AppError::ValidationError {
            details: json!({ "components": problems }),
        });
    }

    state.rules.update(&rule).await?;
    // The live watcher reflects the persisted rule, so reinstall it.
    state
        .manager
        .reload(id)
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))?;
    Ok(Json(rule))
}

async fn delete_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    _auth: AuthUser,
) -> ApiResult<Json<Value>> {
    state.manager.stop_one(id).await;
    if !state.rules.delete(id).await? {
        return Err(AppError::NotFound("Automation".to_string()));
    }
    Ok(Json(json!({ "deleted": id })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub parameters: Option<Value>,
}

async fn execute_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    _auth: AuthUser,
    payload: Option<Json<ExecuteRequest>>,
) -> ApiResult<Json<Value>> {
    let parameters = payload.and_then(|Json(request)| request.parameters);
    let execution_id = state
        .executor
        .trigger_manually(id, parameters)
        .await
        .map_err(executor_error)?;
    Ok(Json(json!({ "executionId": execution_id })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRequest {
    #[serde(default)]
    pub mock_trigger_data: Option<Value>,
}

async fn test_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    _auth: AuthUser,
    payload: Option<Json<TestRequest>>,
) -> ApiResult<Json<crate::automation::TestOutcome>> {
    let mock = payload.and_then(|Json(request)| request.mock_trigger_data);
    let outcome = state.executor.test(id, mock).await.map_err(executor_error)?;
    Ok(Json(outcome))
}

async fn enable_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    _auth: AuthUser,
) -> ApiResult<Json<Value>> {
    set_enabled(&state, id, true).await
}

async fn disable_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    _auth: AuthUser,
) -> ApiResult<Json<Value>> {
    set_enabled(&state, id, false).await
}

async fn set_enabled(state: &Arc<AppState>, id: Uuid, enabled: bool) -> ApiResult<Json<Value>> {
    if !state.rules.set_enabled(id, enabled).await? {
        return Err(AppError::NotFound("Automation".to_string()));
    }
    state
        .manager
        .reload(id)
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))?;
    Ok(Json(json!({ "id": id, "enabled": enabled })))
}

fn executor_error(error: ExecutorError) -> AppError {
    match error {
        ExecutorError::RuleNotFound(_) => AppError::NotFound("Automation".to_string()),
        ExecutorError::Database(e) => AppError::DatabaseError(e.to_string()),
        other => AppError::InternalError(other.to_string()),
    }
}
