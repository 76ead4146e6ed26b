//! Action execution: each action resolves its templated config, calls the
//! upstream adapter, and returns a compact JSON result.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::onstaq::{Item, OnstaqClient, OnstaqError};
use crate::template::{TemplateError, TemplateResolver};

use super::context::ExecutionContext;
use super::executor::RuleExecutor;
use super::rule::ActionSpec;

/// Upper bound on `automation.trigger` chains.
pub const MAX_CHAIN_DEPTH: u32 = 8;

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Upstream(#[from] OnstaqError),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Automation chain depth exceeded (max {MAX_CHAIN_DEPTH})")]
    ChainDepthExceeded,
    #[error("{0}")]
    Other(String),
}

pub struct ActionRunner {
    client: Arc<OnstaqClient>,
    resolver: TemplateResolver,
    /// Separate client for `webhook.send`: shorter timeout than upstream calls.
    webhook_http: reqwest::Client,
}

impl ActionRunner {
    pub fn new(client: Arc<OnstaqClient>, resolver: TemplateResolver) -> Self {
        let webhook_http = reqwest::Client::builder()
            .user_agent("onstaq-automation/0.1")
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            resolver,
            webhook_http,
        }
    }

    /// Execute one action. Every string in the config passes through the
    /// template resolver first.
    pub async fn run(
        &self,
        spec: &ActionSpec,
        ctx: &mut ExecutionContext,
        executor: &RuleExecutor,
    ) -> Result<Value, ActionError> {
        let config = self.resolver.render_value(&spec.config, ctx).await?;

        match spec.action_type.as_str() {
            "item.create" => self.item_create(&config, ctx).await,
            "item.update" => self.item_update(&config, ctx).await,
            "item.delete" => self.item_delete(&config, ctx).await,
            "item.clone" => self.item_clone(&config, ctx).await,
            "item.transition" => self.item_transition(&config, ctx).await,
            "item.lookup" => self.item_lookup(&config, ctx).await,
            "attribute.set" => self.attribute_set(&config, ctx).await,
            "reference.add" => self.reference_add(&config, ctx).await,
            "reference.remove" => self.reference_remove(&config, ctx).await,
            "comment.add" => self.comment_add(&config, ctx).await,
            "item.import" => self.item_import(&config, ctx).await,
            "catalog.create" => self.catalog_create(&config, ctx).await,
            "attribute.create" => self.attribute_create(&config, ctx).await,
            "workspace.member.add" => self.member_add(&config, ctx).await,
            "oql.execute" => self.oql_execute(&config, ctx).await,
            "webhook.send" => self.webhook_send(&config).await,
            "automation.trigger" => self.automation_trigger(&config, ctx, executor).await,
            "variable.set" => self.variable_set(&config, ctx),
            "log" => self.log_message(&config, ctx),
            "refetch_data" => self.refetch_data(ctx).await,
            other => Err(ActionError::Config(format!("unknown action type '{}'", other))),
        }
    }

    // =========================================================================
    // Addressing helpers
    // =========================================================================

    /// Resolve the item an action operates on: explicit id, explicit key, or
    /// (default) the context's current item.
    async fn target_item(&self, config: &Value, ctx: &ExecutionContext) -> Result<Item, ActionError> {
        if let Some(id) = uuid_field(config, "itemId")? {
            return Ok(self.client.get_item(id).await?);
        }
        if let Some(key) = str_field(config, "itemKey") {
            return self
                .client
                .find_item_by_key(ctx.workspace_id, &key)
                .await?
                .ok_or_else(|| ActionError::Config(format!("item with key '{}' not found", key)));
        }
        if config
            .get("useTriggeredItem")
            .and_then(Value::as_bool)
            .unwrap_or(true)
        {
            return ctx
                .effective_item()
                .cloned()
                .ok_or_else(|| ActionError::Config("no item in execution context".to_string()));
        }
        Err(ActionError::Config("no item address in config".to_string()))
    }

    /// Resolve a catalog by id, or by case-insensitive name within the
    /// rule's workspace.
    async fn target_catalog(&self, config: &Value, workspace_id: Uuid) -> Result<Uuid, ActionError> {
        if let Some(id) = uuid_field(config, "catalogId")? {
            return Ok(id);
        }
        if let Some(name) = str_field(config, "catalogName") {
            let catalogs = self.client.list_catalogs(workspace_id).await?;
            return catalogs
                .into_iter()
                .find(|catalog| catalog.name.eq_ignore_ascii_case(&name))
                .map(|catalog| catalog.id)
                .ok_or_else(|| ActionError::Config(format!("catalog '{}' not found", name)));
        }
        Err(ActionError::Config("no catalog address in config".to_string()))
    }

    fn target_workspace(&self, config: &Value, ctx: &ExecutionContext) -> Result<Uuid, ActionError> {
        Ok(uuid_field(config, "workspaceId")?.unwrap_or(ctx.workspace_id))
    }

    // =========================================================================
    // Item actions
    // =========================================================================

    async fn item_create(&self, config: &Value, ctx: &mut ExecutionContext) -> Result<Value, ActionError> {
        let catalog_id = self.target_catalog(config, ctx.workspace_id).await?;
        let attributes = config.get("attributes").cloned().unwrap_or(json!({}));
        let item = self.client.create_item(catalog_id, &attributes).await?;
        let result = json!({ "itemId": item.id, "itemKey": item.key });
        ctx.push_created_item(item);
        Ok(result)
    }

    async fn item_update(&self, config: &Value, ctx: &mut ExecutionContext) -> Result<Value, ActionError> {
        let item = self.target_item(config, ctx).await?;
        let attributes = config
            .get("attributes")
            .cloned()
            .ok_or_else(|| ActionError::Config("attributes map missing".to_string()))?;
        let updated = self.client.update_item(item.id, &attributes).await?;
        Ok(json!({ "itemId": updated.id, "itemKey": updated.key }))
    }

    async fn item_delete(&self, config: &Value, ctx: &mut ExecutionContext) -> Result<Value, ActionError> {
        let item = self.target_item(config, ctx).await?;
        self.client.delete_item(item.id).await?;
        Ok(json!({ "deletedItemId": item.id }))
    }

    async fn item_clone(&self, config: &Value, ctx: &mut ExecutionContext) -> Result<Value, ActionError> {
        let source = self.target_item(config, ctx).await?;
        let catalog_id = match uuid_field(config, "targetCatalogId")? {
            Some(id) => id,
            None => source.catalog_id,
        };

        let mut attributes = serde_json::to_value(&source.attribute_values)
            .unwrap_or_else(|_| json!({}));
        if let Some(Value::Object(overrides)) = config.get("overrides") {
            if let Value::Object(base) = &mut attributes {
                for (key, value) in overrides {
                    base.insert(key.clone(), value.clone());
                }
            }
        }

        let clone = self.client.create_item(catalog_id, &attributes).await?;
        let result = json!({
            "itemId": clone.id,
            "itemKey": clone.key,
            "sourceItemId": source.id,
        });
        ctx.push_created_item(clone);
        Ok(result)
    }

    async fn item_transition(&self, config: &Value, ctx: &mut ExecutionContext) -> Result<Value, ActionError> {
        let item = self.target_item(config, ctx).await?;
        let status = str_field(config, "status")
            .ok_or_else(|| ActionError::Config("status missing".to_string()))?;

        // The status lives in the catalog's STATUS-typed attribute.
        let attribute_name = self
            .client
            .list_attributes(item.catalog_id)
            .await?
            .into_iter()
            .find(|attribute| attribute.attribute_type.eq_ignore_ascii_case("STATUS"))
            .map(|attribute| attribute.name)
            .unwrap_or_else(|| "Status".to_string());

        let updated = self
            .client
            .update_item(item.id, &json!({ attribute_name: status }))
            .await?;
        Ok(json!({ "itemId": updated.id, "itemKey": updated.key, "status": status }))
    }

    async fn item_lookup(&self, config: &Value, ctx: &mut ExecutionContext) -> Result<Value, ActionError> {
        let query = str_field(config, "query")
            .ok_or_else(|| ActionError::Config("query missing".to_string()))?;
        let workspace_id = self.target_workspace(config, ctx)?;
        let store_as = str_field(config, "storeResultAs")
            .ok_or_else(|| ActionError::Config("storeResultAs missing".to_string()))?;

        let result = self.client.execute_query(workspace_id, &query).await?;
        let rows = serde_json::to_value(&result.rows).unwrap_or(Value::Null);
        ctx.set_variable(&store_as, rows);
        Ok(json!({ "totalCount": result.total_count, "storeResultAs": store_as }))
    }

    async fn attribute_set(&self, config: &Value, ctx: &mut ExecutionContext) -> Result<Value, ActionError> {
        let item = self.target_item(config, ctx).await?;
        let attribute_name = str_field(config, "attributeName")
            .ok_or_else(|| ActionError::Config("attributeName missing".to_string()))?;
        let value = config.get("value").cloned().unwrap_or(Value::Null);

        let updated = self
            .client
            .update_item(item.id, &json!({ attribute_name.clone(): value.clone() }))
            .await?;
        Ok(json!({
            "itemId": updated.id,
            "itemKey": updated.key,
            "attributeName": attribute_name,
            "value": value,
        }))
    }

    // =========================================================================
    // References and comments
    // =========================================================================

    async fn reference_add(&self, config: &Value, ctx: &mut ExecutionContext) -> Result<Value, ActionError> {
        let from = self.target_item(config, ctx).await?;
        let to_item_id = uuid_field(config, "toItemId")?
            .ok_or_else(|| ActionError::Config("toItemId missing".to_string()))?;
        let kind = str_field(config, "kind").unwrap_or_else(|| "LINK".to_string());
        let label = str_field(config, "label");

        let reference = self
            .client
            .create_reference(from.id, to_item_id, &kind, label.as_deref())
            .await?;
        Ok(json!({ "referenceId": reference.id }))
    }

    async fn reference_remove(&self, config: &Value, ctx: &mut ExecutionContext) -> Result<Value, ActionError> {
        let item = self.target_item(config, ctx).await?;
        let reference_id = uuid_field(config, "referenceId")?
            .ok_or_else(|| ActionError::Config("referenceId missing".to_string()))?;
        self.client.delete_reference(item.id, reference_id).await?;
        Ok(json!({ "deletedReferenceId": reference_id }))
    }

    async fn comment_add(&self, config: &Value, ctx: &mut ExecutionContext) -> Result<Value, ActionError> {
        let item = self.target_item(config, ctx).await?;
        let body = str_field(config, "body")
            .ok_or_else(|| ActionError::Config("body missing".to_string()))?;
        let comment = self.client.add_comment(item.id, &body).await?;
        Ok(json!({ "commentId": comment.id }))
    }

    // =========================================================================
    // Bulk and schema actions
    // =========================================================================

    async fn item_import(&self, config: &Value, ctx: &mut ExecutionContext) -> Result<Value, ActionError> {
        let catalog_id = self.target_catalog(config, ctx.workspace_id).await?;
        let rows = config
            .get("rows")
            .filter(|rows| rows.is_array())
            .ok_or_else(|| ActionError::Config("rows array missing".to_string()))?;
        let key_column = str_field(config, "keyColumn");

        let result = self
            .client
            .import_items(catalog_id, rows, key_column.as_deref())
            .await?;
        Ok(json!({ "created": result.created, "updated": result.updated }))
    }

    async fn catalog_create(&self, config: &Value, ctx: &mut ExecutionContext) -> Result<Value, ActionError> {
        let workspace_id = self.target_workspace(config, ctx)?;
        let name = str_field(config, "name")
            .ok_or_else(|| ActionError::Config("name missing".to_string()))?;
        let catalog = self
            .client
            .create_catalog(workspace_id, &name, config.get("options"))
            .await?;
        Ok(json!({ "catalogId": catalog.id, "catalogName": catalog.name }))
    }

    async fn attribute_create(&self, config: &Value, ctx: &mut ExecutionContext) -> Result<Value, ActionError> {
        let catalog_id = self.target_catalog(config, ctx.workspace_id).await?;
        let name = str_field(config, "name")
            .ok_or_else(|| ActionError::Config("name missing".to_string()))?;
        let attribute_type = str_field(config, "attributeType")
            .ok_or_else(|| ActionError::Config("attributeType missing".to_string()))?;
        let attribute = self
            .client
            .create_attribute(catalog_id, &name, &attribute_type, config.get("options"))
            .await?;
        Ok(json!({ "attributeId": attribute.id }))
    }

    async fn member_add(&self, config: &Value, ctx: &mut ExecutionContext) -> Result<Value, ActionError> {
        let workspace_id = self.target_workspace(config, ctx)?;
        let user_id = uuid_field(config, "userId")?
            .ok_or_else(|| ActionError::Config("userId missing".to_string()))?;
        let role = str_field(config, "role").unwrap_or_else(|| "MEMBER".to_string());
        let member = self
            .client
            .add_workspace_member(workspace_id, user_id, &role)
            .await?;
        Ok(json!({ "memberId": member.id }))
    }

    // =========================================================================
    // Queries, webhooks, control flow
    // =========================================================================

    async fn oql_execute(&self, config: &Value, ctx: &mut ExecutionContext) -> Result<Value, ActionError> {
        let query = str_field(config, "query")
            .ok_or_else(|| ActionError::Config("query missing".to_string()))?;
        let workspace_id = self.target_workspace(config, ctx)?;
        let result = self.client.execute_query(workspace_id, &query).await?;
        let rows = serde_json::to_value(&result.rows).unwrap_or(Value::Null);

        if let Some(store_as) = str_field(config, "storeResultAs") {
            ctx.set_variable(&store_as, rows.clone());
        }
        Ok(json!({
            "totalCount": result.total_count,
            "executionTimeMs": result.execution_time_ms,
            "rows": rows,
        }))
    }

    async fn webhook_send(&self, config: &Value) -> Result<Value, ActionError> {
        let url = str_field(config, "url")
            .ok_or_else(|| ActionError::Config("url missing".to_string()))?;
        let method = str_field(config, "method").unwrap_or_else(|| "POST".to_string());
        let method: reqwest::Method = method
            .to_uppercase()
            .parse()
            .map_err(|_| ActionError::Config(format!("unsupported HTTP method '{}'", method)))?;

        let mut request = self.webhook_http.request(method, &url);
        if let Some(Value::Object(headers)) = config.get("headers") {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        if let Some(body) = config.get("body").filter(|body| !body.is_null()) {
            request = request.json(body);
        }

        let response = request.send().await?;
        Ok(json!({
            "status": response.status().as_u16(),
            "statusText": response.status().canonical_reason().unwrap_or(""),
        }))
    }

    async fn automation_trigger(
        &self,
        config: &Value,
        ctx: &mut ExecutionContext,
        executor: &RuleExecutor,
    ) -> Result<Value, ActionError> {
        let rule_id = uuid_field(config, "ruleId")?
            .or(uuid_field(config, "automationId")?)
            .ok_or_else(|| ActionError::Config("ruleId missing".to_string()))?;

        if ctx.chain_depth + 1 > MAX_CHAIN_DEPTH {
            return Err(ActionError::ChainDepthExceeded);
        }

        executor
            .trigger_chained(rule_id, config.get("parameters").cloned(), ctx.chain_depth + 1)
            .await
            .map_err(|e| ActionError::Other(e.to_string()))?;
        Ok(json!({ "triggeredAutomationId": rule_id }))
    }

    fn variable_set(&self, config: &Value, ctx: &mut ExecutionContext) -> Result<Value, ActionError> {
        let name = str_field(config, "name")
            .ok_or_else(|| ActionError::Config("name missing".to_string()))?;
        let value = config.get("value").cloned().unwrap_or(Value::Null);
        ctx.set_variable(&name, value.clone());
        Ok(json!({ "name": name, "value": value }))
    }

    fn log_message(&self, config: &Value, ctx: &ExecutionContext) -> Result<Value, ActionError> {
        let message = str_field(config, "message").unwrap_or_default();
        info!("[{}] {}", ctx.rule_name, message);
        Ok(json!({ "message": message }))
    }

    async fn refetch_data(&self, ctx: &mut ExecutionContext) -> Result<Value, ActionError> {
        let item = ctx
            .effective_item()
            .cloned()
            .ok_or_else(|| ActionError::Config("no item in execution context".to_string()))?;
        let fresh = self.client.get_item(item.id).await?;

        if ctx
            .trigger
            .item
            .as_ref()
            .map(|triggered| triggered.id == fresh.id)
            .unwrap_or(false)
        {
            ctx.trigger.item = Some(fresh.clone());
        }
        let result = json!({ "itemId": fresh.id, "itemKey": fresh.key });
        ctx.current_item = Some(fresh);
        Ok(result)
    }
}

fn str_field(config: &Value, name: &str) -> Option<String> {
    config
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn uuid_field(config: &Value, name: &str) -> Result<Option<Uuid>, ActionError> {
    match config.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Uuid::parse_str(s)
            .map(Some)
            .map_err(|_| ActionError::Config(format!("'{}' is not a valid id for {}", s, name))),
        Some(other) => Err(ActionError::Config(format!(
            "{} must be a string id, got {}",
            name, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_field_parsing() {
        let config = json!({
            "itemId": "7b6a4d8e-7f90-4a6a-9a5e-111111111111",
            "empty": "",
            "bad": "not-a-uuid",
        });
        assert!(uuid_field(&config, "itemId").unwrap().is_some());
        assert!(uuid_field(&config, "empty").unwrap().is_none());
        assert!(uuid_field(&config, "missing").unwrap().is_none());
        assert!(uuid_field(&config, "bad").is_err());
    }

    #[test]
    fn test_chain_depth_bound() {
        assert_eq!(MAX_CHAIN_DEPTH, 8);
    }
}
