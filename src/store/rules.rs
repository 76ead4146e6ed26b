//! Rule persistence. Reads accept both the unified `components` tree and the
//! legacy `(conditions, actions)` pair; writes always emit `components` and
//! clear the legacy columns.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::automation::rule::{components_from_legacy, Component, Rule, Trigger};

type RuleRow = (
    Uuid,                  // id
    String,                // name
    Option<String>,        // description
    Uuid,                  // workspace_id
    Option<String>,        // workspace_key
    bool,                  // enabled
    Value,                 // trigger
    Option<Value>,         // components
    Option<Value>,         // conditions (legacy)
    Option<Value>,         // actions (legacy)
    i32,                   // execution_order
    Option<String>,        // created_by
    DateTime<Utc>,         // created_at
    Option<DateTime<Utc>>, // updated_at
);

const SELECT_COLUMNS: &str = "id, name, description, workspace_id, workspace_key, enabled, \
     trigger, components, conditions, actions, execution_order, created_by, created_at, updated_at";

#[derive(Clone)]
pub struct RuleStore {
    pool: PgPool,
}

impl RuleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<Rule>, sqlx::Error> {
        let rows: Vec<RuleRow> = sqlx::query_as(&format!(
            "SELECT {} FROM automations ORDER BY execution_order ASC, created_at ASC",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(row_to_rule).collect())
    }

    pub async fn list_enabled(&self) -> Result<Vec<Rule>, sqlx::Error> {
        let rows: Vec<RuleRow> = sqlx::query_as(&format!(
            "SELECT {} FROM automations WHERE enabled = true ORDER BY execution_order ASC, created_at ASC",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(row_to_rule).collect())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Rule>, sqlx::Error> {
        let row: Option<RuleRow> = sqlx::query_as(&format!(
            "SELECT {} FROM automations WHERE id = $1",
            SELECT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(row_to_rule))
    }

    /// Insert a rule. Always writes the unified `components` shape.
    pub async fn insert(&self, rule: &Rule) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO automations
            (id, name, description, workspace_id, workspace_key, enabled, trigger, components,
             execution_order, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(rule.workspace_id)
        .bind(&rule.workspace_key)
        .bind(rule.enabled)
        .bind(serde_json::to_value(&rule.trigger).unwrap_or(Value::Null))
        .bind(serde_json::to_value(&rule.components).unwrap_or(Value::Null))
        .bind(rule.execution_order)
        .bind(&rule.created_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Update a rule. Legacy rows are migrated: the legacy columns are
    /// cleared and the components tree becomes the single source of truth.
    pub async fn update(&self, rule: &Rule) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE automations
            SET name = $2, description = $3, workspace_id = $4, workspace_key = $5,
                enabled = $6, trigger = $7, components = $8,
                conditions = NULL, actions = NULL,
                execution_order = $9, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(rule.workspace_id)
        .bind(&rule.workspace_key)
        .bind(rule.enabled)
        .bind(serde_json::to_value(&rule.trigger).unwrap_or(Value::Null))
        .bind(serde_json::to_value(&rule.components).unwrap_or(Value::Null))
        .bind(rule.execution_order)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE automations SET enabled = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM automations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_rule(row: RuleRow) -> Option<Rule> {
    let (
        id,
        name,
        description,
        workspace_id,
        workspace_key,
        enabled,
        trigger,
        components,
        legacy_conditions,
        legacy_actions,
        execution_order,
        created_by,
        created_at,
        updated_at,
    ) = row;

    let trigger: Trigger = match serde_json::from_value(trigger) {
        Ok(trigger) => trigger,
        Err(e) => {
            warn!("Skipping automation {}: undecodable trigger: {}", id, e);
            return None;
        }
    };

    let components = decode_components(id, components, legacy_conditions, legacy_actions);

    Some(Rule {
        id,
        name,
        description,
        workspace_id,
        workspace_key,
        enabled,
        trigger,
        components,
        execution_order,
        created_by,
        created_at,
        updated_at,
    })
}

fn decode_components(
    id: Uuid,
    components: Option<Value>,
    legacy_conditions: Option<Value>,
    legacy_actions: Option<Value>,
) -> Vec<Component> {
    if let Some(value) = components {
        if !value.is_null() {
            match serde_json::from_value(value) {
                Ok(components) => return components,
                Err(e) => {
                    warn!("Automation {}: undecodable components: {}", id, e);
                    return Vec::new();
                }
            }
        }
    }

    // Legacy shape: conditions tree + flat action list.
    let conditions = legacy_conditions
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v).ok());
    let actions = legacy_actions
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    components_from_legacy(conditions, actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_prefers_components_over_legacy() {
        let id = Uuid::new_v4();
        let components = json!([
            { "id": "a1", "componentType": "action",
              "action": { "type": "log", "config": { "message": "hi" } } }
        ]);
        let decoded = decode_components(id, Some(components), None, None);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].id, "a1");
    }

    #[test]
    fn test_decode_migrates_legacy_pair() {
        let id = Uuid::new_v4();
        let conditions = json!({
            "type": "attribute", "field": "Priority", "operator": "equals", "value": "High"
        });
        let actions = json!([
            { "type": "log", "config": { "message": "hi" } },
            { "type": "comment.add", "config": { "body": "ok" } }
        ]);
        let decoded = decode_components(id, None, Some(conditions), Some(actions));
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].id, "condition-1");
        assert_eq!(
            decoded[2].action.as_ref().unwrap().action_type,
            "comment.add"
        );
    }
}
