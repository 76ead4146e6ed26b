//! Wire types for the Onstaq REST surface.
//!
//! The upstream serializes everything camelCase; these types mirror that so
//! template paths like `trigger.item.attributeValues.Priority` line up with
//! the raw JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: Uuid,
    #[serde(default)]
    pub key: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMember {
    pub id: Uuid,
    pub user_id: Uuid,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Attribute definition on a catalog. `attribute_type` is the upstream's
/// closed set (TEXT, NUMBER, DATE, STATUS, USER, ...), opaque to the engine
/// except for STATUS which `item.transition` and `status.changed` care about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDef {
    pub id: Uuid,
    pub catalog_id: Uuid,
    pub name: String,
    pub attribute_type: String,
    #[serde(default)]
    pub options: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: Uuid,
    #[serde(default)]
    pub key: Option<String>,
    pub catalog_id: Uuid,
    #[serde(default)]
    pub workspace_id: Option<Uuid>,
    #[serde(default)]
    pub attribute_values: HashMap<String, Value>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Item {
    /// Timestamp to compare against a poll bookmark: updated when present,
    /// created otherwise.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPage {
    pub items: Vec<Item>,
    pub total_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub id: Uuid,
    pub from_item_id: Uuid,
    pub to_item_id: Uuid,
    pub kind: String,
    #[serde(default)]
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One field change inside an UPDATED history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldChange {
    #[serde(default)]
    pub from: Option<Value>,
    #[serde(default)]
    pub to: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: Uuid,
    pub item_id: Uuid,
    /// CREATED, UPDATED, DELETED, REFERENCE_ADDED, REFERENCE_REMOVED, ...
    pub action: String,
    #[serde(default)]
    pub changes: HashMap<String, FieldChange>,
    #[serde(default)]
    pub reference_kind: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: Uuid,
    pub item_id: Uuid,
    pub body: String,
    #[serde(default)]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of an ad-hoc OQL query. Rows are column-name → value maps; the
/// engine never interprets the query text itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub total_count: i64,
    #[serde(default)]
    pub rows: Vec<HashMap<String, Value>>,
    #[serde(default)]
    pub execution_time_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub created: i64,
    pub updated: i64,
}

/// Query-string parameters accepted by upstream list endpoints.
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub search: Option<String>,
    /// Attribute filters, passed through verbatim.
    pub filters: Vec<(String, String)>,
}

impl ListParams {
    /// The window the trigger poller uses: newest first, one page of 20.
    pub fn poll_window(sort_by: &str) -> Self {
        Self {
            sort_by: Some(sort_by.to_string()),
            sort_order: Some("desc".to_string()),
            limit: Some(20),
            ..Default::default()
        }
    }

    pub fn to_query(&self) -> Vec<(String, String)> {
        let mut q = Vec::new();
        if let Some(sort_by) = &self.sort_by {
            q.push(("sortBy".to_string(), sort_by.clone()));
        }
        if let Some(sort_order) = &self.sort_order {
            q.push(("sortOrder".to_string(), sort_order.clone()));
        }
        if let Some(page) = self.page {
            q.push(("page".to_string(), page.to_string()));
        }
        if let Some(limit) = self.limit {
            q.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(search) = &self.search {
            q.push(("search".to_string(), search.clone()));
        }
        q.extend(self.filters.iter().cloned());
        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_window_params() {
        let q = ListParams::poll_window("updatedAt").to_query();
        assert!(q.contains(&("sortBy".to_string(), "updatedAt".to_string())));
        assert!(q.contains(&("sortOrder".to_string(), "desc".to_string())));
        assert!(q.contains(&("limit".to_string(), "20".to_string())));
    }

    #[test]
    fn test_item_deserializes_camel_case() {
        let json = serde_json::json!({
            "id": "7b6a4d8e-7f90-4a6a-9a5e-111111111111",
            "key": "TCK-42",
            "catalogId": "7b6a4d8e-7f90-4a6a-9a5e-222222222222",
            "attributeValues": { "Priority": "High" },
            "createdAt": "2026-01-01T00:00:00Z"
        });
        let item: Item = serde_json::from_value(json).unwrap();
        assert_eq!(item.key.as_deref(), Some("TCK-42"));
        assert_eq!(item.attribute_values["Priority"], "High");
        assert_eq!(item.last_modified(), item.created_at);
    }
}
