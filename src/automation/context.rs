//! Runtime values for one rule execution: the trigger event, the mutable
//! per-run context, and the nested result tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::onstaq::{Item, QueryResult};

use super::rule::ComponentKind;

/// One firing of a rule's trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Item>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub previous_values: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oql_results: Option<QueryResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_time: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            item: None,
            previous_values: HashMap::new(),
            oql_results: None,
            webhook_payload: None,
            manual_parameters: None,
            schedule_time: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_item(event_type: &str, item: Item) -> Self {
        let mut event = Self::new(event_type);
        event.item = Some(item);
        event
    }

    pub fn manual(parameters: Option<Value>) -> Self {
        let mut event = Self::new("manual");
        event.manual_parameters = parameters;
        event
    }

    pub fn scheduled(schedule_time: DateTime<Utc>) -> Self {
        let mut event = Self::new("schedule");
        event.schedule_time = Some(schedule_time);
        event
    }

    pub fn webhook(payload: Value) -> Self {
        let mut event = Self::new("webhook.received");
        event.webhook_payload = Some(payload);
        event
    }

    pub fn oql_match(results: QueryResult) -> Self {
        let mut event = Self::new("oql.match");
        event.oql_results = Some(results);
        event
    }

    pub fn with_previous_values(mut self, previous: HashMap<String, Value>) -> Self {
        self.previous_values = previous;
        self
    }
}

/// Mutable state carried through one execution.
///
/// Branch iterations derive children with [`ExecutionContext::branch_child`]:
/// `variables` stays shared (writes in one iteration are visible to the
/// next), `component_results` starts empty, `created_items` is copied and
/// merged back after the iteration.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub workspace_id: Uuid,
    pub trigger: TriggerEvent,
    pub component_results: Vec<ComponentResult>,
    pub variables: Arc<Mutex<HashMap<String, Value>>>,
    pub created_items: Vec<Item>,
    pub current_item: Option<Item>,
    pub started_at: DateTime<Utc>,
    /// How many `automation.trigger` hops led to this run.
    pub chain_depth: u32,
}

impl ExecutionContext {
    pub fn new(rule_id: Uuid, rule_name: &str, workspace_id: Uuid, trigger: TriggerEvent) -> Self {
        let current_item = trigger.item.clone();
        Self {
            rule_id,
            rule_name: rule_name.to_string(),
            workspace_id,
            trigger,
            component_results: Vec::new(),
            variables: Arc::new(Mutex::new(HashMap::new())),
            created_items: Vec::new(),
            current_item,
            started_at: Utc::now(),
            chain_depth: 0,
        }
    }

    /// The item actions operate on: the branch iteration target when inside
    /// a branch, the triggering item otherwise.
    pub fn effective_item(&self) -> Option<&Item> {
        self.current_item.as_ref().or(self.trigger.item.as_ref())
    }

    /// Derive the context for one branch iteration.
    pub fn branch_child(&self, item: Item) -> Self {
        let mut child = self.clone();
        child.current_item = Some(item);
        child.component_results = Vec::new();
        child
    }

    /// Merge items created during a branch iteration back into this context,
    /// deduplicated by id.
    pub fn absorb_created_items(&mut self, child: &ExecutionContext) {
        for item in &child.created_items {
            if !self.created_items.iter().any(|existing| existing.id == item.id) {
                self.created_items.push(item.clone());
            }
        }
    }

    pub fn set_variable(&self, name: &str, value: Value) {
        if let Ok(mut variables) = self.variables.lock() {
            variables.insert(name.to_string(), value);
        }
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.lock().ok()?.get(name).cloned()
    }

    /// Snapshot of the variables map as a JSON object.
    pub fn variables_snapshot(&self) -> Value {
        match self.variables.lock() {
            Ok(variables) => Value::Object(
                variables
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            Err(_) => Value::Object(Default::default()),
        }
    }

    pub fn push_created_item(&mut self, item: Item) {
        if !self.created_items.iter().any(|existing| existing.id == item.id) {
            self.created_items.push(item);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Success,
    Failed,
    Skipped,
}

/// Nested record mirroring the program tree for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentResult {
    pub component_id: String,
    pub component_type: ComponentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    pub status: ComponentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ComponentResult>,
}

impl ComponentResult {
    pub fn new(component_id: &str, component_type: ComponentKind, status: ComponentStatus) -> Self {
        Self {
            component_id: component_id.to_string(),
            component_type,
            action_type: None,
            status,
            result: None,
            error: None,
            duration_ms: 0,
            children: Vec::new(),
        }
    }

    /// True if this result or any descendant is failed.
    pub fn has_failed_leaf(&self) -> bool {
        self.status == ComponentStatus::Failed
            || self.children.iter().any(ComponentResult::has_failed_leaf)
    }

    /// First error message in pre-order traversal.
    pub fn first_error(&self) -> Option<&str> {
        if let Some(error) = self.error.as_deref() {
            return Some(error);
        }
        self.children.iter().find_map(ComponentResult::first_error)
    }
}

/// Find the first error across an ordered result list, pre-order.
pub fn first_error_in(results: &[ComponentResult]) -> Option<String> {
    results
        .iter()
        .find_map(|result| result.first_error().map(str::to_string))
}

/// Overall run status: FAILED iff any leaf failed.
pub fn any_failed(results: &[ComponentResult]) -> bool {
    results.iter().any(ComponentResult::has_failed_leaf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "SKIPPED")]
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// A persisted execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub status: ExecutionStatus,
    pub trigger_data: TriggerEvent,
    #[serde(default)]
    pub component_results: Vec<ComponentResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, status: ComponentStatus) -> ComponentResult {
        ComponentResult::new(id, ComponentKind::Action, status)
    }

    #[test]
    fn test_failed_leaf_detection_is_recursive() {
        let mut branch = ComponentResult::new("b1", ComponentKind::Branch, ComponentStatus::Success);
        branch.children.push(result("a1", ComponentStatus::Success));
        assert!(!any_failed(&[branch.clone()]));

        branch.children.push({
            let mut failed = result("a2", ComponentStatus::Failed);
            failed.error = Some("boom".to_string());
            failed
        });
        assert!(any_failed(&[branch.clone()]));
        assert_eq!(first_error_in(&[branch]).as_deref(), Some("boom"));
    }

    #[test]
    fn test_first_error_is_pre_order() {
        let mut outer = ComponentResult::new("b1", ComponentKind::IfElse, ComponentStatus::Success);
        let mut inner_failed = result("a1", ComponentStatus::Failed);
        inner_failed.error = Some("first".to_string());
        outer.children.push(inner_failed);

        let mut later = result("a2", ComponentStatus::Failed);
        later.error = Some("second".to_string());

        assert_eq!(
            first_error_in(&[outer, later]).as_deref(),
            Some("first")
        );
    }

    #[test]
    fn test_branch_child_shares_variables() {
        let ctx = ExecutionContext::new(
            Uuid::new_v4(),
            "rule",
            Uuid::new_v4(),
            TriggerEvent::manual(None),
        );
        ctx.set_variable("count", serde_json::json!(1));

        let item: Item = serde_json::from_value(serde_json::json!({
            "id": Uuid::new_v4(),
            "catalogId": Uuid::new_v4(),
            "createdAt": "2026-01-01T00:00:00Z"
        }))
        .unwrap();

        let child = ctx.branch_child(item);
        child.set_variable("count", serde_json::json!(2));
        assert_eq!(ctx.get_variable("count"), Some(serde_json::json!(2)));
        assert!(child.component_results.is_empty());
    }

    #[test]
    fn test_execution_status_round_trip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Skipped,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
        let json = serde_json::to_value(ExecutionStatus::Failed).unwrap();
        assert_eq!(json, "FAILED");
    }
}
