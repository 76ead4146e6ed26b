//! Persisted automation rule model: trigger declaration plus component tree.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use chrono::{DateTime, Utc};

/// A persisted automation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub workspace_id: Uuid,
    #[serde(default)]
    pub workspace_key: Option<String>,
    pub enabled: bool,
    pub trigger: Trigger,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub execution_order: i32,
    #[serde(default)]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Trigger declaration. The tag strings are the wire/storage format and are
/// also what `TriggerEvent.event_type` carries at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Trigger {
    #[serde(rename = "item.created", rename_all = "camelCase")]
    ItemCreated { catalog_id: Uuid },
    #[serde(rename = "item.updated", rename_all = "camelCase")]
    ItemUpdated { catalog_id: Uuid },
    #[serde(rename = "item.deleted", rename_all = "camelCase")]
    ItemDeleted { catalog_id: Uuid },
    #[serde(rename = "attribute.changed", rename_all = "camelCase")]
    AttributeChanged {
        catalog_id: Uuid,
        attribute_name: String,
    },
    #[serde(rename = "status.changed", rename_all = "camelCase")]
    StatusChanged {
        #[serde(default)]
        catalog_id: Option<Uuid>,
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        to: Option<String>,
    },
    #[serde(rename = "reference.added", rename_all = "camelCase")]
    ReferenceAdded {
        catalog_id: Uuid,
        #[serde(default)]
        reference_kind: Option<String>,
    },
    #[serde(rename = "item.linked", rename_all = "camelCase")]
    ItemLinked {
        catalog_id: Uuid,
        #[serde(default)]
        reference_kind: Option<String>,
    },
    #[serde(rename = "item.unlinked", rename_all = "camelCase")]
    ItemUnlinked {
        catalog_id: Uuid,
        #[serde(default)]
        reference_kind: Option<String>,
    },
    #[serde(rename = "item.commented", rename_all = "camelCase")]
    ItemCommented { catalog_id: Uuid },
    #[serde(rename = "oql.match", rename_all = "camelCase")]
    OqlMatch {
        query: String,
        #[serde(default)]
        trigger_on: OqlTriggerPolicy,
    },
    #[serde(rename = "schedule", rename_all = "camelCase")]
    Schedule {
        cron: String,
        #[serde(default)]
        timezone: Option<String>,
    },
    #[serde(rename = "manual")]
    Manual {},
    #[serde(rename = "webhook.received", rename_all = "camelCase")]
    WebhookReceived {
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        secret: Option<String>,
        #[serde(default)]
        filter: Option<HashMap<String, Value>>,
    },
}

impl Trigger {
    /// The tag string, identical to the serialized `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::ItemCreated { .. } => "item.created",
            Trigger::ItemUpdated { .. } => "item.updated",
            Trigger::ItemDeleted { .. } => "item.deleted",
            Trigger::AttributeChanged { .. } => "attribute.changed",
            Trigger::StatusChanged { .. } => "status.changed",
            Trigger::ReferenceAdded { .. } => "reference.added",
            Trigger::ItemLinked { .. } => "item.linked",
            Trigger::ItemUnlinked { .. } => "item.unlinked",
            Trigger::ItemCommented { .. } => "item.commented",
            Trigger::OqlMatch { .. } => "oql.match",
            Trigger::Schedule { .. } => "schedule",
            Trigger::Manual {} => "manual",
            Trigger::WebhookReceived { .. } => "webhook.received",
        }
    }

    /// Whether this trigger is driven by the periodic poller.
    pub fn is_polling(&self) -> bool {
        !matches!(
            self,
            Trigger::Schedule { .. } | Trigger::Manual {} | Trigger::WebhookReceived { .. }
        )
    }
}

/// Firing policy for `oql.match` triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OqlTriggerPolicy {
    #[default]
    AnyResults,
    NewResults,
    CountChange,
}

/// One node in a rule's program tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub id: String,
    pub component_type: ComponentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<Branch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_else: Option<IfElse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Action,
    Condition,
    Branch,
    IfElse,
}

/// A single action invocation. `action_type` stays a string so that rows
/// written by newer deployments still load; unknown types fail at run time,
/// not at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub continue_on_error: bool,
}

/// Condition tree node: either a boolean group or a typed leaf.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionNode {
    Group {
        operator: BoolOperator,
        conditions: Vec<ConditionNode>,
    },
    Leaf(ConditionLeaf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoolOperator {
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
    #[serde(rename = "NOT", alias = "not")]
    Not,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConditionLeaf {
    #[serde(rename = "attribute", rename_all = "camelCase")]
    Attribute {
        field: String,
        operator: String,
        #[serde(default)]
        value: Option<Value>,
        #[serde(default)]
        from: Option<Value>,
        #[serde(default)]
        to: Option<Value>,
    },
    #[serde(rename = "oql", rename_all = "camelCase")]
    Query {
        query: String,
        #[serde(default)]
        expect_count: Option<i64>,
    },
    #[serde(rename = "reference", rename_all = "camelCase")]
    Reference {
        #[serde(default)]
        direction: Option<ReferenceDirection>,
        #[serde(default)]
        reference_kind: Option<String>,
        exists: bool,
    },
    #[serde(rename = "template")]
    Template { template: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceDirection {
    #[default]
    Outbound,
    Inbound,
}

/// Iteration branch. The kind decides the item source; `components` run once
/// per iterated item with `current_item` rebound.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub branch_type: BranchKind,
    #[serde(default)]
    pub direction: Option<ReferenceDirection>,
    #[serde(default)]
    pub reference_kind: Option<String>,
    #[serde(default)]
    pub catalog_id: Option<Uuid>,
    #[serde(default)]
    pub oql_query: Option<String>,
    #[serde(default)]
    pub components: Vec<Component>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchKind {
    RelatedItems,
    CreatedItems,
    LookupItems,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IfElse {
    #[serde(default)]
    pub conditions: Vec<ConditionNode>,
    #[serde(default)]
    pub then: Vec<Component>,
    #[serde(default, rename = "else")]
    pub otherwise: Vec<Component>,
}

/// The closed set of action types the runner understands.
pub const KNOWN_ACTION_TYPES: &[&str] = &[
    "item.create",
    "item.update",
    "item.delete",
    "item.clone",
    "item.transition",
    "item.lookup",
    "attribute.set",
    "reference.add",
    "reference.remove",
    "comment.add",
    "item.import",
    "catalog.create",
    "attribute.create",
    "workspace.member.add",
    "oql.execute",
    "webhook.send",
    "automation.trigger",
    "variable.set",
    "log",
    "refetch_data",
];

/// Validate a rule's program before it is persisted. Returns every problem
/// found, not just the first.
pub fn validate_rule(rule: &Rule) -> Result<(), Vec<String>> {
    let mut problems = Vec::new();
    validate_components(&rule.components, &mut problems);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

fn validate_components(components: &[Component], problems: &mut Vec<String>) {
    for component in components {
        match component.component_type {
            ComponentKind::Action => match &component.action {
                Some(action) => {
                    if !KNOWN_ACTION_TYPES.contains(&action.action_type.as_str()) {
                        problems.push(format!(
                            "component '{}': unknown action type '{}'",
                            component.id, action.action_type
                        ));
                    }
                }
                None => problems.push(format!(
                    "component '{}': action payload missing",
                    component.id
                )),
            },
            ComponentKind::Condition => match &component.condition {
                Some(condition) => validate_condition(condition, &component.id, problems),
                None => problems.push(format!(
                    "component '{}': condition payload missing",
                    component.id
                )),
            },
            ComponentKind::Branch => match &component.branch {
                Some(branch) => {
                    if branch.branch_type == BranchKind::LookupItems && branch.oql_query.is_none() {
                        problems.push(format!(
                            "component '{}': lookup_items branch requires oqlQuery",
                            component.id
                        ));
                    }
                    validate_components(&branch.components, problems);
                }
                None => problems.push(format!(
                    "component '{}': branch payload missing",
                    component.id
                )),
            },
            ComponentKind::IfElse => match &component.if_else {
                Some(if_else) => {
                    for condition in &if_else.conditions {
                        validate_condition(condition, &component.id, problems);
                    }
                    validate_components(&if_else.then, problems);
                    validate_components(&if_else.otherwise, problems);
                }
                None => problems.push(format!(
                    "component '{}': ifElse payload missing",
                    component.id
                )),
            },
        }
    }
}

fn validate_condition(node: &ConditionNode, component_id: &str, problems: &mut Vec<String>) {
    match node {
        ConditionNode::Group {
            operator,
            conditions,
        } => {
            match operator {
                BoolOperator::Not if conditions.len() != 1 => problems.push(format!(
                    "component '{}': NOT requires exactly one child, got {}",
                    component_id,
                    conditions.len()
                )),
                BoolOperator::And | BoolOperator::Or if conditions.is_empty() => problems.push(
                    format!("component '{}': {:?} requires at least one child", component_id, operator),
                ),
                _ => {}
            }
            for child in conditions {
                validate_condition(child, component_id, problems);
            }
        }
        ConditionNode::Leaf(_) => {}
    }
}

/// Rebuild a component tree from the legacy `(conditions, actions)` pair:
/// the condition tree becomes a single leading condition component, the
/// actions follow in order.
pub fn components_from_legacy(
    conditions: Option<ConditionNode>,
    actions: Vec<ActionSpec>,
) -> Vec<Component> {
    let mut components = Vec::new();
    if let Some(condition) = conditions {
        components.push(Component {
            id: "condition-1".to_string(),
            component_type: ComponentKind::Condition,
            action: None,
            condition: Some(condition),
            branch: None,
            if_else: None,
        });
    }
    for (index, action) in actions.into_iter().enumerate() {
        components.push(Component {
            id: format!("action-{}", index + 1),
            component_type: ComponentKind::Action,
            action: Some(action),
            condition: None,
            branch: None,
            if_else: None,
        });
    }
    components
}

impl Component {
    pub fn action(id: &str, action: ActionSpec) -> Self {
        Self {
            id: id.to_string(),
            component_type: ComponentKind::Action,
            action: Some(action),
            condition: None,
            branch: None,
            if_else: None,
        }
    }

    pub fn condition(id: &str, condition: ConditionNode) -> Self {
        Self {
            id: id.to_string(),
            component_type: ComponentKind::Condition,
            action: None,
            condition: Some(condition),
            branch: None,
            if_else: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rule(components: Vec<Component>) -> Rule {
        Rule {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            description: None,
            workspace_id: Uuid::new_v4(),
            workspace_key: None,
            enabled: true,
            trigger: Trigger::Manual {},
            components,
            execution_order: 0,
            created_by: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn test_trigger_round_trips_with_dotted_tag() {
        let trigger = Trigger::ItemCreated {
            catalog_id: Uuid::new_v4(),
        };
        let json = serde_json::to_value(&trigger).unwrap();
        assert_eq!(json["type"], "item.created");
        let back: Trigger = serde_json::from_value(json).unwrap();
        assert_eq!(back, trigger);
        assert_eq!(back.kind(), "item.created");
    }

    #[test]
    fn test_oql_trigger_defaults_to_any_results() {
        let json = serde_json::json!({ "type": "oql.match", "query": "FROM Ticket" });
        let trigger: Trigger = serde_json::from_value(json).unwrap();
        match trigger {
            Trigger::OqlMatch { trigger_on, .. } => {
                assert_eq!(trigger_on, OqlTriggerPolicy::AnyResults)
            }
            other => panic!("unexpected trigger: {:?}", other),
        }
    }

    #[test]
    fn test_condition_node_untagged_shapes() {
        let group_json = serde_json::json!({
            "operator": "AND",
            "conditions": [
                { "type": "attribute", "field": "Priority", "operator": "equals", "value": "High" },
                { "type": "template", "template": "{{variables.flag}}" }
            ]
        });
        let node: ConditionNode = serde_json::from_value(group_json).unwrap();
        match node {
            ConditionNode::Group {
                operator,
                conditions,
            } => {
                assert_eq!(operator, BoolOperator::And);
                assert_eq!(conditions.len(), 2);
            }
            _ => panic!("expected group"),
        }

        let leaf_json = serde_json::json!({
            "type": "attribute", "field": "Status", "operator": "changed_to", "to": "Done"
        });
        let leaf: ConditionNode = serde_json::from_value(leaf_json).unwrap();
        assert!(matches!(leaf, ConditionNode::Leaf(_)));
    }

    #[test]
    fn test_not_arity_validation() {
        let leaf = ConditionNode::Leaf(ConditionLeaf::Template {
            template: "{{x}}".to_string(),
        });
        let bad = ConditionNode::Group {
            operator: BoolOperator::Not,
            conditions: vec![leaf.clone(), leaf.clone()],
        };
        let rule = sample_rule(vec![Component::condition("c1", bad)]);
        let problems = validate_rule(&rule).unwrap_err();
        assert!(problems[0].contains("NOT requires exactly one child"));

        let ok = ConditionNode::Group {
            operator: BoolOperator::Not,
            conditions: vec![leaf],
        };
        let rule = sample_rule(vec![Component::condition("c1", ok)]);
        assert!(validate_rule(&rule).is_ok());
    }

    #[test]
    fn test_unknown_action_type_rejected() {
        let action = ActionSpec {
            action_type: "item.explode".to_string(),
            name: None,
            config: Value::Null,
            continue_on_error: false,
        };
        let rule = sample_rule(vec![Component::action("a1", action)]);
        let problems = validate_rule(&rule).unwrap_err();
        assert!(problems[0].contains("unknown action type"));
    }

    #[test]
    fn test_legacy_pair_migration_order() {
        let condition = ConditionNode::Leaf(ConditionLeaf::Template {
            template: "{{trigger.item}}".to_string(),
        });
        let actions = vec![
            ActionSpec {
                action_type: "log".to_string(),
                name: None,
                config: serde_json::json!({ "message": "one" }),
                continue_on_error: false,
            },
            ActionSpec {
                action_type: "log".to_string(),
                name: None,
                config: serde_json::json!({ "message": "two" }),
                continue_on_error: false,
            },
        ];
        let components = components_from_legacy(Some(condition), actions);
        assert_eq!(components.len(), 3);
        assert_eq!(components[0].component_type, ComponentKind::Condition);
        assert_eq!(components[1].id, "action-1");
        assert_eq!(components[2].id, "action-2");
    }
}
