//! Condition evaluation: typed leaves under AND/OR/NOT groups.
//!
//! Evaluation never raises: any internal failure makes the condition false
//! and is captured in the diagnostic record.

use regex::Regex;
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

use crate::onstaq::OnstaqClient;
use crate::template::eval::{loose_eq, stringify};
use crate::template::TemplateResolver;

use super::context::ExecutionContext;
use super::rule::{BoolOperator, ConditionLeaf, ConditionNode, ReferenceDirection};

/// Pass/fail plus what was compared, for the execution record.
#[derive(Debug, Clone)]
pub struct ConditionOutcome {
    pub passed: bool,
    pub detail: Value,
}

impl ConditionOutcome {
    fn new(passed: bool, detail: Value) -> Self {
        Self { passed, detail }
    }
}

pub struct ConditionEvaluator {
    client: Option<Arc<OnstaqClient>>,
    resolver: TemplateResolver,
}

type OutcomeFuture<'a> = Pin<Box<dyn Future<Output = ConditionOutcome> + Send + 'a>>;

impl ConditionEvaluator {
    pub fn new(client: Arc<OnstaqClient>, resolver: TemplateResolver) -> Self {
        Self {
            client: Some(client),
            resolver,
        }
    }

    /// Evaluator with no upstream connection; query and reference leaves
    /// evaluate false. Used in tests.
    pub fn detached() -> Self {
        Self {
            client: None,
            resolver: TemplateResolver::detached(),
        }
    }

    /// Evaluate a whole condition tree against the context.
    pub fn evaluate<'a>(&'a self, node: &'a ConditionNode, ctx: &'a ExecutionContext) -> OutcomeFuture<'a> {
        Box::pin(async move {
            match node {
                ConditionNode::Group {
                    operator,
                    conditions,
                } => self.evaluate_group(*operator, conditions, ctx).await,
                ConditionNode::Leaf(leaf) => self.evaluate_leaf(leaf, ctx).await,
            }
        })
    }

    /// Evaluate a list of conditions as an implicit AND (used by if/else).
    pub async fn evaluate_all(&self, nodes: &[ConditionNode], ctx: &ExecutionContext) -> ConditionOutcome {
        let mut details = Vec::new();
        for node in nodes {
            let outcome = self.evaluate(node, ctx).await;
            let passed = outcome.passed;
            details.push(outcome.detail);
            if !passed {
                return ConditionOutcome::new(false, Value::Array(details));
            }
        }
        ConditionOutcome::new(true, Value::Array(details))
    }

    async fn evaluate_group(
        &self,
        operator: BoolOperator,
        conditions: &[ConditionNode],
        ctx: &ExecutionContext,
    ) -> ConditionOutcome {
        let mut details = Vec::new();
        match operator {
            BoolOperator::And => {
                for child in conditions {
                    let outcome = self.evaluate(child, ctx).await;
                    let passed = outcome.passed;
                    details.push(outcome.detail);
                    if !passed {
                        return ConditionOutcome::new(
                            false,
                            json!({ "operator": "AND", "children": details }),
                        );
                    }
                }
                ConditionOutcome::new(true, json!({ "operator": "AND", "children": details }))
            }
            BoolOperator::Or => {
                for child in conditions {
                    let outcome = self.evaluate(child, ctx).await;
                    let passed = outcome.passed;
                    details.push(outcome.detail);
                    if passed {
                        return ConditionOutcome::new(
                            true,
                            json!({ "operator": "OR", "children": details }),
                        );
                    }
                }
                ConditionOutcome::new(false, json!({ "operator": "OR", "children": details }))
            }
            BoolOperator::Not => {
                if conditions.len() != 1 {
                    return ConditionOutcome::new(
                        false,
                        json!({ "operator": "NOT", "error": "NOT requires exactly one child" }),
                    );
                }
                let inner = self.evaluate(&conditions[0], ctx).await;
                ConditionOutcome::new(
                    !inner.passed,
                    json!({ "operator": "NOT", "child": inner.detail }),
                )
            }
        }
    }

    async fn evaluate_leaf(&self, leaf: &ConditionLeaf, ctx: &ExecutionContext) -> ConditionOutcome {
        match leaf {
            ConditionLeaf::Attribute {
                field,
                operator,
                value,
                from,
                to,
            } => {
                let current = ctx
                    .trigger
                    .item
                    .as_ref()
                    .and_then(|item| item.attribute_values.get(field))
                    .cloned()
                    .unwrap_or(Value::Null);
                let previous = ctx
                    .trigger
                    .previous_values
                    .get(field)
                    .cloned()
                    .unwrap_or(Value::Null);

                let passed = attribute_operator(
                    operator,
                    &current,
                    &previous,
                    value.as_ref(),
                    from.as_ref(),
                    to.as_ref(),
                );
                ConditionOutcome::new(
                    passed,
                    json!({
                        "type": "attribute",
                        "field": field,
                        "operator": operator,
                        "current": current,
                        "previous": previous,
                        "passed": passed,
                    }),
                )
            }
            ConditionLeaf::Query {
                query,
                expect_count,
            } => {
                let Some(client) = self.client.as_deref() else {
                    return ConditionOutcome::new(
                        false,
                        json!({ "type": "oql", "error": "no upstream client" }),
                    );
                };
                let rendered = match self.resolver.render(query, ctx).await {
                    Ok(q) => q,
                    Err(e) => {
                        debug!("Query condition template failed: {}", e);
                        return ConditionOutcome::new(
                            false,
                            json!({ "type": "oql", "error": e.to_string() }),
                        );
                    }
                };
                match client.execute_query(ctx.workspace_id, &rendered).await {
                    Ok(result) => {
                        let passed = match expect_count {
                            Some(expected) => result.total_count == *expected,
                            None => result.total_count > 0,
                        };
                        ConditionOutcome::new(
                            passed,
                            json!({
                                "type": "oql",
                                "query": rendered,
                                "totalCount": result.total_count,
                                "passed": passed,
                            }),
                        )
                    }
                    Err(e) => {
                        debug!("Query condition failed: {}", e);
                        ConditionOutcome::new(false, json!({ "type": "oql", "error": e.to_string() }))
                    }
                }
            }
            ConditionLeaf::Reference {
                direction,
                reference_kind,
                exists,
            } => {
                let Some(client) = self.client.as_deref() else {
                    return ConditionOutcome::new(
                        false,
                        json!({ "type": "reference", "error": "no upstream client" }),
                    );
                };
                let Some(item) = ctx.effective_item() else {
                    return ConditionOutcome::new(
                        false,
                        json!({ "type": "reference", "error": "no item in context" }),
                    );
                };

                let fetched = match direction.unwrap_or_default() {
                    ReferenceDirection::Outbound => client.list_references(item.id).await,
                    ReferenceDirection::Inbound => client.list_back_references(item.id).await,
                };
                match fetched {
                    Ok(references) => {
                        let present = references.iter().any(|reference| {
                            reference_kind
                                .as_ref()
                                .map(|kind| reference.kind.eq_ignore_ascii_case(kind))
                                .unwrap_or(true)
                        });
                        let passed = present == *exists;
                        ConditionOutcome::new(
                            passed,
                            json!({
                                "type": "reference",
                                "present": present,
                                "expected": exists,
                                "passed": passed,
                            }),
                        )
                    }
                    Err(e) => ConditionOutcome::new(
                        false,
                        json!({ "type": "reference", "error": e.to_string() }),
                    ),
                }
            }
            ConditionLeaf::Template { template } => match self.resolver.render(template, ctx).await
            {
                Ok(rendered) => {
                    let passed =
                        !matches!(rendered.as_str(), "" | "false" | "0" | "null" | "undefined");
                    ConditionOutcome::new(
                        passed,
                        json!({ "type": "template", "resolved": rendered, "passed": passed }),
                    )
                }
                Err(e) => {
                    debug!("Template condition failed: {}", e);
                    ConditionOutcome::new(
                        false,
                        json!({ "type": "template", "error": e.to_string() }),
                    )
                }
            },
        }
    }
}

fn attribute_operator(
    operator: &str,
    current: &Value,
    previous: &Value,
    value: Option<&Value>,
    from: Option<&Value>,
    to: Option<&Value>,
) -> bool {
    let expected = value.unwrap_or(&Value::Null);
    match operator {
        "equals" => loose_eq(current, expected),
        "not_equals" => !loose_eq(current, expected),
        "contains" => lowered(current).contains(&lowered(expected)),
        "not_contains" => !lowered(current).contains(&lowered(expected)),
        "starts_with" => lowered(current).starts_with(&lowered(expected)),
        "ends_with" => lowered(current).ends_with(&lowered(expected)),
        "greater_than" => numeric(current, expected, |a, b| a > b),
        "less_than" => numeric(current, expected, |a, b| a < b),
        "greater_than_or_equal" => numeric(current, expected, |a, b| a >= b),
        "less_than_or_equal" => numeric(current, expected, |a, b| a <= b),
        "in" => expected
            .as_array()
            .map(|items| items.iter().any(|item| loose_eq(current, item)))
            .unwrap_or(false),
        "not_in" => expected
            .as_array()
            .map(|items| !items.iter().any(|item| loose_eq(current, item)))
            .unwrap_or(true),
        "is_null" => is_nullish(current),
        "is_not_null" => !is_nullish(current),
        "changed_to" => {
            let target = to.unwrap_or(&Value::Null);
            loose_eq(current, target) && !loose_eq(previous, target)
        }
        "changed_from" => {
            let source = from.unwrap_or(&Value::Null);
            loose_eq(previous, source) && !loose_eq(current, source)
        }
        "matches_regex" => match Regex::new(&stringify(expected)) {
            Ok(re) => re.is_match(&stringify(current)),
            Err(_) => false,
        },
        _ => false,
    }
}

fn lowered(value: &Value) -> String {
    stringify(value).to_lowercase()
}

fn is_nullish(value: &Value) -> bool {
    matches!(value, Value::Null) || matches!(value, Value::String(s) if s.is_empty())
}

fn numeric(a: &Value, b: &Value, cmp: fn(f64, f64) -> bool) -> bool {
    let parse = |v: &Value| -> Option<f64> {
        match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    };
    match (parse(a), parse(b)) {
        (Some(x), Some(y)) => cmp(x, y),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::context::TriggerEvent;
    use crate::automation::rule::ConditionLeaf;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn ctx(attributes: Value, previous: HashMap<String, Value>) -> ExecutionContext {
        let item: crate::onstaq::Item = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "catalogId": Uuid::new_v4(),
            "attributeValues": attributes,
            "createdAt": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        let event = TriggerEvent::for_item("item.updated", item).with_previous_values(previous);
        ExecutionContext::new(Uuid::new_v4(), "rule", Uuid::new_v4(), event)
    }

    fn attribute(field: &str, operator: &str, value: Value) -> ConditionNode {
        ConditionNode::Leaf(ConditionLeaf::Attribute {
            field: field.to_string(),
            operator: operator.to_string(),
            value: Some(value),
            from: None,
            to: None,
        })
    }

    #[tokio::test]
    async fn test_loose_equality_is_case_insensitive() {
        let evaluator = ConditionEvaluator::detached();
        let ctx = ctx(json!({ "Priority": "High" }), HashMap::new());

        let outcome = evaluator
            .evaluate(&attribute("Priority", "equals", json!("high")), &ctx)
            .await;
        assert!(outcome.passed);

        let outcome = evaluator
            .evaluate(&attribute("Priority", "not_equals", json!("HIGH")), &ctx)
            .await;
        assert!(!outcome.passed);
    }

    #[tokio::test]
    async fn test_numeric_and_membership_operators() {
        let evaluator = ConditionEvaluator::detached();
        let ctx = ctx(json!({ "Points": "8", "Team": "core" }), HashMap::new());

        assert!(
            evaluator
                .evaluate(&attribute("Points", "greater_than", json!(5)), &ctx)
                .await
                .passed
        );
        assert!(
            !evaluator
                .evaluate(&attribute("Points", "less_than", json!(5)), &ctx)
                .await
                .passed
        );
        assert!(
            evaluator
                .evaluate(&attribute("Team", "in", json!(["Core", "infra"])), &ctx)
                .await
                .passed
        );
    }

    #[tokio::test]
    async fn test_changed_to_and_from() {
        let evaluator = ConditionEvaluator::detached();
        let mut previous = HashMap::new();
        previous.insert("Status".to_string(), json!("Open"));
        let ctx = ctx(json!({ "Status": "Done" }), previous);

        let changed_to = ConditionNode::Leaf(ConditionLeaf::Attribute {
            field: "Status".to_string(),
            operator: "changed_to".to_string(),
            value: None,
            from: None,
            to: Some(json!("done")),
        });
        assert!(evaluator.evaluate(&changed_to, &ctx).await.passed);

        let changed_from = ConditionNode::Leaf(ConditionLeaf::Attribute {
            field: "Status".to_string(),
            operator: "changed_from".to_string(),
            value: None,
            from: Some(json!("open")),
            to: None,
        });
        assert!(evaluator.evaluate(&changed_from, &ctx).await.passed);

        // Already Done before: changed_to must not pass.
        let mut previous = HashMap::new();
        previous.insert("Status".to_string(), json!("Done"));
        let ctx2 = ctx_clone_with(&ctx, previous);
        let changed_to = ConditionNode::Leaf(ConditionLeaf::Attribute {
            field: "Status".to_string(),
            operator: "changed_to".to_string(),
            value: None,
            from: None,
            to: Some(json!("Done")),
        });
        assert!(!evaluator.evaluate(&changed_to, &ctx2).await.passed);
    }

    fn ctx_clone_with(base: &ExecutionContext, previous: HashMap<String, Value>) -> ExecutionContext {
        let mut ctx = base.clone();
        ctx.trigger.previous_values = previous;
        ctx
    }

    #[tokio::test]
    async fn test_null_checks_treat_empty_string_as_null() {
        let evaluator = ConditionEvaluator::detached();
        let ctx = ctx(json!({ "Notes": "" }), HashMap::new());

        assert!(
            evaluator
                .evaluate(&attribute("Notes", "is_null", Value::Null), &ctx)
                .await
                .passed
        );
        assert!(
            evaluator
                .evaluate(&attribute("Missing", "is_null", Value::Null), &ctx)
                .await
                .passed
        );
    }

    #[tokio::test]
    async fn test_unknown_operator_is_false() {
        let evaluator = ConditionEvaluator::detached();
        let ctx = ctx(json!({ "X": 1 }), HashMap::new());
        assert!(
            !evaluator
                .evaluate(&attribute("X", "approximately", json!(1)), &ctx)
                .await
                .passed
        );
    }

    #[tokio::test]
    async fn test_group_short_circuits() {
        let evaluator = ConditionEvaluator::detached();
        let ctx = ctx(json!({ "Priority": "High" }), HashMap::new());

        let or = ConditionNode::Group {
            operator: BoolOperator::Or,
            conditions: vec![
                attribute("Priority", "equals", json!("Low")),
                attribute("Priority", "equals", json!("High")),
            ],
        };
        assert!(evaluator.evaluate(&or, &ctx).await.passed);

        let not = ConditionNode::Group {
            operator: BoolOperator::Not,
            conditions: vec![attribute("Priority", "equals", json!("Low"))],
        };
        assert!(evaluator.evaluate(&not, &ctx).await.passed);
    }

    #[tokio::test]
    async fn test_template_leaf_truthiness() {
        let evaluator = ConditionEvaluator::detached();
        let ctx = ctx(json!({ "Priority": "High" }), HashMap::new());

        let truthy = ConditionNode::Leaf(ConditionLeaf::Template {
            template: "{{trigger.item.attributes.Priority}}".to_string(),
        });
        assert!(evaluator.evaluate(&truthy, &ctx).await.passed);

        let falsy = ConditionNode::Leaf(ConditionLeaf::Template {
            template: "{{trigger.item.attributes.Missing}}".to_string(),
        });
        assert!(!evaluator.evaluate(&falsy, &ctx).await.passed);
    }
}
