//! Rule program execution: the concurrency gate, the component walk, and
//! execution record bookkeeping.

use serde::Serialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::onstaq::{Item, OnstaqClient, OnstaqError};
use crate::store::{ExecutionStore, RuleStore};
use crate::template::TemplateResolver;

use super::actions::ActionRunner;
use super::conditions::ConditionEvaluator;
use super::context::{
    any_failed, first_error_in, ComponentResult, ComponentStatus, ExecutionContext,
    ExecutionStatus, TriggerEvent,
};
use super::rule::{
    Branch, BranchKind, Component, ComponentKind, ConditionLeaf, ConditionNode,
    ReferenceDirection, Rule,
};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Automation {0} not found")]
    RuleNotFound(Uuid),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Upstream error: {0}")]
    Upstream(#[from] OnstaqError),
    #[error("Template error: {0}")]
    Template(#[from] crate::template::TemplateError),
    #[error("Executor is stopped")]
    Stopped,
}

/// Outcome of a dry run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcome {
    pub would_execute_components: Vec<String>,
}

type BoxedFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Walks rule programs under a global concurrency cap. All trigger sources
/// (pollers, cron, webhooks, manual calls) funnel through [`Self::execute`].
pub struct RuleExecutor {
    rules: RuleStore,
    executions: ExecutionStore,
    client: Arc<OnstaqClient>,
    resolver: TemplateResolver,
    actions: ActionRunner,
    conditions: ConditionEvaluator,
    semaphore: Arc<Semaphore>,
    active: AtomicUsize,
    running: AtomicBool,
}

impl RuleExecutor {
    pub fn new(pool: PgPool, client: Arc<OnstaqClient>, max_concurrent: usize) -> Self {
        let resolver = TemplateResolver::new(client.clone());
        Self {
            rules: RuleStore::new(pool.clone()),
            executions: ExecutionStore::new(pool),
            client: client.clone(),
            resolver: resolver.clone(),
            actions: ActionRunner::new(client.clone(), resolver.clone()),
            conditions: ConditionEvaluator::new(client, resolver),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            active: AtomicUsize::new(0),
            running: AtomicBool::new(true),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Stop accepting new executions and wait up to 30 seconds for in-flight
    /// runs to drain. Runs in progress are never interrupted.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + std::time::Duration::from_secs(30);
        while self.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        let remaining = self.active.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!("Executor stopped with {} executions still in flight", remaining);
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Run one rule for one trigger event. Blocks until a slot in the gate
    /// frees up (FIFO admission) and the execution record is finalized.
    pub async fn execute(&self, rule: &Rule, event: TriggerEvent) -> Result<Uuid, ExecutorError> {
        self.execute_chained(rule, event, 0).await
    }

    pub(crate) async fn execute_chained(
        &self,
        rule: &Rule,
        event: TriggerEvent,
        chain_depth: u32,
    ) -> Result<Uuid, ExecutorError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ExecutorError::Stopped);
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExecutorError::Stopped)?;
        self.active.fetch_add(1, Ordering::SeqCst);

        let execution_id = Uuid::new_v4();
        let outcome = self.run_one(execution_id, rule, event, chain_depth).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        match outcome {
            Ok(()) => Ok(execution_id),
            Err(e) => {
                // The run must never stay RUNNING.
                let _ = self
                    .executions
                    .finalize(execution_id, ExecutionStatus::Failed, &[], Some(&e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    async fn run_one(
        &self,
        execution_id: Uuid,
        rule: &Rule,
        event: TriggerEvent,
        chain_depth: u32,
    ) -> Result<(), ExecutorError> {
        self.executions
            .insert_pending(execution_id, rule.id, &event)
            .await?;
        self.executions.mark_running(execution_id).await?;

        let mut ctx = ExecutionContext::new(rule.id, &rule.name, rule.workspace_id, event);
        ctx.chain_depth = chain_depth;

        let results = self.execute_components(&rule.components, &mut ctx).await;

        let status = if any_failed(&results) {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Success
        };
        let first_error = first_error_in(&results);

        self.executions
            .finalize(execution_id, status, &results, first_error.as_deref())
            .await?;

        match status {
            ExecutionStatus::Failed => warn!(
                "Automation '{}' execution {} finished FAILED: {}",
                rule.name,
                execution_id,
                first_error.as_deref().unwrap_or("unknown error")
            ),
            _ => info!(
                "Automation '{}' execution {} finished {}",
                rule.name,
                execution_id,
                status.as_str()
            ),
        }
        Ok(())
    }

    /// Manual trigger: build a `manual` event, optionally resolving an item
    /// from the caller's parameters, and run to completion.
    pub fn trigger_manually<'a>(
        &'a self,
        rule_id: Uuid,
        parameters: Option<Value>,
    ) -> BoxedFuture<'a, Result<Uuid, ExecutorError>> {
        self.trigger_chained(rule_id, parameters, 0)
    }

    /// Entry point for `automation.trigger` chains. Boxed so the
    /// executor → action runner → executor recursion has a finite type.
    pub(crate) fn trigger_chained<'a>(
        &'a self,
        rule_id: Uuid,
        parameters: Option<Value>,
        chain_depth: u32,
    ) -> BoxedFuture<'a, Result<Uuid, ExecutorError>> {
        Box::pin(async move {
            let rule = self
                .rules
                .get(rule_id)
                .await?
                .ok_or(ExecutorError::RuleNotFound(rule_id))?;

            let mut event = TriggerEvent::manual(parameters.clone());
            if let Some(params) = &parameters {
                if let Some(item_id) = params
                    .get("itemId")
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok())
                {
                    event.item = Some(self.client.get_item(item_id).await?);
                } else if let Some(key) = params.get("itemKey").and_then(Value::as_str) {
                    event.item = self
                        .client
                        .find_item_by_key(rule.workspace_id, key)
                        .await?;
                }
            }

            self.execute_chained(&rule, event, chain_depth).await
        })
    }

    /// Dry run: outline what the program would execute. No side effects.
    pub async fn test(
        &self,
        rule_id: Uuid,
        _mock_trigger_data: Option<Value>,
    ) -> Result<TestOutcome, ExecutorError> {
        let rule = self
            .rules
            .get(rule_id)
            .await?
            .ok_or(ExecutorError::RuleNotFound(rule_id))?;

        let mut outline = Vec::new();
        outline_components(&rule.components, 0, &mut outline);
        Ok(TestOutcome {
            would_execute_components: outline,
        })
    }

    // =========================================================================
    // Component walk
    // =========================================================================

    /// Execute a sibling list in order. A false condition or a failed action
    /// (without `continue_on_error`) halts the remaining siblings; branches
    /// and if/else blocks only aggregate their descendants' failures.
    fn execute_components<'a>(
        &'a self,
        components: &'a [Component],
        ctx: &'a mut ExecutionContext,
    ) -> BoxedFuture<'a, Vec<ComponentResult>> {
        Box::pin(async move {
            // `action[n]` indexes into the current sibling list only.
            let parent_results = std::mem::take(&mut ctx.component_results);

            let mut results = Vec::new();
            for component in components {
                let started = Instant::now();
                let (mut result, halt) = self.execute_component(component, ctx).await;
                result.duration_ms = started.elapsed().as_millis() as i64;

                ctx.component_results.push(result.clone());
                results.push(result);
                if halt {
                    break;
                }
            }

            ctx.component_results = parent_results;
            results
        })
    }

    async fn execute_component(
        &self,
        component: &Component,
        ctx: &mut ExecutionContext,
    ) -> (ComponentResult, bool) {
        match component.component_type {
            ComponentKind::Action => {
                let Some(spec) = &component.action else {
                    return (
                        failed_result(component, "action payload missing"),
                        true,
                    );
                };
                info!(
                    "Executing action '{}' ({})",
                    spec.name.as_deref().unwrap_or(&component.id),
                    spec.action_type
                );

                let mut result = ComponentResult::new(
                    &component.id,
                    ComponentKind::Action,
                    ComponentStatus::Success,
                );
                result.action_type = Some(spec.action_type.clone());

                match self.actions.run(spec, ctx, self).await {
                    Ok(output) => {
                        result.result = Some(output);
                        (result, false)
                    }
                    Err(e) => {
                        error!("Action '{}' failed: {}", component.id, e);
                        result.status = ComponentStatus::Failed;
                        result.error = Some(e.to_string());
                        (result, !spec.continue_on_error)
                    }
                }
            }
            ComponentKind::Condition => {
                let Some(condition) = &component.condition else {
                    return (
                        failed_result(component, "condition payload missing"),
                        true,
                    );
                };
                let outcome = self.conditions.evaluate(condition, ctx).await;
                let mut result = ComponentResult::new(
                    &component.id,
                    ComponentKind::Condition,
                    if outcome.passed {
                        ComponentStatus::Success
                    } else {
                        ComponentStatus::Skipped
                    },
                );
                result.result = Some(outcome.detail);
                // A false condition stops the surrounding sequence.
                (result, !outcome.passed)
            }
            ComponentKind::Branch => {
                let Some(branch) = &component.branch else {
                    return (failed_result(component, "branch payload missing"), true);
                };
                let result = self.execute_branch(component, branch, ctx).await;
                (result, false)
            }
            ComponentKind::IfElse => {
                let Some(if_else) = &component.if_else else {
                    return (failed_result(component, "ifElse payload missing"), true);
                };

                let outcome = self.conditions.evaluate_all(&if_else.conditions, ctx).await;
                let chosen = if outcome.passed {
                    &if_else.then
                } else {
                    &if_else.otherwise
                };
                let children = self.execute_components(chosen, ctx).await;

                let failed = children.iter().any(ComponentResult::has_failed_leaf);
                let mut result = ComponentResult::new(
                    &component.id,
                    ComponentKind::IfElse,
                    if failed {
                        ComponentStatus::Failed
                    } else {
                        ComponentStatus::Success
                    },
                );
                result.result = Some(json!({ "conditionPassed": outcome.passed }));
                result.children = children;
                (result, false)
            }
        }
    }

    async fn execute_branch(
        &self,
        component: &Component,
        branch: &Branch,
        ctx: &mut ExecutionContext,
    ) -> ComponentResult {
        let items = match self.branch_items(branch, ctx).await {
            Ok(items) => items,
            Err(e) => {
                error!("Branch '{}' failed to resolve items: {}", component.id, e);
                let mut result = ComponentResult::new(
                    &component.id,
                    ComponentKind::Branch,
                    ComponentStatus::Failed,
                );
                result.error = Some(e.to_string());
                return result;
            }
        };

        let mut children = Vec::new();
        for item in items {
            let mut child = ctx.branch_child(item);
            let iteration_results = self.execute_components(&branch.components, &mut child).await;
            ctx.absorb_created_items(&child);
            children.extend(iteration_results);
        }

        let failed = children.iter().any(ComponentResult::has_failed_leaf);
        let mut result = ComponentResult::new(
            &component.id,
            ComponentKind::Branch,
            if failed {
                ComponentStatus::Failed
            } else {
                ComponentStatus::Success
            },
        );
        result.children = children;
        result
    }

    async fn branch_items(
        &self,
        branch: &Branch,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Item>, ExecutorError> {
        match branch.branch_type {
            BranchKind::CreatedItems => Ok(ctx.created_items.clone()),
            BranchKind::RelatedItems => {
                let Some(source) = ctx.effective_item() else {
                    return Ok(Vec::new());
                };
                let references = match branch.direction.unwrap_or_default() {
                    ReferenceDirection::Outbound => self.client.list_references(source.id).await?,
                    ReferenceDirection::Inbound => {
                        self.client.list_back_references(source.id).await?
                    }
                };

                let mut items = Vec::new();
                for reference in references {
                    if let Some(kind) = &branch.reference_kind {
                        if !reference.kind.eq_ignore_ascii_case(kind) {
                            continue;
                        }
                    }
                    let target_id = match branch.direction.unwrap_or_default() {
                        ReferenceDirection::Outbound => reference.to_item_id,
                        ReferenceDirection::Inbound => reference.from_item_id,
                    };
                    match self.client.get_item(target_id).await {
                        Ok(item) => {
                            if branch
                                .catalog_id
                                .map(|catalog_id| item.catalog_id == catalog_id)
                                .unwrap_or(true)
                            {
                                items.push(item);
                            }
                        }
                        Err(e) => warn!("Skipping unreachable related item {}: {}", target_id, e),
                    }
                }
                Ok(items)
            }
            BranchKind::LookupItems => {
                let query = branch.oql_query.as_deref().unwrap_or_default();
                let rendered = self.resolver.render(query, ctx).await?;
                let result = self.client.execute_query(ctx.workspace_id, &rendered).await?;

                let mut items = Vec::new();
                for row in &result.rows {
                    let id = row
                        .get("id")
                        .or_else(|| row.get("itemId"))
                        .and_then(Value::as_str)
                        .and_then(|s| Uuid::parse_str(s).ok());
                    let Some(id) = id else { continue };
                    match self.client.get_item(id).await {
                        Ok(item) => items.push(item),
                        Err(e) => warn!("Skipping unreachable lookup item {}: {}", id, e),
                    }
                }
                Ok(items)
            }
        }
    }

}

fn failed_result(component: &Component, message: &str) -> ComponentResult {
    let mut result = ComponentResult::new(
        &component.id,
        component.component_type,
        ComponentStatus::Failed,
    );
    result.error = Some(message.to_string());
    result
}

// =============================================================================
// Dry-run outline
// =============================================================================

fn outline_components(components: &[Component], depth: usize, out: &mut Vec<String>) {
    let indent = "  ".repeat(depth);
    for component in components {
        match component.component_type {
            ComponentKind::Action => {
                let label = component
                    .action
                    .as_ref()
                    .map(|action| {
                        if let Some(name) = &action.name {
                            format!("{} ({})", action.action_type, name)
                        } else {
                            action.action_type.clone()
                        }
                    })
                    .unwrap_or_else(|| "<missing action>".to_string());
                out.push(format!("{}action: {}", indent, label));
            }
            ComponentKind::Condition => {
                let summary = component
                    .condition
                    .as_ref()
                    .map(summarize_condition)
                    .unwrap_or_else(|| "<missing condition>".to_string());
                out.push(format!("{}condition: {}", indent, summary));
            }
            ComponentKind::Branch => {
                if let Some(branch) = &component.branch {
                    out.push(format!(
                        "{}branch: {}",
                        indent,
                        match branch.branch_type {
                            BranchKind::RelatedItems => "related_items",
                            BranchKind::CreatedItems => "created_items",
                            BranchKind::LookupItems => "lookup_items",
                        }
                    ));
                    outline_components(&branch.components, depth + 1, out);
                }
            }
            ComponentKind::IfElse => {
                if let Some(if_else) = &component.if_else {
                    out.push(format!("{}if:", indent));
                    outline_components(&if_else.then, depth + 1, out);
                    if !if_else.otherwise.is_empty() {
                        out.push(format!("{}else:", indent));
                        outline_components(&if_else.otherwise, depth + 1, out);
                    }
                }
            }
        }
    }
}

fn summarize_condition(node: &ConditionNode) -> String {
    match node {
        ConditionNode::Group {
            operator,
            conditions,
        } => format!("{:?} over {} condition(s)", operator, conditions.len()),
        ConditionNode::Leaf(ConditionLeaf::Attribute {
            field, operator, ..
        }) => format!("attribute '{}' {}", field, operator),
        ConditionNode::Leaf(ConditionLeaf::Query { .. }) => "query result".to_string(),
        ConditionNode::Leaf(ConditionLeaf::Reference { exists, .. }) => {
            format!("reference exists = {}", exists)
        }
        ConditionNode::Leaf(ConditionLeaf::Template { template }) => {
            format!("template '{}'", template)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::rule::{ActionSpec, IfElse};

    fn action_component(id: &str, action_type: &str, name: Option<&str>) -> Component {
        Component::action(
            id,
            ActionSpec {
                action_type: action_type.to_string(),
                name: name.map(str::to_string),
                config: Value::Null,
                continue_on_error: false,
            },
        )
    }

    #[test]
    fn test_outline_flattens_nested_program() {
        let components = vec![
            Component::condition(
                "c1",
                ConditionNode::Leaf(ConditionLeaf::Template {
                    template: "{{variables.go}}".to_string(),
                }),
            ),
            Component {
                id: "ie1".to_string(),
                component_type: ComponentKind::IfElse,
                action: None,
                condition: None,
                branch: None,
                if_else: Some(IfElse {
                    conditions: vec![],
                    then: vec![action_component("a1", "log", Some("yes"))],
                    otherwise: vec![action_component("a2", "log", None)],
                }),
            },
        ];

        let mut outline = Vec::new();
        outline_components(&components, 0, &mut outline);
        assert_eq!(
            outline,
            vec![
                "condition: template '{{variables.go}}'",
                "if:",
                "  action: log (yes)",
                "else:",
                "  action: log",
            ]
        );
    }
}
