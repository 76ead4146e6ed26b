//! Template resolution: `{{ … }}` expressions embedded in action configs,
//! queries, and webhook bodies, evaluated against the execution context.

pub mod blocks;
pub mod eval;
pub mod functions;
pub mod parser;

use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::automation::context::ExecutionContext;
use crate::onstaq::OnstaqClient;

use eval::{stringify, Evaluator};
use parser::parse_expression;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Template parse error: {0}")]
    Parse(String),
    #[error("Template evaluation error: {0}")]
    Eval(String),
    #[error("Unknown function '{0}'")]
    UnknownFunction(String),
    #[error("Unknown context root '{0}'")]
    UnknownRoot(String),
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Inline query failed: {0}")]
    Oql(String),
}

/// The context roots an expression can see. Built once per resolution from
/// the execution context; element-scoped copies are derived inside
/// `{{#each}}` bodies.
#[derive(Debug, Clone)]
pub struct Scope {
    pub trigger: Value,
    pub current_item: Option<Value>,
    pub variables: Value,
    pub action_results: Value,
    pub workspace_id: Uuid,
}

impl Scope {
    pub fn from_context(ctx: &ExecutionContext) -> Self {
        let mut trigger = serde_json::to_value(&ctx.trigger).unwrap_or(Value::Null);

        // Conveniences layered over the raw event.
        if let Value::Object(fields) = &mut trigger {
            let previous = serde_json::to_value(&ctx.trigger.previous_values)
                .unwrap_or_else(|_| Value::Object(Default::default()));
            fields.insert("previous".to_string(), previous);

            let user = ctx
                .trigger
                .item
                .as_ref()
                .and_then(|item| item.created_by.clone().or_else(|| item.updated_by.clone()))
                .map(Value::String)
                .unwrap_or(Value::Null);
            fields.insert("user".to_string(), user);
        }

        Self {
            trigger,
            current_item: ctx
                .current_item
                .as_ref()
                .and_then(|item| serde_json::to_value(item).ok()),
            variables: ctx.variables_snapshot(),
            action_results: serde_json::to_value(&ctx.component_results)
                .unwrap_or_else(|_| Value::Array(Vec::new())),
            workspace_id: ctx.workspace_id,
        }
    }

    /// Derived scope for one `{{#each}}` element.
    pub fn with_current_item(&self, item: Value) -> Self {
        let mut scope = self.clone();
        scope.current_item = Some(item);
        scope
    }
}

/// Resolves templates against execution contexts. Owns nothing but a handle
/// to the upstream client for `oql:` and `lookup()` expressions.
#[derive(Clone)]
pub struct TemplateResolver {
    client: Option<Arc<OnstaqClient>>,
}

impl TemplateResolver {
    pub fn new(client: Arc<OnstaqClient>) -> Self {
        Self {
            client: Some(client),
        }
    }

    /// A resolver with no upstream connection; `oql:`/`lookup()` fail. Used
    /// in tests and dry runs.
    pub fn detached() -> Self {
        Self { client: None }
    }

    fn client_ref(&self) -> Option<&OnstaqClient> {
        self.client.as_deref()
    }

    /// Resolve a whole template string: block helpers first, then every
    /// remaining `{{ … }}` expression.
    pub async fn render(&self, template: &str, ctx: &ExecutionContext) -> Result<String, TemplateError> {
        let scope = Scope::from_context(ctx);
        self.render_with_scope(template, &scope).await
    }

    pub async fn render_with_scope(
        &self,
        template: &str,
        scope: &Scope,
    ) -> Result<String, TemplateError> {
        if !template.contains("{{") {
            return Ok(template.to_string());
        }
        let expanded = blocks::process_blocks(template, scope, self.client_ref()).await?;
        resolve_inline(&expanded, scope, self.client_ref()).await
    }

    /// Deep resolution: strings are rendered, arrays and maps are walked,
    /// other values pass through untouched.
    pub async fn render_value(&self, value: &Value, ctx: &ExecutionContext) -> Result<Value, TemplateError> {
        let scope = Scope::from_context(ctx);
        self.render_value_inner(value, &scope).await
    }

    fn render_value_inner<'a>(
        &'a self,
        value: &'a Value,
        scope: &'a Scope,
    ) -> Pin<Box<dyn Future<Output = Result<Value, TemplateError>> + Send + 'a>> {
        Box::pin(async move {
            match value {
                Value::String(s) => Ok(Value::String(self.render_with_scope(s, scope).await?)),
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.render_value_inner(item, scope).await?);
                    }
                    Ok(Value::Array(out))
                }
                Value::Object(fields) => {
                    let mut out = serde_json::Map::with_capacity(fields.len());
                    for (key, field) in fields {
                        out.insert(key.clone(), self.render_value_inner(field, scope).await?);
                    }
                    Ok(Value::Object(out))
                }
                other => Ok(other.clone()),
            }
        })
    }
}

/// Resolve every plain `{{ expr }}` span in `text`. Block tags are left
/// untouched (the block processor runs first). A parse failure falls back to
/// the legacy dotted-path resolver; an evaluation failure propagates.
pub(crate) async fn resolve_inline(
    text: &str,
    scope: &Scope,
    client: Option<&OnstaqClient>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start..];
        let Some(end) = after.find("}}") else {
            out.push_str(after);
            return Ok(out);
        };

        let raw = &after[2..end];
        let inner = raw.trim();
        if inner.starts_with('#') || inner.starts_with('/') || inner == "else" {
            out.push_str(&after[..end + 2]);
        } else {
            match parse_expression(raw) {
                Ok(expr) => {
                    let value = Evaluator::new(scope, client).eval(&expr).await?;
                    out.push_str(&stringify(&value));
                }
                Err(_) => match legacy_resolve(inner, scope) {
                    Some(resolved) => out.push_str(&resolved),
                    None => out.push_str(&after[..end + 2]),
                },
            }
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

/// The pre-expression-engine resolver: plain dotted-path navigation over the
/// same context roots. No functions, blocks, or operators.
fn legacy_resolve(path: &str, scope: &Scope) -> Option<String> {
    if path.is_empty() || !path.split('.').all(is_legacy_segment) {
        return None;
    }
    let mut segments = path.split('.');
    let root_name = segments.next()?;

    let root = match root_name {
        "trigger" => scope.trigger.clone(),
        "item" | "currentItem" => scope
            .current_item
            .clone()
            .or_else(|| scope.trigger.get("item").cloned())
            .unwrap_or(Value::Null),
        "env" => serde_json::json!({
            "NOW": chrono::Utc::now().to_rfc3339(),
            "TODAY": chrono::Utc::now().format("%Y-%m-%d").to_string(),
        }),
        "context" | "variables" => scope.variables.clone(),
        "action" => scope.action_results.clone(),
        _ => return None,
    };

    let mut current = root;
    for segment in segments {
        current = eval::navigate(&current, segment);
    }
    Some(stringify(&current))
}

fn is_legacy_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '@')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::context::TriggerEvent;
    use serde_json::json;

    fn context_with_item(attributes: Value) -> ExecutionContext {
        let item: crate::onstaq::Item = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "key": "TCK-7",
            "catalogId": Uuid::new_v4(),
            "attributeValues": attributes,
            "createdBy": "alice@example.com",
            "createdAt": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        let event = TriggerEvent::for_item("item.created", item);
        ExecutionContext::new(Uuid::new_v4(), "rule", Uuid::new_v4(), event)
    }

    #[tokio::test]
    async fn test_simple_substitution() {
        let ctx = context_with_item(json!({ "Reporter": "Alice" }));
        let resolver = TemplateResolver::detached();
        let out = resolver
            .render("Thanks, {{trigger.item.attributes.Reporter}}", &ctx)
            .await
            .unwrap();
        assert_eq!(out, "Thanks, Alice");
    }

    #[tokio::test]
    async fn test_pipeline_scenario() {
        let ctx = context_with_item(json!({ "Tags": ["a", "b", "c"] }));
        let resolver = TemplateResolver::detached();
        let out = resolver
            .render(
                r#"{{trigger.item.attributes.Tags | join(" / ") | toUpperCase}}"#,
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out, "A / B / C");
    }

    #[tokio::test]
    async fn test_each_block_matches_map_join() {
        let ctx = context_with_item(json!({ "Tags": ["x", "y"] }));
        let resolver = TemplateResolver::detached();

        let via_each = resolver
            .render(
                "{{#each trigger.item.attributes.Tags}}{{currentItem}}{{/each}}",
                &ctx,
            )
            .await
            .unwrap();
        let via_map = resolver
            .render(
                r#"{{trigger.item.attributes.Tags | map("") | join("")}}"#,
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(via_each, "xy");
        assert_eq!(via_each, via_map);
    }

    #[tokio::test]
    async fn test_each_pseudo_variables() {
        let ctx = context_with_item(json!({ "Tags": ["x", "y"] }));
        let resolver = TemplateResolver::detached();
        let out = resolver
            .render(
                "{{#each trigger.item.attributes.Tags}}{{@index}}:{{currentItem}}({{@last}}) {{/each}}",
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out, "0:x(false) 1:y(true) ");
    }

    #[tokio::test]
    async fn test_each_wraps_scalar() {
        let ctx = context_with_item(json!({ "Owner": "bob" }));
        let resolver = TemplateResolver::detached();
        let out = resolver
            .render(
                "{{#each trigger.item.attributes.Owner}}[{{currentItem}}]{{/each}}",
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out, "[bob]");
    }

    #[tokio::test]
    async fn test_if_else_block() {
        let ctx = context_with_item(json!({ "Priority": "High" }));
        let resolver = TemplateResolver::detached();

        let out = resolver
            .render(
                r#"{{#if trigger.item.attributes.Priority == "High"}}HOT{{else}}cold{{/if}}"#,
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out, "HOT");

        let out = resolver
            .render(
                r#"{{#if trigger.item.attributes.Missing}}yes{{else}}no{{/if}}"#,
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out, "no");
    }

    #[tokio::test]
    async fn test_nested_blocks_expand_innermost_first() {
        let ctx = context_with_item(json!({ "Tags": ["a"], "Flag": true }));
        let resolver = TemplateResolver::detached();
        let out = resolver
            .render(
                "{{#if trigger.item.attributes.Flag}}{{#each trigger.item.attributes.Tags}}<{{currentItem}}>{{/each}}{{/if}}",
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out, "<a>");
    }

    #[tokio::test]
    async fn test_block_loop_guard_leaves_remainder() {
        let ctx = context_with_item(json!({}));
        let resolver = TemplateResolver::detached();
        let template = "{{#if true}}x{{/if}}".repeat(101);
        let out = resolver.render(&template, &ctx).await.unwrap();
        // 100 expanded, one left as-is.
        assert!(out.starts_with(&"x".repeat(100)));
        assert!(out.contains("{{#if true}}"));
    }

    #[tokio::test]
    async fn test_divide_by_zero_propagates() {
        let ctx = context_with_item(json!({}));
        let resolver = TemplateResolver::detached();
        let err = resolver.render("{{1 / 0}}", &ctx).await.unwrap_err();
        assert!(matches!(err, TemplateError::DivisionByZero));
    }

    #[tokio::test]
    async fn test_legacy_fallback_on_parse_error() {
        // A segment starting with a digit is not parseable by the expression
        // engine but the legacy resolver navigates it fine.
        let ctx = context_with_item(json!({ "1st_response": "fast" }));
        let resolver = TemplateResolver::detached();
        let out = resolver
            .render("{{trigger.item.attributes.1st_response}}", &ctx)
            .await
            .unwrap();
        assert_eq!(out, "fast");
    }

    #[tokio::test]
    async fn test_unresolvable_text_left_verbatim() {
        let ctx = context_with_item(json!({}));
        let resolver = TemplateResolver::detached();
        let out = resolver.render("{{not a path at all !}}", &ctx).await.unwrap();
        assert_eq!(out, "{{not a path at all !}}");
    }

    #[tokio::test]
    async fn test_deep_value_resolution_preserves_structure() {
        let ctx = context_with_item(json!({ "Reporter": "Alice" }));
        let resolver = TemplateResolver::detached();
        let config = json!({
            "attributes": { "Assignee": "{{trigger.item.attributes.Reporter}}" },
            "tags": ["{{trigger.type}}", 42],
            "flag": true
        });
        let resolved = resolver.render_value(&config, &ctx).await.unwrap();
        assert_eq!(resolved["attributes"]["Assignee"], "Alice");
        assert_eq!(resolved["tags"][0], "item.created");
        assert_eq!(resolved["tags"][1], 42);
        assert_eq!(resolved["flag"], true);
    }

    #[tokio::test]
    async fn test_trigger_user_convenience() {
        let ctx = context_with_item(json!({}));
        let resolver = TemplateResolver::detached();
        let out = resolver.render("{{trigger.user}}", &ctx).await.unwrap();
        assert_eq!(out, "alice@example.com");
    }

    #[tokio::test]
    async fn test_pure_resolution_is_deterministic() {
        let ctx = context_with_item(json!({ "Count": 4, "Name": "Widget" }));
        let resolver = TemplateResolver::detached();
        let template = "{{trigger.item.attributes.Name}}:{{trigger.item.attributes.Count * 2}}";
        let first = resolver.render(template, &ctx).await.unwrap();
        let second = resolver.render(template, &ctx).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "Widget:8");
    }
}
