//! Expression evaluation against a template scope.

use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

use crate::onstaq::OnstaqClient;

use super::functions;
use super::parser::{BinaryOp, Expr};
use super::{Scope, TemplateError};

/// Navigate one path segment, honoring the `attributes` → `attributeValues`
/// rewrite so `item.attributes.Priority` reads the item's attribute map.
pub(crate) fn navigate(value: &Value, segment: &str) -> Value {
    if segment == "attributes" {
        if let Some(attribute_values) = value.get("attributeValues") {
            return attribute_values.clone();
        }
    }
    value.get(segment).cloned().unwrap_or(Value::Null)
}

pub(crate) fn navigate_path(value: &Value, path: &str) -> Value {
    let mut current = value.clone();
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = navigate(&current, segment);
    }
    current
}

/// Substitution rules for resolved values inside host strings.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.abs() < 9e15 {
                    format!("{}", f as i64)
                } else {
                    f.to_string()
                }
            } else {
                n.to_string()
            }
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// `null`, `false`, `0`, `""`, and empty arrays are false; everything else
/// is true.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

/// Loose equality: JSON-equal, or equal after string coercion ignoring case.
pub(crate) fn loose_eq(a: &Value, b: &Value) -> bool {
    a == b || stringify(a).to_lowercase() == stringify(b).to_lowercase()
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn as_number(value: &Value) -> Result<f64, TemplateError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| TemplateError::Eval("number out of range".to_string())),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| TemplateError::Eval(format!("'{}' is not a number", s))),
        other => Err(TemplateError::Eval(format!(
            "expected a number, got {}",
            stringify(other)
        ))),
    }
}

type EvalFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, TemplateError>> + Send + 'a>>;

pub struct Evaluator<'a> {
    pub scope: &'a Scope,
    pub client: Option<&'a OnstaqClient>,
}

impl<'a> Evaluator<'a> {
    pub fn new(scope: &'a Scope, client: Option<&'a OnstaqClient>) -> Self {
        Self { scope, client }
    }

    pub fn eval<'e>(&'e self, expr: &'e Expr) -> EvalFuture<'e> {
        Box::pin(async move {
            match expr {
                Expr::Literal(value) => Ok(value.clone()),
                Expr::Ident(name) => self.root_value(name),
                Expr::Oql(query) => self.run_oql(query).await,
                Expr::Call { name, args } => self.call(name, args).await,
                Expr::Property { base, name } => {
                    let value = self.eval(base).await?;
                    self.property(&value, name)
                }
                Expr::Method { base, name, args } => {
                    let value = self.eval(base).await?;
                    let mut evaluated = Vec::with_capacity(args.len());
                    for arg in args {
                        evaluated.push(self.eval(arg).await?);
                    }
                    apply_function(name, &value, &evaluated)
                }
                Expr::Index { base, index } => {
                    let value = self.eval(base).await?;
                    let index = self.eval(index).await?;
                    Ok(index_value(&value, &index))
                }
                Expr::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs).await,
            }
        })
    }

    fn root_value(&self, name: &str) -> Result<Value, TemplateError> {
        match name {
            "trigger" => Ok(self.scope.trigger.clone()),
            "item" | "currentItem" => Ok(self
                .scope
                .current_item
                .clone()
                .or_else(|| {
                    let item = self.scope.trigger.get("item").cloned();
                    item.filter(|i| !i.is_null())
                })
                .unwrap_or(Value::Null)),
            "env" => Ok(serde_json::json!({
                "NOW": Utc::now().to_rfc3339(),
                "TODAY": Utc::now().format("%Y-%m-%d").to_string(),
            })),
            "context" | "variables" => Ok(self.scope.variables.clone()),
            "action" => Ok(self.scope.action_results.clone()),
            other => Err(TemplateError::UnknownRoot(other.to_string())),
        }
    }

    fn property(&self, value: &Value, name: &str) -> Result<Value, TemplateError> {
        if name == "attributes" {
            if let Some(attribute_values) = value.get("attributeValues") {
                return Ok(attribute_values.clone());
            }
        }
        if let Some(found) = value.get(name) {
            return Ok(found.clone());
        }
        // Not a field: a zero-arg registered function applies instead.
        if let Some(def) = functions::lookup(name) {
            if def.min_args == 0 {
                return (def.apply)(value, &[]);
            }
        }
        Ok(Value::Null)
    }

    async fn call(&self, name: &str, args: &[Expr]) -> Result<Value, TemplateError> {
        match name {
            "now" => Ok(Value::String(Utc::now().to_rfc3339())),
            "lookup" => {
                if args.len() != 1 {
                    return Err(TemplateError::Eval(
                        "lookup takes exactly one argument".to_string(),
                    ));
                }
                let key = stringify(&self.eval(&args[0]).await?);
                let client = self.client.ok_or_else(|| {
                    TemplateError::Eval("no upstream client available for lookup".to_string())
                })?;
                match client
                    .find_item_by_key(self.scope.workspace_id, &key)
                    .await
                    .map_err(|e| TemplateError::Oql(e.to_string()))?
                {
                    Some(item) => serde_json::to_value(item)
                        .map_err(|e| TemplateError::Eval(e.to_string())),
                    None => Ok(Value::Null),
                }
            }
            other => Err(TemplateError::UnknownFunction(other.to_string())),
        }
    }

    async fn run_oql(&self, query: &str) -> Result<Value, TemplateError> {
        let client = self.client.ok_or_else(|| {
            TemplateError::Eval("no upstream client available for inline query".to_string())
        })?;
        let result = client
            .execute_query(self.scope.workspace_id, query)
            .await
            .map_err(|e| TemplateError::Oql(e.to_string()))?;

        let rows: Vec<Value> = result
            .rows
            .iter()
            .map(|row| serde_json::to_value(row).unwrap_or(Value::Null))
            .collect();

        // One row × one column → scalar; one row → the row; else all rows.
        if rows.len() == 1 {
            if let Value::Object(fields) = &rows[0] {
                if fields.len() == 1 {
                    return Ok(fields.values().next().cloned().unwrap_or(Value::Null));
                }
            }
            return Ok(rows.into_iter().next().unwrap_or(Value::Null));
        }
        Ok(Value::Array(rows))
    }

    async fn binary(&self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Value, TemplateError> {
        if op == BinaryOp::Pipe {
            let left = self.eval(lhs).await?;
            let empty = matches!(&left, Value::Null) || matches!(&left, Value::String(s) if s.is_empty());
            return if empty { self.eval(rhs).await } else { Ok(left) };
        }

        let left = self.eval(lhs).await?;
        let right = self.eval(rhs).await?;

        match op {
            BinaryOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
            BinaryOp::Ne => Ok(Value::Bool(!values_equal(&left, &right))),
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
                let ordering = compare_values(&left, &right);
                Ok(Value::Bool(match op {
                    BinaryOp::Lt => ordering == std::cmp::Ordering::Less,
                    BinaryOp::Gt => ordering == std::cmp::Ordering::Greater,
                    BinaryOp::Le => ordering != std::cmp::Ordering::Greater,
                    BinaryOp::Ge => ordering != std::cmp::Ordering::Less,
                    _ => unreachable!(),
                }))
            }
            BinaryOp::Add => {
                if left.is_string() || right.is_string() {
                    Ok(Value::String(format!("{}{}", stringify(&left), stringify(&right))))
                } else {
                    Ok(number_value(as_number(&left)? + as_number(&right)?))
                }
            }
            BinaryOp::Sub => Ok(number_value(as_number(&left)? - as_number(&right)?)),
            BinaryOp::Mul => Ok(number_value(as_number(&left)? * as_number(&right)?)),
            BinaryOp::Div => {
                let divisor = as_number(&right)?;
                if divisor == 0.0 {
                    return Err(TemplateError::DivisionByZero);
                }
                Ok(number_value(as_number(&left)? / divisor))
            }
            BinaryOp::Pipe => unreachable!(),
        }
    }
}

fn apply_function(name: &str, value: &Value, args: &[Value]) -> Result<Value, TemplateError> {
    let def =
        functions::lookup(name).ok_or_else(|| TemplateError::UnknownFunction(name.to_string()))?;
    if args.len() < def.min_args || args.len() > def.max_args {
        return Err(TemplateError::Eval(format!(
            "{} expects {}..={} arguments, got {}",
            name,
            def.min_args,
            def.max_args,
            args.len()
        )));
    }
    (def.apply)(value, args)
}

fn index_value(base: &Value, index: &Value) -> Value {
    match (base, index) {
        (Value::Array(items), Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
            .and_then(|i| items.get(i as usize))
            .cloned()
            .unwrap_or(Value::Null),
        (Value::Object(fields), Value::String(key)) => {
            fields.get(key).cloned().unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Ok(x), Ok(y)) = (as_number(a), as_number(b)) {
        if a.is_number() && b.is_number() {
            return x == y;
        }
        // One side numeric string: compare numerically as well.
        if a.is_number() || b.is_number() {
            return x == y;
        }
    }
    stringify(a) == stringify(b)
}

pub(crate) fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    if let (Ok(x), Ok(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal);
    }
    stringify(a).cmp(&stringify(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::parser::parse_expression;
    use serde_json::json;
    use uuid::Uuid;

    fn scope() -> Scope {
        Scope {
            trigger: json!({
                "type": "manual",
                "item": {
                    "id": "11111111-1111-1111-1111-111111111111",
                    "key": "TCK-1",
                    "attributeValues": { "Priority": "High", "Tags": ["a", "b", "c"], "Count": 4 }
                },
                "previous": { "Priority": "Low" },
                "timestamp": "2026-01-01T00:00:00Z"
            }),
            current_item: None,
            variables: json!({ "who": "Alice" }),
            action_results: json!([
                { "componentId": "a1", "result": { "itemId": "x" } }
            ]),
            workspace_id: Uuid::new_v4(),
        }
    }

    async fn eval_str(input: &str) -> Result<Value, TemplateError> {
        let scope = scope();
        let evaluator = Evaluator::new(&scope, None);
        let expr = parse_expression(input)?;
        evaluator.eval(&expr).await
    }

    #[tokio::test]
    async fn test_path_with_attributes_rewrite() {
        assert_eq!(
            eval_str("trigger.item.attributes.Priority").await.unwrap(),
            json!("High")
        );
        assert_eq!(
            eval_str("trigger.previous.Priority").await.unwrap(),
            json!("Low")
        );
    }

    #[tokio::test]
    async fn test_missing_path_is_null_and_pipe_defaults() {
        assert_eq!(
            eval_str("trigger.item.attributes.Missing").await.unwrap(),
            Value::Null
        );
        assert_eq!(
            eval_str("trigger.item.attributes.Missing | \"fallback\"")
                .await
                .unwrap(),
            json!("fallback")
        );
        assert_eq!(
            eval_str("trigger.item.key | \"fallback\"").await.unwrap(),
            json!("TCK-1")
        );
    }

    #[tokio::test]
    async fn test_property_as_zero_arg_function() {
        assert_eq!(
            eval_str("trigger.item.key.toUpperCase").await.unwrap(),
            json!("TCK-1")
        );
        assert_eq!(
            eval_str("trigger.item.attributes.Tags.size").await.unwrap(),
            json!(3)
        );
    }

    #[tokio::test]
    async fn test_pipeline_with_functions() {
        assert_eq!(
            eval_str(r#"trigger.item.attributes.Tags | join(" / ") | toUpperCase"#)
                .await
                .unwrap(),
            json!("A / B / C")
        );
    }

    #[tokio::test]
    async fn test_arithmetic_and_division_by_zero() {
        assert_eq!(eval_str("1 + 2 * 1").await.unwrap(), json!(3));
        assert_eq!(
            eval_str("trigger.item.attributes.Count / 2").await.unwrap(),
            json!(2)
        );
        assert!(matches!(
            eval_str("1 / 0").await,
            Err(TemplateError::DivisionByZero)
        ));
    }

    #[tokio::test]
    async fn test_string_concat_with_plus() {
        assert_eq!(
            eval_str(r#""Hello, " + variables.who"#).await.unwrap(),
            json!("Hello, Alice")
        );
    }

    #[tokio::test]
    async fn test_action_indexing() {
        assert_eq!(
            eval_str("action[0].result.itemId").await.unwrap(),
            json!("x")
        );
    }

    #[tokio::test]
    async fn test_unknown_root_and_function_fail() {
        assert!(matches!(
            eval_str("nonsense.path").await,
            Err(TemplateError::UnknownRoot(_))
        ));
        assert!(matches!(
            eval_str("trigger.item.key.fooBar(1)").await,
            Err(TemplateError::UnknownFunction(_))
        ));
    }

    #[tokio::test]
    async fn test_comparisons() {
        assert_eq!(eval_str("4 >= 4").await.unwrap(), json!(true));
        assert_eq!(
            eval_str("trigger.item.attributes.Count > 3").await.unwrap(),
            json!(true)
        );
        assert_eq!(
            eval_str(r#"trigger.item.attributes.Priority == "High""#)
                .await
                .unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_stringify_rules() {
        assert_eq!(stringify(&Value::Null), "");
        assert_eq!(stringify(&json!(3.0)), "3");
        assert_eq!(stringify(&json!(3.5)), "3.5");
        assert_eq!(stringify(&json!(true)), "true");
        assert_eq!(stringify(&json!(["a", 1])), r#"["a",1]"#);
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!("false")));
        assert!(is_truthy(&json!({})));
    }
}
