//! Block helper processing: `{{#each}}` and `{{#if}}` with `{{else}}`.
//!
//! Blocks expand innermost-first so nesting works without a full parse of
//! the surrounding template. A guard stops runaway expansion after 100
//! blocks; whatever is left is emitted unexpanded.

use serde_json::Value;
use tracing::warn;

use crate::onstaq::OnstaqClient;

use super::eval::{compare_values, is_truthy, values_equal, Evaluator};
use super::parser::parse_expression;
use super::{resolve_inline, Scope, TemplateError};

const MAX_BLOCK_EXPANSIONS: usize = 100;

pub async fn process_blocks(
    template: &str,
    scope: &Scope,
    client: Option<&OnstaqClient>,
) -> Result<String, TemplateError> {
    let mut text = template.to_string();
    let mut expansions = 0;

    while let Some(block) = find_innermost_block(&text) {
        if expansions >= MAX_BLOCK_EXPANSIONS {
            warn!("Template block expansion exceeded {} iterations, leaving remaining blocks unexpanded", MAX_BLOCK_EXPANSIONS);
            break;
        }
        expansions += 1;

        let replacement = match block.kind {
            BlockKind::Each => expand_each(&block, scope, client).await?,
            BlockKind::If => expand_if(&block, scope, client).await?,
        };

        let mut next = String::with_capacity(text.len());
        next.push_str(&text[..block.open_start]);
        next.push_str(&replacement);
        next.push_str(&text[block.close_end..]);
        text = next;
    }

    Ok(text)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Each,
    If,
}

impl BlockKind {
    fn open_tag(&self) -> &'static str {
        match self {
            BlockKind::Each => "{{#each",
            BlockKind::If => "{{#if",
        }
    }

    fn close_tag(&self) -> &'static str {
        match self {
            BlockKind::Each => "{{/each}}",
            BlockKind::If => "{{/if}}",
        }
    }
}

struct Block {
    kind: BlockKind,
    /// Byte offset of `{{#`.
    open_start: usize,
    /// Byte offset just past the closing tag.
    close_end: usize,
    /// Expression text from the opening tag.
    expression: String,
    /// Body between the opening tag and the closing tag.
    body: String,
}

/// Locate the innermost block: the earliest closing tag paired with the last
/// opener of the same kind before it.
fn find_innermost_block(text: &str) -> Option<Block> {
    let each_close = text.find(BlockKind::Each.close_tag());
    let if_close = text.find(BlockKind::If.close_tag());

    let (kind, close_start) = match (each_close, if_close) {
        (Some(e), Some(i)) if e < i => (BlockKind::Each, e),
        (Some(_), Some(i)) => (BlockKind::If, i),
        (Some(e), None) => (BlockKind::Each, e),
        (None, Some(i)) => (BlockKind::If, i),
        (None, None) => return None,
    };

    let open_start = text[..close_start].rfind(kind.open_tag())?;
    let header_end = text[open_start..].find("}}")? + open_start;
    let expression = text[open_start + kind.open_tag().len()..header_end]
        .trim()
        .to_string();

    Some(Block {
        kind,
        open_start,
        close_end: close_start + kind.close_tag().len(),
        expression,
        body: text[header_end + 2..close_start].to_string(),
    })
}

async fn expand_each(
    block: &Block,
    scope: &Scope,
    client: Option<&OnstaqClient>,
) -> Result<String, TemplateError> {
    let expr = parse_expression(&block.expression)?;
    let collection = Evaluator::new(scope, client).eval(&expr).await?;

    let elements = match collection {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        scalar => vec![scalar],
    };

    let total = elements.len();
    let mut out = String::new();
    for (index, element) in elements.into_iter().enumerate() {
        let body = block
            .body
            .replace("{{@index}}", &index.to_string())
            .replace("{{@first}}", if index == 0 { "true" } else { "false" })
            .replace("{{@last}}", if index + 1 == total { "true" } else { "false" });

        let element_scope = scope.with_current_item(element);
        out.push_str(&resolve_inline(&body, &element_scope, client).await?);
    }
    Ok(out)
}

async fn expand_if(
    block: &Block,
    scope: &Scope,
    client: Option<&OnstaqClient>,
) -> Result<String, TemplateError> {
    let passed = evaluate_block_condition(&block.expression, scope, client).await;

    let (then_body, else_body) = match block.body.split_once("{{else}}") {
        Some((t, e)) => (t, e),
        None => (block.body.as_str(), ""),
    };

    let chosen = if passed { then_body } else { else_body };
    resolve_inline(chosen, scope, client).await
}

/// Evaluate an `{{#if}}` condition: `X op Y` with comparison operators, or
/// the truthiness of a single expression. Evaluation problems count as false.
pub(crate) async fn evaluate_block_condition(
    condition: &str,
    scope: &Scope,
    client: Option<&OnstaqClient>,
) -> bool {
    if let Some((lhs, op, rhs)) = split_condition(condition) {
        let left = condition_operand(&lhs, scope, client).await;
        let right = condition_operand(&rhs, scope, client).await;
        let (left, right) = match (left, right) {
            (Some(l), Some(r)) => (l, r),
            _ => return false,
        };
        return match op {
            "==" => values_equal(&left, &right),
            "!=" => !values_equal(&left, &right),
            ">" => compare_values(&left, &right) == std::cmp::Ordering::Greater,
            "<" => compare_values(&left, &right) == std::cmp::Ordering::Less,
            ">=" => compare_values(&left, &right) != std::cmp::Ordering::Less,
            "<=" => compare_values(&left, &right) != std::cmp::Ordering::Greater,
            _ => false,
        };
    }

    match parse_expression(condition) {
        Ok(expr) => match Evaluator::new(scope, client).eval(&expr).await {
            Ok(value) => is_truthy(&value),
            Err(_) => false,
        },
        Err(_) => false,
    }
}

/// Split `X op Y` at the first comparison operator outside of quotes.
fn split_condition(condition: &str) -> Option<(String, &'static str, String)> {
    let chars: Vec<char> = condition.chars().collect();
    let mut quote: Option<char> = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) => {
                if c == '\\' {
                    i += 1;
                } else if c == q {
                    quote = None;
                }
            }
            None => {
                if c == '"' || c == '\'' {
                    quote = Some(c);
                } else {
                    let next = chars.get(i + 1).copied();
                    let op = match (c, next) {
                        ('=', Some('=')) => Some(("==", 2)),
                        ('!', Some('=')) => Some(("!=", 2)),
                        ('>', Some('=')) => Some((">=", 2)),
                        ('<', Some('=')) => Some(("<=", 2)),
                        ('>', _) => Some((">", 1)),
                        ('<', _) => Some(("<", 1)),
                        _ => None,
                    };
                    if let Some((op, width)) = op {
                        let lhs: String = chars[..i].iter().collect();
                        let rhs: String = chars[i + width..].iter().collect();
                        return Some((lhs.trim().to_string(), op, rhs.trim().to_string()));
                    }
                }
            }
        }
        i += 1;
    }
    None
}

/// Resolve one side of a block condition: quoted / numeric / boolean / null
/// operands are literals, anything else is an expression.
async fn condition_operand(
    text: &str,
    scope: &Scope,
    client: Option<&OnstaqClient>,
) -> Option<Value> {
    let trimmed = text.trim();
    if (trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2)
        || (trimmed.starts_with('\'') && trimmed.ends_with('\'') && trimmed.len() >= 2)
    {
        return Some(Value::String(trimmed[1..trimmed.len() - 1].to_string()));
    }
    if let Ok(n) = trimmed.parse::<f64>() {
        return serde_json::Number::from_f64(n).map(Value::Number);
    }
    match trimmed {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }
    // Strip template delimiters if the operand was written as `{{expr}}`.
    let expression = trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .unwrap_or(trimmed);
    let expr = parse_expression(expression).ok()?;
    Evaluator::new(scope, client).eval(&expr).await.ok()
}
