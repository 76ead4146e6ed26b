//! Built-in template function registry.
//!
//! Functions are pure: they receive the value they are applied to plus
//! already-evaluated arguments. Arg counts are validated by the evaluator
//! against `min_args`/`max_args` before `apply` runs.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

use super::eval::{is_truthy, loose_eq, navigate_path, stringify};
use super::TemplateError;

/// Value families a function accepts; used for error messages when a
/// function is applied to something it cannot work with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applicability {
    StringLike,
    NumberLike,
    DateLike,
    ArrayLike,
    Any,
}

pub struct FunctionDef {
    pub min_args: usize,
    pub max_args: usize,
    pub applicable: Applicability,
    pub apply: fn(&Value, &[Value]) -> Result<Value, TemplateError>,
}

pub fn registry() -> &'static HashMap<&'static str, FunctionDef> {
    static REGISTRY: OnceLock<HashMap<&'static str, FunctionDef>> = OnceLock::new();
    REGISTRY.get_or_init(build_registry)
}

pub fn lookup(name: &str) -> Option<&'static FunctionDef> {
    registry().get(name)
}

macro_rules! func {
    ($map:expr, $name:expr, $min:expr, $max:expr, $kind:expr, $f:expr) => {
        $map.insert(
            $name,
            FunctionDef {
                min_args: $min,
                max_args: $max,
                applicable: $kind,
                apply: $f,
            },
        );
    };
}

fn build_registry() -> HashMap<&'static str, FunctionDef> {
    use Applicability::*;
    let mut m: HashMap<&'static str, FunctionDef> = HashMap::new();

    // ---- string ----
    func!(m, "toUpperCase", 0, 0, StringLike, |v, _| {
        Ok(json!(as_string(v)?.to_uppercase()))
    });
    func!(m, "toLowerCase", 0, 0, StringLike, |v, _| {
        Ok(json!(as_string(v)?.to_lowercase()))
    });
    func!(m, "capitalize", 0, 0, StringLike, |v, _| {
        let s = as_string(v)?;
        let mut chars = s.chars();
        Ok(match chars.next() {
            Some(first) => json!(first.to_uppercase().collect::<String>() + chars.as_str()),
            None => json!(""),
        })
    });
    func!(m, "truncate", 1, 2, StringLike, |v, args| {
        let s = as_string(v)?;
        let max = as_usize(&args[0])?;
        let suffix = args.get(1).map(|a| stringify(a)).unwrap_or_else(|| "...".to_string());
        if s.chars().count() > max {
            let cut: String = s.chars().take(max).collect();
            Ok(json!(cut + &suffix))
        } else {
            Ok(json!(s))
        }
    });
    func!(m, "replace", 2, 2, StringLike, |v, args| {
        let s = as_string(v)?;
        Ok(json!(s.replace(&stringify(&args[0]), &stringify(&args[1]))))
    });
    func!(m, "match", 1, 1, StringLike, |v, args| {
        let s = as_string(v)?;
        let pattern = stringify(&args[0]);
        let re = regex::Regex::new(&pattern)
            .map_err(|e| TemplateError::Eval(format!("invalid regex '{}': {}", pattern, e)))?;
        Ok(re
            .find(&s)
            .map(|found| json!(found.as_str()))
            .unwrap_or(Value::Null))
    });
    func!(m, "substring", 1, 2, StringLike, |v, args| {
        let s = as_string(v)?;
        let chars: Vec<char> = s.chars().collect();
        let start = as_usize(&args[0])?.min(chars.len());
        let end = match args.get(1) {
            Some(arg) => as_usize(arg)?.min(chars.len()),
            None => chars.len(),
        };
        Ok(json!(chars[start..end.max(start)].iter().collect::<String>()))
    });
    func!(m, "trim", 0, 0, StringLike, |v, _| {
        Ok(json!(as_string(v)?.trim()))
    });
    func!(m, "length", 0, 0, Any, |v, _| match v {
        Value::String(s) => Ok(json!(s.chars().count())),
        Value::Array(a) => Ok(json!(a.len())),
        other => Ok(json!(stringify(other).chars().count())),
    });
    func!(m, "split", 1, 1, StringLike, |v, args| {
        let s = as_string(v)?;
        let sep = stringify(&args[0]);
        Ok(json!(s.split(&sep).collect::<Vec<_>>()))
    });
    func!(m, "concat", 1, 1, StringLike, |v, args| {
        Ok(json!(format!("{}{}", stringify(v), stringify(&args[0]))))
    });
    func!(m, "padStart", 1, 2, StringLike, |v, args| {
        Ok(json!(pad(&as_string(v)?, args, true)?))
    });
    func!(m, "padEnd", 1, 2, StringLike, |v, args| {
        Ok(json!(pad(&as_string(v)?, args, false)?))
    });
    func!(m, "isEmpty", 0, 0, Any, |v, _| Ok(json!(is_empty(v))));
    func!(m, "isNotEmpty", 0, 0, Any, |v, _| Ok(json!(!is_empty(v))));
    func!(m, "htmlEncode", 0, 0, StringLike, |v, _| {
        let s = as_string(v)?;
        let mut out = String::with_capacity(s.len());
        for c in s.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&#39;"),
                other => out.push(other),
            }
        }
        Ok(json!(out))
    });
    func!(m, "urlEncode", 0, 0, StringLike, |v, _| {
        let s = as_string(v)?;
        let mut out = String::with_capacity(s.len());
        for byte in s.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    out.push(byte as char)
                }
                other => out.push_str(&format!("%{:02X}", other)),
            }
        }
        Ok(json!(out))
    });
    func!(m, "jsonStringify", 0, 0, Any, |v, _| {
        Ok(json!(serde_json::to_string(v).unwrap_or_default()))
    });

    // ---- number ----
    func!(m, "toNumber", 0, 0, Any, |v, _| Ok(json!(as_f64(v)?)));
    func!(m, "abs", 0, 0, NumberLike, |v, _| Ok(json!(as_f64(v)?.abs())));
    func!(m, "round", 0, 1, NumberLike, |v, args| {
        let n = as_f64(v)?;
        let digits = match args.first() {
            Some(arg) => as_usize(arg)? as i32,
            None => 0,
        };
        let factor = 10f64.powi(digits);
        Ok(json!((n * factor).round() / factor))
    });
    func!(m, "ceil", 0, 0, NumberLike, |v, _| Ok(json!(as_f64(v)?.ceil())));
    func!(m, "floor", 0, 0, NumberLike, |v, _| Ok(json!(as_f64(v)?.floor())));
    func!(m, "min", 1, 1, NumberLike, |v, args| {
        Ok(json!(as_f64(v)?.min(as_f64(&args[0])?)))
    });
    func!(m, "max", 1, 1, NumberLike, |v, args| {
        Ok(json!(as_f64(v)?.max(as_f64(&args[0])?)))
    });
    func!(m, "percentage", 1, 1, NumberLike, |v, args| {
        let total = as_f64(&args[0])?;
        if total == 0.0 {
            return Err(TemplateError::DivisionByZero);
        }
        Ok(json!(as_f64(v)? / total * 100.0))
    });
    func!(m, "isPositive", 0, 0, NumberLike, |v, _| {
        Ok(json!(as_f64(v)? > 0.0))
    });
    func!(m, "isNegative", 0, 0, NumberLike, |v, _| {
        Ok(json!(as_f64(v)? < 0.0))
    });
    func!(m, "isZero", 0, 0, NumberLike, |v, _| {
        Ok(json!(as_f64(v)? == 0.0))
    });

    // ---- date ----
    func!(m, "plusDays", 1, 1, DateLike, |v, args| {
        shift(v, Duration::days(as_i64(&args[0])?))
    });
    func!(m, "minusDays", 1, 1, DateLike, |v, args| {
        shift(v, Duration::days(-as_i64(&args[0])?))
    });
    func!(m, "plusHours", 1, 1, DateLike, |v, args| {
        shift(v, Duration::hours(as_i64(&args[0])?))
    });
    func!(m, "minusHours", 1, 1, DateLike, |v, args| {
        shift(v, Duration::hours(-as_i64(&args[0])?))
    });
    func!(m, "plusMinutes", 1, 1, DateLike, |v, args| {
        shift(v, Duration::minutes(as_i64(&args[0])?))
    });
    func!(m, "format", 1, 1, DateLike, |v, args| {
        let dt = as_datetime(v)?;
        Ok(json!(format_date(&dt, &stringify(&args[0]))))
    });
    func!(m, "isAfter", 1, 1, DateLike, |v, args| {
        Ok(json!(as_datetime(v)? > as_datetime(&args[0])?))
    });
    func!(m, "isBefore", 1, 1, DateLike, |v, args| {
        Ok(json!(as_datetime(v)? < as_datetime(&args[0])?))
    });
    func!(m, "dayOfWeek", 0, 0, DateLike, |v, _| {
        Ok(json!(weekday_name(&as_datetime(v)?, true)))
    });
    func!(m, "startOfDay", 0, 0, DateLike, |v, _| {
        let dt = as_datetime(v)?;
        let start = Utc
            .with_ymd_and_hms(dt.year(), dt.month(), dt.day(), 0, 0, 0)
            .single()
            .ok_or_else(|| TemplateError::Eval("invalid date".to_string()))?;
        Ok(json!(start.to_rfc3339()))
    });
    func!(m, "endOfDay", 0, 0, DateLike, |v, _| {
        let dt = as_datetime(v)?;
        let end = Utc
            .with_ymd_and_hms(dt.year(), dt.month(), dt.day(), 23, 59, 59)
            .single()
            .ok_or_else(|| TemplateError::Eval("invalid date".to_string()))?
            + Duration::milliseconds(999);
        Ok(json!(end.to_rfc3339()))
    });
    func!(m, "toEpochMs", 0, 0, DateLike, |v, _| {
        Ok(json!(as_datetime(v)?.timestamp_millis()))
    });
    func!(m, "diffDays", 1, 1, DateLike, |v, args| {
        Ok(json!((as_datetime(v)? - as_datetime(&args[0])?).num_days()))
    });

    // ---- collection ----
    func!(m, "size", 0, 0, ArrayLike, |v, _| Ok(json!(as_array(v)?.len())));
    func!(m, "count", 0, 0, ArrayLike, |v, _| Ok(json!(as_array(v)?.len())));
    func!(m, "first", 0, 0, ArrayLike, |v, _| {
        Ok(as_array(v)?.first().cloned().unwrap_or(Value::Null))
    });
    func!(m, "last", 0, 0, ArrayLike, |v, _| {
        Ok(as_array(v)?.last().cloned().unwrap_or(Value::Null))
    });
    func!(m, "join", 0, 1, ArrayLike, |v, args| {
        let sep = args.first().map(|a| stringify(a)).unwrap_or_else(|| ", ".to_string());
        let parts: Vec<String> = as_array(v)?.iter().map(stringify).collect();
        Ok(json!(parts.join(&sep)))
    });
    func!(m, "contains", 1, 1, Any, |v, args| match v {
        Value::Array(items) => Ok(json!(items.iter().any(|item| loose_eq(item, &args[0])))),
        Value::String(s) => Ok(json!(s.contains(&stringify(&args[0])))),
        other => Err(TemplateError::Eval(format!(
            "contains is not applicable to {}",
            kind_name(other)
        ))),
    });
    func!(m, "flatten", 0, 0, ArrayLike, |v, _| {
        let mut out = Vec::new();
        for item in as_array(v)? {
            match item {
                Value::Array(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        Ok(Value::Array(out))
    });
    func!(m, "unique", 0, 0, ArrayLike, |v, _| {
        let mut out: Vec<Value> = Vec::new();
        for item in as_array(v)? {
            if !out.contains(&item) {
                out.push(item);
            }
        }
        Ok(Value::Array(out))
    });
    func!(m, "sort", 0, 0, ArrayLike, |v, _| {
        let mut items = as_array(v)?;
        items.sort_by(|a, b| match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
            _ => stringify(a).cmp(&stringify(b)),
        });
        Ok(Value::Array(items))
    });
    func!(m, "reverse", 0, 0, ArrayLike, |v, _| {
        let mut items = as_array(v)?;
        items.reverse();
        Ok(Value::Array(items))
    });
    func!(m, "at", 1, 1, ArrayLike, |v, args| {
        let items = as_array(v)?;
        let index = as_usize(&args[0])?;
        Ok(items.get(index).cloned().unwrap_or(Value::Null))
    });
    func!(m, "slice", 1, 2, ArrayLike, |v, args| {
        let items = as_array(v)?;
        let start = as_usize(&args[0])?.min(items.len());
        let end = match args.get(1) {
            Some(arg) => as_usize(arg)?.min(items.len()),
            None => items.len(),
        };
        Ok(Value::Array(items[start..end.max(start)].to_vec()))
    });
    func!(m, "map", 1, 1, ArrayLike, |v, args| {
        let path = stringify(&args[0]);
        let mapped: Vec<Value> = as_array(v)?
            .iter()
            .map(|item| navigate_path(item, &path))
            .collect();
        Ok(Value::Array(mapped))
    });
    func!(m, "filter", 1, 2, ArrayLike, |v, args| {
        let path = stringify(&args[0]);
        let kept: Vec<Value> = as_array(v)?
            .into_iter()
            .filter(|item| {
                let found = navigate_path(item, &path);
                match args.get(1) {
                    Some(expected) => loose_eq(&found, expected),
                    None => is_truthy(&found),
                }
            })
            .collect();
        Ok(Value::Array(kept))
    });
    func!(m, "sum", 0, 1, ArrayLike, |v, args| {
        Ok(json!(numeric_values(v, args)?.into_iter().sum::<f64>()))
    });
    func!(m, "avg", 0, 1, ArrayLike, |v, args| {
        let numbers = numeric_values(v, args)?;
        if numbers.is_empty() {
            return Ok(json!(0));
        }
        Ok(json!(numbers.iter().sum::<f64>() / numbers.len() as f64))
    });

    m
}

// =============================================================================
// Coercions
// =============================================================================

fn kind_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn as_string(v: &Value) -> Result<String, TemplateError> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(_) | Value::Bool(_) => Ok(stringify(v)),
        other => Err(TemplateError::Eval(format!(
            "expected a string, got {}",
            kind_name(other)
        ))),
    }
}

fn as_f64(v: &Value) -> Result<f64, TemplateError> {
    match v {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| TemplateError::Eval("number out of range".to_string())),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| TemplateError::Eval(format!("'{}' is not a number", s))),
        other => Err(TemplateError::Eval(format!(
            "expected a number, got {}",
            kind_name(other)
        ))),
    }
}

fn as_i64(v: &Value) -> Result<i64, TemplateError> {
    Ok(as_f64(v)? as i64)
}

fn as_usize(v: &Value) -> Result<usize, TemplateError> {
    let n = as_f64(v)?;
    if n < 0.0 {
        return Err(TemplateError::Eval(format!("expected a non-negative number, got {}", n)));
    }
    Ok(n as usize)
}

fn as_array(v: &Value) -> Result<Vec<Value>, TemplateError> {
    match v {
        Value::Array(items) => Ok(items.clone()),
        other => Err(TemplateError::Eval(format!(
            "expected an array, got {}",
            kind_name(other)
        ))),
    }
}

pub(crate) fn as_datetime(v: &Value) -> Result<DateTime<Utc>, TemplateError> {
    match v {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                if let Some(dt) = date.and_hms_opt(0, 0, 0) {
                    return Ok(Utc.from_utc_datetime(&dt));
                }
            }
            Err(TemplateError::Eval(format!("'{}' is not a date", s)))
        }
        Value::Number(n) => {
            let millis = n
                .as_i64()
                .ok_or_else(|| TemplateError::Eval("epoch out of range".to_string()))?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| TemplateError::Eval("epoch out of range".to_string()))
        }
        other => Err(TemplateError::Eval(format!(
            "expected a date, got {}",
            kind_name(other)
        ))),
    }
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn pad(s: &str, args: &[Value], at_start: bool) -> Result<String, TemplateError> {
    let width = as_usize(&args[0])?;
    let fill = args
        .get(1)
        .map(|a| stringify(a))
        .filter(|f| !f.is_empty())
        .unwrap_or_else(|| " ".to_string());
    let fill_char = fill.chars().next().unwrap_or(' ');

    let current = s.chars().count();
    if current >= width {
        return Ok(s.to_string());
    }
    let padding: String = std::iter::repeat(fill_char).take(width - current).collect();
    Ok(if at_start {
        padding + s
    } else {
        s.to_string() + &padding
    })
}

fn shift(v: &Value, by: Duration) -> Result<Value, TemplateError> {
    Ok(json!((as_datetime(v)? + by).to_rfc3339()))
}

fn numeric_values(v: &Value, args: &[Value]) -> Result<Vec<f64>, TemplateError> {
    let items = as_array(v)?;
    let path = args.first().map(|a| stringify(a));
    Ok(items
        .iter()
        .map(|item| match &path {
            Some(path) => navigate_path(item, path),
            None => item.clone(),
        })
        .filter_map(|value| as_f64(&value).ok())
        .collect())
}

// =============================================================================
// Date formatting
// =============================================================================

fn weekday_name(dt: &DateTime<Utc>, full: bool) -> String {
    let name = match dt.weekday() {
        chrono::Weekday::Mon => "Monday",
        chrono::Weekday::Tue => "Tuesday",
        chrono::Weekday::Wed => "Wednesday",
        chrono::Weekday::Thu => "Thursday",
        chrono::Weekday::Fri => "Friday",
        chrono::Weekday::Sat => "Saturday",
        chrono::Weekday::Sun => "Sunday",
    };
    if full {
        name.to_string()
    } else {
        name[..3].to_string()
    }
}

/// Token-based date formatting, longest token first so `yyyy` never gets
/// eaten as two `yy`s.
pub(crate) fn format_date(dt: &DateTime<Utc>, pattern: &str) -> String {
    const TOKENS: &[&str] = &[
        "EEEE", "yyyy", "SSS", "EEE", "HH", "MM", "dd", "mm", "ss", "yy", "H", "M", "d", "m", "s",
    ];

    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    'outer: while i < chars.len() {
        for token in TOKENS {
            let token_chars: Vec<char> = token.chars().collect();
            if chars[i..].starts_with(&token_chars) {
                out.push_str(&render_token(dt, token));
                i += token_chars.len();
                continue 'outer;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn render_token(dt: &DateTime<Utc>, token: &str) -> String {
    match token {
        "yyyy" => format!("{:04}", dt.year()),
        "yy" => format!("{:02}", dt.year() % 100),
        "MM" => format!("{:02}", dt.month()),
        "M" => dt.month().to_string(),
        "dd" => format!("{:02}", dt.day()),
        "d" => dt.day().to_string(),
        "HH" => format!("{:02}", dt.hour()),
        "H" => dt.hour().to_string(),
        "mm" => format!("{:02}", dt.minute()),
        "m" => dt.minute().to_string(),
        "ss" => format!("{:02}", dt.second()),
        "s" => dt.second().to_string(),
        "SSS" => format!("{:03}", dt.timestamp_subsec_millis()),
        "EEEE" => weekday_name(dt, true),
        "EEE" => weekday_name(dt, false),
        _ => token.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(name: &str, value: Value, args: &[Value]) -> Result<Value, TemplateError> {
        let def = lookup(name).expect("function registered");
        (def.apply)(&value, args)
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(apply("toUpperCase", json!("abc"), &[]).unwrap(), json!("ABC"));
        assert_eq!(apply("capitalize", json!("hello"), &[]).unwrap(), json!("Hello"));
        assert_eq!(
            apply("truncate", json!("hello world"), &[json!(5)]).unwrap(),
            json!("hello...")
        );
        assert_eq!(
            apply("replace", json!("a-b-c"), &[json!("-"), json!("/")]).unwrap(),
            json!("a/b/c")
        );
        assert_eq!(
            apply("padStart", json!("7"), &[json!(3), json!("0")]).unwrap(),
            json!("007")
        );
        assert_eq!(
            apply("htmlEncode", json!("<a & b>"), &[]).unwrap(),
            json!("&lt;a &amp; b&gt;")
        );
        assert_eq!(
            apply("urlEncode", json!("a b/c"), &[]).unwrap(),
            json!("a%20b%2Fc")
        );
    }

    #[test]
    fn test_number_functions() {
        assert_eq!(apply("toNumber", json!("42"), &[]).unwrap(), json!(42.0));
        assert_eq!(apply("round", json!(3.456), &[json!(2)]).unwrap(), json!(3.46));
        assert_eq!(apply("abs", json!(-5), &[]).unwrap(), json!(5.0));
        assert_eq!(
            apply("percentage", json!(25), &[json!(200)]).unwrap(),
            json!(12.5)
        );
        assert!(matches!(
            apply("percentage", json!(25), &[json!(0)]),
            Err(TemplateError::DivisionByZero)
        ));
    }

    #[test]
    fn test_date_functions() {
        let date = json!("2026-03-01T10:30:00Z");
        assert_eq!(
            apply("format", date.clone(), &[json!("yyyy-MM-dd")]).unwrap(),
            json!("2026-03-01")
        );
        assert_eq!(apply("dayOfWeek", date.clone(), &[]).unwrap(), json!("Sunday"));
        let shifted = apply("plusDays", date.clone(), &[json!(2)]).unwrap();
        assert!(shifted.as_str().unwrap().starts_with("2026-03-03"));
        assert_eq!(
            apply("diffDays", json!("2026-03-05"), &[json!("2026-03-01")]).unwrap(),
            json!(4)
        );
    }

    #[test]
    fn test_format_tokens_are_longest_first() {
        let dt = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_date(&dt, "yyyy/yy MM:M EEE"), "2026/26 01:1 Fri");
        assert_eq!(format_date(&dt, "HH:mm:ss.SSS"), "03:04:05.000");
    }

    #[test]
    fn test_collection_functions() {
        let tags = json!(["b", "a", "b"]);
        assert_eq!(apply("size", tags.clone(), &[]).unwrap(), json!(3));
        assert_eq!(
            apply("unique", tags.clone(), &[]).unwrap(),
            json!(["b", "a"])
        );
        assert_eq!(
            apply("sort", tags.clone(), &[]).unwrap(),
            json!(["a", "b", "b"])
        );
        assert_eq!(
            apply("join", tags, &[json!(" / ")]).unwrap(),
            json!("b / a / b")
        );
        assert_eq!(
            apply("flatten", json!([[1, 2], [3]]), &[]).unwrap(),
            json!([1, 2, 3])
        );
    }

    #[test]
    fn test_map_honors_attributes_rewrite() {
        let items = json!([
            { "attributeValues": { "Priority": "High" } },
            { "attributeValues": { "Priority": "Low" } }
        ]);
        assert_eq!(
            apply("map", items.clone(), &[json!("attributes.Priority")]).unwrap(),
            json!(["High", "Low"])
        );
        assert_eq!(
            apply("filter", items, &[json!("attributes.Priority"), json!("high")]).unwrap(),
            json!([{ "attributeValues": { "Priority": "High" } }])
        );
    }

    #[test]
    fn test_sum_and_avg() {
        let rows = json!([{ "n": 1 }, { "n": 2 }, { "n": "3" }, { "n": null }]);
        assert_eq!(apply("sum", rows.clone(), &[json!("n")]).unwrap(), json!(6.0));
        assert_eq!(apply("avg", rows, &[json!("n")]).unwrap(), json!(2.0));
        assert_eq!(apply("avg", json!([]), &[]).unwrap(), json!(0));
    }
}
