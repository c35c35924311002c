//! Filter and condition expressions used by the tree query engine.
//!
//! Filters follow the familiar metadata filter syntax: `key: pattern` terms
//! combined with `&` (and) and `|` (or), a leading `-` negating a term, and
//! comma-separated patterns inside one term acting as alternatives. Patterns
//! are regular expressions searched in the attribute value (or in any element
//! of a list value).
//!
//! Conditions are simple comparisons of one attribute against a literal:
//! `order < 50`, `tier == "1"`, `manual != true`, `name ~ /smoke/`. They may
//! be chained with `and` / `or`.
//!
//! In both languages a missing attribute makes the expression non-matching;
//! it never raises. That keeps a single malformed expression from crashing
//! a whole-tree query.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Evaluation failures the caller is expected to treat as "no match".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("missing attribute '{0}'")]
    MissingAttribute(String),
    #[error("invalid expression '{0}'")]
    Syntax(String),
}

/// Attribute mapping prepared for filtering.
///
/// Every attribute is rendered into one or more candidate strings: scalars
/// become one candidate, lists one per element. Boolean attributes carry
/// both the capitalized and the lower-cased spelling so that filters may be
/// written case-insensitively (`enabled:true` and `enabled:True` both work).
pub type FilterVars = BTreeMap<String, Vec<String>>;

/// Build filter variables from an exported attribute mapping.
pub fn filter_vars(data: &serde_json::Map<String, Value>) -> FilterVars {
    let mut vars = FilterVars::new();
    for (key, value) in data {
        let mut candidates = Vec::new();
        collect_candidates(value, &mut candidates);
        vars.insert(key.clone(), candidates);
    }
    vars
}

fn collect_candidates(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::Bool(flag) => {
            out.push(if *flag { "True" } else { "False" }.to_string());
            out.push(flag.to_string());
        }
        Value::Number(number) => out.push(number.to_string()),
        Value::String(text) => out.push(text.clone()),
        Value::Array(items) => {
            for item in items {
                collect_candidates(item, out);
            }
        }
        Value::Object(_) => {}
    }
}

/// Evaluate a filter expression against prepared variables.
pub fn matches_filter(expression: &str, vars: &FilterVars) -> Result<bool, EvalError> {
    let expression = expression.trim();
    if expression.is_empty() {
        return Err(EvalError::Syntax(expression.to_string()));
    }
    for clause in expression.split('|') {
        let mut clause_matches = true;
        for term in clause.split('&') {
            if !matches_term(term.trim(), vars)? {
                clause_matches = false;
                break;
            }
        }
        if clause_matches {
            return Ok(true);
        }
    }
    Ok(false)
}

fn matches_term(term: &str, vars: &FilterVars) -> Result<bool, EvalError> {
    let (negated, term) = match term.strip_prefix('-') {
        Some(rest) => (true, rest.trim()),
        None => (false, term),
    };
    let (key, patterns) = term
        .split_once(':')
        .ok_or_else(|| EvalError::Syntax(term.to_string()))?;
    let key = key.trim();
    let candidates = vars
        .get(key)
        .ok_or_else(|| EvalError::MissingAttribute(key.to_string()))?;

    let mut matched = false;
    for pattern in patterns.split(',') {
        let regex = Regex::new(pattern.trim())
            .map_err(|_| EvalError::Syntax(pattern.trim().to_string()))?;
        if candidates.iter().any(|value| regex.is_match(value)) {
            matched = true;
            break;
        }
    }
    Ok(matched != negated)
}

/// Evaluate a condition expression against raw attribute values.
///
/// Supported comparisons: `==`, `!=`, `<`, `<=`, `>`, `>=`, `~` (regex
/// search) and `!~`. Chaining with `and` / `or` is allowed; `and` binds
/// tighter than `or`.
pub fn evaluate_condition(
    expression: &str,
    data: &serde_json::Map<String, Value>,
) -> Result<bool, EvalError> {
    for or_part in split_keyword(expression, " or ") {
        let mut all = true;
        for and_part in split_keyword(&or_part, " and ") {
            if !evaluate_comparison(and_part.trim(), data)? {
                all = false;
                break;
            }
        }
        if all {
            return Ok(true);
        }
    }
    Ok(false)
}

fn split_keyword(expression: &str, keyword: &str) -> Vec<String> {
    expression
        .split(keyword)
        .map(|part| part.to_string())
        .collect()
}

fn evaluate_comparison(
    expression: &str,
    data: &serde_json::Map<String, Value>,
) -> Result<bool, EvalError> {
    if expression.is_empty() {
        return Err(EvalError::Syntax(expression.to_string()));
    }

    const OPERATORS: [&str; 8] = ["==", "!=", "<=", ">=", "!~", "<", ">", "~"];
    for operator in OPERATORS {
        if let Some((left, right)) = expression.split_once(operator) {
            let key = left.trim();
            let literal = parse_literal(right.trim());
            let value = data
                .get(key)
                .filter(|value| !value.is_null())
                .ok_or_else(|| EvalError::MissingAttribute(key.to_string()))?;
            return compare(value, operator, &literal);
        }
    }

    // A bare attribute name tests truthiness.
    let key = expression;
    let value = data
        .get(key)
        .ok_or_else(|| EvalError::MissingAttribute(key.to_string()))?;
    Ok(truthy(value))
}

fn parse_literal(text: &str) -> Value {
    let unquoted = text
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .or_else(|| {
            text.strip_prefix('\'')
                .and_then(|rest| rest.strip_suffix('\''))
        });
    if let Some(inner) = unquoted {
        return Value::String(inner.to_string());
    }
    if let Ok(number) = text.parse::<i64>() {
        return Value::Number(number.into());
    }
    match text {
        "true" | "True" => Value::Bool(true),
        "false" | "False" => Value::Bool(false),
        other => Value::String(other.to_string()),
    }
}

fn compare(value: &Value, operator: &str, literal: &Value) -> Result<bool, EvalError> {
    // List attributes compare with any-element semantics for equality
    // and regex operators.
    if let Value::Array(items) = value {
        let results = items
            .iter()
            .map(|item| compare(item, operator, literal))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(match operator {
            "!=" | "!~" => results.iter().all(|matched| *matched),
            _ => results.iter().any(|matched| *matched),
        });
    }

    match operator {
        "==" => Ok(loosely_equal(value, literal)),
        "!=" => Ok(!loosely_equal(value, literal)),
        "~" | "!~" => {
            let pattern = literal
                .as_str()
                .map(|text| text.trim_matches('/'))
                .ok_or_else(|| EvalError::Syntax(literal.to_string()))?;
            let regex =
                Regex::new(pattern).map_err(|_| EvalError::Syntax(pattern.to_string()))?;
            let matched = regex.is_match(&stringify(value));
            Ok(if operator == "~" { matched } else { !matched })
        }
        "<" | "<=" | ">" | ">=" => {
            let ordering = match (numeric(value), numeric(literal)) {
                (Some(left), Some(right)) => left.cmp(&right),
                _ => stringify(value).cmp(&stringify(literal)),
            };
            Ok(match operator {
                "<" => ordering.is_lt(),
                "<=" => ordering.is_le(),
                ">" => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
        other => Err(EvalError::Syntax(other.to_string())),
    }
}

fn loosely_equal(value: &Value, literal: &Value) -> bool {
    if value == literal {
        return true;
    }
    stringify(value) == stringify(literal)
}

fn numeric(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_i64() != Some(0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(mapping) => !mapping.is_empty(),
    }
}
