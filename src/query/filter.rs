//! Filter tree: parsing and evaluation
//!
//! A filter is either a leaf `{field, op, value}` or a combinator
//! `{and: [...]}` / `{or: [...]}` / `{not: {...}}`. Comparisons are
//! numeric when both sides are numbers, lexicographic for strings;
//! values of mismatched types never compare.

use regex::Regex;
use serde_json::Value;

use crate::document::path_value;
use crate::error::{DbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    Between,
    In,
    IsNull,
    IsNotNull,
}

impl Op {
    pub fn parse(s: &str) -> Result<Op> {
        let normalized = s.trim().to_ascii_lowercase();
        Ok(match normalized.as_str() {
            "=" | "==" => Op::Eq,
            "!=" | "<>" => Op::Ne,
            ">" => Op::Gt,
            ">=" => Op::Ge,
            "<" => Op::Lt,
            "<=" => Op::Le,
            "like" => Op::Like,
            "between" => Op::Between,
            "in" => Op::In,
            "is null" => Op::IsNull,
            "is not null" => Op::IsNotNull,
            _ => return Err(DbError::BadRequest(format!("unknown operator {:?}", s))),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub field: String,
    pub op: Op,
    pub value: Value,
    /// Compiled pattern for `like`
    like: Option<Regex>,
}

#[derive(Debug, Clone)]
pub enum Filter {
    Leaf(Condition),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Parse a filter object
    pub fn from_value(v: &Value) -> Result<Filter> {
        let Value::Object(obj) = v else {
            return Err(DbError::BadRequest("filter must be a JSON object".into()));
        };

        if let Some(children) = obj.get("and") {
            return Ok(Filter::And(Self::parse_children(children, "and")?));
        }
        if let Some(children) = obj.get("or") {
            return Ok(Filter::Or(Self::parse_children(children, "or")?));
        }
        if let Some(inner) = obj.get("not") {
            return Ok(Filter::Not(Box::new(Filter::from_value(inner)?)));
        }

        let field = obj
            .get("field")
            .and_then(Value::as_str)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| DbError::BadRequest("filter leaf needs a field".into()))?;
        let op = obj
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| DbError::BadRequest("filter leaf needs an op".into()))?;
        let op = Op::parse(op)?;
        let value = obj.get("value").cloned().unwrap_or(Value::Null);

        Self::validate_leaf(op, &value)?;
        let like = match (op, &value) {
            (Op::Like, Value::String(pattern)) => Some(compile_like(pattern)),
            _ => None,
        };

        Ok(Filter::Leaf(Condition {
            field: field.to_string(),
            op,
            value,
            like,
        }))
    }

    fn parse_children(v: &Value, combinator: &str) -> Result<Vec<Filter>> {
        let Value::Array(items) = v else {
            return Err(DbError::BadRequest(format!("{} expects an array", combinator)));
        };
        if items.is_empty() {
            return Err(DbError::BadRequest(format!("{} must not be empty", combinator)));
        }
        items.iter().map(Filter::from_value).collect()
    }

    fn validate_leaf(op: Op, value: &Value) -> Result<()> {
        match op {
            Op::Between => match value {
                Value::Array(arr) if arr.len() == 2 => Ok(()),
                _ => Err(DbError::BadRequest(
                    "between expects a two-element array".into(),
                )),
            },
            Op::In => match value {
                Value::Array(_) => Ok(()),
                _ => Err(DbError::BadRequest("in expects an array".into())),
            },
            Op::Like => match value {
                Value::String(_) => Ok(()),
                _ => Err(DbError::BadRequest("like expects a string pattern".into())),
            },
            _ => Ok(()),
        }
    }

    /// Evaluate against a document
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::Leaf(cond) => cond.matches(doc),
            Filter::And(children) => children.iter().all(|f| f.matches(doc)),
            Filter::Or(children) => children.iter().any(|f| f.matches(doc)),
            Filter::Not(inner) => !inner.matches(doc),
        }
    }
}

impl Condition {
    pub fn matches(&self, doc: &Value) -> bool {
        let field_value = path_value(doc, &self.field);

        match self.op {
            Op::IsNull => matches!(field_value, None | Some(Value::Null)),
            Op::IsNotNull => !matches!(field_value, None | Some(Value::Null)),
            Op::Eq => field_value.map_or(false, |v| values_equal(v, &self.value)),
            Op::Ne => field_value.map_or(true, |v| !values_equal(v, &self.value)),
            Op::Gt | Op::Ge | Op::Lt | Op::Le => {
                let Some(v) = field_value else { return false };
                let Some(ord) = compare_values(v, &self.value) else {
                    return false;
                };
                match self.op {
                    Op::Gt => ord.is_gt(),
                    Op::Ge => ord.is_ge(),
                    Op::Lt => ord.is_lt(),
                    Op::Le => ord.is_le(),
                    _ => unreachable!(),
                }
            }
            Op::Between => {
                let Some(v) = field_value else { return false };
                let Value::Array(bounds) = &self.value else {
                    return false;
                };
                let (Some(lo), Some(hi)) = (
                    compare_values(v, &bounds[0]),
                    compare_values(v, &bounds[1]),
                ) else {
                    return false;
                };
                lo.is_ge() && hi.is_le()
            }
            Op::In => {
                let Some(v) = field_value else { return false };
                let Value::Array(candidates) = &self.value else {
                    return false;
                };
                candidates.iter().any(|c| values_equal(v, c))
            }
            Op::Like => {
                let Some(s) = field_value.and_then(Value::as_str) else {
                    return false;
                };
                self.like.as_ref().map_or(false, |re| re.is_match(s))
            }
        }
    }
}

/// Equality with numeric coercion: `1` equals `1.0`
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Ordering: numeric when both numbers, lexicographic when both strings,
/// booleans false < true; anything else does not compare.
pub fn compare_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            Some(x.as_f64()?.total_cmp(&y.as_f64()?))
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Translate a `like` pattern: `%` becomes `.*`, everything else is
/// escaped; matching is case-insensitive over the whole string.
fn compile_like(pattern: &str) -> Regex {
    let translated = format!(
        "^{}$",
        pattern
            .split('%')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*")
    );

    regex::RegexBuilder::new(&translated)
        .case_insensitive(true)
        .build()
        // Every metacharacter was escaped, so the pattern is well-formed
        .unwrap_or_else(|_| Regex::new("$^").expect("never-matching regex"))
}
