//! Grouping and aggregation

use serde_json::{json, Map, Number, Value};

use crate::document::path_value;
use crate::error::{DbError, Result};

use super::filter::Filter;

/// Group-key bucket for documents missing a grouped field
const NULL_BUCKET: &str = "NULL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    pub fn parse(s: &str) -> Result<AggFunc> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "count" => AggFunc::Count,
            "sum" => AggFunc::Sum,
            "avg" => AggFunc::Avg,
            "min" => AggFunc::Min,
            "max" => AggFunc::Max,
            other => {
                return Err(DbError::BadRequest(format!(
                    "unknown aggregation function {:?}",
                    other
                )))
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct AggSpec {
    pub func: AggFunc,
    pub field: String,
}

/// Partition the documents by `group_by`, compute every named aggregation
/// per partition, and filter the groups with `having`.
pub fn run(
    docs: &[Value],
    group_by: &[String],
    aggregations: &[(String, AggSpec)],
    having: Option<&Filter>,
) -> Vec<Value> {
    // Partition preserving first-seen group order
    let mut order: Vec<String> = Vec::new();
    let mut groups: std::collections::HashMap<String, Vec<&Value>> =
        std::collections::HashMap::new();

    for doc in docs {
        let key = group_key(doc, group_by);
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(doc);
    }

    let mut out = Vec::with_capacity(order.len());
    for key in order {
        let members = &groups[&key];
        let mut row = Map::new();

        if let Some(first) = members.first() {
            for field in group_by {
                let value = path_value(first, field).cloned().unwrap_or(Value::Null);
                row.insert(field.clone(), value);
            }
        }

        for (name, spec) in aggregations {
            row.insert(name.clone(), compute(members, spec));
        }

        let row = Value::Object(row);
        if having.map_or(true, |f| f.matches(&row)) {
            out.push(row);
        }
    }
    out
}

fn group_key(doc: &Value, group_by: &[String]) -> String {
    if group_by.is_empty() {
        return String::new();
    }
    group_by
        .iter()
        .map(|field| match path_value(doc, field) {
            None | Some(Value::Null) => NULL_BUCKET.to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("|")
}

fn compute(members: &[&Value], spec: &AggSpec) -> Value {
    if spec.func == AggFunc::Count {
        let count = if spec.field == "*" {
            members.len()
        } else {
            members
                .iter()
                .filter(|doc| !matches!(path_value(doc, &spec.field), None | Some(Value::Null)))
                .count()
        };
        return json!(count);
    }

    // Numeric-convertible values only; everything else is skipped
    let values: Vec<f64> = members
        .iter()
        .filter_map(|doc| path_value(doc, &spec.field))
        .filter_map(numeric)
        .collect();

    match spec.func {
        AggFunc::Sum => number(values.iter().sum()),
        AggFunc::Avg => {
            if values.is_empty() {
                Value::Null
            } else {
                number(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        AggFunc::Min => values
            .iter()
            .copied()
            .reduce(f64::min)
            .map(number)
            .unwrap_or(Value::Null),
        AggFunc::Max => values
            .iter()
            .copied()
            .reduce(f64::max)
            .map(number)
            .unwrap_or(Value::Null),
        AggFunc::Count => unreachable!(),
    }
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn number(n: f64) -> Value {
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}
