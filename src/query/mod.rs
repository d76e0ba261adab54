//! Structured queries
//!
//! A query is a JSON object: `{filter?, order_by?, limit?, offset?,
//! count?, aggregations?, group_by?, having?, distinct?, projection?,
//! lookups?}`. The engine plans index access, merges the hot and cold
//! tiers, and post-processes (sort, paginate, aggregate, join, project).

pub mod aggregate;
pub mod exec;
pub mod filter;
pub mod plan;

pub use aggregate::{AggFunc, AggSpec};
pub use exec::QueryEngine;
pub use filter::{Filter, Op};
pub use plan::{plan, Plan};

use serde_json::Value;

use crate::error::{DbError, Result};

#[derive(Debug, Clone)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

#[derive(Debug, Clone)]
pub struct LookupSpec {
    pub from: String,
    pub local_field: String,
    pub foreign_field: String,
    pub as_field: String,
}

#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub filter: Option<Filter>,
    pub order_by: Vec<SortKey>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub count: bool,
    pub aggregations: Vec<(String, AggSpec)>,
    pub group_by: Vec<String>,
    pub having: Option<Filter>,
    pub distinct: Option<String>,
    pub projection: Vec<String>,
    pub lookups: Vec<LookupSpec>,
}

impl QuerySpec {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| DbError::BadRequest(format!("invalid query JSON: {}", e)))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Object(obj) = value else {
            return Err(DbError::BadRequest("query must be a JSON object".into()));
        };

        let mut spec = Self::default();

        if let Some(f) = obj.get("filter").filter(|v| !v.is_null()) {
            spec.filter = Some(Filter::from_value(f)?);
        }

        if let Some(order) = obj.get("order_by").filter(|v| !v.is_null()) {
            let Value::Array(keys) = order else {
                return Err(DbError::BadRequest("order_by must be an array".into()));
            };
            for key in keys {
                let field = key
                    .get("field")
                    .and_then(Value::as_str)
                    .filter(|f| !f.is_empty())
                    .ok_or_else(|| DbError::BadRequest("order_by entry needs a field".into()))?;
                let descending = match key.get("direction").and_then(Value::as_str) {
                    None | Some("asc") => false,
                    Some("desc") => true,
                    Some(other) => {
                        return Err(DbError::BadRequest(format!(
                            "direction must be \"asc\" or \"desc\", got {:?}",
                            other
                        )))
                    }
                };
                spec.order_by.push(SortKey {
                    field: field.to_string(),
                    descending,
                });
            }
        }

        if let Some(limit) = obj.get("limit").filter(|v| !v.is_null()) {
            let limit = limit
                .as_u64()
                .ok_or_else(|| DbError::BadRequest("limit must be a non-negative integer".into()))?;
            spec.limit = Some(limit as usize);
        }

        if let Some(offset) = obj.get("offset").filter(|v| !v.is_null()) {
            let offset = offset
                .as_u64()
                .ok_or_else(|| DbError::BadRequest("offset must be a non-negative integer".into()))?;
            spec.offset = offset as usize;
        }

        if let Some(count) = obj.get("count").filter(|v| !v.is_null()) {
            spec.count = count
                .as_bool()
                .ok_or_else(|| DbError::BadRequest("count must be a boolean".into()))?;
        }

        if let Some(aggs) = obj.get("aggregations").filter(|v| !v.is_null()) {
            let Value::Object(aggs) = aggs else {
                return Err(DbError::BadRequest("aggregations must be an object".into()));
            };
            for (name, body) in aggs {
                let func = body
                    .get("func")
                    .and_then(Value::as_str)
                    .ok_or_else(|| DbError::BadRequest(format!("aggregation {} needs a func", name)))?;
                let field = body
                    .get("field")
                    .and_then(Value::as_str)
                    .unwrap_or("*");
                spec.aggregations.push((
                    name.clone(),
                    AggSpec {
                        func: AggFunc::parse(func)?,
                        field: field.to_string(),
                    },
                ));
            }
        }

        if let Some(group) = obj.get("group_by").filter(|v| !v.is_null()) {
            let Value::Array(fields) = group else {
                return Err(DbError::BadRequest("group_by must be an array".into()));
            };
            for field in fields {
                let field = field
                    .as_str()
                    .filter(|f| !f.is_empty())
                    .ok_or_else(|| DbError::BadRequest("group_by entries must be strings".into()))?;
                spec.group_by.push(field.to_string());
            }
        }

        if let Some(h) = obj.get("having").filter(|v| !v.is_null()) {
            spec.having = Some(Filter::from_value(h)?);
        }

        if let Some(d) = obj.get("distinct").filter(|v| !v.is_null()) {
            let field = d
                .as_str()
                .filter(|f| !f.is_empty())
                .ok_or_else(|| DbError::BadRequest("distinct must be a field name".into()))?;
            spec.distinct = Some(field.to_string());
        }

        if let Some(proj) = obj.get("projection").filter(|v| !v.is_null()) {
            let Value::Array(fields) = proj else {
                return Err(DbError::BadRequest("projection must be an array".into()));
            };
            for field in fields {
                let field = field
                    .as_str()
                    .filter(|f| !f.is_empty())
                    .ok_or_else(|| DbError::BadRequest("projection entries must be strings".into()))?;
                spec.projection.push(field.to_string());
            }
        }

        if let Some(lookups) = obj.get("lookups").filter(|v| !v.is_null()) {
            let Value::Array(lookups) = lookups else {
                return Err(DbError::BadRequest("lookups must be an array".into()));
            };
            for lookup in lookups {
                let get = |key: &str| -> Result<String> {
                    lookup
                        .get(key)
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .ok_or_else(|| DbError::BadRequest(format!("lookup needs {:?}", key)))
                };
                spec.lookups.push(LookupSpec {
                    from: get("from")?,
                    local_field: get("localField")?,
                    foreign_field: get("foreignField")?,
                    as_field: get("as")?,
                });
            }
        }

        Ok(spec)
    }

    /// Streaming fast path: nothing to do but skip and take
    pub fn is_plain(&self) -> bool {
        self.filter.is_none()
            && self.order_by.is_empty()
            && self.aggregations.is_empty()
            && self.group_by.is_empty()
            && self.distinct.is_none()
            && self.projection.is_empty()
            && self.lookups.is_empty()
            && !self.count
    }

    /// Whether collection can stop as soon as `offset + limit` documents
    /// matched (nothing downstream reorders or recounts them)
    pub fn can_short_circuit(&self) -> bool {
        self.order_by.is_empty()
            && self.aggregations.is_empty()
            && self.group_by.is_empty()
            && self.distinct.is_none()
            && !self.count
            && self.limit.is_some()
    }
}
