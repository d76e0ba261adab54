//! Query executor
//!
//! Pipeline: plan → hot evaluation → cold merge → count/distinct →
//! aggregate → sort → paginate → lookups → projection. The fast path
//! streams raw document bytes without materializing values.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::document::{path_value, FIELD_ID};
use crate::error::Result;
use crate::manager::CollectionManager;
use crate::store::Collection;

use super::filter::values_equal;
use super::plan::{plan, Plan};
use super::{LookupSpec, QuerySpec, SortKey};

pub struct QueryEngine {
    mgr: Arc<CollectionManager>,
}

impl QueryEngine {
    pub fn new(mgr: Arc<CollectionManager>) -> Self {
        Self { mgr }
    }

    /// Execute a query against a collection, returning serialized JSON
    pub async fn execute(&self, collection: &str, raw_query: &[u8]) -> Result<Vec<u8>> {
        let spec = QuerySpec::from_bytes(raw_query)?;
        self.run(collection, &spec).await
    }

    pub async fn run(&self, collection: &str, spec: &QuerySpec) -> Result<Vec<u8>> {
        let Some(coll) = self.mgr.get_existing(collection) else {
            // Querying an absent collection is an empty result, not an error
            return empty_result(spec);
        };

        if spec.is_plain() {
            return self.fast_path(&coll, spec).await;
        }

        let mut docs = self.collect(&coll, spec).await?;

        if spec.count {
            return Ok(serde_json::to_vec(&json!({ "count": docs.len() }))?);
        }

        if let Some(field) = &spec.distinct {
            return Ok(serde_json::to_vec(&Value::Array(distinct_values(
                &docs, field,
            )))?);
        }

        if !spec.aggregations.is_empty() || !spec.group_by.is_empty() {
            docs = super::aggregate::run(
                &docs,
                &spec.group_by,
                &spec.aggregations,
                spec.having.as_ref(),
            );
        }

        sort_docs(&mut docs, &spec.order_by);
        docs = paginate(docs, spec.offset, spec.limit);

        for lookup in &spec.lookups {
            self.apply_lookup(&mut docs, lookup).await?;
        }

        if !spec.projection.is_empty() {
            docs = docs.iter().map(|d| project(d, &spec.projection)).collect();
        }

        Ok(serde_json::to_vec(&Value::Array(docs))?)
    }

    /// No filtering, ordering or shaping: stream raw bytes, skip, take
    async fn fast_path(&self, coll: &Collection, spec: &QuerySpec) -> Result<Vec<u8>> {
        let mut raw_docs: Vec<Vec<u8>> = Vec::new();
        let mut hot_ids = HashSet::new();
        let mut to_skip = spec.offset;
        let mut satisfied = false;

        let at_limit =
            |collected: usize| -> bool { spec.limit.map_or(false, |l| collected >= l) };

        if at_limit(0) {
            return Ok(b"[]".to_vec());
        }

        coll.stream_hot(|id, raw| {
            hot_ids.insert(id.to_string());
            if to_skip > 0 {
                to_skip -= 1;
                return true;
            }
            raw_docs.push(raw.to_vec());
            if at_limit(raw_docs.len()) {
                satisfied = true;
                return false;
            }
            true
        });

        if !satisfied {
            coll.scan_cold(|id, raw, _| {
                if hot_ids.contains(id) {
                    return true;
                }
                if to_skip > 0 {
                    to_skip -= 1;
                    return true;
                }
                raw_docs.push(raw.to_vec());
                !at_limit(raw_docs.len())
            })
            .await?;
        }

        // Assemble the JSON array from the raw document bytes
        let total: usize = raw_docs.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(total + raw_docs.len() + 2);
        out.push(b'[');
        for (i, raw) in raw_docs.iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            out.extend_from_slice(raw);
        }
        out.push(b']');
        Ok(out)
    }

    /// Gather matching documents across both tiers
    async fn collect(&self, coll: &Collection, spec: &QuerySpec) -> Result<Vec<Value>> {
        let mut docs = Vec::new();
        let needed = if spec.can_short_circuit() {
            spec.limit.map(|l| spec.offset.saturating_add(l))
        } else {
            None
        };
        let reached = |docs: &Vec<Value>| needed.map_or(false, |n| docs.len() >= n);

        match plan(spec.filter.as_ref(), coll) {
            Plan::Candidates { ids, residual } => {
                let mut id_list: Vec<String> = ids.into_iter().collect();
                // Stable order keeps pagination deterministic
                id_list.sort();
                for (_, raw) in coll.get_many(&id_list).await? {
                    let Ok(doc) = serde_json::from_slice::<Value>(&raw) else {
                        continue;
                    };
                    if residual.as_ref().map_or(true, |f| f.matches(&doc)) {
                        docs.push(doc);
                        if reached(&docs) {
                            break;
                        }
                    }
                }
            }
            Plan::FullScan => {
                let mut hot_ids = HashSet::new();
                let mut stopped_early = false;
                coll.stream_hot(|id, raw| {
                    hot_ids.insert(id.to_string());
                    if let Ok(doc) = serde_json::from_slice::<Value>(raw) {
                        if spec.filter.as_ref().map_or(true, |f| f.matches(&doc)) {
                            docs.push(doc);
                            if reached(&docs) {
                                stopped_early = true;
                                return false;
                            }
                        }
                    }
                    true
                });

                // Cold merge: the hot tier is authoritative for any id it
                // holds, matching or not
                if !stopped_early {
                    coll.scan_cold(|id, _, doc| {
                        if hot_ids.contains(id) {
                            return true;
                        }
                        if spec.filter.as_ref().map_or(true, |f| f.matches(doc)) {
                            docs.push(doc.clone());
                            if reached(&docs) {
                                return false;
                            }
                        }
                        true
                    })
                    .await?;
                }
            }
        }

        Ok(docs)
    }

    /// Attach joined documents: a single-leaf equality sub-query per result
    async fn apply_lookup(&self, docs: &mut [Value], lookup: &LookupSpec) -> Result<()> {
        for doc in docs.iter_mut() {
            let local = path_value(doc, &lookup.local_field).cloned();
            let matches = match local {
                None | Some(Value::Null) => Vec::new(),
                Some(value) => {
                    self.equality_matches(&lookup.from, &lookup.foreign_field, &value)
                        .await?
                }
            };

            // A single match attaches as an object, anything else as an array
            let attached = match matches.len() {
                1 => matches.into_iter().next().unwrap_or(Value::Null),
                _ => Value::Array(matches),
            };
            if let Value::Object(map) = doc {
                map.insert(lookup.as_field.clone(), attached);
            }
        }
        Ok(())
    }

    async fn equality_matches(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Value>> {
        let Some(coll) = self.mgr.get_existing(collection) else {
            return Ok(Vec::new());
        };

        // Joining on the primary key is a point read
        if field == FIELD_ID {
            let Some(key) = value.as_str() else {
                return Ok(Vec::new());
            };
            return Ok(match coll.get(key).await? {
                Some(raw) => vec![serde_json::from_slice(&raw)?],
                None => Vec::new(),
            });
        }

        let mut out = Vec::new();
        if let Some(index) = coll.index(field) {
            let mut ids: Vec<String> = index.lookup_eq(value).into_iter().collect();
            ids.sort();
            for (_, raw) in coll.get_many(&ids).await? {
                let doc: Value = serde_json::from_slice(&raw)?;
                if path_value(&doc, field).map_or(false, |v| values_equal(v, value)) {
                    out.push(doc);
                }
            }
        } else {
            let mut hot_ids = HashSet::new();
            coll.stream_hot(|id, raw| {
                hot_ids.insert(id.to_string());
                if let Ok(doc) = serde_json::from_slice::<Value>(raw) {
                    if path_value(&doc, field).map_or(false, |v| values_equal(v, value)) {
                        out.push(doc);
                    }
                }
                true
            });
            coll.scan_cold(|id, _, doc| {
                if !hot_ids.contains(id)
                    && path_value(doc, field).map_or(false, |v| values_equal(v, value))
                {
                    out.push(doc.clone());
                }
                true
            })
            .await?;
        }
        Ok(out)
    }
}

fn empty_result(spec: &QuerySpec) -> Result<Vec<u8>> {
    if spec.count {
        return Ok(serde_json::to_vec(&json!({ "count": 0 }))?);
    }
    Ok(b"[]".to_vec())
}

fn distinct_values(docs: &[Value], field: &str) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for doc in docs {
        let value = path_value(doc, field).cloned().unwrap_or(Value::Null);
        let key = value.to_string();
        if seen.insert(key) {
            out.push(value);
        }
    }
    out
}

/// Multi-key stable sort; a missing field sorts before a present one
pub fn sort_docs(docs: &mut [Value], order_by: &[SortKey]) {
    if order_by.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for key in order_by {
            let ord = compare_for_sort(path_value(a, &key.field), path_value(b, &key.field));
            let ord = if key.descending { ord.reverse() } else { ord };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn compare_for_sort(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => Ordering::Equal,
            }
        }
        (Some(a), Some(b)) => sort_text(a).cmp(&sort_text(b)),
    }
}

fn sort_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn paginate(docs: Vec<Value>, offset: usize, limit: Option<usize>) -> Vec<Value> {
    let offset = offset.min(docs.len());
    let mut docs: Vec<Value> = docs.into_iter().skip(offset).collect();
    if let Some(limit) = limit {
        docs.truncate(limit);
    }
    docs
}

/// Build a new document containing only the listed fields, preserving
/// dotted-path nesting
fn project(doc: &Value, fields: &[String]) -> Value {
    let mut out = Map::new();
    for path in fields {
        if let Some(value) = path_value(doc, path) {
            // A literal key wins over a nested path, mirroring path_value
            if doc.get(path).is_some() {
                out.insert(path.clone(), value.clone());
            } else {
                insert_path(&mut out, path, value.clone());
            }
        }
    }
    Value::Object(out)
}

fn insert_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(inner) = slot {
                insert_path(inner, rest, value);
            }
        }
    }
}
