//! Document handling
//!
//! Documents are plain JSON objects. Three fields are owned by the server:
//! `_id` (primary key), `created_at` (set once) and `updated_at` (set on
//! every write), both RFC3339 UTC.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::{DbError, Result};

/// Primary key field
pub const FIELD_ID: &str = "_id";
/// Creation timestamp field
pub const FIELD_CREATED_AT: &str = "created_at";
/// Last-update timestamp field
pub const FIELD_UPDATED_AT: &str = "updated_at";

/// Fields managed by the server; client-supplied values are ignored
pub const RESERVED_FIELDS: [&str; 3] = [FIELD_ID, FIELD_CREATED_AT, FIELD_UPDATED_AT];

/// Generate a fresh document id
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Format a timestamp the way reserved fields carry it
pub fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse raw bytes into a JSON object, rejecting anything else
pub fn parse_object(raw: &[u8]) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| DbError::BadRequest(format!("invalid JSON: {}", e)))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(DbError::BadRequest(format!(
            "document must be a JSON object, got {}",
            json_type_name(&other)
        ))),
    }
}

/// Stamp reserved fields onto a parsed document.
///
/// `prior` is the currently stored version of the document, if any; its
/// `created_at` survives the write.
pub fn stamp(map: &mut Map<String, Value>, key: &str, prior: Option<&[u8]>, now: DateTime<Utc>) {
    map.insert(FIELD_ID.to_string(), Value::String(key.to_string()));

    let created = prior
        .and_then(extract_created_at)
        .unwrap_or_else(|| format_time(now));
    map.insert(FIELD_CREATED_AT.to_string(), Value::String(created));
    map.insert(
        FIELD_UPDATED_AT.to_string(),
        Value::String(format_time(now)),
    );
}

/// Pull `created_at` out of a stored document
pub fn extract_created_at(raw: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(raw).ok()?;
    value
        .get(FIELD_CREATED_AT)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Pull `_id` out of a parsed document
pub fn extract_id(map: &Map<String, Value>) -> Option<String> {
    map.get(FIELD_ID).and_then(Value::as_str).map(str::to_string)
}

/// Compute the expiry instant for a TTL. Zero (or negative) means no expiry.
pub fn expires_at(ttl_secs: i64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if ttl_secs <= 0 {
        None
    } else {
        Some(now + chrono::Duration::seconds(ttl_secs))
    }
}

/// Resolve a possibly dotted path against a document
pub fn path_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(v) = doc.get(path) {
        // A literal key containing dots wins over path traversal
        return Some(v);
    }
    let mut current = doc;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// Parse an update-many body: a JSON array of `{"_id": ..., "patch": {...}}`
pub fn parse_update_many(raw: &[u8]) -> Result<Vec<(String, Map<String, Value>)>> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| DbError::BadRequest(format!("invalid JSON: {}", e)))?;
    let Value::Array(items) = value else {
        return Err(DbError::BadRequest("updates must be a JSON array".into()));
    };

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Value::Object(mut obj) = item else {
            return Err(DbError::BadRequest("each update must be an object".into()));
        };
        let id = obj
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| DbError::BadRequest("each update needs a string _id".into()))?;
        let patch = match obj.remove("patch") {
            Some(Value::Object(patch)) => patch,
            _ => return Err(DbError::BadRequest("each update needs a patch object".into())),
        };
        out.push((id, patch));
    }
    Ok(out)
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stamp_sets_reserved_fields() {
        let mut map = parse_object(br#"{"name": "Ada"}"#).unwrap();
        let now = Utc::now();
        stamp(&mut map, "u1", None, now);

        assert_eq!(map[FIELD_ID], json!("u1"));
        assert_eq!(map[FIELD_CREATED_AT], json!(format_time(now)));
        assert_eq!(map[FIELD_UPDATED_AT], json!(format_time(now)));
    }

    #[test]
    fn stamp_preserves_created_at() {
        let mut first = parse_object(br#"{"n": 1}"#).unwrap();
        let t0 = Utc::now();
        stamp(&mut first, "k", None, t0);
        let stored = serde_json::to_vec(&first).unwrap();

        let mut second = parse_object(br#"{"n": 2}"#).unwrap();
        let t1 = t0 + chrono::Duration::seconds(5);
        stamp(&mut second, "k", Some(&stored), t1);

        assert_eq!(second[FIELD_CREATED_AT], json!(format_time(t0)));
        assert_eq!(second[FIELD_UPDATED_AT], json!(format_time(t1)));
    }

    #[test]
    fn non_object_rejected() {
        assert!(parse_object(b"[1,2,3]").is_err());
        assert!(parse_object(b"42").is_err());
        assert!(parse_object(b"not json").is_err());
    }

    #[test]
    fn ttl_zero_means_no_expiry() {
        let now = Utc::now();
        assert!(expires_at(0, now).is_none());
        assert!(expires_at(-1, now).is_none());
        assert_eq!(expires_at(10, now), Some(now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn dotted_path_lookup() {
        let doc = json!({"a": {"b": {"c": 7}}, "x.y": 1});
        assert_eq!(path_value(&doc, "a.b.c"), Some(&json!(7)));
        assert_eq!(path_value(&doc, "x.y"), Some(&json!(1)));
        assert_eq!(path_value(&doc, "a.missing"), None);
    }
}
