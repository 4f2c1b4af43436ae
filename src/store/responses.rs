//! Cache of idempotent remote responses, keyed by a canonical request
//! fingerprint. Only GET requests produce a key; administrative and
//! streaming route prefixes are never cached.

use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use crate::error::Result;
use crate::time::now_iso;

use super::Store;

/// Route prefixes that must never be served from cache.
const UNCACHED_PREFIXES: &[&str] = &[
    "/api/admins",
    "/api/batch",
    "/api/health",
    "/api/realtime",
    "/api/collections",
    "/api/settings",
    "/api/logs",
    "/api/backups",
    "/api/files",
];

/// Canonical fingerprint of an idempotent remote read, or `None` when the
/// request must not be cached (non-GET, blocklisted path, file upload).
pub fn request_key(
    method: &str,
    path: &str,
    query: &[(String, String)],
    body: Option<&Value>,
    has_files: bool,
) -> Option<String> {
    if !method.eq_ignore_ascii_case("GET") || has_files {
        return None;
    }
    if UNCACHED_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return None;
    }

    let sorted_query: BTreeMap<&str, &str> = query
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let query_json = serde_json::to_string(&sorted_query).unwrap_or_default();
    let body_json = body.map(canonical_json).unwrap_or_default();

    Some(format!(
        "{}::{}::{}::{}",
        method.to_ascii_uppercase(),
        path,
        query_json,
        body_json
    ))
}

/// JSON with object keys sorted at every level, so key equality is
/// independent of caller-side insertion order.
fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, sort(v))).collect();
                serde_json::to_value(sorted).unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

impl Store {
    pub fn get_response(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT response_data FROM cached_responses WHERE request_key = ?1",
                    [key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn set_response(&self, key: &str, response: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cached_responses (request_key, response_data, cached_at)
                 VALUES (?1, ?2, ?3)",
                params![key, response, now_iso()],
            )?;
            Ok(())
        })
    }

    pub fn delete_response(&self, key: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM cached_responses WHERE request_key = ?1",
                [key],
            )?;
            Ok(n)
        })
    }
}
