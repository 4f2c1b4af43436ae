//! Record CRUD over the `services` table, bulk server-merge operations, the
//! pending-change scan, and the stale reconciler.

use std::collections::HashSet;

use rusqlite::{params, Connection};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::id::record_id;
use crate::schema::SCHEMA_SERVICE;
use crate::time::now_iso;
use crate::types::{flag, QueryOptions, FLAG_DELETED, FLAG_NEW, FLAG_NO_SYNC, FLAG_SYNCED};

use super::Store;

/// Reassemble a stored row into the record JSON handed to callers: the
/// persisted `data` object with `id`, `created`, `updated` overlaid.
pub(crate) fn assemble(
    id: String,
    data: String,
    created: String,
    updated: String,
) -> Result<Value> {
    let mut value: Value = serde_json::from_str(&data)?;
    if !value.is_object() {
        value = Value::Object(Map::new());
    }
    let obj = value.as_object_mut().expect("object ensured above");
    obj.insert("id".into(), Value::String(id));
    obj.insert("created".into(), Value::String(created));
    obj.insert("updated".into(), Value::String(updated));
    Ok(value)
}

/// Split an incoming record into `(id, data, created, updated)`. System keys
/// are removed from `data`; `createdAt`/`updatedAt` are accepted as
/// timestamp fallbacks on ingest. Missing pieces are generated.
fn split_record(item: &Value) -> (String, Map<String, Value>, String, String) {
    let mut data = item.as_object().cloned().unwrap_or_default();

    let id = match data.get("id").and_then(Value::as_str) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => record_id(),
    };
    let created = pick_timestamp(&data, "created", "createdAt");
    let updated = pick_timestamp(&data, "updated", "updatedAt");

    for key in ["id", "created", "updated", "createdAt", "updatedAt"] {
        data.remove(key);
    }
    (id, data, created, updated)
}

fn pick_timestamp(data: &Map<String, Value>, key: &str, fallback: &str) -> String {
    data.get(key)
        .or_else(|| data.get(fallback))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(now_iso)
}

fn upsert(conn: &Connection, service: &str, item: &Value) -> Result<Value> {
    let (id, data, created, updated) = split_record(item);
    let data_text = serde_json::to_string(&Value::Object(data))?;
    conn.execute(
        "INSERT OR REPLACE INTO services (id, service, data, created, updated)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, service, data_text, created, updated],
    )?;
    assemble(id, data_text, created, updated)
}

impl Store {
    // ------------------------------------------------------------------
    // Single-row CRUD
    // ------------------------------------------------------------------

    /// Insert (or replace) a record. A missing/empty `id` gets a freshly
    /// generated server-format one; missing timestamps are stamped now.
    pub fn create_row(&self, service: &str, data: &Value, validate: bool) -> Result<Value> {
        if !data.is_object() {
            return Err(Error::validation("data", "expected a JSON object"));
        }
        if validate {
            self.schemas().validate(service, data)?;
        }
        let record = self.with_conn(|conn| upsert(conn, service, data))?;
        if service == SCHEMA_SERVICE {
            self.schemas().ingest(&record);
        }
        Ok(record)
    }

    /// Partial update: the persisted row is fetched and three-way merged
    /// (existing fields, then the patch, then the id forced back) so that
    /// validation never fails over required fields the row already has.
    pub fn update_row(
        &self,
        service: &str,
        id: &str,
        patch: &Value,
        validate: bool,
    ) -> Result<Value> {
        let existing = self
            .get_row(service, id)?
            .ok_or_else(|| Error::cache_miss(service, id))?;

        let mut merged = existing.as_object().cloned().unwrap_or_default();
        if let Some(overlay) = patch.as_object() {
            for (k, v) in overlay {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged.insert("id".into(), Value::String(id.to_string()));
        // Unless the patch carries an explicit timestamp, the update bumps it.
        if patch.get("updated").and_then(Value::as_str).is_none()
            && patch.get("updatedAt").and_then(Value::as_str).is_none()
        {
            merged.insert("updated".into(), Value::String(now_iso()));
        }
        let merged = Value::Object(merged);

        if validate {
            self.schemas().validate(service, &merged)?;
        }
        let record = self.with_conn(|conn| upsert(conn, service, &merged))?;
        if service == SCHEMA_SERVICE {
            self.schemas().ingest(&record);
        }
        Ok(record)
    }

    pub fn get_row(&self, service: &str, id: &str) -> Result<Option<Value>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, data, created, updated FROM services
                 WHERE service = ?1 AND id = ?2",
            )?;
            let mut rows = stmt.query(params![service, id])?;
            match rows.next()? {
                Some(row) => Ok(Some(assemble(
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                )?)),
                None => Ok(None),
            }
        })
    }

    /// Delete a record and, in the same transaction, the file blobs its
    /// file-typed fields reference. Without a cached schema every blob under
    /// the record id is swept instead.
    pub fn delete_row(&self, service: &str, id: &str) -> Result<()> {
        let row = self.get_row(service, id)?;
        let filenames = row
            .as_ref()
            .map(|record| self.referenced_filenames(service, record))
            .unwrap_or_default();

        self.with_tx(|tx| {
            match filenames {
                Some(ref names) => {
                    for name in names {
                        super::blobs::delete_file_in(tx, id, name)?;
                    }
                }
                None => {
                    tx.execute("DELETE FROM blob_files WHERE record_id = ?1", [id])?;
                }
            }
            tx.execute(
                "DELETE FROM services WHERE service = ?1 AND id = ?2",
                params![service, id],
            )?;
            Ok(())
        })
    }

    /// Filenames referenced by the record's file fields, or `None` when no
    /// schema is cached for the collection.
    fn referenced_filenames(&self, service: &str, record: &Value) -> Option<Vec<String>> {
        let def = self.schemas().by_name(service)?;
        let mut names = Vec::new();
        for field in def.file_fields() {
            match record.get(&field.name) {
                Some(Value::String(s)) if !s.is_empty() => names.push(s.clone()),
                Some(Value::Array(items)) => {
                    names.extend(items.iter().filter_map(Value::as_str).map(str::to_string));
                }
                _ => {}
            }
        }
        Some(names)
    }

    // ------------------------------------------------------------------
    // Bulk server merges
    // ------------------------------------------------------------------

    /// Bulk upsert of server records. With `replace_all` the collection is
    /// cleared first. Items are marked `synced` unless they say otherwise.
    pub fn set_local(&self, service: &str, items: &[Value], replace_all: bool) -> Result<usize> {
        self.with_tx(|tx| {
            if replace_all {
                tx.execute("DELETE FROM services WHERE service = ?1", [service])?;
            }
            for item in items {
                upsert(tx, service, &mark_synced(item))?;
            }
            Ok(items.len())
        })?;
        if service == SCHEMA_SERVICE {
            for item in items {
                self.schemas().ingest(item);
            }
        }
        Ok(items.len())
    }

    /// Timestamp-aware upsert: only items strictly newer (by `updated`) than
    /// the local row, or locally absent, are written. Returns how many were.
    pub fn merge_local(&self, service: &str, items: &[Value]) -> Result<usize> {
        let written = self.with_tx(|tx| {
            let mut written = 0;
            for item in items {
                let (id, _, _, incoming_updated) = split_record(item);
                let local_updated: Option<String> = tx
                    .query_row(
                        "SELECT updated FROM services WHERE service = ?1 AND id = ?2",
                        params![service, id],
                        |row| row.get(0),
                    )
                    .ok();
                let newer = match local_updated {
                    Some(local) => incoming_updated > local,
                    None => true,
                };
                if newer {
                    upsert(tx, service, &mark_synced(item))?;
                    written += 1;
                }
            }
            Ok(written)
        })?;
        if service == SCHEMA_SERVICE {
            for item in items {
                self.schemas().ingest(item);
            }
        }
        Ok(written)
    }

    /// Merge a full server listing and reconcile stale local rows: records
    /// matching the *same* filter that the server no longer returned are
    /// deleted, unless guarded by local-change flags.
    pub fn sync_local(
        &self,
        service: &str,
        items: &[Value],
        filter: Option<&str>,
    ) -> Result<usize> {
        let written = self.merge_local(service, items)?;
        self.reconcile_stale(service, items, filter)?;
        Ok(written)
    }

    // ------------------------------------------------------------------
    // Stale reconciliation
    // ------------------------------------------------------------------

    /// Allowed stale deletions when the server response was empty; above
    /// this the sweep aborts, assuming a server-side fault.
    const EMPTY_RESPONSE_DELETE_CAP: usize = 10;

    fn reconcile_stale(
        &self,
        service: &str,
        items: &[Value],
        filter: Option<&str>,
    ) -> Result<()> {
        let incoming_ids: HashSet<&str> = items
            .iter()
            .filter_map(|item| item.get("id").and_then(Value::as_str))
            .collect();

        let candidates = self.query(
            service,
            &QueryOptions {
                filter: filter.map(str::to_string),
                ..Default::default()
            },
        )?;

        let stale: Vec<String> = candidates
            .iter()
            .filter(|row| {
                let id = row.get("id").and_then(Value::as_str).unwrap_or_default();
                !incoming_ids.contains(id)
                    && flag(row, FLAG_SYNCED)
                    && !flag(row, FLAG_NO_SYNC)
                    && !flag(row, FLAG_DELETED)
            })
            .filter_map(|row| row.get("id").and_then(Value::as_str).map(str::to_string))
            .collect();

        if incoming_ids.is_empty() && stale.len() > Self::EMPTY_RESPONSE_DELETE_CAP {
            tracing::warn!(
                service,
                candidates = stale.len(),
                "stale reconcile aborted: empty server response would delete too many rows"
            );
            return Ok(());
        }

        for id in &stale {
            self.delete_row(service, id)?;
        }
        if !stale.is_empty() {
            tracing::debug!(service, removed = stale.len(), "stale rows reconciled");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pending-change scan
    // ------------------------------------------------------------------

    /// Collections that currently hold pending (unsynced, syncable) rows.
    pub fn pending_services(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT service FROM services
                 WHERE json_extract(data,'$.synced') = 0
                   AND (json_extract(data,'$.noSync') IS NULL
                        OR json_extract(data,'$.noSync') = 0)",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row.get(0)?);
            }
            Ok(out)
        })
    }

    /// Pending rows of one collection, in local insertion order.
    pub fn pending_rows(&self, service: &str) -> Result<Vec<Value>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, data, created, updated FROM services
                 WHERE service = ?1
                   AND json_extract(data,'$.synced') = 0
                   AND (json_extract(data,'$.noSync') IS NULL
                        OR json_extract(data,'$.noSync') = 0)
                 ORDER BY created, id",
            )?;
            let mut rows = stmt.query([service])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(assemble(
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                )?);
            }
            Ok(out)
        })
    }
}

/// Server-confirmed rows carry `synced = true` and no local-change flags.
fn mark_synced(item: &Value) -> Value {
    let mut out = item.clone();
    if let Some(obj) = out.as_object_mut() {
        let synced = obj
            .get(FLAG_SYNCED)
            .and_then(Value::as_bool)
            .unwrap_or(true);
        obj.insert(FLAG_SYNCED.into(), Value::Bool(synced));
        if synced {
            obj.remove(FLAG_NEW);
            obj.remove(FLAG_DELETED);
            obj.remove(FLAG_NO_SYNC);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::id::is_record_id;
    use crate::schema::SchemaRegistry;
    use crate::store::DbLocation;

    use super::*;

    fn store() -> Store {
        Store::open(&DbLocation::Memory, Arc::new(SchemaRegistry::new())).unwrap()
    }

    #[test]
    fn create_generates_server_format_id_and_timestamps() {
        let s = store();
        let record = s.create_row("posts", &json!({"title": "Hi"}), false).unwrap();
        let id = record["id"].as_str().unwrap();
        assert!(is_record_id(id));
        assert!(record["created"].as_str().is_some());
        assert_eq!(record["title"], "Hi");
        assert_eq!(s.get_row("posts", id).unwrap().unwrap()["title"], "Hi");
    }

    #[test]
    fn create_preserves_given_id_and_timestamps() {
        let s = store();
        let record = s
            .create_row(
                "posts",
                &json!({"id": "abc123def456ghi", "title": "x", "created": "2020-01-01T00:00:00.000Z"}),
                false,
            )
            .unwrap();
        assert_eq!(record["id"], "abc123def456ghi");
        assert_eq!(record["created"], "2020-01-01T00:00:00.000Z");
    }

    #[test]
    fn ingest_accepts_created_at_fallback_keys() {
        let s = store();
        let record = s
            .create_row(
                "posts",
                &json!({"title": "x", "createdAt": "2020-01-01T00:00:00.000Z"}),
                false,
            )
            .unwrap();
        assert_eq!(record["created"], "2020-01-01T00:00:00.000Z");
        assert!(record.get("createdAt").is_none());
    }

    #[test]
    fn update_merges_partial_patches() {
        let s = store();
        let record = s
            .create_row("posts", &json!({"title": "a", "body": "long"}), false)
            .unwrap();
        let id = record["id"].as_str().unwrap();

        let updated = s
            .update_row("posts", id, &json!({"title": "b"}), false)
            .unwrap();
        assert_eq!(updated["title"], "b");
        assert_eq!(updated["body"], "long", "untouched fields survive");
        assert!(updated["updated"].as_str().unwrap() >= record["updated"].as_str().unwrap());
    }

    #[test]
    fn update_missing_row_is_a_cache_miss() {
        let s = store();
        let err = s
            .update_row("posts", "nope", &json!({"a": 1}), false)
            .unwrap_err();
        assert!(matches!(err, Error::CacheMiss { .. }));
    }

    #[test]
    fn merge_local_respects_timestamps() {
        let s = store();
        s.create_row(
            "posts",
            &json!({"id": "abc123def456ghi", "title": "local", "updated": "2024-06-01T00:00:00.000Z"}),
            false,
        )
        .unwrap();

        // older incoming: skipped
        let older = json!({"id": "abc123def456ghi", "title": "old", "updated": "2024-01-01T00:00:00.000Z"});
        assert_eq!(s.merge_local("posts", &[older]).unwrap(), 0);
        assert_eq!(
            s.get_row("posts", "abc123def456ghi").unwrap().unwrap()["title"],
            "local"
        );

        // newer incoming: written and marked synced
        let newer = json!({"id": "abc123def456ghi", "title": "new", "updated": "2025-01-01T00:00:00.000Z"});
        assert_eq!(s.merge_local("posts", &[newer]).unwrap(), 1);
        let row = s.get_row("posts", "abc123def456ghi").unwrap().unwrap();
        assert_eq!(row["title"], "new");
        assert_eq!(row["synced"], true);
    }

    #[test]
    fn set_local_replace_all_clears_collection() {
        let s = store();
        s.create_row("posts", &json!({"id": "aaaaaaaaaaaaaaa", "title": "old"}), false)
            .unwrap();
        s.set_local("posts", &[json!({"id": "bbbbbbbbbbbbbbb", "title": "new"})], true)
            .unwrap();
        assert!(s.get_row("posts", "aaaaaaaaaaaaaaa").unwrap().is_none());
        assert!(s.get_row("posts", "bbbbbbbbbbbbbbb").unwrap().is_some());
    }

    #[test]
    fn pending_scan_skips_no_sync_and_synced_rows() {
        let s = store();
        s.create_row("posts", &json!({"id": "aaaaaaaaaaaaaaa", "synced": false}), false)
            .unwrap();
        s.create_row(
            "posts",
            &json!({"id": "bbbbbbbbbbbbbbb", "synced": false, "noSync": true}),
            false,
        )
        .unwrap();
        s.create_row("posts", &json!({"id": "ccccccccccccccc", "synced": true}), false)
            .unwrap();

        assert_eq!(s.pending_services().unwrap(), vec!["posts".to_string()]);
        let pending = s.pending_rows("posts").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0]["id"], "aaaaaaaaaaaaaaa");
    }

    #[test]
    fn pending_rows_keep_insertion_order() {
        let s = store();
        for (id, created) in [
            ("ccccccccccccccc", "2024-01-03T00:00:00.000Z"),
            ("aaaaaaaaaaaaaaa", "2024-01-01T00:00:00.000Z"),
            ("bbbbbbbbbbbbbbb", "2024-01-02T00:00:00.000Z"),
        ] {
            s.create_row(
                "posts",
                &json!({"id": id, "created": created, "synced": false}),
                false,
            )
            .unwrap();
        }
        let ids: Vec<_> = s
            .pending_rows("posts")
            .unwrap()
            .into_iter()
            .map(|r| r["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["aaaaaaaaaaaaaaa", "bbbbbbbbbbbbbbb", "ccccccccccccccc"]);
    }
}
