//! Relation expansion: substitute relation ids with the referenced records,
//! in batched per-collection lookups, with the single-vs-multi shape decided
//! by the relation field's `maxSelect`.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::schema::FieldType;
use crate::store::Store;
use crate::types::QueryOptions;

use super::MAX_EXPAND_DEPTH;

impl Store {
    /// Attach `expand.<relation>` entries to every row in place.
    ///
    /// `expand` is a comma-separated list of dotted paths; the dotted tail of
    /// each path is applied recursively to the target collection's query, so
    /// the cache stays closed under reachability up to the requested depth.
    pub(crate) fn expand_rows(
        &self,
        service: &str,
        rows: &mut [Value],
        expand: &str,
        depth: usize,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        if depth >= MAX_EXPAND_DEPTH {
            tracing::warn!(service, expand, "expansion depth limit reached");
            return Ok(());
        }

        // Group dotted paths by their head relation: "author.team,tags"
        // becomes {author: [team], tags: []}.
        let mut groups: HashMap<&str, Vec<&str>> = HashMap::new();
        for path in expand.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match path.split_once('.') {
                Some((head, tail)) => groups.entry(head).or_default().push(tail),
                None => {
                    groups.entry(path).or_default();
                }
            }
        }

        let def = self
            .schemas()
            .by_name(service)
            .ok_or_else(|| Error::SchemaMissing {
                collection: service.to_string(),
            })?;

        for (head, tails) in groups {
            let Some(field) = def.field(head) else {
                tracing::warn!(service, relation = head, "expand of unknown field skipped");
                continue;
            };
            if field.field_type != FieldType::Relation {
                tracing::warn!(service, relation = head, "expand of non-relation field skipped");
                continue;
            }
            let Some(target) = field
                .collection_id
                .as_deref()
                .and_then(|id| self.schemas().by_id(id))
            else {
                tracing::warn!(service, relation = head, "expand target collection unknown");
                continue;
            };

            // One batched lookup for every id referenced by the result set.
            let mut ids: HashSet<String> = HashSet::new();
            for row in rows.iter() {
                collect_ids(row.get(head), &mut ids);
            }

            let related = if ids.is_empty() {
                Vec::new()
            } else {
                let filter = ids
                    .iter()
                    .map(|id| format!("id='{}'", id.replace('\\', "\\\\").replace('\'', "\\'")))
                    .collect::<Vec<_>>()
                    .join(" || ");
                let sub_opts = QueryOptions {
                    filter: Some(filter),
                    expand: (!tails.is_empty()).then(|| tails.join(",")),
                    ..Default::default()
                };
                self.query_at_depth(&target.name, &sub_opts, depth + 1)?
            };

            let by_id: HashMap<&str, &Value> = related
                .iter()
                .filter_map(|r| r.get("id").and_then(Value::as_str).map(|id| (id, r)))
                .collect();

            let multi = field.is_multi();
            for row in rows.iter_mut() {
                let value = attach_value(row.get(head), &by_id, multi);
                let Some(obj) = row.as_object_mut() else {
                    continue;
                };
                let expand_obj = obj
                    .entry("expand")
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Some(map) = expand_obj.as_object_mut() {
                    map.insert(head.to_string(), value);
                }
            }
        }
        Ok(())
    }
}

fn collect_ids(value: Option<&Value>, out: &mut HashSet<String>) {
    match value {
        Some(Value::String(s)) if !s.is_empty() => {
            out.insert(s.clone());
        }
        Some(Value::Array(items)) => {
            for item in items {
                if let Some(s) = item.as_str() {
                    if !s.is_empty() {
                        out.insert(s.to_string());
                    }
                }
            }
        }
        _ => {}
    }
}

/// Single relations expand to an object (or null); multi relations always
/// expand to a list, mirroring the server's shapes exactly.
fn attach_value(raw: Option<&Value>, by_id: &HashMap<&str, &Value>, multi: bool) -> Value {
    if multi {
        let mut out = Vec::new();
        if let Some(Value::Array(items)) = raw {
            for item in items {
                if let Some(found) = item.as_str().and_then(|id| by_id.get(id)) {
                    out.push((*found).clone());
                }
            }
        }
        Value::Array(out)
    } else {
        raw.and_then(Value::as_str)
            .and_then(|id| by_id.get(id))
            .map(|v| (*v).clone())
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::schema::SchemaRegistry;
    use crate::store::DbLocation;

    use super::*;

    fn schemas() -> Arc<SchemaRegistry> {
        let reg = SchemaRegistry::new();
        reg.ingest(&json!({
            "id": "col_posts",
            "name": "posts",
            "schema": [
                {"name": "title", "type": "text"},
                {"name": "author", "type": "relation",
                 "data": {"maxSelect": 1, "collectionId": "col_users"}},
                {"name": "tags", "type": "relation",
                 "data": {"maxSelect": 3, "collectionId": "col_tags"}}
            ]
        }));
        reg.ingest(&json!({
            "id": "col_users",
            "name": "users",
            "schema": [
                {"name": "name", "type": "text"},
                {"name": "team", "type": "relation",
                 "data": {"maxSelect": 1, "collectionId": "col_teams"}}
            ]
        }));
        reg.ingest(&json!({
            "id": "col_tags",
            "name": "tags",
            "schema": [{"name": "label", "type": "text"}]
        }));
        reg.ingest(&json!({
            "id": "col_teams",
            "name": "teams",
            "schema": [{"name": "name", "type": "text"}]
        }));
        Arc::new(reg)
    }

    fn seeded() -> Store {
        let s = Store::open(&DbLocation::Memory, schemas()).unwrap();
        s.create_row("teams", &json!({"id": "team1team1team1", "name": "Core"}), false)
            .unwrap();
        s.create_row(
            "users",
            &json!({"id": "user1user1user1", "name": "Ada", "team": "team1team1team1"}),
            false,
        )
        .unwrap();
        s.create_row("tags", &json!({"id": "tagaaaaaaaaaaa1", "label": "rust"}), false)
            .unwrap();
        s.create_row("tags", &json!({"id": "tagbbbbbbbbbbb2", "label": "sync"}), false)
            .unwrap();
        s.create_row(
            "posts",
            &json!({
                "id": "postaaaaaaaaaa1",
                "title": "Hello",
                "author": "user1user1user1",
                "tags": ["tagaaaaaaaaaaa1", "tagbbbbbbbbbbb2", "missingtagaaaa3"]
            }),
            false,
        )
        .unwrap();
        s.create_row(
            "posts",
            &json!({"id": "postbbbbbbbbbb2", "title": "Orphan", "author": "ghostghostghost", "tags": []}),
            false,
        )
        .unwrap();
        s
    }

    fn query_expanded(s: &Store, expand: &str) -> Vec<Value> {
        s.query(
            "posts",
            &QueryOptions {
                sort: Some("id".into()),
                expand: Some(expand.into()),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn single_relation_expands_to_object_or_null() {
        let s = seeded();
        let rows = query_expanded(&s, "author");
        assert_eq!(rows[0]["expand"]["author"]["name"], "Ada");
        assert_eq!(rows[1]["expand"]["author"], Value::Null);
    }

    #[test]
    fn multi_relation_expands_to_list() {
        let s = seeded();
        let rows = query_expanded(&s, "author,tags");
        let tags = rows[0]["expand"]["tags"].as_array().unwrap();
        let labels: Vec<_> = tags.iter().map(|t| t["label"].as_str().unwrap()).collect();
        assert_eq!(labels, vec!["rust", "sync"], "missing ids are dropped");
        assert_eq!(rows[1]["expand"]["tags"], json!([]));
    }

    #[test]
    fn dotted_paths_expand_recursively() {
        let s = seeded();
        let rows = query_expanded(&s, "author.team");
        assert_eq!(
            rows[0]["expand"]["author"]["expand"]["team"]["name"],
            "Core"
        );
    }

    #[test]
    fn expand_without_schema_is_an_error() {
        let s = Store::open(&DbLocation::Memory, Arc::new(SchemaRegistry::new())).unwrap();
        s.create_row("posts", &json!({"id": "postaaaaaaaaaa1", "author": "x"}), false)
            .unwrap();
        let err = s
            .query(
                "posts",
                &QueryOptions {
                    expand: Some("author".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::SchemaMissing { .. }));
    }
}
