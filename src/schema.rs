//! Collection schemas: the in-memory registry and schema-driven validation.
//!
//! Schemas are themselves records (under the reserved `schema` service) so
//! they ride the same cache and sync machinery as everything else. The
//! registry is a parsed view over those records, keyed by collection name
//! and by collection id, used for validation, single-vs-multi cardinality,
//! and relation targeting.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::time::parse_iso;

/// Reserved service holding collection schemas.
pub const SCHEMA_SERVICE: &str = "schema";

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$")
            .expect("email regex compiles")
    })
}

// ============================================================================
// Parsed schema types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Editor,
    Number,
    Bool,
    Date,
    Url,
    Email,
    Select,
    File,
    Relation,
    Json,
    /// Unknown server-side type; values pass validation untouched.
    Other,
}

impl FieldType {
    fn parse(s: &str) -> FieldType {
        match s {
            "text" => FieldType::Text,
            "editor" => FieldType::Editor,
            "number" => FieldType::Number,
            "bool" => FieldType::Bool,
            "date" => FieldType::Date,
            "url" => FieldType::Url,
            "email" => FieldType::Email,
            "select" => FieldType::Select,
            "file" => FieldType::File,
            "relation" => FieldType::Relation,
            "json" => FieldType::Json,
            _ => FieldType::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub system: bool,
    /// `maxSelect` is authoritative for cardinality: `<= 1` or absent means
    /// single-valued, `>= 2` means multi-valued.
    pub max_select: Option<i64>,
    /// Target collection id for relation fields.
    pub collection_id: Option<String>,
}

impl FieldDef {
    pub fn is_multi(&self) -> bool {
        matches!(self.max_select, Some(n) if n >= 2)
    }
}

#[derive(Debug, Clone)]
pub struct CollectionDef {
    pub id: String,
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl CollectionDef {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn file_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields
            .iter()
            .filter(|f| f.field_type == FieldType::File)
    }

    /// Parse a schema record (`service = "schema"`) into a definition.
    /// Field lists are accepted under either `schema` or `fields`.
    pub fn from_record(record: &Value) -> Option<CollectionDef> {
        let id = record.get("id")?.as_str()?.to_string();
        let name = record.get("name")?.as_str()?.to_string();
        let raw_fields = record
            .get("schema")
            .or_else(|| record.get("fields"))?
            .as_array()?;

        let mut fields = Vec::with_capacity(raw_fields.len());
        for raw in raw_fields {
            let Some(field_name) = raw.get("name").and_then(Value::as_str) else {
                continue;
            };
            let type_name = raw.get("type").and_then(Value::as_str).unwrap_or("");
            // Cardinality options live under `data` (older snapshots) or
            // `options`, or directly on the field.
            let opts = raw
                .get("data")
                .or_else(|| raw.get("options"))
                .unwrap_or(raw);
            fields.push(FieldDef {
                name: field_name.to_string(),
                field_type: FieldType::parse(type_name),
                required: raw.get("required").and_then(Value::as_bool).unwrap_or(false),
                system: raw.get("system").and_then(Value::as_bool).unwrap_or(false),
                max_select: opts.get("maxSelect").and_then(Value::as_i64),
                collection_id: opts
                    .get("collectionId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }

        Some(CollectionDef { id, name, fields })
    }
}

// ============================================================================
// SchemaRegistry
// ============================================================================

/// Thread-safe cache of parsed collection schemas.
#[derive(Default)]
pub struct SchemaRegistry {
    by_name: RwLock<HashMap<String, Arc<CollectionDef>>>,
    by_id: RwLock<HashMap<String, Arc<CollectionDef>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and register one schema record. Unparseable records are
    /// ignored (the raw row stays in the cache either way).
    pub fn ingest(&self, record: &Value) {
        let Some(def) = CollectionDef::from_record(record) else {
            tracing::debug!("skipping unparseable schema record");
            return;
        };
        let def = Arc::new(def);
        self.by_name.write().insert(def.name.clone(), def.clone());
        self.by_id.write().insert(def.id.clone(), def);
    }

    /// Bootstrap from a bundled JSON snapshot (an array of schema records).
    /// Returns the number of collections registered.
    pub fn load_bundled(&self, json: &str) -> Result<usize> {
        let parsed: Value = serde_json::from_str(json)?;
        let Some(items) = parsed.as_array() else {
            return Err(Error::Parse("schema snapshot must be a JSON array".into()));
        };
        let mut count = 0;
        for item in items {
            if CollectionDef::from_record(item).is_some() {
                self.ingest(item);
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn by_name(&self, service: &str) -> Option<Arc<CollectionDef>> {
        self.by_name.read().get(service).cloned()
    }

    pub fn by_id(&self, id: &str) -> Option<Arc<CollectionDef>> {
        self.by_id.read().get(id).cloned()
    }

    /// Validate `data` against the cached schema for `service`.
    ///
    /// Fails with `SchemaMissing` when no schema is cached. System fields
    /// are skipped; fields absent from the schema pass untouched.
    pub fn validate(&self, service: &str, data: &Value) -> Result<()> {
        let Some(def) = self.by_name(service) else {
            return Err(Error::SchemaMissing {
                collection: service.to_string(),
            });
        };
        for field in &def.fields {
            if field.system {
                continue;
            }
            let value = data.get(&field.name);
            validate_field(field, value)?;
        }
        Ok(())
    }
}

// ============================================================================
// Field validation
// ============================================================================

fn validate_field(field: &FieldDef, value: Option<&Value>) -> Result<()> {
    let value = match value {
        None | Some(Value::Null) => {
            if field.required {
                return Err(Error::validation(&field.name, "value is required"));
            }
            return Ok(());
        }
        Some(v) => v,
    };
    let empty = match value {
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    };
    if empty {
        if field.required {
            return Err(Error::validation(&field.name, "value is required"));
        }
        return Ok(());
    }

    match field.field_type {
        FieldType::Text | FieldType::Editor => expect_string(field, value),
        FieldType::Number => {
            if value.is_number() {
                Ok(())
            } else {
                Err(Error::validation(&field.name, "expected a number"))
            }
        }
        FieldType::Bool => {
            if value.is_boolean() {
                Ok(())
            } else {
                Err(Error::validation(&field.name, "expected a boolean"))
            }
        }
        FieldType::Date => {
            let s = as_string(field, value)?;
            if parse_iso(s).is_none() {
                return Err(Error::validation(&field.name, "expected an ISO-8601 date"));
            }
            Ok(())
        }
        FieldType::Url => {
            let s = as_string(field, value)?;
            if !is_absolute_url(s) {
                return Err(Error::validation(&field.name, "expected an absolute URL"));
            }
            Ok(())
        }
        FieldType::Email => {
            let s = as_string(field, value)?;
            if !email_regex().is_match(s) {
                return Err(Error::validation(&field.name, "expected an email address"));
            }
            Ok(())
        }
        FieldType::Select | FieldType::File | FieldType::Relation => {
            validate_cardinality(field, value)
        }
        FieldType::Json | FieldType::Other => Ok(()),
    }
}

/// Select/file/relation values are strings when single-valued and lists of
/// strings when multi-valued, mirroring the server's shapes.
fn validate_cardinality(field: &FieldDef, value: &Value) -> Result<()> {
    if field.is_multi() {
        let Some(items) = value.as_array() else {
            return Err(Error::validation(
                &field.name,
                "expected a list for a multi-value field",
            ));
        };
        if let Some(max) = field.max_select {
            if items.len() as i64 > max {
                return Err(Error::validation(
                    &field.name,
                    format!("at most {max} values allowed"),
                ));
            }
        }
        for item in items {
            if !item.is_string() {
                return Err(Error::validation(&field.name, "expected string items"));
            }
        }
        Ok(())
    } else {
        expect_string(field, value)
    }
}

fn expect_string(field: &FieldDef, value: &Value) -> Result<()> {
    if value.is_string() {
        Ok(())
    } else {
        Err(Error::validation(&field.name, "expected a string"))
    }
}

fn as_string<'v>(field: &FieldDef, value: &'v Value) -> Result<&'v str> {
    value
        .as_str()
        .ok_or_else(|| Error::validation(&field.name, "expected a string"))
}

fn is_absolute_url(s: &str) -> bool {
    let Some((scheme, rest)) = s.split_once("://") else {
        return false;
    };
    !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
        && !rest.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn posts_schema() -> Value {
        json!({
            "id": "col_posts_00001",
            "name": "posts",
            "schema": [
                {"name": "title", "type": "text", "required": true},
                {"name": "views", "type": "number"},
                {"name": "published", "type": "bool"},
                {"name": "when", "type": "date"},
                {"name": "homepage", "type": "url"},
                {"name": "contact", "type": "email"},
                {"name": "author", "type": "relation", "required": false,
                 "data": {"maxSelect": 1, "collectionId": "col_users_00001"}},
                {"name": "tags", "type": "select",
                 "data": {"maxSelect": 5}},
                {"name": "attachment", "type": "file",
                 "data": {"maxSelect": 1}}
            ]
        })
    }

    fn registry() -> SchemaRegistry {
        let reg = SchemaRegistry::new();
        reg.ingest(&posts_schema());
        reg
    }

    #[test]
    fn lookup_by_name_and_id() {
        let reg = registry();
        assert!(reg.by_name("posts").is_some());
        assert_eq!(reg.by_id("col_posts_00001").unwrap().name, "posts");
        assert!(reg.by_name("missing").is_none());
    }

    #[test]
    fn missing_schema_is_an_error() {
        let reg = SchemaRegistry::new();
        let err = reg.validate("posts", &json!({})).unwrap_err();
        assert!(matches!(err, Error::SchemaMissing { .. }));
    }

    #[test]
    fn required_field_must_be_present() {
        let reg = registry();
        assert!(reg.validate("posts", &json!({})).is_err());
        assert!(reg.validate("posts", &json!({"title": ""})).is_err());
        assert!(reg.validate("posts", &json!({"title": "Hi"})).is_ok());
    }

    #[test]
    fn empty_strings_pass_for_optional_date_url_email() {
        let reg = registry();
        let data = json!({"title": "Hi", "when": "", "homepage": "", "contact": ""});
        assert!(reg.validate("posts", &data).is_ok());
    }

    #[test]
    fn type_mismatches_fail() {
        let reg = registry();
        assert!(reg.validate("posts", &json!({"title": "x", "views": "3"})).is_err());
        assert!(reg.validate("posts", &json!({"title": "x", "published": 1})).is_err());
        assert!(reg.validate("posts", &json!({"title": "x", "when": "not-a-date"})).is_err());
        assert!(reg.validate("posts", &json!({"title": "x", "homepage": "nope"})).is_err());
        assert!(reg.validate("posts", &json!({"title": "x", "contact": "nope"})).is_err());
    }

    #[test]
    fn url_and_email_accept_valid_values() {
        let reg = registry();
        let data = json!({
            "title": "x",
            "homepage": "https://example.com/a",
            "contact": "a@example.com"
        });
        assert!(reg.validate("posts", &data).is_ok());
    }

    #[test]
    fn cardinality_follows_max_select() {
        let reg = registry();
        // single relation takes a string, not a list
        assert!(reg
            .validate("posts", &json!({"title": "x", "author": "abc123def456ghi"}))
            .is_ok());
        assert!(reg
            .validate("posts", &json!({"title": "x", "author": ["abc123def456ghi"]}))
            .is_err());
        // multi select takes a list
        assert!(reg
            .validate("posts", &json!({"title": "x", "tags": ["a", "b"]}))
            .is_ok());
        assert!(reg.validate("posts", &json!({"title": "x", "tags": "a"})).is_err());
        // maxSelect caps the list
        assert!(reg
            .validate(
                "posts",
                &json!({"title": "x", "tags": ["a", "b", "c", "d", "e", "f"]})
            )
            .is_err());
    }

    #[test]
    fn unknown_fields_pass_through() {
        let reg = registry();
        assert!(reg
            .validate("posts", &json!({"title": "x", "extra": {"free": "form"}}))
            .is_ok());
    }
}
