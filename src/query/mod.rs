//! Local query engine: compiles `(filter, sort, fields, limit, offset)` into
//! SQL over the `services` table and assembles JSON rows, then hands off to
//! the relation expander.

pub mod expand;
pub mod filter;

use chrono::Utc;
use rusqlite::params_from_iter;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::QueryOptions;

use filter::{field_sql, SqlParam};

/// Dotted expansion paths deeper than this are ignored.
pub const MAX_EXPAND_DEPTH: usize = 6;

const SYSTEM_FIELDS: &[&str] = &["id", "created", "updated"];

impl Store {
    /// Run a local query. See `QueryOptions` for the accepted knobs.
    pub fn query(&self, service: &str, opts: &QueryOptions) -> Result<Vec<Value>> {
        self.query_at_depth(service, opts, 0)
    }

    /// `COUNT(*)` over the collection with an optional filter.
    pub fn count(&self, service: &str, filter: Option<&str>) -> Result<i64> {
        let mut sql = "SELECT COUNT(*) FROM services WHERE service = ?".to_string();
        let mut params = vec![SqlParam::Text(service.to_string())];
        if let Some(f) = filter {
            let compiled = filter::compile(f, Utc::now())?;
            sql.push_str(" AND (");
            sql.push_str(&compiled.sql);
            sql.push(')');
            params.extend(compiled.params);
        }
        self.with_conn(|conn| {
            let n = conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
            Ok(n)
        })
    }

    pub(crate) fn query_at_depth(
        &self,
        service: &str,
        opts: &QueryOptions,
        depth: usize,
    ) -> Result<Vec<Value>> {
        let mut params = vec![SqlParam::Text(service.to_string())];

        let projected = opts.fields.as_deref().map(parse_fields).transpose()?;
        let select = match &projected {
            None => "id, data, created, updated".to_string(),
            Some(fields) => fields
                .iter()
                .map(|f| f.sql.clone())
                .collect::<Vec<_>>()
                .join(", "),
        };

        let mut sql = format!("SELECT {select} FROM services WHERE service = ?");
        if let Some(f) = opts.filter.as_deref() {
            let compiled = filter::compile(f, Utc::now())?;
            sql.push_str(" AND (");
            sql.push_str(&compiled.sql);
            sql.push(')');
            params.extend(compiled.params);
        }

        if let Some(sort) = opts.sort.as_deref() {
            let order = parse_sort(sort)?;
            if !order.is_empty() {
                sql.push_str(" ORDER BY ");
                sql.push_str(&order.join(", "));
            }
        }

        match (opts.limit, opts.offset) {
            (Some(limit), offset) => {
                sql.push_str(" LIMIT ?");
                params.push(SqlParam::Int(limit));
                if let Some(offset) = offset {
                    sql.push_str(" OFFSET ?");
                    params.push(SqlParam::Int(offset));
                }
            }
            (None, Some(offset)) => {
                // SQLite requires a LIMIT clause before OFFSET; -1 = unbounded.
                sql.push_str(" LIMIT -1 OFFSET ?");
                params.push(SqlParam::Int(offset));
            }
            (None, None) => {}
        }

        let mut rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let column_names: Vec<String> =
                stmt.column_names().iter().map(|s| s.to_string()).collect();
            let mut out = Vec::new();
            let mut db_rows = stmt.query(params_from_iter(params.iter()))?;
            while let Some(row) = db_rows.next()? {
                match &projected {
                    None => out.push(crate::store::records::assemble(
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                    )?),
                    Some(_) => {
                        let mut obj = Map::new();
                        for (i, name) in column_names.iter().enumerate() {
                            obj.insert(name.clone(), column_value(row, i)?);
                        }
                        out.push(Value::Object(obj));
                    }
                }
            }
            Ok(out)
        })?;

        if let Some(expand) = opts.expand.as_deref() {
            if !expand.trim().is_empty() {
                self.expand_rows(service, &mut rows, expand, depth)?;
            }
        }
        Ok(rows)
    }
}

// ============================================================================
// Projection
// ============================================================================

struct SelectedField {
    sql: String,
}

fn parse_fields(fields: &str) -> Result<Vec<SelectedField>> {
    let mut out = Vec::new();
    for raw in fields.split(',') {
        let term = raw.trim();
        if term.is_empty() {
            continue;
        }
        // Aggregates like COUNT(*) pass through untouched.
        if term.contains('(') {
            out.push(SelectedField {
                sql: term.to_string(),
            });
            continue;
        }
        if !is_field_path(term) {
            return Err(Error::Parse(format!("invalid field '{term}'")));
        }
        let sql = if SYSTEM_FIELDS.contains(&term) {
            term.to_string()
        } else {
            format!("json_extract(data,'$.{term}') AS \"{term}\"")
        };
        out.push(SelectedField { sql });
    }
    if out.is_empty() {
        return Err(Error::Parse("empty field list".into()));
    }
    Ok(out)
}

/// Map a projected column back to JSON. `json_extract` flattens nested
/// objects/arrays to JSON text, so those are re-parsed.
fn column_value(row: &rusqlite::Row<'_>, index: usize) -> Result<Value> {
    use rusqlite::types::ValueRef;
    Ok(match row.get_ref(index)? {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).to_string();
            if text.starts_with('{') || text.starts_with('[') {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            } else {
                Value::String(text)
            }
        }
        ValueRef::Blob(_) => Value::Null,
    })
}

// ============================================================================
// Sort
// ============================================================================

fn parse_sort(sort: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for raw in sort.split(',') {
        let term = raw.trim();
        if term.is_empty() {
            continue;
        }
        let (name, dir) = match term.strip_prefix('-') {
            Some(rest) => (rest, "DESC"),
            None => (term.strip_prefix('+').unwrap_or(term), "ASC"),
        };
        if !is_field_path(name) {
            return Err(Error::Parse(format!("invalid sort field '{name}'")));
        }
        let path: Vec<String> = name.split('.').map(str::to_string).collect();
        out.push(format!("{} {dir}", field_sql(&path, None)));
    }
    Ok(out)
}

fn is_field_path(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|seg| {
            !seg.is_empty()
                && seg.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
                && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}
