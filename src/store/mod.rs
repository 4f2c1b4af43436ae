//! The local cache store: a single-table JSON record store plus the file
//! blob store and the idempotent-response cache, all over one embedded
//! SQLite database.
//!
//! The `Store` owns the connection; every other component holds a shared,
//! non-owning `Arc<Store>` handle. All methods are synchronous — async
//! callers should expect them to block the current thread briefly.

pub mod blobs;
pub mod records;
pub mod responses;

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::Result;
use crate::schema::{SchemaRegistry, SCHEMA_SERVICE};

pub use blobs::BlobFile;

/// Where the database lives.
#[derive(Debug, Clone)]
pub enum DbLocation {
    Memory,
    Path(PathBuf),
}

/// Current layout version. v2 added `blob_files`, v3 `cached_responses`.
const SCHEMA_VERSION: i64 = 3;

pub struct Store {
    conn: Mutex<Connection>,
    schemas: Arc<SchemaRegistry>,
}

impl Store {
    /// Open (and migrate) the database, then warm the schema registry from
    /// any persisted schema records.
    pub fn open(location: &DbLocation, schemas: Arc<SchemaRegistry>) -> Result<Store> {
        let conn = match location {
            DbLocation::Memory => Connection::open_in_memory()?,
            DbLocation::Path(path) => Connection::open(path)?,
        };
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&conn)?;

        let store = Store {
            conn: Mutex::new(conn),
            schemas,
        };
        store.warm_schema_registry()?;
        Ok(store)
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    /// Run `f` with the connection. Keep closures short: this serializes all
    /// database access.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside a transaction; commits on `Ok`, rolls back on `Err`.
    pub(crate) fn with_tx<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    fn warm_schema_registry(&self) -> Result<()> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, data, created, updated FROM services WHERE service = ?1",
            )?;
            let mut rows = stmt.query([SCHEMA_SERVICE])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(records::assemble(
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                )?);
            }
            Ok(out)
        })?;
        for record in &rows {
            self.schemas.ingest(record);
        }
        if !rows.is_empty() {
            tracing::debug!(collections = rows.len(), "schema registry warmed from cache");
        }
        Ok(())
    }
}

// ============================================================================
// Migrations
// ============================================================================

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)")?;

    let mut version: i64 = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if version < 1 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS services (
                id      TEXT NOT NULL,
                service TEXT NOT NULL,
                data    TEXT NOT NULL,
                created TEXT NOT NULL,
                updated TEXT NOT NULL,
                PRIMARY KEY (id, service)
            );
            CREATE INDEX IF NOT EXISTS idx_services_service ON services(service);",
        )?;
        version = 1;
    }
    if version < 2 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blob_files (
                row_id     INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id  TEXT NOT NULL,
                filename   TEXT NOT NULL,
                data       BLOB NOT NULL,
                expiration TEXT,
                created    TEXT NOT NULL,
                updated    TEXT NOT NULL,
                UNIQUE (record_id, filename)
            );",
        )?;
        version = 2;
    }
    if version < 3 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cached_responses (
                request_key   TEXT PRIMARY KEY,
                response_data TEXT NOT NULL,
                cached_at     TEXT NOT NULL
            );",
        )?;
        version = 3;
    }

    debug_assert_eq!(version, SCHEMA_VERSION);
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
        [version.to_string()],
    )?;
    Ok(())
}
