//! Per-record file blob cache. Filenames are scoped to their record;
//! replacement is atomic (delete-then-insert in one transaction), and
//! deleting a record cascades into its blobs.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::time::now_iso;

use super::Store;

/// One cached file.
#[derive(Debug, Clone)]
pub struct BlobFile {
    pub record_id: String,
    pub filename: String,
    pub data: Vec<u8>,
    /// `None` never auto-expires.
    pub expiration: Option<String>,
    pub created: String,
    pub updated: String,
}

pub(crate) fn delete_file_in(conn: &Connection, record_id: &str, filename: &str) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM blob_files WHERE record_id = ?1 AND filename = ?2",
        params![record_id, filename],
    )?;
    Ok(n)
}

impl Store {
    /// Store a file, atomically replacing any previous blob under the same
    /// `(record_id, filename)` key.
    pub fn set_file(
        &self,
        record_id: &str,
        filename: &str,
        bytes: &[u8],
        expiration: Option<&str>,
    ) -> Result<()> {
        let now = now_iso();
        self.with_tx(|tx| {
            delete_file_in(tx, record_id, filename)?;
            tx.execute(
                "INSERT INTO blob_files (record_id, filename, data, expiration, created, updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![record_id, filename, bytes, expiration, now, now],
            )?;
            Ok(())
        })
    }

    pub fn get_file(&self, record_id: &str, filename: &str) -> Result<Option<BlobFile>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT record_id, filename, data, expiration, created, updated
                     FROM blob_files WHERE record_id = ?1 AND filename = ?2",
                    params![record_id, filename],
                    |row| {
                        Ok(BlobFile {
                            record_id: row.get(0)?,
                            filename: row.get(1)?,
                            data: row.get(2)?,
                            expiration: row.get(3)?,
                            created: row.get(4)?,
                            updated: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn delete_file(&self, record_id: &str, filename: &str) -> Result<usize> {
        self.with_conn(|conn| delete_file_in(conn, record_id, filename))
    }

    /// All filenames currently cached for a record.
    pub fn list_files(&self, record_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT filename FROM blob_files WHERE record_id = ?1 ORDER BY row_id")?;
            let mut rows = stmt.query([record_id])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row.get(0)?);
            }
            Ok(out)
        })
    }

    /// Re-key every blob of `old_id` to `new_id`. Used when the server
    /// assigns a different id to a locally created record.
    pub fn rekey_files(&self, old_id: &str, new_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE OR REPLACE blob_files SET record_id = ?2 WHERE record_id = ?1",
                params![old_id, new_id],
            )?;
            Ok(n)
        })
    }
}
