//! TTL-based cleanup across records, cached responses, and file blobs.

use chrono::{Duration, Utc};

use crate::error::Result;
use crate::store::Store;
use crate::time::to_iso;
use crate::types::MaintenanceReport;

impl Store {
    /// Sweep expired state. `ttl = None` disables cleanup entirely and
    /// returns zeros.
    ///
    /// Cutoffs are strict (`<`): a row updated exactly `ttl` ago survives.
    /// Unsynced, local-only, and tombstoned records are never reaped.
    pub fn run_maintenance(&self, ttl: Option<Duration>) -> Result<MaintenanceReport> {
        let Some(ttl) = ttl else {
            return Ok(MaintenanceReport::default());
        };
        let now = Utc::now();
        let cutoff = to_iso(now - ttl);
        let now_iso = to_iso(now);

        self.with_tx(|tx| {
            let deleted_records = tx.execute(
                "DELETE FROM services
                 WHERE updated < ?1
                   AND json_extract(data,'$.synced') = 1
                   AND (json_extract(data,'$.noSync') IS NULL
                        OR json_extract(data,'$.noSync') = 0)
                   AND (json_extract(data,'$.deleted') IS NULL
                        OR json_extract(data,'$.deleted') = 0)",
                [&cutoff],
            )?;
            let deleted_responses = tx.execute(
                "DELETE FROM cached_responses WHERE cached_at < ?1",
                [&cutoff],
            )?;
            let deleted_files = tx.execute(
                "DELETE FROM blob_files WHERE expiration IS NOT NULL AND expiration < ?1",
                [&now_iso],
            )?;

            let report = MaintenanceReport {
                deleted_records,
                deleted_responses,
                deleted_files,
            };
            if report.total() > 0 {
                tracing::debug!(
                    records = report.deleted_records,
                    responses = report.deleted_responses,
                    files = report.deleted_files,
                    "maintenance sweep"
                );
            }
            Ok(report)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::schema::SchemaRegistry;
    use crate::store::DbLocation;
    use crate::time::to_iso;

    use super::*;

    fn store() -> Store {
        Store::open(&DbLocation::Memory, Arc::new(SchemaRegistry::new())).unwrap()
    }

    fn days_ago(days: i64) -> String {
        to_iso(Utc::now() - Duration::days(days))
    }

    #[test]
    fn none_ttl_is_a_noop() {
        let s = store();
        s.create_row(
            "posts",
            &json!({"synced": true, "updated": days_ago(100)}),
            false,
        )
        .unwrap();
        let report = s.run_maintenance(None).unwrap();
        assert_eq!(report, MaintenanceReport::default());
        assert_eq!(s.count("posts", None).unwrap(), 1);
    }

    #[test]
    fn reaps_only_old_synced_rows() {
        let s = store();
        s.create_row(
            "posts",
            &json!({"id": "aaaaaaaaaaaaaaa", "synced": true, "updated": days_ago(10)}),
            false,
        )
        .unwrap();
        s.create_row(
            "posts",
            &json!({"id": "bbbbbbbbbbbbbbb", "synced": false, "updated": days_ago(10)}),
            false,
        )
        .unwrap();
        s.create_row(
            "posts",
            &json!({"id": "ccccccccccccccc", "synced": true, "noSync": true, "updated": days_ago(10)}),
            false,
        )
        .unwrap();
        s.create_row(
            "posts",
            &json!({"id": "ddddddddddddddd", "synced": true, "deleted": true, "updated": days_ago(10)}),
            false,
        )
        .unwrap();
        s.create_row(
            "posts",
            &json!({"id": "eeeeeeeeeeeeeee", "synced": true, "updated": days_ago(1)}),
            false,
        )
        .unwrap();

        let report = s.run_maintenance(Some(Duration::days(7))).unwrap();
        assert_eq!(report.deleted_records, 1);
        assert!(s.get_row("posts", "aaaaaaaaaaaaaaa").unwrap().is_none());
        for kept in ["bbbbbbbbbbbbbbb", "ccccccccccccccc", "ddddddddddddddd", "eeeeeeeeeeeeeee"] {
            assert!(s.get_row("posts", kept).unwrap().is_some(), "{kept}");
        }
    }

    #[test]
    fn ttl_cutoff_is_strict() {
        let s = store();
        let exactly = to_iso(Utc::now() - Duration::days(7));
        s.create_row(
            "posts",
            &json!({"id": "aaaaaaaaaaaaaaa", "synced": true, "updated": exactly}),
            false,
        )
        .unwrap();
        // The row's `updated` equals the cutoff only if no time passes, so
        // pad the TTL by a second to land exactly on the boundary side.
        let report = s
            .run_maintenance(Some(Duration::days(7) + Duration::seconds(1)))
            .unwrap();
        assert_eq!(report.deleted_records, 0);
    }

    #[test]
    fn reaps_expired_blobs_and_old_responses() {
        let s = store();
        s.set_file("rec1", "old.bin", b"x", Some(&days_ago(1))).unwrap();
        s.set_file("rec1", "fresh.bin", b"y", Some(&to_iso(Utc::now() + Duration::days(1))))
            .unwrap();
        s.set_file("rec1", "forever.bin", b"z", None).unwrap();

        s.set_response("GET::/api/x::::", "{}").unwrap();
        // Backdate the response so the sweep sees it as stale.
        s.with_conn(|conn| {
            conn.execute(
                "UPDATE cached_responses SET cached_at = ?1",
                [days_ago(30)],
            )?;
            Ok(())
        })
        .unwrap();

        let report = s.run_maintenance(Some(Duration::days(7))).unwrap();
        assert_eq!(report.deleted_files, 1);
        assert_eq!(report.deleted_responses, 1);
        assert!(s.get_file("rec1", "old.bin").unwrap().is_none());
        assert!(s.get_file("rec1", "fresh.bin").unwrap().is_some());
        assert!(s.get_file("rec1", "forever.bin").unwrap().is_some());
    }
}
