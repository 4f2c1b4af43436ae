//! Shared types: request policies, query options, list pages, realtime
//! events, and the control flags carried inside every record's `data` blob.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// RequestPolicy
// ============================================================================

/// How a read or write is routed between the local cache and the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestPolicy {
    /// Cache only; never touches the network.
    CacheOnly,
    /// Network only; never touches the cache. Fails offline.
    NetworkOnly,
    /// Serve from cache, refresh from the network in the background.
    CacheFirst,
    /// Prefer the network, fall back to cache on failure.
    NetworkFirst,
    /// Resilient offline-first default: cache always, network when possible.
    CacheAndNetwork,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        RequestPolicy::CacheAndNetwork
    }
}

impl RequestPolicy {
    /// Whether this policy is allowed to read or write the cache.
    pub fn uses_cache(self) -> bool {
        !matches!(self, RequestPolicy::NetworkOnly)
    }

    /// Whether this policy is allowed to contact the remote.
    pub fn uses_network(self) -> bool {
        !matches!(self, RequestPolicy::CacheOnly)
    }
}

// ============================================================================
// Query options
// ============================================================================

/// Options accepted by the local query engine and forwarded to list reads.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Backend-style filter expression, e.g. `status = 'open' && votes > 3`.
    pub filter: Option<String>,
    /// Comma-separated sort terms; `-` prefix for descending.
    pub sort: Option<String>,
    /// Comma-separated projection list; `None` selects everything.
    pub fields: Option<String>,
    /// Comma-separated dotted relation paths to expand.
    pub expand: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl QueryOptions {
    pub fn filtered(filter: impl Into<String>) -> Self {
        Self {
            filter: Some(filter.into()),
            ..Default::default()
        }
    }
}

/// One page of a list read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPage {
    pub page: u32,
    #[serde(rename = "perPage")]
    pub per_page: u32,
    #[serde(rename = "totalItems")]
    pub total_items: i64,
    #[serde(rename = "totalPages")]
    pub total_pages: i64,
    pub items: Vec<Value>,
}

// ============================================================================
// Realtime events
// ============================================================================

/// Action of a realtime push from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAction {
    Create,
    Update,
    Delete,
}

impl RecordAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(RecordAction::Create),
            "update" => Some(RecordAction::Update),
            "delete" => Some(RecordAction::Delete),
            _ => None,
        }
    }
}

/// A realtime event payload.
#[derive(Debug, Clone)]
pub struct RecordEvent {
    pub action: RecordAction,
    pub record: Option<Value>,
}

pub type EventCallback = Arc<dyn Fn(RecordEvent) + Send + Sync>;

// ============================================================================
// Maintenance
// ============================================================================

/// Counts returned by a maintenance sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub deleted_records: usize,
    pub deleted_responses: usize,
    pub deleted_files: usize,
}

impl MaintenanceReport {
    pub fn total(&self) -> usize {
        self.deleted_records + self.deleted_responses + self.deleted_files
    }
}

// ============================================================================
// Control flags
// ============================================================================

/// The row reflects a server-confirmed state.
pub const FLAG_SYNCED: &str = "synced";
/// The row was created locally and has never existed on the server.
pub const FLAG_NEW: &str = "isNew";
/// The row is local-only and must never be sent to the server.
pub const FLAG_NO_SYNC: &str = "noSync";
/// Tombstone marker for deletions captured while offline.
pub const FLAG_DELETED: &str = "deleted";

/// Fields owned by the server, stripped before replaying a local create.
pub const SERVER_OWNED_FIELDS: &[&str] = &[
    "created",
    "updated",
    "collectionId",
    "collectionName",
    "expand",
    FLAG_SYNCED,
    FLAG_NEW,
    FLAG_DELETED,
];

/// Read a boolean control flag from a record's data. Absent means `false`.
pub fn flag(data: &Value, key: &str) -> bool {
    data.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Set a control flag on a record's data (no-op on non-objects).
pub fn set_flag(data: &mut Value, key: &str, value: bool) {
    if let Some(obj) = data.as_object_mut() {
        obj.insert(key.to_string(), Value::Bool(value));
    }
}

/// Remove server-owned fields from a record body about to be re-created.
pub fn strip_server_fields(data: &mut Value) {
    if let Some(obj) = data.as_object_mut() {
        for key in SERVER_OWNED_FIELDS {
            obj.remove(*key);
        }
    }
}
