//! Offline-first record cache with policy-routed reads and writes against a
//! PocketBase-style remote.
//!
//! The crate keeps a transparent local mirror of server state in an embedded
//! SQLite database, so reads and writes proceed whether or not the network
//! is available, and converges with the server once connectivity returns.
//!
//! The moving parts:
//! - a five-way [`RequestPolicy`] engine routing every operation through
//!   cache, network, or both;
//! - a single-table JSON record store with a backend-compatible
//!   filter/sort/expand query compiler;
//! - a sync manager that replays pending local mutations on connectivity
//!   rising edges;
//! - schema-driven validation and relation expansion;
//! - a per-record file blob cache and an idempotent-response cache, both
//!   swept by TTL maintenance.
//!
//! The HTTP transport and the connectivity probe are injected as trait
//! objects ([`RemoteClient`], [`Connectivity`]), which keeps the core fully
//! testable offline.

pub mod client;
pub mod error;
pub mod id;
pub mod maintenance;
pub mod policy;
pub mod query;
pub mod remote;
pub mod schema;
pub mod service;
pub mod store;
pub mod sync;
pub mod tasks;
pub mod time;
pub mod types;

pub use client::{Client, ClientConfig};
pub use error::{Error, Result};
pub use id::{is_record_id, record_id, RECORD_ID_LEN};
pub use policy::PolicyEngine;
pub use query::filter::{compile as compile_filter, CompiledFilter, FilterExpr, SqlParam};
pub use remote::{Connectivity, FileUpload, RemoteClient, RemoteError, RemoteResult};
pub use schema::{CollectionDef, FieldDef, FieldType, SchemaRegistry, SCHEMA_SERVICE};
pub use service::RecordService;
pub use store::{BlobFile, DbLocation, Store};
pub use sync::SyncManager;
pub use tasks::TaskScope;
pub use types::{
    EventCallback, ListPage, MaintenanceReport, QueryOptions, RecordAction, RecordEvent,
    RequestPolicy,
};
