//! The client: owns the cache store and the background task scope, wires
//! the policy engine and sync manager together, and hands out per-collection
//! `RecordService` handles.

use std::sync::Arc;

use chrono::Duration;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::policy::PolicyEngine;
use crate::remote::{Connectivity, FileUpload, RemoteClient};
use crate::schema::{SchemaRegistry, SCHEMA_SERVICE};
use crate::service::RecordService;
use crate::store::{responses::request_key, DbLocation, Store};
use crate::sync::SyncManager;
use crate::tasks::TaskScope;
use crate::types::{set_flag, MaintenanceReport, RequestPolicy, FLAG_NO_SYNC, FLAG_SYNCED};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone)]
pub struct ClientConfig {
    /// Remote server URL, handed to the transport implementation.
    pub base_url: String,
    /// Default policy for every operation without an explicit override.
    pub request_policy: RequestPolicy,
    /// TTL for maintenance sweeps; `None` disables cleanup.
    pub cache_ttl: Option<Duration>,
    pub db: DbLocation,
    /// Accept-Language forwarded by the transport.
    pub lang: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8090".to_string(),
            request_policy: RequestPolicy::CacheAndNetwork,
            cache_ttl: Some(Duration::days(7)),
            db: DbLocation::Memory,
            lang: "en-US".to_string(),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

pub struct Client {
    config: ClientConfig,
    store: Arc<Store>,
    engine: PolicyEngine,
    sync: Arc<SyncManager>,
    connectivity: Arc<dyn Connectivity>,
    tasks: TaskScope,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        remote: Arc<dyn RemoteClient>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Result<Self> {
        let schemas = Arc::new(SchemaRegistry::new());
        let store = Arc::new(Store::open(&config.db, schemas)?);
        let tasks = TaskScope::new();
        let engine = PolicyEngine::new(
            store.clone(),
            remote,
            connectivity.clone(),
            tasks.clone(),
        );
        let sync = SyncManager::new(engine.clone(), connectivity.clone(), tasks.clone());
        Ok(Self {
            config,
            store,
            engine,
            sync,
            connectivity,
            tasks,
        })
    }

    /// Start background machinery (the connectivity watcher). Requires a
    /// running tokio runtime.
    pub fn start(&self) {
        self.sync.start();
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        self.store.schemas()
    }

    pub fn sync_manager(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    /// A handle for one collection.
    pub fn collection(&self, name: &str) -> RecordService {
        RecordService::new(name, self.engine.clone(), self.config.request_policy)
    }

    /// Bootstrap collection schemas from a bundled JSON snapshot (an array
    /// of schema records). The records are persisted as local-only rows so
    /// they survive restarts without ever being pushed to the server.
    pub fn load_schema_snapshot(&self, json: &str) -> Result<usize> {
        let parsed: Value = serde_json::from_str(json)?;
        let Some(items) = parsed.as_array() else {
            return Err(Error::Parse("schema snapshot must be a JSON array".into()));
        };
        let mut count = 0;
        for item in items {
            let mut data = item.clone();
            set_flag(&mut data, FLAG_SYNCED, false);
            set_flag(&mut data, FLAG_NO_SYNC, true);
            self.store.create_row(SCHEMA_SERVICE, &data, false)?;
            count += 1;
        }
        Ok(count)
    }

    /// Trigger a pending-change drain if we are online (app-resume hook).
    pub fn on_resume(&self) {
        if self.connectivity.is_connected() {
            self.sync.trigger();
        }
    }

    /// Await the currently-running drain, if any.
    pub async fn wait_for_sync(&self) {
        self.sync.wait_for_sync().await;
    }

    /// Sweep expired records, responses, and blobs using the configured TTL.
    pub fn run_maintenance(&self) -> Result<MaintenanceReport> {
        self.store.run_maintenance(self.config.cache_ttl)
    }

    /// Abort all background work. Pending rows stay in the cache and will be
    /// drained on the next start.
    pub fn shutdown(&self) {
        self.tasks.shutdown();
    }

    // ------------------------------------------------------------------
    // Arbitrary routes
    // ------------------------------------------------------------------

    /// Send a request to an arbitrary route, consulting the idempotent
    /// response cache according to the policy. Only GET responses outside
    /// the blocklisted prefixes are ever cached.
    pub async fn send(
        &self,
        path: &str,
        method: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        files: &[FileUpload],
        policy: Option<RequestPolicy>,
    ) -> Result<Value> {
        let policy = policy.unwrap_or(self.config.request_policy);
        let key = request_key(method, path, query, body, !files.is_empty());

        let cached = |key: &Option<String>| -> Result<Option<Value>> {
            let Some(key) = key else { return Ok(None) };
            match self.store.get_response(key)? {
                Some(text) => Ok(Some(serde_json::from_str(&text)?)),
                None => Ok(None),
            }
        };

        match policy {
            RequestPolicy::CacheOnly => cached(&key)?.ok_or_else(|| Error::cache_miss(path, method)),

            RequestPolicy::NetworkOnly => {
                if !self.connectivity.is_connected() {
                    return Err(Error::Offline);
                }
                Ok(self.engine.remote().send(path, method, query, body, files).await?)
            }

            RequestPolicy::CacheFirst => {
                if let Some(hit) = cached(&key)? {
                    return Ok(hit);
                }
                if !self.connectivity.is_connected() {
                    return Err(Error::Offline);
                }
                let response = self.engine.remote().send(path, method, query, body, files).await?;
                self.cache_response(&key, &response)?;
                Ok(response)
            }

            RequestPolicy::NetworkFirst | RequestPolicy::CacheAndNetwork => {
                let remote_err: Error = if self.connectivity.is_connected() {
                    match self.engine.remote().send(path, method, query, body, files).await {
                        Ok(response) => {
                            self.cache_response(&key, &response)?;
                            return Ok(response);
                        }
                        Err(err) => {
                            tracing::debug!(path, %err, "send failed, trying cached response");
                            err.into()
                        }
                    }
                } else {
                    Error::Offline
                };
                match cached(&key)? {
                    Some(hit) => Ok(hit),
                    None => Err(remote_err),
                }
            }
        }
    }

    fn cache_response(&self, key: &Option<String>, response: &Value) -> Result<()> {
        if let Some(key) = key {
            self.store.set_response(key, &response.to_string())?;
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.tasks.shutdown();
    }
}
