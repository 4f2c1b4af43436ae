//! The sync manager: watches for connectivity rising edges and drains
//! pending local changes against the remote, in local insertion order,
//! through the resilient CacheAndNetwork policy.
//!
//! One drain runs at a time; concurrent triggers coalesce onto the running
//! drain's completion channel, so a connectivity flap does not stack drains.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use crate::policy::PolicyEngine;
use crate::remote::Connectivity;
use crate::schema::SCHEMA_SERVICE;
use crate::tasks::TaskScope;
use crate::types::{flag, strip_server_fields, RequestPolicy, FLAG_DELETED, FLAG_NEW};

pub struct SyncManager {
    engine: PolicyEngine,
    connectivity: Arc<dyn Connectivity>,
    tasks: TaskScope,
    /// Completion channel of the currently-running (or last finished) drain.
    current: Mutex<Option<watch::Receiver<bool>>>,
}

impl SyncManager {
    pub fn new(
        engine: PolicyEngine,
        connectivity: Arc<dyn Connectivity>,
        tasks: TaskScope,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            connectivity,
            tasks,
            current: Mutex::new(None),
        })
    }

    /// Start the connectivity watcher. Each rising edge triggers a drain.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut rx = self.connectivity.watch();
        self.tasks.spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow();
                if online {
                    tracing::debug!("connectivity restored, draining pending changes");
                    manager.trigger();
                }
            }
        });
    }

    /// Request a drain. If one is already running its completion channel is
    /// returned instead of starting another.
    pub fn trigger(self: &Arc<Self>) -> watch::Receiver<bool> {
        let mut current = self.current.lock();
        if let Some(rx) = current.as_ref() {
            if !*rx.borrow() {
                return rx.clone();
            }
        }

        let (tx, rx) = watch::channel(false);
        *current = Some(rx.clone());
        let manager = Arc::clone(self);
        self.tasks.spawn(async move {
            manager.drain().await;
            let _ = tx.send(true);
        });
        rx
    }

    /// Await completion of the current drain, if any is running.
    pub async fn wait_for_sync(&self) {
        let rx = self.current.lock().clone();
        let Some(mut rx) = rx else {
            return;
        };
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// One pass over the pending rows. Rows are snapshot at enumeration;
    /// rows that vanish mid-drain were reconciled by someone else.
    async fn drain(&self) {
        let store = self.engine.store().clone();
        let services = match store.pending_services() {
            Ok(services) => services,
            Err(err) => {
                tracing::warn!(%err, "pending scan failed");
                return;
            }
        };

        for service in services {
            if service == SCHEMA_SERVICE {
                continue;
            }
            let rows = match store.pending_rows(&service) {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::warn!(%service, %err, "failed to load pending rows");
                    continue;
                }
            };

            for row in rows {
                let Some(id) = row.get("id").and_then(Value::as_str).map(str::to_string) else {
                    continue;
                };
                if let Err(err) = self.replay(&service, &id, &row).await {
                    tracing::warn!(%service, %id, %err, "replay failed; row stays pending");
                }
            }
        }
    }

    async fn replay(&self, service: &str, id: &str, row: &Value) -> crate::error::Result<()> {
        let policy = RequestPolicy::CacheAndNetwork;
        if flag(row, FLAG_DELETED) {
            self.engine.delete(service, id, policy).await
        } else if flag(row, FLAG_NEW) {
            // Locally created: replay as a create carrying the local id,
            // minus every server-owned field.
            let mut body = row.clone();
            strip_server_fields(&mut body);
            self.engine.create(service, &body, &[], policy).await.map(|_| ())
        } else {
            self.engine
                .update(service, id, row, &[], policy)
                .await
                .map(|_| ())
        }
    }
}
