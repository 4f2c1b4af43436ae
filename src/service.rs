//! `RecordService` — the per-collection public API. A thin, cheaply
//! cloneable handle over the policy engine; holds no rows of its own.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::policy::PolicyEngine;
use crate::remote::FileUpload;
use crate::store::Store;
use crate::types::{
    EventCallback, ListPage, QueryOptions, RecordAction, RecordEvent, RequestPolicy,
};

#[derive(Clone)]
pub struct RecordService {
    name: String,
    engine: PolicyEngine,
    default_policy: RequestPolicy,
}

impl RecordService {
    pub(crate) fn new(name: &str, engine: PolicyEngine, default_policy: RequestPolicy) -> Self {
        Self {
            name: name.to_string(),
            engine,
            default_policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self, policy: Option<RequestPolicy>) -> RequestPolicy {
        policy.unwrap_or(self.default_policy)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_one(
        &self,
        id: &str,
        opts: &QueryOptions,
        policy: Option<RequestPolicy>,
    ) -> Result<Value> {
        self.engine
            .get_one(&self.name, id, opts, self.policy(policy))
            .await
    }

    pub async fn get_list(
        &self,
        page: u32,
        per_page: u32,
        opts: &QueryOptions,
        policy: Option<RequestPolicy>,
    ) -> Result<ListPage> {
        self.engine
            .get_list(&self.name, page, per_page, opts, self.policy(policy))
            .await
    }

    pub async fn get_full_list(
        &self,
        opts: &QueryOptions,
        policy: Option<RequestPolicy>,
    ) -> Result<Vec<Value>> {
        self.engine
            .get_full_list(&self.name, opts, self.policy(policy))
            .await
    }

    /// Reactive full-list read: the receiver yields the current cache
    /// contents first, then one merged update after the remote fetch and
    /// reconcile complete. Partial pages are never interleaved.
    pub fn stream_full_list(&self, opts: &QueryOptions) -> Result<mpsc::Receiver<Vec<Value>>> {
        let (tx, rx) = mpsc::channel(2);

        let unpaged = QueryOptions {
            limit: None,
            offset: None,
            ..opts.clone()
        };
        let snapshot = self.engine.store().query(&self.name, &unpaged)?;
        let _ = tx.try_send(snapshot);

        let service = self.clone();
        let opts = opts.clone();
        self.engine.tasks().spawn(async move {
            match service
                .engine
                .get_full_list(&service.name, &opts, RequestPolicy::CacheAndNetwork)
                .await
            {
                Ok(merged) => {
                    let _ = tx.send(merged).await;
                }
                Err(err) => {
                    tracing::warn!(service = %service.name, %err, "streamed full list failed");
                }
            }
        });
        Ok(rx)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub async fn create(&self, body: &Value, policy: Option<RequestPolicy>) -> Result<Value> {
        self.create_with_files(body, &[], policy).await
    }

    pub async fn create_with_files(
        &self,
        body: &Value,
        files: &[FileUpload],
        policy: Option<RequestPolicy>,
    ) -> Result<Value> {
        self.engine
            .create(&self.name, body, files, self.policy(policy))
            .await
    }

    pub async fn update(
        &self,
        id: &str,
        patch: &Value,
        policy: Option<RequestPolicy>,
    ) -> Result<Value> {
        self.update_with_files(id, patch, &[], policy).await
    }

    pub async fn update_with_files(
        &self,
        id: &str,
        patch: &Value,
        files: &[FileUpload],
        policy: Option<RequestPolicy>,
    ) -> Result<Value> {
        self.engine
            .update(&self.name, id, patch, files, self.policy(policy))
            .await
    }

    pub async fn delete(&self, id: &str, policy: Option<RequestPolicy>) -> Result<()> {
        self.engine
            .delete(&self.name, id, self.policy(policy))
            .await
    }

    // ------------------------------------------------------------------
    // Realtime
    // ------------------------------------------------------------------

    /// Subscribe to the collection's realtime topic. Incoming events are
    /// applied to the cache (creates/updates merge as server-confirmed,
    /// deletes remove the row) before the optional listener runs.
    pub async fn subscribe(&self, listener: Option<EventCallback>) -> Result<()> {
        let store = self.engine.store().clone();
        let name = self.name.clone();
        let callback: EventCallback = std::sync::Arc::new(move |event: RecordEvent| {
            apply_event(&store, &name, &event);
            if let Some(listener) = &listener {
                listener(event);
            }
        });
        self.engine.remote().subscribe(&self.name, callback).await?;
        Ok(())
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        self.engine.remote().unsubscribe(&self.name).await?;
        Ok(())
    }
}

/// Fold one realtime event into the cache. Merge is timestamp-aware, so a
/// stale out-of-order push never clobbers a newer row.
fn apply_event(store: &Store, service: &str, event: &RecordEvent) {
    let result = match (event.action, &event.record) {
        (RecordAction::Create | RecordAction::Update, Some(record)) => store
            .merge_local(service, std::slice::from_ref(record))
            .map(|_| ()),
        (RecordAction::Delete, Some(record)) => match record.get("id").and_then(Value::as_str) {
            Some(id) => store.delete_row(service, id),
            None => Ok(()),
        },
        _ => Ok(()),
    };
    if let Err(err) = result {
        tracing::warn!(service, %err, "failed to apply realtime event");
    }
}
