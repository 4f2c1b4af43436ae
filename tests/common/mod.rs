//! Shared test doubles: an in-memory remote backend and a scriptable
//! connectivity probe.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use pocket_db::{
    record_id, Client, ClientConfig, Connectivity, EventCallback, FileUpload, ListPage,
    RecordEvent, RemoteClient, RemoteError, RemoteResult,
};

// ============================================================================
// MockConnectivity
// ============================================================================

pub struct MockConnectivity {
    online: AtomicBool,
    tx: watch::Sender<bool>,
}

impl MockConnectivity {
    pub fn new(online: bool) -> Arc<Self> {
        let (tx, _) = watch::channel(online);
        Arc::new(Self {
            online: AtomicBool::new(online),
            tx,
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        let _ = self.tx.send(online);
    }
}

impl Connectivity for MockConnectivity {
    fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

// ============================================================================
// MockRemote
// ============================================================================

/// In-memory server double. Keeps records per `(service, id)`, logs every
/// call, and can be scripted to fail or to rewrite ids/filenames the way a
/// real backend would.
#[derive(Default)]
pub struct MockRemote {
    pub records: Mutex<HashMap<(String, String), Value>>,
    /// Call log, e.g. `"create posts abc123def456ghi"`.
    pub calls: Mutex<Vec<String>>,
    /// Every operation fails with a transport error.
    pub fail_all: AtomicBool,
    /// Ids whose create/update/delete fail with HTTP 500.
    pub fail_ids: Mutex<HashSet<String>>,
    /// Next create fails once with this HTTP status.
    pub reject_create_with: Mutex<Option<u16>>,
    /// Server assigns this id on create instead of the client's.
    pub assign_id: Mutex<Option<String>>,
    /// Server renames uploaded files to `<stem>_srv.<ext>`.
    pub rename_files: AtomicBool,
    /// Canned full-list response, served regardless of stored records.
    pub list_response: Mutex<Option<Vec<Value>>>,
    pub subscriptions: Mutex<HashMap<String, EventCallback>>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn log(&self, entry: impl Into<String>) {
        self.calls.lock().unwrap().push(entry.into());
    }

    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn seed(&self, service: &str, record: Value) {
        let id = record["id"].as_str().expect("seeded record has id").to_string();
        self.records
            .lock()
            .unwrap()
            .insert((service.to_string(), id), record);
    }

    pub fn record(&self, service: &str, id: &str) -> Option<Value> {
        self.records
            .lock()
            .unwrap()
            .get(&(service.to_string(), id.to_string()))
            .cloned()
    }

    /// Deliver a realtime event to the collection's subscriber.
    pub fn push_event(&self, topic: &str, event: RecordEvent) {
        let callback = self.subscriptions.lock().unwrap().get(topic).cloned();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    fn check_failures(&self, id: &str) -> RemoteResult<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("connection refused".into()));
        }
        if self.fail_ids.lock().unwrap().contains(id) {
            return Err(RemoteError::Http {
                status: 500,
                body: "internal error".into(),
            });
        }
        Ok(())
    }

    fn stamp(&self, service: &str, body: &Value, id: String, files: &[FileUpload]) -> Value {
        let mut record = body.clone();
        let obj = record.as_object_mut().expect("record body is an object");
        obj.insert("id".into(), Value::String(id));
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        obj.entry("created").or_insert(Value::String(now.clone()));
        obj.insert("updated".into(), Value::String(now));
        obj.insert("collectionName".into(), Value::String(service.to_string()));

        if self.rename_files.load(Ordering::SeqCst) {
            for upload in files {
                let (stem, ext) = upload
                    .filename
                    .rsplit_once('.')
                    .unwrap_or((upload.filename.as_str(), ""));
                let renamed = if ext.is_empty() {
                    format!("{stem}_srv")
                } else {
                    format!("{stem}_srv.{ext}")
                };
                obj.insert(upload.field.clone(), Value::String(renamed));
            }
        }
        record
    }
}

#[async_trait]
impl RemoteClient for MockRemote {
    async fn get_one(
        &self,
        service: &str,
        id: &str,
        _query: &[(String, String)],
    ) -> RemoteResult<Value> {
        self.log(format!("get_one {service} {id}"));
        self.check_failures(id)?;
        self.record(service, id).ok_or(RemoteError::Http {
            status: 404,
            body: "not found".into(),
        })
    }

    async fn get_list(
        &self,
        service: &str,
        page: u32,
        per_page: u32,
        _query: &[(String, String)],
    ) -> RemoteResult<ListPage> {
        self.log(format!("get_list {service} p{page}"));
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("connection refused".into()));
        }
        let all: Vec<Value> = match self.list_response.lock().unwrap().clone() {
            Some(items) => items,
            None => {
                let records = self.records.lock().unwrap();
                let mut items: Vec<Value> = records
                    .iter()
                    .filter(|((s, _), _)| s == service)
                    .map(|(_, v)| v.clone())
                    .collect();
                items.sort_by_key(|v| v["id"].as_str().unwrap_or_default().to_string());
                items
            }
        };
        let total_items = all.len() as i64;
        let per = per_page.max(1) as usize;
        let start = (page.max(1) as usize - 1) * per;
        let items: Vec<Value> = all.into_iter().skip(start).take(per).collect();
        Ok(ListPage {
            page,
            per_page,
            total_items,
            total_pages: (total_items + per as i64 - 1) / per as i64,
            items,
        })
    }

    async fn create(
        &self,
        service: &str,
        body: &Value,
        files: &[FileUpload],
    ) -> RemoteResult<Value> {
        let sent_id = body["id"].as_str().unwrap_or("").to_string();
        self.log(format!("create {service} {sent_id}"));
        self.check_failures(&sent_id)?;
        if let Some(status) = self.reject_create_with.lock().unwrap().take() {
            return Err(RemoteError::Http {
                status,
                body: "rejected".into(),
            });
        }
        let id = self
            .assign_id
            .lock()
            .unwrap()
            .clone()
            .or_else(|| (!sent_id.is_empty()).then(|| sent_id.clone()))
            .unwrap_or_else(record_id);
        let record = self.stamp(service, body, id.clone(), files);
        self.records
            .lock()
            .unwrap()
            .insert((service.to_string(), id), record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        service: &str,
        id: &str,
        body: &Value,
        files: &[FileUpload],
    ) -> RemoteResult<Value> {
        self.log(format!("update {service} {id}"));
        self.check_failures(id)?;
        if self.record(service, id).is_none() {
            return Err(RemoteError::Http {
                status: 404,
                body: "not found".into(),
            });
        }
        let record = self.stamp(service, body, id.to_string(), files);
        self.records
            .lock()
            .unwrap()
            .insert((service.to_string(), id.to_string()), record.clone());
        Ok(record)
    }

    async fn delete(&self, service: &str, id: &str) -> RemoteResult<()> {
        self.log(format!("delete {service} {id}"));
        self.check_failures(id)?;
        match self
            .records
            .lock()
            .unwrap()
            .remove(&(service.to_string(), id.to_string()))
        {
            Some(_) => Ok(()),
            None => Err(RemoteError::Http {
                status: 404,
                body: "not found".into(),
            }),
        }
    }

    async fn send(
        &self,
        path: &str,
        method: &str,
        _query: &[(String, String)],
        _body: Option<&Value>,
        _files: &[FileUpload],
    ) -> RemoteResult<Value> {
        self.log(format!("send {method} {path}"));
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("connection refused".into()));
        }
        Ok(serde_json::json!({"ok": true, "path": path}))
    }

    async fn subscribe(&self, topic: &str, callback: EventCallback) -> RemoteResult<()> {
        self.log(format!("subscribe {topic}"));
        self.subscriptions
            .lock()
            .unwrap()
            .insert(topic.to_string(), callback);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> RemoteResult<()> {
        self.log(format!("unsubscribe {topic}"));
        self.subscriptions.lock().unwrap().remove(topic);
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub const POSTS_SCHEMA: &str = r#"[
    {
        "id": "col_posts_00001",
        "name": "posts",
        "schema": [
            {"name": "title", "type": "text", "required": true},
            {"name": "community", "type": "text"},
            {"name": "author", "type": "relation",
             "data": {"maxSelect": 1, "collectionId": "col_users_00001"}},
            {"name": "tags", "type": "relation",
             "data": {"maxSelect": 3, "collectionId": "col_tags_000001"}},
            {"name": "attachment", "type": "file",
             "data": {"maxSelect": 1}}
        ]
    },
    {
        "id": "col_users_00001",
        "name": "users",
        "schema": [{"name": "name", "type": "text"}]
    },
    {
        "id": "col_tags_000001",
        "name": "tags",
        "schema": [{"name": "label", "type": "text"}]
    }
]"#;

pub struct Harness {
    pub client: Client,
    pub remote: Arc<MockRemote>,
    pub connectivity: Arc<MockConnectivity>,
}

/// Build a client over in-memory storage with the posts/users/tags schemas
/// preloaded.
pub fn harness(online: bool) -> Harness {
    let remote = MockRemote::new();
    let connectivity = MockConnectivity::new(online);
    let client = Client::new(
        ClientConfig::default(),
        remote.clone(),
        connectivity.clone(),
    )
    .expect("client opens");
    client
        .load_schema_snapshot(POSTS_SCHEMA)
        .expect("schema snapshot loads");
    Harness {
        client,
        remote,
        connectivity,
    }
}

/// Give spawned background tasks a moment to run.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}
