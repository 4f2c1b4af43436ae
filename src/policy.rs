//! The request policy engine: routes every read and write through the cache,
//! the network, or both, with distinct semantics per policy and operation.
//!
//! The engine composes a `Store` (cache side) with a `RemoteClient` and a
//! `Connectivity` probe (network side). Background refreshes are spawned on
//! the client's `TaskScope` and never awaited by the caller.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::id::record_id;
use crate::remote::{Connectivity, FileUpload, RemoteClient, RemoteError, RemoteResult};
use crate::store::Store;
use crate::tasks::TaskScope;
use crate::types::{
    set_flag, ListPage, QueryOptions, RequestPolicy, FLAG_DELETED, FLAG_NEW, FLAG_NO_SYNC,
    FLAG_SYNCED,
};

/// Default timeout for remote list fetches.
const LIST_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Page size used when draining a full list from the remote.
const FULL_LIST_PAGE: u32 = 500;

#[derive(Clone)]
pub struct PolicyEngine {
    store: Arc<Store>,
    remote: Arc<dyn RemoteClient>,
    connectivity: Arc<dyn Connectivity>,
    tasks: TaskScope,
}

impl PolicyEngine {
    pub fn new(
        store: Arc<Store>,
        remote: Arc<dyn RemoteClient>,
        connectivity: Arc<dyn Connectivity>,
        tasks: TaskScope,
    ) -> Self {
        Self {
            store,
            remote,
            connectivity,
            tasks,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteClient> {
        &self.remote
    }

    pub(crate) fn tasks(&self) -> &TaskScope {
        &self.tasks
    }

    fn online(&self) -> bool {
        self.connectivity.is_connected()
    }

    /// Validation is schema-driven: collections without a cached schema are
    /// stored as-is, and the schema collection itself is never validated.
    fn should_validate(&self, service: &str) -> bool {
        service != crate::schema::SCHEMA_SERVICE && self.store.schemas().by_name(service).is_some()
    }

    // ======================================================================
    // Reads
    // ======================================================================

    pub async fn get_one(
        &self,
        service: &str,
        id: &str,
        opts: &QueryOptions,
        policy: RequestPolicy,
    ) -> Result<Value> {
        match policy {
            RequestPolicy::CacheOnly => self
                .local_get_one(service, id, opts)?
                .ok_or_else(|| Error::cache_miss(service, id)),

            RequestPolicy::NetworkOnly => {
                if !self.online() {
                    return Err(Error::Offline);
                }
                let record = self
                    .remote
                    .get_one(service, id, &remote_params(opts, false))
                    .await?;
                Ok(record)
            }

            RequestPolicy::CacheFirst => {
                if let Some(row) = self.local_get_one(service, id, opts)? {
                    if self.online() {
                        self.spawn_refresh_one(service, id, opts);
                    }
                    return Ok(row);
                }
                if !self.online() {
                    return Err(Error::cache_miss(service, id));
                }
                let record = self
                    .remote
                    .get_one(service, id, &remote_params(opts, false))
                    .await?;
                self.store.set_local(service, &[record.clone()], false)?;
                Ok(self.local_get_one(service, id, opts)?.unwrap_or(record))
            }

            RequestPolicy::NetworkFirst | RequestPolicy::CacheAndNetwork => {
                let remote_err: Error = if self.online() {
                    match self
                        .remote
                        .get_one(service, id, &remote_params(opts, false))
                        .await
                    {
                        Ok(record) => {
                            self.store.set_local(service, &[record.clone()], false)?;
                            return Ok(self.local_get_one(service, id, opts)?.unwrap_or(record));
                        }
                        Err(err) => err.into(),
                    }
                } else {
                    Error::Offline
                };

                match self.local_get_one(service, id, opts)? {
                    Some(row) => {
                        tracing::debug!(service, id, %remote_err, "serving cached record after remote failure");
                        Ok(row)
                    }
                    None => Err(Error::NoSource {
                        service: service.to_string(),
                        id: id.to_string(),
                        remote: remote_err.to_string(),
                    }),
                }
            }
        }
    }

    pub async fn get_list(
        &self,
        service: &str,
        page: u32,
        per_page: u32,
        opts: &QueryOptions,
        policy: RequestPolicy,
    ) -> Result<ListPage> {
        match policy {
            RequestPolicy::CacheOnly => self.local_list(service, page, per_page, opts),

            RequestPolicy::NetworkOnly => {
                if !self.online() {
                    return Err(Error::Offline);
                }
                let result = with_list_timeout(self.remote.get_list(
                    service,
                    page,
                    per_page,
                    &remote_params(opts, true),
                ))
                .await?;
                Ok(result)
            }

            RequestPolicy::CacheFirst => {
                let local = self.local_list(service, page, per_page, opts)?;
                if !local.items.is_empty() || !self.online() {
                    if self.online() {
                        self.spawn_refresh_page(service, page, per_page, opts);
                    }
                    return Ok(local);
                }
                let fetched = with_list_timeout(self.remote.get_list(
                    service,
                    page,
                    per_page,
                    &remote_params(opts, true),
                ))
                .await?;
                self.store.merge_local(service, &fetched.items)?;
                self.local_list(service, page, per_page, opts)
            }

            RequestPolicy::NetworkFirst | RequestPolicy::CacheAndNetwork => {
                if self.online() {
                    match with_list_timeout(self.remote.get_list(
                        service,
                        page,
                        per_page,
                        &remote_params(opts, true),
                    ))
                    .await
                    {
                        Ok(fetched) => {
                            self.store.merge_local(service, &fetched.items)?;
                            return Ok(fetched);
                        }
                        Err(err) => {
                            tracing::debug!(service, %err, "list fetch failed, falling back to cache");
                        }
                    }
                }
                self.local_list(service, page, per_page, opts)
            }
        }
    }

    /// Fetch every page of a listing. On a successful network pass the
    /// result is merged with `sync_local`, which also reconciles rows the
    /// server stopped returning for the same filter.
    pub async fn get_full_list(
        &self,
        service: &str,
        opts: &QueryOptions,
        policy: RequestPolicy,
    ) -> Result<Vec<Value>> {
        let unpaged = QueryOptions {
            limit: None,
            offset: None,
            ..opts.clone()
        };
        match policy {
            RequestPolicy::CacheOnly => self.store.query(service, &unpaged),

            RequestPolicy::NetworkOnly => {
                if !self.online() {
                    return Err(Error::Offline);
                }
                self.fetch_all_pages(service, opts).await.map_err(Into::into)
            }

            RequestPolicy::CacheFirst => {
                let local = self.store.query(service, &unpaged)?;
                if !local.is_empty() || !self.online() {
                    if self.online() {
                        self.spawn_refresh_full(service, opts);
                    }
                    return Ok(local);
                }
                let items = self.fetch_all_pages(service, opts).await?;
                self.store
                    .sync_local(service, &items, opts.filter.as_deref())?;
                self.store.query(service, &unpaged)
            }

            RequestPolicy::NetworkFirst | RequestPolicy::CacheAndNetwork => {
                if self.online() {
                    match self.fetch_all_pages(service, opts).await {
                        Ok(items) => {
                            self.store
                                .sync_local(service, &items, opts.filter.as_deref())?;
                        }
                        Err(err) => {
                            tracing::debug!(service, %err, "full list fetch failed, serving cache");
                        }
                    }
                }
                self.store.query(service, &unpaged)
            }
        }
    }

    fn local_get_one(&self, service: &str, id: &str, opts: &QueryOptions) -> Result<Option<Value>> {
        let q = QueryOptions {
            filter: Some(format!("id='{}'", quote_literal(id))),
            sort: None,
            limit: Some(1),
            offset: None,
            ..opts.clone()
        };
        Ok(self.store.query(service, &q)?.into_iter().next())
    }

    fn local_list(
        &self,
        service: &str,
        page: u32,
        per_page: u32,
        opts: &QueryOptions,
    ) -> Result<ListPage> {
        let page = page.max(1);
        let q = QueryOptions {
            limit: Some(per_page as i64),
            offset: Some((page as i64 - 1) * per_page as i64),
            ..opts.clone()
        };
        let items = self.store.query(service, &q)?;
        let total_items = self.store.count(service, opts.filter.as_deref())?;
        Ok(ListPage {
            page,
            per_page,
            total_items,
            total_pages: if per_page == 0 {
                0
            } else {
                (total_items + per_page as i64 - 1) / per_page as i64
            },
            items,
        })
    }

    async fn fetch_all_pages(&self, service: &str, opts: &QueryOptions) -> RemoteResult<Vec<Value>> {
        let mut items = Vec::new();
        let mut page = 1;
        loop {
            let fetched = with_list_timeout(self.remote.get_list(
                service,
                page,
                FULL_LIST_PAGE,
                &remote_params(opts, true),
            ))
            .await?;
            let batch = fetched.items.len();
            items.extend(fetched.items);
            if batch == 0 || (page as i64) >= fetched.total_pages {
                return Ok(items);
            }
            page += 1;
        }
    }

    fn spawn_refresh_one(&self, service: &str, id: &str, opts: &QueryOptions) {
        let engine = self.clone();
        let (service, id, params) = (
            service.to_string(),
            id.to_string(),
            remote_params(opts, false),
        );
        self.tasks.spawn(async move {
            match engine.remote.get_one(&service, &id, &params).await {
                Ok(record) => {
                    if let Err(err) = engine.store.set_local(&service, &[record], false) {
                        tracing::warn!(%service, %id, %err, "background refresh failed to cache");
                    }
                }
                Err(err) => tracing::debug!(%service, %id, %err, "background refresh failed"),
            }
        });
    }

    fn spawn_refresh_page(&self, service: &str, page: u32, per_page: u32, opts: &QueryOptions) {
        let engine = self.clone();
        let service = service.to_string();
        let params = remote_params(opts, true);
        self.tasks.spawn(async move {
            match with_list_timeout(engine.remote.get_list(&service, page, per_page, &params)).await
            {
                Ok(fetched) => {
                    if let Err(err) = engine.store.merge_local(&service, &fetched.items) {
                        tracing::warn!(%service, %err, "background page refresh failed to cache");
                    }
                }
                Err(err) => tracing::debug!(%service, %err, "background page refresh failed"),
            }
        });
    }

    fn spawn_refresh_full(&self, service: &str, opts: &QueryOptions) {
        let engine = self.clone();
        let service = service.to_string();
        let opts = opts.clone();
        self.tasks.spawn(async move {
            match engine.fetch_all_pages(&service, &opts).await {
                Ok(items) => {
                    if let Err(err) =
                        engine
                            .store
                            .sync_local(&service, &items, opts.filter.as_deref())
                    {
                        tracing::warn!(%service, %err, "background full refresh failed to cache");
                    }
                }
                Err(err) => tracing::debug!(%service, %err, "background full refresh failed"),
            }
        });
    }

    // ======================================================================
    // Creates
    // ======================================================================

    pub async fn create(
        &self,
        service: &str,
        body: &Value,
        files: &[FileUpload],
        policy: RequestPolicy,
    ) -> Result<Value> {
        let validate = self.should_validate(service);
        match policy {
            RequestPolicy::CacheOnly => {
                let mut data = body.clone();
                set_flag(&mut data, FLAG_SYNCED, false);
                set_flag(&mut data, FLAG_NO_SYNC, true);
                set_flag(&mut data, FLAG_NEW, true);
                let record = self.store.create_row(service, &data, validate)?;
                self.store_uploads(&record, files)?;
                Ok(record)
            }

            RequestPolicy::NetworkOnly => {
                if !self.online() {
                    return Err(Error::Offline);
                }
                Ok(self.remote.create(service, body, files).await?)
            }

            RequestPolicy::CacheFirst => {
                let body = ensure_id(body);
                let mut data = body.clone();
                set_flag(&mut data, FLAG_SYNCED, false);
                set_flag(&mut data, FLAG_NO_SYNC, false);
                set_flag(&mut data, FLAG_NEW, true);
                let record = self.store.create_row(service, &data, validate)?;
                self.store_uploads(&record, files)?;

                if self.online() {
                    let engine = self.clone();
                    let service = service.to_string();
                    let local_id = record_id_of(&record);
                    let files = files.to_vec();
                    self.tasks.spawn(async move {
                        match engine.remote.create(&service, &body, &files).await {
                            Ok(server) => {
                                if let Err(err) = engine.cache_server_record(
                                    &service,
                                    server,
                                    local_id.as_deref(),
                                    &files,
                                ) {
                                    tracing::warn!(%service, %err, "failed to cache background create");
                                }
                            }
                            Err(err) => {
                                tracing::warn!(%service, %err, "background create failed; row stays pending")
                            }
                        }
                    });
                }
                Ok(record)
            }

            RequestPolicy::NetworkFirst => {
                if !self.online() {
                    return Err(Error::Offline);
                }
                let sent_id = body.get("id").and_then(Value::as_str).map(str::to_string);
                let server = match self.remote.create(service, body, files).await {
                    Ok(server) => server,
                    // A 400 for a create that carried an id usually means the
                    // record already exists: retry as an update.
                    Err(RemoteError::Http { status: 400, .. }) if sent_id.is_some() => {
                        let id = sent_id.as_deref().unwrap_or_default();
                        self.remote.update(service, id, body, files).await?
                    }
                    Err(err) => return Err(err.into()),
                };
                self.cache_server_record(service, server, sent_id.as_deref(), files)
            }

            RequestPolicy::CacheAndNetwork => {
                let body = ensure_id(body);
                let Some(local_id) = record_id_of(&body) else {
                    return Err(Error::validation("data", "expected a JSON object"));
                };

                if self.online() {
                    match self.try_remote_create(service, &body, &local_id, files).await {
                        Some(server) => {
                            return self.cache_server_record(
                                service,
                                server,
                                Some(&local_id),
                                files,
                            );
                        }
                        None => {
                            tracing::debug!(service, id = %local_id, "remote create failed; keeping local pending row");
                        }
                    }
                }

                let mut data = body.clone();
                set_flag(&mut data, FLAG_SYNCED, false);
                set_flag(&mut data, FLAG_NO_SYNC, false);
                set_flag(&mut data, FLAG_NEW, true);
                let record = self.store.create_row(service, &data, validate)?;
                self.store_uploads(&record, files)?;
                Ok(record)
            }
        }
    }

    /// Remote create with the update fallback on 400; `None` means "fall
    /// back to the cache".
    async fn try_remote_create(
        &self,
        service: &str,
        body: &Value,
        id: &str,
        files: &[FileUpload],
    ) -> Option<Value> {
        match self.remote.create(service, body, files).await {
            Ok(server) => Some(server),
            Err(RemoteError::Http { status: 400, body: detail }) => {
                tracing::debug!(service, id, %detail, "create rejected with 400, retrying as update");
                match self.remote.update(service, id, body, files).await {
                    Ok(server) => Some(server),
                    Err(err) => {
                        tracing::warn!(service, id, %err, "create-as-update fallback failed");
                        None
                    }
                }
            }
            Err(err) => {
                tracing::warn!(service, id, %err, "remote create failed");
                None
            }
        }
    }

    // ======================================================================
    // Updates
    // ======================================================================

    pub async fn update(
        &self,
        service: &str,
        id: &str,
        patch: &Value,
        files: &[FileUpload],
        policy: RequestPolicy,
    ) -> Result<Value> {
        let validate = self.should_validate(service);
        match policy {
            RequestPolicy::CacheOnly => {
                let mut data = patch.clone();
                set_flag(&mut data, FLAG_SYNCED, false);
                set_flag(&mut data, FLAG_NO_SYNC, true);
                let record = self.store.update_row(service, id, &data, validate)?;
                self.store_uploads(&record, files)?;
                Ok(record)
            }

            RequestPolicy::NetworkOnly => {
                if !self.online() {
                    return Err(Error::Offline);
                }
                Ok(self.remote.update(service, id, patch, files).await?)
            }

            RequestPolicy::CacheFirst => {
                let mut data = patch.clone();
                set_flag(&mut data, FLAG_SYNCED, false);
                set_flag(&mut data, FLAG_NO_SYNC, false);
                let record = self.store.update_row(service, id, &data, validate)?;
                self.store_uploads(&record, files)?;

                if self.online() {
                    let engine = self.clone();
                    let (service, id) = (service.to_string(), id.to_string());
                    let patch = patch.clone();
                    let files = files.to_vec();
                    self.tasks.spawn(async move {
                        match engine.remote.update(&service, &id, &patch, &files).await {
                            Ok(server) => {
                                if let Err(err) =
                                    engine.cache_server_record(&service, server, Some(&id), &files)
                                {
                                    tracing::warn!(%service, %id, %err, "failed to cache background update");
                                }
                            }
                            Err(err) => {
                                tracing::warn!(%service, %id, %err, "background update failed; row stays pending")
                            }
                        }
                    });
                }
                Ok(record)
            }

            RequestPolicy::NetworkFirst => {
                if !self.online() {
                    return Err(Error::Offline);
                }
                let server = match self.remote.update(service, id, patch, files).await {
                    Ok(server) => server,
                    // 404/400 while updating: the record may not exist yet on
                    // the server, so retry as a create carrying the id.
                    Err(RemoteError::Http { status: 404 | 400, .. }) => {
                        let body = with_id(patch, id);
                        self.remote.create(service, &body, files).await?
                    }
                    Err(err) => return Err(err.into()),
                };
                self.cache_server_record(service, server, Some(id), files)
            }

            RequestPolicy::CacheAndNetwork => {
                if self.online() {
                    if let Some(server) = self.try_remote_update(service, id, patch, files).await {
                        return self.cache_server_record(service, server, Some(id), files);
                    }
                }

                let mut data = patch.clone();
                set_flag(&mut data, FLAG_SYNCED, false);
                set_flag(&mut data, FLAG_NO_SYNC, false);
                let record = match self.store.update_row(service, id, &data, validate) {
                    Ok(record) => record,
                    // Nothing local to patch: keep the write as a pending row
                    // so the next drain replays it as an update.
                    Err(Error::CacheMiss { .. }) => {
                        let body = with_id(&data, id);
                        self.store.create_row(service, &body, validate)?
                    }
                    Err(err) => return Err(err),
                };
                self.store_uploads(&record, files)?;
                Ok(record)
            }
        }
    }

    async fn try_remote_update(
        &self,
        service: &str,
        id: &str,
        patch: &Value,
        files: &[FileUpload],
    ) -> Option<Value> {
        match self.remote.update(service, id, patch, files).await {
            Ok(server) => Some(server),
            Err(RemoteError::Http { status: 404 | 400, .. }) => {
                let body = with_id(patch, id);
                match self.remote.create(service, &body, files).await {
                    Ok(server) => Some(server),
                    Err(err) => {
                        tracing::warn!(service, id, %err, "update-as-create fallback failed");
                        None
                    }
                }
            }
            Err(err) => {
                tracing::warn!(service, id, %err, "remote update failed");
                None
            }
        }
    }

    // ======================================================================
    // Deletes
    // ======================================================================

    pub async fn delete(&self, service: &str, id: &str, policy: RequestPolicy) -> Result<()> {
        match policy {
            RequestPolicy::CacheOnly => {
                let mut patch = Value::Object(Default::default());
                set_flag(&mut patch, FLAG_DELETED, true);
                set_flag(&mut patch, FLAG_SYNCED, false);
                set_flag(&mut patch, FLAG_NO_SYNC, true);
                self.store.update_row(service, id, &patch, false)?;
                Ok(())
            }

            RequestPolicy::NetworkOnly => {
                if !self.online() {
                    return Err(Error::Offline);
                }
                self.remote.delete(service, id).await?;
                Ok(())
            }

            RequestPolicy::CacheFirst => {
                // Instant local removal; the remote delete is fire-and-forget
                // and a crash in the window can leak a server row.
                self.store.delete_row(service, id)?;
                if self.online() {
                    let engine = self.clone();
                    let (service, id) = (service.to_string(), id.to_string());
                    self.tasks.spawn(async move {
                        if let Err(err) = engine.remote.delete(&service, &id).await {
                            tracing::warn!(%service, %id, %err, "background delete failed");
                        }
                    });
                }
                Ok(())
            }

            RequestPolicy::NetworkFirst => {
                if !self.online() {
                    return Err(Error::Offline);
                }
                self.remote.delete(service, id).await?;
                self.store.delete_row(service, id)?;
                Ok(())
            }

            RequestPolicy::CacheAndNetwork => {
                if self.online() {
                    match self.remote.delete(service, id).await {
                        Ok(()) => {
                            self.store.delete_row(service, id)?;
                            return Ok(());
                        }
                        // Already gone on the server: finish the local side.
                        Err(RemoteError::Http { status: 404, .. }) => {
                            self.store.delete_row(service, id)?;
                            return Ok(());
                        }
                        Err(err) => {
                            tracing::warn!(service, id, %err, "remote delete failed; tombstoning locally");
                        }
                    }
                }

                let mut patch = Value::Object(Default::default());
                set_flag(&mut patch, FLAG_DELETED, true);
                set_flag(&mut patch, FLAG_SYNCED, false);
                match self.store.update_row(service, id, &patch, false) {
                    Ok(_) => Ok(()),
                    // Nothing cached: there is nothing to tombstone either.
                    Err(Error::CacheMiss { .. }) => Ok(()),
                    Err(err) => Err(err),
                }
            }
        }
    }

    // ======================================================================
    // Server-canonical caching
    // ======================================================================

    /// Upsert a server-returned record as the canonical local state.
    ///
    /// Handles the two post-write chores: reconciling a server-assigned id
    /// that differs from the local one, and re-caching uploaded file bytes
    /// under the filenames the server chose.
    pub(crate) fn cache_server_record(
        &self,
        service: &str,
        server: Value,
        local_id: Option<&str>,
        uploads: &[FileUpload],
    ) -> Result<Value> {
        let server_id = record_id_of(&server).unwrap_or_default();

        if let Some(local_id) = local_id {
            if !server_id.is_empty() && local_id != server_id {
                tracing::warn!(
                    service,
                    local = local_id,
                    server = %server_id,
                    "server assigned a different id; replacing local row"
                );
                self.store.rekey_files(local_id, &server_id)?;
                self.store.delete_row(service, local_id)?;
            }
        }

        let mut canonical = server;
        set_flag(&mut canonical, FLAG_SYNCED, true);
        set_flag(&mut canonical, FLAG_NEW, false);
        if let Some(obj) = canonical.as_object_mut() {
            obj.remove(FLAG_DELETED);
            obj.remove(FLAG_NO_SYNC);
        }
        let record = self.store.create_row(service, &canonical, false)?;

        self.remap_uploads(&record, uploads)?;
        Ok(record)
    }

    /// Cache uploaded bytes under the record's original filenames.
    fn store_uploads(&self, record: &Value, uploads: &[FileUpload]) -> Result<()> {
        let Some(id) = record_id_of(record) else {
            return Ok(());
        };
        for upload in uploads {
            self.store.set_file(&id, &upload.filename, &upload.bytes, None)?;
        }
        Ok(())
    }

    /// After a successful server write, the server renames each uploaded
    /// file to `<stem>_<nonce>.<ext>`. Re-cache every buffered upload under
    /// the server's filename.
    fn remap_uploads(&self, record: &Value, uploads: &[FileUpload]) -> Result<()> {
        let Some(id) = record_id_of(record) else {
            return Ok(());
        };
        for upload in uploads {
            let server_name =
                server_filename(record, upload).unwrap_or_else(|| upload.filename.clone());
            self.store.set_file(&id, &server_name, &upload.bytes, None)?;
            if server_name != upload.filename {
                self.store.delete_file(&id, &upload.filename)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn record_id_of(record: &Value) -> Option<String> {
    record
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Clone `body`, generating a fresh server-format id when it has none.
fn ensure_id(body: &Value) -> Value {
    let mut out = body.clone();
    if record_id_of(&out).is_none() {
        if let Some(obj) = out.as_object_mut() {
            obj.insert("id".into(), Value::String(record_id()));
        }
    }
    out
}

fn with_id(body: &Value, id: &str) -> Value {
    let mut out = body.clone();
    if let Some(obj) = out.as_object_mut() {
        obj.insert("id".into(), Value::String(id.to_string()));
    }
    out
}

fn quote_literal(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Match an uploaded file to the filename the server stored it under:
/// exact match first, then a `<stem>_` prefix match.
fn server_filename(record: &Value, upload: &FileUpload) -> Option<String> {
    let value = record.get(&upload.field)?;
    let candidates: Vec<&str> = match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => return None,
    };
    if candidates.iter().any(|c| *c == upload.filename) {
        return Some(upload.filename.clone());
    }
    let stem = upload
        .filename
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(&upload.filename);
    let prefix = format!("{stem}_");
    candidates
        .iter()
        .find(|c| c.starts_with(&prefix))
        .map(|c| c.to_string())
}

fn remote_params(opts: &QueryOptions, include_filter: bool) -> Vec<(String, String)> {
    let mut params = Vec::new();
    if include_filter {
        if let Some(filter) = &opts.filter {
            params.push(("filter".to_string(), filter.clone()));
        }
        if let Some(sort) = &opts.sort {
            params.push(("sort".to_string(), sort.clone()));
        }
    }
    if let Some(expand) = &opts.expand {
        params.push(("expand".to_string(), expand.clone()));
    }
    if let Some(fields) = &opts.fields {
        params.push(("fields".to_string(), fields.clone()));
    }
    params
}

async fn with_list_timeout<T>(
    fut: impl std::future::Future<Output = RemoteResult<T>>,
) -> RemoteResult<T> {
    match tokio::time::timeout(LIST_FETCH_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Transport("list fetch timed out".into())),
    }
}
