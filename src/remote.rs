//! Transport seams: the `RemoteClient` CRUD/realtime contract and the
//! `Connectivity` probe. Both are user-provided trait objects so tests can
//! drive them deterministically.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::error::Error;
use crate::types::{EventCallback, ListPage};

// ============================================================================
// RemoteClient
// ============================================================================

/// A file buffered for a multipart upload.
#[derive(Debug, Clone)]
pub struct FileUpload {
    /// Schema field the file belongs to.
    pub field: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Transport-level failure.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("transport: {0}")]
    Transport(String),
}

impl RemoteError {
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Http { status, .. } => Some(*status),
            RemoteError::Transport(_) => None,
        }
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Http { status, body } => Error::Remote { status, body },
            RemoteError::Transport(message) => Error::Remote {
                status: 0,
                body: message,
            },
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// The HTTP transport the core consumes. Implementations own authentication,
/// retries below the policy layer, and the realtime channel.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn get_one(
        &self,
        service: &str,
        id: &str,
        query: &[(String, String)],
    ) -> RemoteResult<Value>;

    async fn get_list(
        &self,
        service: &str,
        page: u32,
        per_page: u32,
        query: &[(String, String)],
    ) -> RemoteResult<ListPage>;

    /// Create a record. `body` may carry a client-generated `id`.
    async fn create(
        &self,
        service: &str,
        body: &Value,
        files: &[FileUpload],
    ) -> RemoteResult<Value>;

    async fn update(
        &self,
        service: &str,
        id: &str,
        body: &Value,
        files: &[FileUpload],
    ) -> RemoteResult<Value>;

    async fn delete(&self, service: &str, id: &str) -> RemoteResult<()>;

    /// Arbitrary-route escape hatch.
    async fn send(
        &self,
        path: &str,
        method: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        files: &[FileUpload],
    ) -> RemoteResult<Value>;

    /// Subscribe to realtime events for a topic (`collection` or
    /// `collection/recordId`).
    async fn subscribe(&self, topic: &str, callback: EventCallback) -> RemoteResult<()>;

    async fn unsubscribe(&self, topic: &str) -> RemoteResult<()>;
}

// ============================================================================
// Connectivity
// ============================================================================

/// Connectivity probe. `watch()` returns a channel that yields `true` on
/// rising edges; repeated `true` values must be tolerated by consumers.
pub trait Connectivity: Send + Sync {
    fn is_connected(&self) -> bool;
    fn watch(&self) -> tokio::sync::watch::Receiver<bool>;
}
