use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("offline: the requested policy requires the network")]
    Offline,

    #[error("cache miss for {service}/{id}")]
    CacheMiss { service: String, id: String },

    #[error("remote returned {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("no usable source for {service}/{id}: remote failed ({remote}); no cached copy")]
    NoSource {
        service: String,
        id: String,
        remote: String,
    },

    #[error("validation failed for field '{field}': {reason}")]
    Validation { field: String, reason: String },

    #[error("no schema cached for collection '{collection}'")]
    SchemaMissing { collection: String },

    #[error("filter parse error: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn cache_miss(service: impl Into<String>, id: impl Into<String>) -> Self {
        Error::CacheMiss {
            service: service.into(),
            id: id.into(),
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// HTTP status of a remote failure, if this error carries one.
    pub fn remote_status(&self) -> Option<u16> {
        match self {
            Error::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }
}
