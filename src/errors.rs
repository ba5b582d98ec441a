use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("VALIDATION: {0}")]
    Validation(String),
    #[error("REMOTE_WRITE: {0}")]
    RemoteWrite(String),
    #[error("SUBSCRIPTION: {0}")]
    Subscription(String),
    #[error("SCHEDULER: {0}")]
    Scheduler(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl From<std::io::Error> for SyncError {
    fn from(value: std::io::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
