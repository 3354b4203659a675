use thiserror::Error;

/// Error taxonomy for the sync engine.
///
/// Propagation policy: `Network` is transient and retried by the scheduler
/// on the next debounce/connectivity edge; `Database` and `SyncState` are
/// surfaced to the caller of the facade; `Conflict` is best-effort
/// telemetry and never aborts a sync cycle; `ChangeProcessing` lets the
/// worker continue applying the remaining changes in a batch.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("network error (status={status:?}): {cause}")]
    Network {
        status: Option<u16>,
        cause: String,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("conflict on {entity_type}:{entity_id}")]
    Conflict {
        entity_id: String,
        entity_type: String,
    },

    #[error("initialization error: {0}")]
    Initialization(String),

    #[error("sync state error: {0}")]
    SyncState(String),

    #[error("failed to apply {} changes", failed_changes.len())]
    ChangeProcessing { failed_changes: Vec<i64> },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("the db executor thread is gone")]
    ExecutorGone,
}

impl SyncError {
    pub fn network(cause: impl Into<String>) -> Self {
        SyncError::Network { status: None, cause: cause.into() }
    }

    pub fn network_status(status: u16, cause: impl Into<String>) -> Self {
        SyncError::Network { status: Some(status), cause: cause.into() }
    }

    /// True for errors the scheduler should treat as transient and retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network { .. })
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
