use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum SysgateError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Elevation required: {0}")]
    ElevationRequired(String),

    /// Two mutations entered the critical section for the same key. The per-key
    /// lock makes this unreachable unless locking itself is broken.
    #[error("Concurrent mutation conflict on {0}")]
    ConcurrentMutationConflict(String),

    #[error("Rollback of journal entry {entry_id} failed: {reason}")]
    RollbackFailed { entry_id: u64, reason: String },

    #[error("Journal entry {0} was already rolled back")]
    AlreadyRolledBack(u64),

    #[error("Journal entry not found: {0}")]
    JournalEntryNotFound(u64),

    #[error("Operation timed out: {0}")]
    OperationTimeout(String),

    /// Part of a compound operation succeeded before a later step failed.
    /// `entry_id` is the journal entry describing the state actually left behind.
    #[error("Partially completed {operation} on {resource}: {reason} (journal entry {entry_id})")]
    PartialCompletion {
        operation: String,
        resource: String,
        entry_id: u64,
        reason: String,
    },

    #[error("Process not found: {0}")]
    ProcessNotFound(u32),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] crate::runtime::RuntimeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Audit store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

impl SysgateError {
    /// Stable machine-readable code, used by the CLI's JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            SysgateError::PermissionDenied(_) => "permission_denied",
            SysgateError::ResourceNotFound(_) => "resource_not_found",
            SysgateError::ElevationRequired(_) => "elevation_required",
            SysgateError::ConcurrentMutationConflict(_) => "concurrent_mutation_conflict",
            SysgateError::RollbackFailed { .. } => "rollback_failed",
            SysgateError::AlreadyRolledBack(_) => "already_rolled_back",
            SysgateError::JournalEntryNotFound(_) => "journal_entry_not_found",
            SysgateError::OperationTimeout(_) => "operation_timeout",
            SysgateError::PartialCompletion { .. } => "partial_completion",
            SysgateError::ProcessNotFound(_) => "process_not_found",
            SysgateError::InvalidRequest(_) => "invalid_request",
            SysgateError::Runtime(_) => "runtime",
            SysgateError::Io(_) => "io",
            SysgateError::Json(_) => "json",
            SysgateError::Sqlite(_) => "audit_store",
            SysgateError::Other(_) => "other",
        }
    }
}

impl Serialize for SysgateError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type SysgateResult<T> = Result<T, SysgateError>;
