//! Error types for AtlasRS
//!
//! Provides a unified error type for all record store operations.

use thiserror::Error;

use crate::record::RecordId;

/// Result type alias using AtlasError
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Unified error type for AtlasRS operations
#[derive(Debug, Error)]
pub enum AtlasError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Transaction Errors
    // -------------------------------------------------------------------------
    /// The engine detected a conflicting concurrent write. The caller must
    /// retry the whole logical operation in a fresh unit of work.
    #[error("write conflict")]
    WriteConflict,

    #[error("no active unit of work")]
    NoUnitOfWork,

    // -------------------------------------------------------------------------
    // Record Errors
    // -------------------------------------------------------------------------
    #[error("record {0} not found")]
    RecordNotFound(RecordId),

    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    #[error("bad value: {0}")]
    BadValue(String),

    #[error("log record id {id} is not greater than the highest assigned id {highest}")]
    OutOfOrderLogId { id: RecordId, highest: RecordId },

    #[error("capped deletion callback failed: {0}")]
    Callback(String),

    // -------------------------------------------------------------------------
    // Cursor Errors
    // -------------------------------------------------------------------------
    #[error("cursor position {0} was removed from a capped collection")]
    CappedPositionLost(RecordId),

    #[error("cursor used with a different snapshot without restore()")]
    CursorNotRestored,

    // -------------------------------------------------------------------------
    // Table / Format Errors
    // -------------------------------------------------------------------------
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("unsupported record store format version {found} (supported {min}..={max})")]
    IncompatibleFormat { found: u32, min: u32, max: u32 },

    #[error("unable to parse table metadata: {0}")]
    MetadataParse(String),

    #[error("storage corruption: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AtlasError {
    /// Whether the caller should retry the whole logical operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AtlasError::WriteConflict)
    }

    /// Whether the error means the store must not be used (format checks at open).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AtlasError::IncompatibleFormat { .. } | AtlasError::MetadataParse(_)
        )
    }
}

impl From<bincode::Error> for AtlasError {
    fn from(e: bincode::Error) -> Self {
        AtlasError::Serialization(e.to_string())
    }
}
