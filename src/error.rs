//! Error types for the deal store.

use thiserror::Error;

use crate::dedup::DuplicateMatch;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to open shard for period '{period}': {reason}")]
    Connection { period: String, reason: String },

    #[error("deal not found: {0}")]
    DealNotFound(String),

    #[error("deal not found or already deleted: {0}")]
    DealNotFoundOrDeleted(String),

    #[error("partner not found: {0}")]
    PartnerNotFound(String),

    #[error("period not found: {0}")]
    PeriodNotFound(String),

    #[error("deal number already exists: {0}")]
    NumberExists(String),

    #[error("deal {0} has already been superseded")]
    AlreadySuperseded(String),

    #[error("partner already exists: {0}")]
    PartnerExists(String),

    #[error("period already exists: {0}")]
    PeriodExists(String),

    #[error("period '{0}' still holds deal records")]
    PeriodNotEmpty(String),

    #[error("partner '{name}' is referenced by {count} deal(s) in period '{period}'")]
    PartnerInUse {
        name: String,
        count: u64,
        period: String,
    },

    #[error("file content already registered ({} existing deal(s))", matches.len())]
    DuplicateFile { matches: Vec<DuplicateMatch> },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Get error code for the wire protocol.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Connection { .. } => "connection_error",
            StoreError::DealNotFound(_)
            | StoreError::DealNotFoundOrDeleted(_)
            | StoreError::PartnerNotFound(_)
            | StoreError::PeriodNotFound(_) => "not_found",
            StoreError::NumberExists(_)
            | StoreError::AlreadySuperseded(_)
            | StoreError::PartnerExists(_)
            | StoreError::PeriodExists(_)
            | StoreError::PeriodNotEmpty(_)
            | StoreError::PartnerInUse { .. } => "resource_conflict",
            StoreError::DuplicateFile { .. } => "duplicate_file",
            StoreError::Validation(_) => "validation_error",
            StoreError::Database(_) | StoreError::Io(_) => "database_error",
        }
    }
}
