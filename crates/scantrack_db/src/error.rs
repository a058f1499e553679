//! Error types for the dashboard database layer.

use thiserror::Error;

/// Dashboard operation result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// Dashboard database errors.
///
/// "Not found", "ambiguous" and "invalid" are kept as separate variants so
/// callers can decide whether to skip a record or abort a batch.
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLx error (connection, query, etc.)
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed subject or scan identifier
    #[error("Invalid identifier: {0}")]
    Id(#[from] scantrack_ids::ParseError),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A lookup by supposedly-unique keys matched more than one row
    #[error("Ambiguous match: {0}")]
    Ambiguous(String),

    /// Session site not registered for the study
    #[error("Invalid site: {0}")]
    InvalidSite(String),

    /// Scan type not registered for the study
    #[error("Invalid scantype: {0}")]
    InvalidScanType(String),

    /// Session date not in YYYY-MM-DD form
    #[error("Invalid date: {0}")]
    InvalidDate(String),

    /// Constraint violation (unique, foreign key, etc.)
    #[error("Constraint violation: {0}")]
    Constraint(String),
}

impl DbError {
    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an ambiguous match error.
    pub fn ambiguous(msg: impl Into<String>) -> Self {
        Self::Ambiguous(msg.into())
    }
}
