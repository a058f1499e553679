//! Dashboard database layer for Scantrack.
//!
//! This crate is the single interface to the relational dashboard store.
//! It upserts sessions and scans observed on disk, mirrors QC checklist
//! and blacklist annotations, and never assumes it is the only writer.
//!
//! # Usage
//!
//! ```rust,ignore
//! use scantrack_db::{DashboardDb, Result};
//!
//! let db = DashboardDb::open("~/.scantrack/dashboard.sqlite3").await?;
//! let study = db.get_study("STUDY01").await?;
//! let session = db
//!     .get_or_create_session(&study, "STU01SITE0001_01", None, true, None)
//!     .await?;
//! ```

mod error;
mod schema;
mod types;

// Method implementations organized by domain
mod scan;
mod session;
mod study;

pub use error::{DbError, Result};
pub use types::*;

use chrono::NaiveDate;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::info;

/// The dashboard database handle.
///
/// All dashboard reads and writes go through this type.
#[derive(Clone)]
pub struct DashboardDb {
    pool: SqlitePool,
}

impl DashboardDb {
    /// Open or create a database at the given path.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;

        info!(path = %path.display(), "Dashboard database opened");

        Ok(db)
    }

    /// Open an existing database (fails if not exists).
    pub async fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(DbError::not_found(format!(
                "Dashboard database not found: {}",
                path.display()
            )));
        }

        let url = format!("sqlite:{}?mode=rw", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        Ok(Self { pool })
    }

    /// Get the underlying connection pool (escape hatch for complex queries).
    ///
    /// Prefer using the typed methods instead.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection.
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Current time as milliseconds since Unix epoch.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Parse a session date in the `YYYY-MM-DD` form used by external sources.
pub fn parse_session_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| DbError::InvalidDate(raw.to_string()))
}
