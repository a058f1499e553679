//! Database schema creation for all dashboard tables.
//!
//! All CREATE TABLE statements live here - single source of truth.
//!
//! Note: sessions intentionally carry no UNIQUE(study_id, name) constraint.
//! The dashboard is shared with other writers and duplicate rows have been
//! observed in the wild; lookups treat a multi-row match as a hard error
//! instead of assuming the constraint holds.

use crate::error::Result;
use crate::DashboardDb;
use tracing::info;

impl DashboardDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        // Enable WAL mode for better concurrent access
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(&self.pool)
            .await?;

        self.create_study_tables().await?;
        self.create_session_tables().await?;
        self.create_scan_tables().await?;

        info!("Dashboard schema verified");
        Ok(())
    }

    /// Studies, sites and scan types.
    async fn create_study_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS studies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                nickname TEXT NOT NULL UNIQUE
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS sites (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                study_id INTEGER NOT NULL REFERENCES studies(id),
                name TEXT NOT NULL,
                UNIQUE(study_id, name)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS scantypes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                is_linked INTEGER NOT NULL DEFAULT 0
            )"#,
        )
        .execute(&self.pool)
        .await?;

        // Which scan types are valid for which study
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS study_scantypes (
                study_id INTEGER NOT NULL REFERENCES studies(id),
                scantype_id INTEGER NOT NULL REFERENCES scantypes(id),
                PRIMARY KEY (study_id, scantype_id)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Sessions and their REDCap records.
    async fn create_session_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                study_id INTEGER NOT NULL REFERENCES studies(id),
                site_id INTEGER NOT NULL REFERENCES sites(id),
                name TEXT NOT NULL,
                date TEXT,
                is_phantom INTEGER NOT NULL DEFAULT 0,
                is_repeated INTEGER NOT NULL DEFAULT 0,
                repeat_count INTEGER NOT NULL DEFAULT 1,
                signed_off INTEGER NOT NULL DEFAULT 0,
                reviewer TEXT,
                cl_comment TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_study_name ON sessions(study_id, name)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS session_redcap (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL REFERENCES sessions(id),
                record_id TEXT NOT NULL,
                project TEXT NOT NULL,
                url TEXT NOT NULL,
                instrument TEXT NOT NULL,
                date TEXT,
                comment TEXT,
                event_id INTEGER,
                version TEXT,
                created_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Scans and the session-scan link table.
    async fn create_scan_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS scans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                series_number TEXT NOT NULL,
                scantype_id INTEGER NOT NULL REFERENCES scantypes(id),
                description TEXT NOT NULL DEFAULT '',
                repeat_number INTEGER,
                bl_comment TEXT,
                bl_user TEXT,
                created_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_scans_name ON scans(name)")
            .execute(&self.pool)
            .await?;

        // Many-to-many link. A scan entered by reconciliation is always a
        // primary link; non-primary links come from the separate linking
        // process.
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS session_scans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL REFERENCES sessions(id),
                scan_id INTEGER NOT NULL REFERENCES scans(id),
                is_primary INTEGER NOT NULL DEFAULT 1,
                scan_name TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
