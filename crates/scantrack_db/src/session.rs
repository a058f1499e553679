//! Session reconciliation operations.

use crate::error::{DbError, Result};
use crate::types::*;
use crate::DashboardDb;
use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, info, warn};

impl DashboardDb {
    /// Find a session by (study, canonical session name), creating it when
    /// `create` is set.
    ///
    /// Reconciliation rules, applied in one transaction:
    /// - The site is resolved from the parsed identifier against the
    ///   study's registered sites; no match fails closed with
    ///   [`DbError::InvalidSite`].
    /// - More than one row for the supposedly-unique key is a hard
    ///   [`DbError::Ambiguous`] error.
    /// - An externally observed `date` that disagrees with the stored one
    ///   overwrites it; the external source wins.
    /// - A non-empty `checklist_comment` that differs from the stored one
    ///   overwrites it; the file-of-record is authoritative for this field.
    ///   Sign-off state set elsewhere is never touched here.
    ///
    /// Returns `Ok(None)` when the session is absent and `create` is false.
    pub async fn get_or_create_session(
        &self,
        study: &Study,
        session_name: &str,
        date: Option<NaiveDate>,
        create: bool,
        checklist_comment: Option<&str>,
    ) -> Result<Option<SessionRecord>> {
        let ident = scantrack_ids::parse(session_name)?;
        let name = ident.subject_id();
        let repeat = ident.repeat_number().unwrap_or(1);

        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(SESSION_COLUMNS_WHERE_STUDY_AND_NAME)
            .bind(study.id)
            .bind(&name)
            .fetch_all(&mut *tx)
            .await?;

        let session_id = match rows.len() {
            1 => {
                debug!(session = %name, "Found session");
                let id: i64 = rows[0].get("id");
                let stored_date: Option<NaiveDate> = rows[0].get("date");
                if let Some(new_date) = date {
                    if stored_date != Some(new_date) {
                        debug!(session = %name, date = %new_date, "Updating session date");
                        sqlx::query("UPDATE sessions SET date = ?, updated_at = ? WHERE id = ?")
                            .bind(new_date)
                            .bind(Self::now_millis())
                            .bind(id)
                            .execute(&mut *tx)
                            .await?;
                    }
                }

                // A higher repeat number means a repeat visit was observed;
                // the count never goes down.
                let stored_repeats: i64 = rows[0].get("repeat_count");
                if repeat > stored_repeats {
                    debug!(session = %name, repeat, "Recording repeat visit");
                    sqlx::query(
                        "UPDATE sessions SET repeat_count = ?, is_repeated = 1, updated_at = ? WHERE id = ?",
                    )
                    .bind(repeat)
                    .bind(Self::now_millis())
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                }
                id
            }
            0 => {
                if !create {
                    tx.rollback().await?;
                    return Ok(None);
                }

                let site = self
                    .resolve_site(study, ident.site())
                    .await?
                    .ok_or_else(|| {
                        warn!(session = %name, site = ident.site(), "Invalid site for study");
                        DbError::InvalidSite(format!(
                            "Site '{}' in session '{}' not registered for study '{}'",
                            ident.site(),
                            name,
                            study.nickname
                        ))
                    })?;

                info!(session = %name, "Creating session");
                let now = Self::now_millis();
                let result = sqlx::query(
                    r#"
                    INSERT INTO sessions
                        (study_id, site_id, name, date, is_phantom, is_repeated,
                         repeat_count, signed_off, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
                    "#,
                )
                .bind(study.id)
                .bind(site.id)
                .bind(&name)
                .bind(date)
                .bind(ident.is_phantom())
                .bind(repeat > 1)
                .bind(repeat)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                result.last_insert_rowid()
            }
            n => {
                tx.rollback().await?;
                return Err(DbError::ambiguous(format!(
                    "Session '{}' matched {} rows in study '{}'",
                    name, n, study.nickname
                )));
            }
        };

        // The checklist file is the source of truth for this one field.
        if let Some(comment) = checklist_comment {
            if !comment.is_empty() {
                let stored: Option<String> =
                    sqlx::query("SELECT cl_comment FROM sessions WHERE id = ?")
                        .bind(session_id)
                        .fetch_one(&mut *tx)
                        .await?
                        .get("cl_comment");
                if stored.as_deref() != Some(comment) {
                    debug!(session = %name, "Updating checklist comment");
                    sqlx::query("UPDATE sessions SET cl_comment = ?, updated_at = ? WHERE id = ?")
                        .bind(comment)
                        .bind(Self::now_millis())
                        .bind(session_id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;

        let session = self.get_session_by_id(session_id).await?;
        Ok(Some(session))
    }

    /// Fetch a session row by primary key.
    pub async fn get_session_by_id(&self, id: i64) -> Result<SessionRecord> {
        let row = sqlx::query(
            "SELECT id, study_id, site_id, name, date, is_phantom, is_repeated, repeat_count, \
             signed_off, reviewer, cl_comment FROM sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row_to_session(&row)),
            None => Err(DbError::not_found(format!("Session id {id}"))),
        }
    }

    /// Sign off QC for a session. Never downgrades: an already signed-off
    /// session keeps its original reviewer.
    pub async fn sign_off(&self, session: &SessionRecord, user: &str) -> Result<()> {
        if session.signed_off {
            debug!(session = %session.name, "Already signed off, leaving reviewer untouched");
            return Ok(());
        }

        sqlx::query(
            "UPDATE sessions SET signed_off = 1, reviewer = ?, updated_at = ? WHERE id = ? AND signed_off = 0",
        )
        .bind(user)
        .bind(Self::now_millis())
        .bind(session.id)
        .execute(&self.pool)
        .await?;

        info!(session = %session.name, reviewer = user, "Session signed off");
        Ok(())
    }

    /// Checklist view of a study: every non-phantom session name mapped to
    /// its reviewer (empty string when registered but not yet reviewed).
    pub async fn checklist_entries(&self, study: &Study) -> Result<HashMap<String, String>> {
        let rows = sqlx::query(
            "SELECT name, signed_off, reviewer FROM sessions \
             WHERE study_id = ? AND is_phantom = 0 ORDER BY name",
        )
        .bind(study.id)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = HashMap::new();
        for row in rows {
            let name: String = row.get("name");
            let signed_off: bool = row.get("signed_off");
            let reviewer: Option<String> = row.get("reviewer");
            let comment = if signed_off {
                reviewer.unwrap_or_default()
            } else {
                String::new()
            };
            entries.insert(name, comment);
        }

        Ok(entries)
    }

    /// Attach a REDCap record to a session.
    pub async fn add_redcap_record(
        &self,
        session: &SessionRecord,
        record: &RedcapRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_redcap
                (session_id, record_id, project, url, instrument, date,
                 comment, event_id, version, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.id)
        .bind(&record.record_id)
        .bind(&record.project)
        .bind(&record.url)
        .bind(&record.instrument)
        .bind(record.date)
        .bind(&record.comment)
        .bind(record.event_id)
        .bind(&record.version)
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await?;

        debug!(session = %session.name, record = %record.record_id, "REDCap record attached");
        Ok(())
    }

    async fn resolve_site(&self, study: &Study, site_name: &str) -> Result<Option<Site>> {
        let sites = self.study_sites(study).await?;
        Ok(sites.into_iter().find(|s| s.name == site_name))
    }
}

const SESSION_COLUMNS_WHERE_STUDY_AND_NAME: &str =
    "SELECT id, study_id, site_id, name, date, is_phantom, is_repeated, repeat_count, \
     signed_off, reviewer, cl_comment FROM sessions WHERE study_id = ? AND name = ?";

pub(crate) fn row_to_session(row: &SqliteRow) -> SessionRecord {
    SessionRecord {
        id: row.get("id"),
        study_id: row.get("study_id"),
        site_id: row.get("site_id"),
        name: row.get("name"),
        date: row.get("date"),
        is_phantom: row.get("is_phantom"),
        is_repeated: row.get("is_repeated"),
        repeat_count: row.get("repeat_count"),
        signed_off: row.get("signed_off"),
        reviewer: row.get("reviewer"),
        cl_comment: row.get("cl_comment"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn seeded_db(tmp: &TempDir) -> (DashboardDb, Study) {
        let db = DashboardDb::open(tmp.path().join("test.db")).await.unwrap();
        let study = db.add_study("STU01").await.unwrap();
        db.add_site(&study, "SITE").await.unwrap();
        (db, study)
    }

    #[tokio::test]
    async fn test_create_session() {
        let tmp = TempDir::new().unwrap();
        let (db, study) = seeded_db(&tmp).await;

        let session = db
            .get_or_create_session(&study, "STU01SITE0001_01", None, true, None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(session.name, "STU01SITE0001_01");
        assert!(!session.is_phantom);
        assert!(!session.signed_off);
    }

    #[tokio::test]
    async fn test_absent_session_without_create() {
        let tmp = TempDir::new().unwrap();
        let (db, study) = seeded_db(&tmp).await;

        let session = db
            .get_or_create_session(&study, "STU01SITE0001_01", None, false, None)
            .await
            .unwrap();
        assert!(session.is_none());
    }

    #[tokio::test]
    async fn test_invalid_site_fails_closed() {
        let tmp = TempDir::new().unwrap();
        let (db, study) = seeded_db(&tmp).await;

        let err = db
            .get_or_create_session(&study, "STU01_MRC_0001_01", None, true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidSite(_)));
    }

    #[tokio::test]
    async fn test_external_date_wins() {
        let tmp = TempDir::new().unwrap();
        let (db, study) = seeded_db(&tmp).await;

        let original = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let observed = NaiveDate::from_ymd_opt(2024, 2, 2).unwrap();

        db.get_or_create_session(&study, "STU01SITE0001_01", Some(original), true, None)
            .await
            .unwrap();
        let session = db
            .get_or_create_session(&study, "STU01SITE0001_01", Some(observed), false, None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(session.date, Some(observed));
    }

    #[tokio::test]
    async fn test_repeat_visits_tracked() {
        let tmp = TempDir::new().unwrap();
        let (db, study) = seeded_db(&tmp).await;

        let session = db
            .get_or_create_session(&study, "STU01SITE0001_01", None, true, None)
            .await
            .unwrap()
            .unwrap();
        assert!(!session.is_repeated);
        assert_eq!(session.repeat_count, 1);

        // A second visit shares the session row and raises the count.
        let session = db
            .get_or_create_session(&study, "STU01SITE0001_01_02", None, false, None)
            .await
            .unwrap()
            .unwrap();
        assert!(session.is_repeated);
        assert_eq!(session.repeat_count, 2);

        // Re-observing the first visit never lowers it.
        let session = db
            .get_or_create_session(&study, "STU01SITE0001_01_01", None, false, None)
            .await
            .unwrap()
            .unwrap();
        assert!(session.is_repeated);
        assert_eq!(session.repeat_count, 2);
    }

    #[tokio::test]
    async fn test_ambiguous_session_is_hard_error() {
        let tmp = TempDir::new().unwrap();
        let (db, study) = seeded_db(&tmp).await;

        // Simulate another writer having inserted a duplicate row.
        for _ in 0..2 {
            sqlx::query(
                "INSERT INTO sessions (study_id, site_id, name, is_phantom, is_repeated, \
                 repeat_count, signed_off, created_at, updated_at) \
                 VALUES (?, 1, 'STU01SITE0001_01', 0, 0, 1, 0, 0, 0)",
            )
            .bind(study.id)
            .execute(db.pool())
            .await
            .unwrap();
        }

        let err = db
            .get_or_create_session(&study, "STU01SITE0001_01", None, false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Ambiguous(_)));
    }

    #[tokio::test]
    async fn test_checklist_comment_synced_from_file() {
        let tmp = TempDir::new().unwrap();
        let (db, study) = seeded_db(&tmp).await;

        let session = db
            .get_or_create_session(
                &study,
                "STU01SITE0001_01",
                None,
                true,
                Some("reviewed by X"),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.cl_comment.as_deref(), Some("reviewed by X"));

        // An empty file comment never erases the stored one.
        let session = db
            .get_or_create_session(&study, "STU01SITE0001_01", None, false, Some(""))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.cl_comment.as_deref(), Some("reviewed by X"));
    }

    #[tokio::test]
    async fn test_sign_off_never_downgrades() {
        let tmp = TempDir::new().unwrap();
        let (db, study) = seeded_db(&tmp).await;

        let session = db
            .get_or_create_session(&study, "STU01SITE0001_01", None, true, None)
            .await
            .unwrap()
            .unwrap();

        db.sign_off(&session, "alice").await.unwrap();
        let session = db.get_session_by_id(session.id).await.unwrap();
        db.sign_off(&session, "bob").await.unwrap();

        let session = db.get_session_by_id(session.id).await.unwrap();
        assert_eq!(session.reviewer.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_checklist_entries_skip_phantoms() {
        let tmp = TempDir::new().unwrap();
        let (db, study) = seeded_db(&tmp).await;

        db.get_or_create_session(&study, "STU01SITE0001_01", None, true, None)
            .await
            .unwrap();
        db.get_or_create_session(&study, "STU01SITEPHA0001", None, true, None)
            .await
            .unwrap();

        let entries = db.checklist_entries(&study).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.get("STU01SITE0001_01"), Some(&String::new()));
    }
}
