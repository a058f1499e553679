//! Scan upsert, blacklist reconciliation and extra-scan deletion.

use crate::error::{DbError, Result};
use crate::types::*;
use crate::DashboardDb;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashSet;
use tracing::{debug, info, warn};

const SCAN_COLUMNS: &str = "s.id, s.name, s.series_number, s.scantype_id, s.description, \
                            s.repeat_number, s.bl_comment, s.bl_user";

impl DashboardDb {
    /// Find a scan by (study, session name, scan id, repeat number),
    /// creating it when `create` is set.
    ///
    /// More than one match is a hard [`DbError::Ambiguous`] error. On
    /// create, the scan's type must be registered as valid for the study
    /// (fails closed), the session is created if absent, and the
    /// session-scan link is established as primary. Non-primary/linked
    /// scans are the exclusive responsibility of the separate linking
    /// process.
    ///
    /// Blacklist comment reconciliation: a non-empty `blacklist_comment`
    /// that differs from the stored one overwrites it; a stored comment
    /// with no file counterpart is logged as a data-integrity divergence
    /// and kept.
    pub async fn get_or_create_scan(
        &self,
        study: &Study,
        scan_name: &str,
        create: bool,
        blacklist_comment: Option<&str>,
    ) -> Result<Option<ScanRecord>> {
        let parsed = scantrack_ids::parse_filename(scan_name)?;
        let scan_id = parsed.scan_id();
        let session_name = parsed.ident.subject_id();
        let repeat = parsed.ident.repeat_number();

        let rows = self
            .find_scan_rows(study, &session_name, &scan_id, repeat)
            .await?;

        let scan = match rows.len() {
            1 => {
                debug!(scan = %scan_id, "Found scan");
                row_to_scan(&rows[0])
            }
            0 => {
                if !create {
                    debug!(scan = %scan_id, "Scan not found and create is false, skipping");
                    return Ok(None);
                }

                let session = self
                    .get_or_create_session(study, &session_name, None, true, None)
                    .await?
                    .ok_or_else(|| {
                        DbError::not_found(format!("Session '{session_name}' after create"))
                    })?;

                let scantype = self.get_study_scantype(study, &parsed.tag).await?;

                info!(scan = %scan_id, "Creating scan");
                let mut tx = self.pool.begin().await?;

                let result = sqlx::query(
                    r#"
                    INSERT INTO scans
                        (name, series_number, scantype_id, description, repeat_number, created_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&scan_id)
                .bind(&parsed.series)
                .bind(scantype.id)
                .bind(&parsed.description)
                .bind(repeat)
                .bind(Self::now_millis())
                .execute(&mut *tx)
                .await?;
                let new_id = result.last_insert_rowid();

                // Anything entered this way is a primary scan; linked scans
                // come from the separate linking process.
                sqlx::query(
                    "INSERT INTO session_scans (session_id, scan_id, is_primary, scan_name) \
                     VALUES (?, ?, 1, ?)",
                )
                .bind(session.id)
                .bind(new_id)
                .bind(&scan_id)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;

                self.get_scan_by_id(new_id).await?
            }
            n => {
                return Err(DbError::ambiguous(format!(
                    "Scan '{}' matched {} rows in study '{}'",
                    scan_id, n, study.nickname
                )));
            }
        };

        let scan = self
            .reconcile_blacklist_comment(scan, blacklist_comment)
            .await?;

        Ok(Some(scan))
    }

    /// Fetch a scan row by primary key.
    pub async fn get_scan_by_id(&self, id: i64) -> Result<ScanRecord> {
        let row = sqlx::query(&format!("SELECT {SCAN_COLUMNS} FROM scans s WHERE s.id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row_to_scan(&row)),
            None => Err(DbError::not_found(format!("Scan id {id}"))),
        }
    }

    /// Record a blacklist entry for a scan. The scan must already exist.
    pub async fn add_blacklist_comment(
        &self,
        scan: &ScanRecord,
        user: &str,
        comment: &str,
    ) -> Result<()> {
        if comment.is_empty() {
            return Err(DbError::Constraint(format!(
                "Blacklist entry for '{}' requires a non-empty reason",
                scan.name
            )));
        }

        sqlx::query("UPDATE scans SET bl_comment = ?, bl_user = ? WHERE id = ?")
            .bind(comment)
            .bind(user)
            .bind(scan.id)
            .execute(&self.pool)
            .await?;

        info!(scan = %scan.name, user, "Scan blacklisted");
        Ok(())
    }

    /// All blacklisted scans of a study: full scan name (with description)
    /// mapped to the blacklist reason.
    pub async fn blacklisted_scans(&self, study: &Study) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SCAN_COLUMNS}
            FROM scans s
            JOIN session_scans link ON link.scan_id = s.id
            JOIN sessions sess ON sess.id = link.session_id
            WHERE sess.study_id = ? AND s.bl_comment IS NOT NULL AND s.bl_comment != ''
            ORDER BY s.name
            "#
        ))
        .bind(study.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(row_to_scan)
            .map(|scan| {
                let comment = scan.bl_comment.clone().unwrap_or_default();
                (scan.full_name(), comment)
            })
            .collect())
    }

    /// Remove from the store any primary, non-linked scan under the given
    /// session/repeat that is not present in the authoritative list.
    ///
    /// Linked scan types (derived/alias series) are always excluded from
    /// deletion. Deleting a scan removes both the scan row and its link
    /// row, and the whole set of deletions is one transaction.
    pub async fn delete_extra_scans(
        &self,
        study: &Study,
        session_label: &str,
        authoritative: &[String],
    ) -> Result<()> {
        let ident = scantrack_ids::parse(session_label)?;
        let repeat = if ident.is_phantom() {
            None
        } else {
            ident.repeat_number()
        };
        let session_name = ident.subject_id();

        let session = match self
            .get_or_create_session(study, &session_name, None, false, None)
            .await?
        {
            Some(session) => session,
            None => {
                return Err(DbError::not_found(format!(
                    "Session '{session_name}' in study '{}'",
                    study.nickname
                )))
            }
        };

        // Convert the authoritative full scan names to scan ids; names
        // that don't parse are skipped, consistent with upsert behavior.
        let keep: HashSet<String> = authoritative
            .iter()
            .filter_map(|name| match scantrack_ids::parse_filename(name) {
                Ok(parsed) => Some(parsed.scan_id()),
                Err(err) => {
                    warn!(scan = %name, %err, "Skipping unparseable authoritative scan name");
                    None
                }
            })
            .collect();

        let rows = sqlx::query(&format!(
            r#"
            SELECT {SCAN_COLUMNS}
            FROM scans s
            JOIN session_scans link ON link.scan_id = s.id
            JOIN scantypes st ON st.id = s.scantype_id
            WHERE link.session_id = ? AND link.is_primary = 1 AND st.is_linked = 0
            "#
        ))
        .bind(session.id)
        .fetch_all(&self.pool)
        .await?;

        let extra: Vec<ScanRecord> = rows
            .iter()
            .map(row_to_scan)
            .filter(|scan| scan.repeat_number == repeat && !keep.contains(&scan.name))
            .collect();

        if extra.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for scan in &extra {
            info!(scan = %scan.name, session = %session_name, "Deleting extra scan");
            sqlx::query("DELETE FROM session_scans WHERE scan_id = ? AND session_id = ?")
                .bind(scan.id)
                .bind(session.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM scans WHERE id = ?")
                .bind(scan.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn find_scan_rows(
        &self,
        study: &Study,
        session_name: &str,
        scan_id: &str,
        repeat: Option<i64>,
    ) -> Result<Vec<SqliteRow>> {
        let base = format!(
            r#"
            SELECT {SCAN_COLUMNS}
            FROM scans s
            JOIN session_scans link ON link.scan_id = s.id
            JOIN sessions sess ON sess.id = link.session_id
            WHERE sess.study_id = ? AND sess.name = ? AND s.name = ?
            "#
        );

        let rows = if let Some(repeat) = repeat {
            sqlx::query(&format!("{base} AND s.repeat_number = ?"))
                .bind(study.id)
                .bind(session_name)
                .bind(scan_id)
                .bind(repeat)
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query(&base)
                .bind(study.id)
                .bind(session_name)
                .bind(scan_id)
                .fetch_all(&self.pool)
                .await?
        };

        Ok(rows)
    }

    /// Apply the blacklist-comment reconciliation rules and return the
    /// refreshed record.
    async fn reconcile_blacklist_comment(
        &self,
        scan: ScanRecord,
        file_comment: Option<&str>,
    ) -> Result<ScanRecord> {
        let file_comment = file_comment.unwrap_or("");
        let stored = scan.bl_comment.as_deref().unwrap_or("");

        if file_comment.is_empty() {
            if !stored.is_empty() {
                // Divergence between the database and the file-of-record is
                // surfaced, never fixed automatically.
                warn!(
                    scan = %scan.name,
                    comment = stored,
                    "Scan has a blacklist comment in the dashboard that is absent from blacklist.csv"
                );
            }
            return Ok(scan);
        }

        if file_comment != stored {
            debug!(scan = %scan.name, "Updating blacklist comment from file");
            sqlx::query("UPDATE scans SET bl_comment = ? WHERE id = ?")
                .bind(file_comment)
                .bind(scan.id)
                .execute(&self.pool)
                .await?;
            return self.get_scan_by_id(scan.id).await;
        }

        Ok(scan)
    }
}

fn row_to_scan(row: &SqliteRow) -> ScanRecord {
    ScanRecord {
        id: row.get("id"),
        name: row.get("name"),
        series_number: row.get("series_number"),
        scantype_id: row.get("scantype_id"),
        description: row.get("description"),
        repeat_number: row.get("repeat_number"),
        bl_comment: row.get("bl_comment"),
        bl_user: row.get("bl_user"),
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
        db.add_scantype(&study, "T1", false).await.unwrap();
        db.add_scantype(&study, "DTI60", false).await.unwrap();
        db.add_scantype(&study, "SPRL", true).await.unwrap();
        (db, study)
    }

    #[tokio::test]
    async fn test_create_scan_cascades_session() {
        let tmp = TempDir::new().unwrap();
        let (db, study) = seeded_db(&tmp).await;

        let scan = db
            .get_or_create_scan(&study, "STU01SITE0001_01_T1_01_SagT1", true, None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(scan.name, "STU01SITE0001_01_T1_01");
        assert_eq!(scan.description, "SagT1");

        let session = db
            .get_or_create_session(&study, "STU01SITE0001_01", None, false, None)
            .await
            .unwrap();
        assert!(session.is_some());
    }

    #[tokio::test]
    async fn test_unregistered_scantype_fails_closed() {
        let tmp = TempDir::new().unwrap();
        let (db, study) = seeded_db(&tmp).await;

        let err = db
            .get_or_create_scan(&study, "STU01SITE0001_01_FLAIR_04_Flair", true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidScanType(_)));
    }

    #[tokio::test]
    async fn test_absent_scan_without_create() {
        let tmp = TempDir::new().unwrap();
        let (db, study) = seeded_db(&tmp).await;

        let scan = db
            .get_or_create_scan(&study, "STU01SITE0001_01_T1_01_SagT1", false, None)
            .await
            .unwrap();
        assert!(scan.is_none());
    }

    #[tokio::test]
    async fn test_blacklist_comment_from_file_wins() {
        let tmp = TempDir::new().unwrap();
        let (db, study) = seeded_db(&tmp).await;

        let scan = db
            .get_or_create_scan(
                &study,
                "STU01SITE0001_01_T1_01_SagT1",
                true,
                Some("motion artifact"),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scan.bl_comment.as_deref(), Some("motion artifact"));

        // An absent file comment never erases the stored one.
        let scan = db
            .get_or_create_scan(&study, "STU01SITE0001_01_T1_01_SagT1", false, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scan.bl_comment.as_deref(), Some("motion artifact"));
    }

    #[tokio::test]
    async fn test_delete_extra_scans_spares_linked_and_listed() {
        let tmp = TempDir::new().unwrap();
        let (db, study) = seeded_db(&tmp).await;

        db.get_or_create_scan(&study, "STU01SITE0001_01_T1_01_SagT1", true, None)
            .await
            .unwrap();
        db.get_or_create_scan(&study, "STU01SITE0001_01_DTI60_02_AxDTI", true, None)
            .await
            .unwrap();
        db.get_or_create_scan(&study, "STU01SITE0001_01_SPRL_03_Spiral", true, None)
            .await
            .unwrap();

        db.delete_extra_scans(
            &study,
            "STU01SITE0001_01",
            &["STU01SITE0001_01_T1_01_SagT1".to_string()],
        )
        .await
        .unwrap();

        // Listed scan survives
        assert!(db
            .get_or_create_scan(&study, "STU01SITE0001_01_T1_01_SagT1", false, None)
            .await
            .unwrap()
            .is_some());
        // Unlisted primary scan deleted
        assert!(db
            .get_or_create_scan(&study, "STU01SITE0001_01_DTI60_02_AxDTI", false, None)
            .await
            .unwrap()
            .is_none());
        // Linked scan type survives regardless of list membership
        assert!(db
            .get_or_create_scan(&study, "STU01SITE0001_01_SPRL_03_Spiral", false, None)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_blacklisted_scans_view() {
        let tmp = TempDir::new().unwrap();
        let (db, study) = seeded_db(&tmp).await;

        let scan = db
            .get_or_create_scan(&study, "STU01SITE0001_01_T1_01_SagT1", true, None)
            .await
            .unwrap()
            .unwrap();
        db.add_blacklist_comment(&scan, "alice", "ghosting").await.unwrap();

        let entries = db.blacklisted_scans(&study).await.unwrap();
        assert_eq!(
            entries,
            vec![("STU01SITE0001_01_T1_01_SagT1".to_string(), "ghosting".to_string())]
        );
    }

    #[tokio::test]
    async fn test_empty_blacklist_reason_rejected() {
        let tmp = TempDir::new().unwrap();
        let (db, study) = seeded_db(&tmp).await;

        let scan = db
            .get_or_create_scan(&study, "STU01SITE0001_01_T1_01_SagT1", true, None)
            .await
            .unwrap()
            .unwrap();

        let err = db.add_blacklist_comment(&scan, "alice", "").await.unwrap_err();
        assert!(matches!(err, DbError::Constraint(_)));
    }
}
