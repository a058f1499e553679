//! Dashboard-backed metadata store.
//!
//! Delegates to the relational store in `scantrack_db`. The checklist maps
//! onto session sign-off state (the "comment" of a signed-off session is
//! its reviewer), the blacklist onto per-scan blacklist comments.

use super::{MetadataError, Result};
use scantrack_db::{DashboardDb, Study};
use std::collections::HashMap;
use tracing::{error, info};

/// Dashboard-backed checklist/blacklist store for one study.
pub struct DashboardStore {
    db: DashboardDb,
    study: Study,
    user: String,
    dry_run: bool,
}

impl DashboardStore {
    pub fn new(db: DashboardDb, study: Study, user: String, dry_run: bool) -> Self {
        Self {
            db,
            study,
            user,
            dry_run,
        }
    }

    pub async fn read_checklist(&self) -> Result<HashMap<String, String>> {
        Ok(self.db.checklist_entries(&self.study).await?)
    }

    pub async fn checklist_comment(&self, subject: &str) -> Result<Option<String>> {
        let session = self
            .db
            .get_or_create_session(&self.study, subject, None, false, None)
            .await?;
        Ok(session.map(|s| s.checklist_comment()))
    }

    /// Register sessions and record sign-offs. An empty comment registers
    /// the session without signing it off; a non-empty one additionally
    /// signs the session off under the configured user.
    pub async fn update_checklist(&self, delta: &HashMap<String, String>) -> Result<()> {
        for (subject, comment) in delta {
            if self.dry_run {
                info!(session = %subject, "Dry run, not updating dashboard checklist");
                continue;
            }

            let session = self
                .db
                .get_or_create_session(
                    &self.study,
                    subject,
                    None,
                    true,
                    Some(comment.as_str()),
                )
                .await?
                .ok_or_else(|| {
                    MetadataError::InvalidEntry(format!("Session '{subject}' could not be registered"))
                })?;

            if !comment.is_empty() {
                self.db.sign_off(&session, &self.user).await?;
            }
        }
        Ok(())
    }

    pub async fn read_blacklist(&self) -> Result<HashMap<String, String>> {
        Ok(self
            .db
            .blacklisted_scans(&self.study)
            .await?
            .into_iter()
            .collect())
    }

    pub async fn blacklist_reason(&self, scan: &str) -> Result<Option<String>> {
        let record = self
            .db
            .get_or_create_scan(&self.study, scan, false, None)
            .await?;
        Ok(record.and_then(|r| r.bl_comment))
    }

    /// Record blacklist entries. The scan must already exist in the
    /// dashboard; entries with an empty reason are skipped.
    pub async fn update_blacklist(&self, delta: &HashMap<String, String>) -> Result<()> {
        for (scan_name, reason) in delta {
            if reason.trim().is_empty() {
                error!(scan = %scan_name, "Ignoring blacklist entry with empty reason");
                continue;
            }
            if self.dry_run {
                info!(scan = %scan_name, "Dry run, not updating dashboard blacklist");
                continue;
            }

            let scan = self
                .db
                .get_or_create_scan(&self.study, scan_name, false, None)
                .await?
                .ok_or_else(|| {
                    MetadataError::InvalidEntry(format!(
                        "Scan '{scan_name}' is not registered in the dashboard"
                    ))
                })?;

            self.db
                .add_blacklist_comment(&scan, &self.user, reason)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn seeded_store(tmp: &TempDir) -> DashboardStore {
        let db = DashboardDb::open(tmp.path().join("test.db")).await.unwrap();
        let study = db.add_study("STU01").await.unwrap();
        db.add_site(&study, "SITE").await.unwrap();
        db.add_scantype(&study, "T1", false).await.unwrap();
        DashboardStore::new(db, study, "tester".to_string(), false)
    }

    #[tokio::test]
    async fn test_checklist_register_then_sign_off() {
        let tmp = TempDir::new().unwrap();
        let store = seeded_store(&tmp).await;

        let mut delta = HashMap::new();
        delta.insert("STU01SITE0001_01".to_string(), String::new());
        store.update_checklist(&delta).await.unwrap();

        let entries = store.read_checklist().await.unwrap();
        assert_eq!(entries.get("STU01SITE0001_01"), Some(&String::new()));

        delta.insert("STU01SITE0001_01".to_string(), "reviewed".to_string());
        store.update_checklist(&delta).await.unwrap();

        let entries = store.read_checklist().await.unwrap();
        assert_eq!(entries.get("STU01SITE0001_01"), Some(&"tester".to_string()));
    }

    #[tokio::test]
    async fn test_blacklist_requires_existing_scan() {
        let tmp = TempDir::new().unwrap();
        let store = seeded_store(&tmp).await;

        let mut delta = HashMap::new();
        delta.insert(
            "STU01SITE0001_01_T1_01_SagT1".to_string(),
            "ghosting".to_string(),
        );
        let err = store.update_blacklist(&delta).await.unwrap_err();
        assert!(matches!(err, MetadataError::InvalidEntry(_)));
    }

    #[tokio::test]
    async fn test_blacklist_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = seeded_store(&tmp).await;

        store
            .db
            .get_or_create_scan(&store.study, "STU01SITE0001_01_T1_01_SagT1", true, None)
            .await
            .unwrap();

        let mut delta = HashMap::new();
        delta.insert(
            "STU01SITE0001_01_T1_01_SagT1".to_string(),
            "ghosting".to_string(),
        );
        store.update_blacklist(&delta).await.unwrap();

        let entries = store.read_blacklist().await.unwrap();
        assert_eq!(entries["STU01SITE0001_01_T1_01_SagT1"], "ghosting");
        assert_eq!(
            store
                .blacklist_reason("STU01SITE0001_01_T1_01_SagT1")
                .await
                .unwrap()
                .as_deref(),
            Some("ghosting")
        );
    }

    #[tokio::test]
    async fn test_dry_run_skips_mutations() {
        let tmp = TempDir::new().unwrap();
        let db = DashboardDb::open(tmp.path().join("test.db")).await.unwrap();
        let study = db.add_study("STU01").await.unwrap();
        db.add_site(&study, "SITE").await.unwrap();
        let store = DashboardStore::new(db, study, "tester".to_string(), true);

        let mut delta = HashMap::new();
        delta.insert("STU01SITE0001_01".to_string(), "reviewed".to_string());
        store.update_checklist(&delta).await.unwrap();

        assert!(store.read_checklist().await.unwrap().is_empty());
    }
}
