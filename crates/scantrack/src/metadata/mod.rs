//! Checklist and blacklist metadata store.
//!
//! Two symmetric sub-protocols - QC sign-off tracking (checklist) and scan
//! exclusion tracking (blacklist) - behind a single abstraction with two
//! backends. The backend is chosen once at startup from the study
//! configuration, never probed per call.

mod dashboard;
mod file;

pub use dashboard::DashboardStore;
pub use file::{FileStore, CHECKLIST_FILE, BLACKLIST_FILE};

use crate::config::{MetadataBackend, StudyConfig};
use scantrack_db::DashboardDb;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::error;

/// Metadata store result type.
pub type Result<T> = std::result::Result<T, MetadataError>;

/// Metadata store errors.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dashboard error: {0}")]
    Db(#[from] scantrack_db::DbError),

    #[error("Invalid identifier: {0}")]
    Id(#[from] scantrack_ids::ParseError),

    #[error("Invalid metadata entry: {0}")]
    InvalidEntry(String),

    #[error("Failed to write {path} after {attempts} attempts")]
    WriteFailed { path: PathBuf, attempts: u32 },

    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// The checklist/blacklist store, file- or dashboard-backed.
pub enum MetadataStore {
    File(FileStore),
    Dashboard(DashboardStore),
}

impl MetadataStore {
    /// Build the store selected by the study configuration.
    pub async fn from_config(config: &StudyConfig, dry_run: bool) -> Result<Self> {
        match config.metadata.backend {
            MetadataBackend::File => {
                let meta_dir = config.meta_path()?;
                Ok(Self::File(FileStore::new(meta_dir, dry_run)))
            }
            MetadataBackend::Dashboard => {
                let db_path = config
                    .metadata
                    .dashboard_db
                    .as_ref()
                    .ok_or_else(|| {
                        MetadataError::InvalidEntry(
                            "dashboard backend requires metadata.dashboard_db".to_string(),
                        )
                    })?;
                let db = DashboardDb::open(db_path).await?;
                let study = if dry_run {
                    db.get_study(&config.nickname).await?
                } else {
                    seed_study(&db, config).await?
                };
                Ok(Self::Dashboard(DashboardStore::new(
                    db,
                    study,
                    config.metadata.default_user.clone(),
                    dry_run,
                )))
            }
        }
    }

    /// Read the full checklist: subject id (without repeat number) mapped
    /// to the QC comment (empty string = registered, unreviewed).
    pub async fn read_checklist(&self) -> Result<HashMap<String, String>> {
        match self {
            Self::File(store) => store.read_checklist(),
            Self::Dashboard(store) => store.read_checklist().await,
        }
    }

    /// Read one subject's checklist comment, or None when absent.
    pub async fn checklist_comment(&self, subject: &str) -> Result<Option<String>> {
        match self {
            Self::File(store) => store.checklist_comment(subject),
            Self::Dashboard(store) => store.checklist_comment(subject).await,
        }
    }

    /// Merge a delta into the checklist (delta overwrites on collision).
    pub async fn update_checklist(&self, delta: &HashMap<String, String>) -> Result<()> {
        match self {
            Self::File(store) => store.update_checklist(delta),
            Self::Dashboard(store) => store.update_checklist(delta).await,
        }
    }

    /// Read the full blacklist: scan name mapped to the exclusion reason.
    pub async fn read_blacklist(&self) -> Result<HashMap<String, String>> {
        match self {
            Self::File(store) => store.read_blacklist(),
            Self::Dashboard(store) => store.read_blacklist().await,
        }
    }

    /// Read one scan's blacklist reason, or None when not blacklisted.
    pub async fn blacklist_reason(&self, scan: &str) -> Result<Option<String>> {
        match self {
            Self::File(store) => store.blacklist_reason(scan),
            Self::Dashboard(store) => store.blacklist_reason(scan).await,
        }
    }

    /// All blacklisted scans belonging to one subject.
    pub async fn subject_blacklist(&self, subject: &str) -> Result<Vec<String>> {
        let blacklist = self.read_blacklist().await?;
        let mut scans: Vec<String> = blacklist
            .into_keys()
            .filter(|scan| {
                scantrack_ids::parse_filename(scan)
                    .map(|p| p.ident.subject_id() == subject)
                    .unwrap_or(false)
            })
            .collect();
        scans.sort();
        Ok(scans)
    }

    /// Merge a delta into the blacklist. Entries with an empty reason are
    /// rejected per-entry (logged, rest continues).
    pub async fn update_blacklist(&self, delta: &HashMap<String, String>) -> Result<()> {
        match self {
            Self::File(store) => store.update_blacklist(delta),
            Self::Dashboard(store) => store.update_blacklist(delta).await,
        }
    }

    /// Aggregate QC view: every signed-off subject mapped to its
    /// blacklisted scan names.
    ///
    /// Blacklist entries whose subject does not appear in the checklist are
    /// reported as inconsistencies and excluded, never added implicitly.
    pub async fn get_subject_metadata(&self) -> Result<HashMap<String, Vec<String>>> {
        let checklist = self.read_checklist().await?;
        let blacklist = self.read_blacklist().await?;

        let mut all_qc: HashMap<String, Vec<String>> = checklist
            .iter()
            .filter(|(_, comment)| !comment.is_empty())
            .map(|(subject, _)| (subject.clone(), Vec::new()))
            .collect();

        let mut scans: Vec<&String> = blacklist.keys().collect();
        scans.sort();

        for scan_name in scans {
            let parsed = match scantrack_ids::parse_filename(scan_name) {
                Ok(parsed) => parsed,
                Err(err) => {
                    error!(scan = %scan_name, %err, "Malformed scan name in blacklist, ignoring");
                    continue;
                }
            };

            let subject = parsed.ident.subject_id();
            match all_qc.get_mut(&subject) {
                Some(entries) => entries.push(scan_name.clone()),
                None => {
                    error!(
                        subject = %subject,
                        scan = %scan_name,
                        "Blacklisted series for subject missing from QC checklist, ignoring entry"
                    );
                }
            }
        }

        Ok(all_qc)
    }
}

/// Register the study, its sites and its scan types from the config so a
/// fresh dashboard database can be stood up without a separate tool. All
/// registrations are idempotent upserts.
async fn seed_study(db: &DashboardDb, config: &StudyConfig) -> Result<scantrack_db::Study> {
    let study = db.add_study(&config.nickname).await?;
    if let Some(sites) = config.study_tags.get(&config.study_tag) {
        for site in sites {
            db.add_site(&study, site).await?;
        }
    }
    for scantype in &config.scantypes {
        db.add_scantype(&study, &scantype.name, scantype.linked)
            .await?;
    }
    Ok(study)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_subject_metadata_excludes_orphans() {
        let tmp = TempDir::new().unwrap();
        let store = MetadataStore::File(FileStore::new(tmp.path().to_path_buf(), false));

        let mut checklist = HashMap::new();
        checklist.insert("STU01SITE0001_01".to_string(), "reviewed".to_string());
        checklist.insert("STU01SITE0002_01".to_string(), String::new());
        store.update_checklist(&checklist).await.unwrap();

        let mut blacklist = HashMap::new();
        blacklist.insert(
            "STU01SITE0001_01_T1_01_SagT1".to_string(),
            "motion".to_string(),
        );
        // Subject 0003 is in no checklist: its entry is an orphan.
        blacklist.insert(
            "STU01SITE0003_01_T1_01_SagT1".to_string(),
            "ghosting".to_string(),
        );
        store.update_blacklist(&blacklist).await.unwrap();

        let qc = store.get_subject_metadata().await.unwrap();
        assert_eq!(qc.len(), 1);
        assert_eq!(
            qc["STU01SITE0001_01"],
            vec!["STU01SITE0001_01_T1_01_SagT1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_subject_blacklist_filters_by_subject() {
        let tmp = TempDir::new().unwrap();
        let store = MetadataStore::File(FileStore::new(tmp.path().to_path_buf(), false));

        let mut blacklist = HashMap::new();
        blacklist.insert(
            "STU01SITE0001_01_T1_01_SagT1".to_string(),
            "motion".to_string(),
        );
        blacklist.insert(
            "STU01SITE0001_01_DTI60_02_AxDTI".to_string(),
            "spiking".to_string(),
        );
        blacklist.insert(
            "STU01SITE0002_01_T1_01_SagT1".to_string(),
            "ghosting".to_string(),
        );
        store.update_blacklist(&blacklist).await.unwrap();

        let scans = store.subject_blacklist("STU01SITE0001_01").await.unwrap();
        assert_eq!(
            scans,
            vec![
                "STU01SITE0001_01_DTI60_02_AxDTI".to_string(),
                "STU01SITE0001_01_T1_01_SagT1".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_from_config_seeds_dashboard() {
        use crate::config::{
            MetadataBackend, MetadataConfig, QueueConfig, QueueKind, ScanTypeConfig, StudyConfig,
        };

        let tmp = TempDir::new().unwrap();
        let mut study_tags = HashMap::new();
        study_tags.insert("STU01".to_string(), vec!["SITE".to_string()]);
        let config = StudyConfig {
            nickname: "STUDY01".to_string(),
            study_tag: "STU01".to_string(),
            base_dir: tmp.path().to_path_buf(),
            paths: HashMap::new(),
            study_tags,
            scantypes: vec![ScanTypeConfig {
                name: "T1".to_string(),
                linked: false,
            }],
            metadata: MetadataConfig {
                backend: MetadataBackend::Dashboard,
                dashboard_db: Some(tmp.path().join("dashboard.db")),
                default_user: "tester".to_string(),
            },
            queue: QueueConfig {
                backend: QueueKind::Qbatch,
                cpu_cores: 1,
                partition: None,
                workdir: tmp.path().to_path_buf(),
            },
            redcap: None,
        };

        let store = MetadataStore::from_config(&config, false).await.unwrap();

        // Session creation needs the seeded study and site.
        let mut delta = HashMap::new();
        delta.insert("STU01SITE0001_01".to_string(), String::new());
        store.update_checklist(&delta).await.unwrap();

        let entries = store.read_checklist().await.unwrap();
        assert!(entries.contains_key("STU01SITE0001_01"));
    }

    #[tokio::test]
    async fn test_unreviewed_subjects_not_in_metadata() {
        let tmp = TempDir::new().unwrap();
        let store = MetadataStore::File(FileStore::new(tmp.path().to_path_buf(), false));

        let mut checklist = HashMap::new();
        checklist.insert("STU01SITE0002_01".to_string(), String::new());
        store.update_checklist(&checklist).await.unwrap();

        let qc = store.get_subject_metadata().await.unwrap();
        assert!(qc.is_empty());
    }
}
