//! Row types for the dashboard database.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A study registered in the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Study {
    pub id: i64,
    /// Short study nickname, e.g. "STUDY01". Unique.
    pub nickname: String,
}

/// A scanning site registered for a study.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub study_id: i64,
    /// Site code as it appears in subject identifiers.
    pub name: String,
}

/// A scan type (series tag) the dashboard knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanType {
    pub id: i64,
    pub name: String,
    /// Linked scan types represent derived/alias series. They are never
    /// deleted by reconciliation.
    pub is_linked: bool,
}

/// One imaging visit for one subject within one study.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub study_id: i64,
    pub site_id: i64,
    /// Canonical session name: the subject id without the repeat number.
    pub name: String,
    pub date: Option<NaiveDate>,
    pub is_phantom: bool,
    pub is_repeated: bool,
    pub repeat_count: i64,
    pub signed_off: bool,
    /// Who signed off on QC, when signed_off is set.
    pub reviewer: Option<String>,
    /// QC checklist comment mirrored from the file-of-record.
    pub cl_comment: Option<String>,
}

impl SessionRecord {
    /// The checklist comment for this session: reviewer name when signed
    /// off, empty string for a registered-but-unreviewed session.
    pub fn checklist_comment(&self) -> String {
        if self.signed_off {
            self.reviewer.clone().unwrap_or_default()
        } else {
            String::new()
        }
    }
}

/// One acquired series within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: i64,
    /// Scan id: identifier + tag + series, without the description.
    pub name: String,
    pub series_number: String,
    pub scantype_id: i64,
    pub description: String,
    pub repeat_number: Option<i64>,
    /// Blacklist reason, when the scan has been excluded from analysis.
    pub bl_comment: Option<String>,
    /// Who blacklisted the scan.
    pub bl_user: Option<String>,
}

impl ScanRecord {
    /// The full scan name including the description, as it appears in
    /// blacklist files.
    pub fn full_name(&self) -> String {
        format!("{}_{}", self.name, self.description)
    }

    pub fn blacklisted(&self) -> bool {
        self.bl_comment.as_deref().is_some_and(|c| !c.is_empty())
    }
}

/// A REDCap record attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedcapRecord {
    pub record_id: String,
    pub project: String,
    pub url: String,
    pub instrument: String,
    pub date: Option<NaiveDate>,
    pub comment: Option<String>,
    pub event_id: Option<i64>,
    pub version: Option<String>,
}
