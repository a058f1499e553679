//! REDCap scan-completed import.
//!
//! Fetches the records of the configured instrument and attaches one
//! dashboard REDCap row per completed scan session. Records are filtered
//! client side: only those with a non-empty scan date and a status value
//! marking the instrument complete are imported. Failures on individual
//! records are logged and skipped so one bad entry never blocks the rest.

use crate::config::{RedcapConfig, StudyConfig};
use scantrack_db::{DashboardDb, RedcapRecord};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

pub type Result<T> = std::result::Result<T, RedcapError>;

#[derive(Error, Debug)]
pub enum RedcapError {
    #[error("Failed to read token file {path}: {source}")]
    Token {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("REDCap request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Dashboard error: {0}")]
    Db(#[from] scantrack_db::DbError),

    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Import outcome, for reporting.
#[derive(Debug, Default)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

/// Read the API token from its file under the metadata directory.
pub fn read_token(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path).map_err(|source| RedcapError::Token {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(raw.trim().to_string())
}

/// Run the scan-completed import for one study.
pub async fn import_scan_completed(
    config: &StudyConfig,
    db: &DashboardDb,
    dry_run: bool,
) -> Result<ImportSummary> {
    let rc = config.redcap()?;
    let token = read_token(&config.meta_path()?.join(&rc.token_file))?;

    let client = reqwest::Client::new();
    let version = fetch_version(&client, rc, &token).await?;
    let records = fetch_records(&client, rc, &token).await?;
    info!(records = records.len(), "REDCap records fetched");

    let study = db.get_study(&config.nickname).await?;

    let mut summary = ImportSummary::default();
    for record in &records {
        let record_id = str_field(record, "record_id").unwrap_or_default();
        match import_record(config, rc, db, &study, record, &version, dry_run).await {
            Ok(true) => summary.imported += 1,
            Ok(false) => summary.skipped += 1,
            Err(err) => {
                warn!(record = %record_id, %err, "Skipping REDCap record");
                summary.skipped += 1;
            }
        }
    }

    info!(
        imported = summary.imported,
        skipped = summary.skipped,
        "REDCap import finished"
    );
    Ok(summary)
}

async fn import_record(
    config: &StudyConfig,
    rc: &RedcapConfig,
    db: &DashboardDb,
    study: &scantrack_db::Study,
    record: &Value,
    version: &str,
    dry_run: bool,
) -> Result<bool> {
    let date_raw = str_field(record, &rc.date_field).unwrap_or_default();
    let status = str_field(record, &rc.status_field).unwrap_or_default();
    if date_raw.is_empty() || !rc.status_values.iter().any(|v| v == &status) {
        debug!("Record not complete yet, skipping");
        return Ok(false);
    }

    let raw_subject = str_field(record, &rc.subject_field).unwrap_or_default();
    let subject = match normalize_subject(&raw_subject) {
        Some(subject) => subject,
        None => {
            warn!(subject = %raw_subject, "Record subject is not a valid session id");
            return Ok(false);
        }
    };

    let date = scantrack_db::parse_session_date(&date_raw)?;

    if dry_run {
        info!(session = %subject, "Dry run, not importing record");
        return Ok(true);
    }

    let session = db
        .get_or_create_session(study, &subject, Some(date), true, None)
        .await?
        .ok_or_else(|| scantrack_db::DbError::not_found(format!("Session '{subject}'")))?;

    let event_id = str_field(record, "redcap_event_name")
        .and_then(|event| lookup_event(&rc.events, &event));

    let redcap_record = RedcapRecord {
        record_id: str_field(record, "record_id").unwrap_or_default(),
        project: rc.project_id.clone(),
        url: rc.api_url.clone(),
        instrument: rc.instrument.clone(),
        date: Some(date),
        comment: str_field(record, &rc.comment_field).filter(|c| !c.is_empty()),
        event_id,
        version: Some(version.to_string()),
    };

    db.add_redcap_record(&session, &redcap_record).await?;
    info!(session = %subject, record = %redcap_record.record_id, "Record imported");
    Ok(true)
}

async fn fetch_version(client: &reqwest::Client, rc: &RedcapConfig, token: &str) -> Result<String> {
    let params = [("token", token), ("content", "version")];
    let response = client
        .post(&rc.api_url)
        .form(&params)
        .send()
        .await?
        .error_for_status()?;
    Ok(response.text().await?.trim().to_string())
}

async fn fetch_records(
    client: &reqwest::Client,
    rc: &RedcapConfig,
    token: &str,
) -> Result<Vec<Value>> {
    let params = [
        ("token", token),
        ("content", "record"),
        ("format", "json"),
        ("type", "flat"),
        ("forms", rc.instrument.as_str()),
        ("rawOrLabel", "raw"),
    ];
    let response = client
        .post(&rc.api_url)
        .form(&params)
        .send()
        .await?
        .error_for_status()?;
    Ok(response.json().await?)
}

/// Uppercase the recorded label, appending a first-session suffix when the
/// bare label is not a valid session id.
fn normalize_subject(raw: &str) -> Option<String> {
    let upper = raw.trim().to_uppercase();
    if upper.is_empty() {
        return None;
    }
    if scantrack_ids::is_scan_id(&upper) {
        return Some(upper);
    }
    let with_session = format!("{upper}_01");
    if scantrack_ids::is_scan_id(&with_session) {
        return Some(with_session);
    }
    None
}

fn lookup_event(events: &HashMap<String, i64>, event: &str) -> Option<i64> {
    let id = events.get(event).copied();
    if id.is_none() && !event.is_empty() {
        warn!(event = %event, "No event id configured for REDCap event");
    }
    id
}

fn str_field(record: &Value, field: &str) -> Option<String> {
    record.get(field).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_subject_appends_session() {
        assert_eq!(
            normalize_subject("stu01site0001").as_deref(),
            Some("STU01SITE0001_01")
        );
        assert_eq!(
            normalize_subject("STU01SITE0001_01").as_deref(),
            Some("STU01SITE0001_01")
        );
        assert!(normalize_subject("").is_none());
        assert!(normalize_subject("###").is_none());
    }

    #[test]
    fn test_read_token_trims() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("redcap-token");
        std::fs::write(&path, "s3cret\n").unwrap();
        assert_eq!(read_token(&path).unwrap(), "s3cret");
        assert!(read_token(&tmp.path().join("missing")).is_err());
    }

    #[test]
    fn test_str_field() {
        let record: Value = serde_json::json!({"a": "x", "n": 3});
        assert_eq!(str_field(&record, "a").as_deref(), Some("x"));
        assert!(str_field(&record, "n").is_none());
        assert!(str_field(&record, "missing").is_none());
    }
}
