//! Flat-file metadata backend.
//!
//! Two whitespace-delimited files under the study metadata directory:
//!
//! - `checklist.csv`: one line per session, `qc_<subject>.html [comment]`.
//!   A line with no comment means registered but not yet reviewed.
//! - `blacklist.csv`: a `series  reason` header line, then one line per
//!   excluded scan, `<scan_name> <reason>`.
//!
//! Reads are tolerant: malformed lines are logged and skipped, and the
//! first occurrence of a duplicated key wins. Writes rewrite the whole
//! file through a temp file rename, with a short randomized retry against
//! concurrent writers on shared filesystems.

use super::{MetadataError, Result};
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const CHECKLIST_FILE: &str = "checklist.csv";
pub const BLACKLIST_FILE: &str = "blacklist.csv";

const WRITE_ATTEMPTS: u32 = 3;

/// File-backed checklist/blacklist store.
pub struct FileStore {
    meta_dir: PathBuf,
    dry_run: bool,
}

impl FileStore {
    pub fn new(meta_dir: PathBuf, dry_run: bool) -> Self {
        Self { meta_dir, dry_run }
    }

    pub fn checklist_path(&self) -> PathBuf {
        self.meta_dir.join(CHECKLIST_FILE)
    }

    pub fn blacklist_path(&self) -> PathBuf {
        self.meta_dir.join(BLACKLIST_FILE)
    }

    // ========================================================================
    // Checklist
    // ========================================================================

    pub fn read_checklist(&self) -> Result<HashMap<String, String>> {
        let path = self.checklist_path();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No checklist file yet");
                return Ok(HashMap::new());
            }
            Err(err) => return Err(err.into()),
        };

        let mut entries = HashMap::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let subject = match fields.next().map(checklist_key_to_subject) {
                Some(Some(subject)) => subject,
                _ => {
                    warn!(path = %path.display(), line, "Skipping malformed checklist line");
                    continue;
                }
            };
            let comment = fields.collect::<Vec<_>>().join(" ");
            // First occurrence wins when a subject is listed twice.
            entries.entry(subject).or_insert(comment);
        }

        Ok(entries)
    }

    pub fn checklist_comment(&self, subject: &str) -> Result<Option<String>> {
        Ok(self.read_checklist()?.remove(subject))
    }

    pub fn update_checklist(&self, delta: &HashMap<String, String>) -> Result<()> {
        for subject in delta.keys() {
            if !scantrack_ids::is_scan_id(subject) {
                return Err(MetadataError::InvalidEntry(format!(
                    "'{subject}' is not a valid session identifier"
                )));
            }
        }

        let mut entries = self.read_checklist()?;
        for (subject, comment) in delta {
            entries.insert(subject.clone(), comment.clone());
        }

        let mut keys: Vec<&String> = entries.keys().collect();
        keys.sort();
        let mut lines = Vec::with_capacity(keys.len());
        for subject in keys {
            let comment = &entries[subject];
            if comment.is_empty() {
                lines.push(format!("qc_{subject}.html"));
            } else {
                lines.push(format!("qc_{subject}.html {comment}"));
            }
        }

        self.write_lines(&self.checklist_path(), None, &lines)
    }

    // ========================================================================
    // Blacklist
    // ========================================================================

    pub fn read_blacklist(&self) -> Result<HashMap<String, String>> {
        let path = self.blacklist_path();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No blacklist file yet");
                return Ok(HashMap::new());
            }
            Err(err) => return Err(err.into()),
        };

        let mut entries = HashMap::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split(|c: char| c.is_whitespace() || c == ',').filter(|f| !f.is_empty());
            let scan = match fields.next() {
                Some(scan) => scan,
                None => continue,
            };
            if scan == "series" {
                // Header line.
                continue;
            }
            if scantrack_ids::parse_filename(scan).is_err() {
                warn!(path = %path.display(), line, "Skipping malformed blacklist line");
                continue;
            }
            let reason = fields.collect::<Vec<_>>().join(" ");
            entries.entry(scan.to_string()).or_insert(reason);
        }

        Ok(entries)
    }

    pub fn blacklist_reason(&self, scan: &str) -> Result<Option<String>> {
        Ok(self.read_blacklist()?.remove(scan))
    }

    pub fn update_blacklist(&self, delta: &HashMap<String, String>) -> Result<()> {
        let mut entries = self.read_blacklist()?;
        for (scan, reason) in delta {
            if scantrack_ids::parse_filename(scan).is_err() {
                return Err(MetadataError::InvalidEntry(format!(
                    "'{scan}' is not a valid scan name"
                )));
            }
            if reason.trim().is_empty() {
                // A blacklist entry without a reason is useless; skip it
                // rather than fail the whole update.
                error!(scan = %scan, "Ignoring blacklist entry with empty reason");
                continue;
            }
            entries.insert(scan.clone(), reason.clone());
        }

        let mut keys: Vec<&String> = entries.keys().collect();
        keys.sort();
        let lines: Vec<String> = keys
            .into_iter()
            .map(|scan| format!("{scan} {}", entries[scan]))
            .collect();

        self.write_lines(&self.blacklist_path(), Some("series\treason"), &lines)
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Rewrite a metadata file atomically. Shared filesystems occasionally
    /// reject the rename under concurrent access, so retry a few times with
    /// a randomized pause before giving up.
    fn write_lines(&self, path: &Path, header: Option<&str>, lines: &[String]) -> Result<()> {
        if self.dry_run {
            info!(path = %path.display(), entries = lines.len(), "Dry run, not writing");
            return Ok(());
        }

        let mut content = String::new();
        if let Some(header) = header {
            content.push_str(header);
            content.push('\n');
        }
        for line in lines {
            content.push_str(line);
            content.push('\n');
        }

        std::fs::create_dir_all(&self.meta_dir)?;

        let mut last_err = None;
        for attempt in 1..=WRITE_ATTEMPTS {
            match write_atomic(&self.meta_dir, path, &content) {
                Ok(()) => {
                    debug!(path = %path.display(), entries = lines.len(), "Metadata file written");
                    return Ok(());
                }
                Err(err) => {
                    warn!(path = %path.display(), attempt, %err, "Metadata write failed, retrying");
                    last_err = Some(err);
                    let pause = rand::thread_rng().gen_range(100..1000);
                    std::thread::sleep(Duration::from_millis(pause));
                }
            }
        }

        error!(path = %path.display(), ?last_err, "Giving up on metadata write");
        Err(MetadataError::WriteFailed {
            path: path.to_path_buf(),
            attempts: WRITE_ATTEMPTS,
        })
    }
}

fn write_atomic(dir: &Path, path: &Path, content: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Turn a checklist key (`qc_<subject>.html`) back into the subject id.
/// Returns None when the remainder is not a valid identifier.
fn checklist_key_to_subject(key: &str) -> Option<String> {
    let stripped = key.strip_prefix("qc_").unwrap_or(key);
    let stem = match stripped.rsplit_once('.') {
        Some((stem, _ext)) => stem,
        None => stripped,
    };
    if scantrack_ids::is_scan_id(stem) {
        Some(stem.to_string())
    } else {
        None
    }
}
