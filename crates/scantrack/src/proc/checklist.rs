//! The per-pipeline run checklist.
//!
//! A CSV file in the pipeline output directory tracking, per subject,
//! which input image was used, when the pipeline ran, and the QC verdict.
//! Rows are only ever added or filled in, never removed, so the file
//! doubles as the pipeline's run history.

use super::Result;
use crate::fsutil;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One subject's row in the run checklist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistRow {
    pub id: String,
    #[serde(default)]
    pub fa_nii: String,
    #[serde(default)]
    pub date_ran: String,
    /// Who rated QC. Filled in by reviewers, only carried through here.
    #[serde(default)]
    pub qc_rator: String,
    /// QC verdict. Filled in by reviewers, only carried through here.
    #[serde(default)]
    pub qc_rating: String,
    #[serde(default)]
    pub notes: String,
}

impl ChecklistRow {
    fn new(id: String) -> Self {
        Self {
            id,
            fa_nii: String::new(),
            date_ran: String::new(),
            qc_rator: String::new(),
            qc_rating: String::new(),
            notes: String::new(),
        }
    }

    /// Whether this row should be attempted in the next run.
    pub fn runnable(&self) -> bool {
        !self.fa_nii.is_empty() && self.date_ran.is_empty()
    }
}

/// The run checklist, loaded from and saved back to one CSV file.
pub struct ProcChecklist {
    path: PathBuf,
    rows: Vec<ChecklistRow>,
}

impl ProcChecklist {
    /// Load the checklist, or start an empty one when the file is absent.
    pub fn load_or_create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let rows = if path.exists() {
            let mut reader = csv::Reader::from_path(&path)?;
            reader.deserialize().collect::<std::result::Result<_, _>>()?
        } else {
            debug!(path = %path.display(), "No run checklist yet, starting fresh");
            Vec::new()
        };
        Ok(Self { path, rows })
    }

    pub fn rows(&self) -> &[ChecklistRow] {
        &self.rows
    }

    pub fn row(&self, id: &str) -> Option<&ChecklistRow> {
        self.rows.iter().find(|row| row.id == id)
    }

    fn row_mut(&mut self, id: &str) -> Option<&mut ChecklistRow> {
        self.rows.iter_mut().find(|row| row.id == id)
    }

    /// Add rows for subjects not yet listed. Existing rows are untouched.
    pub fn add_new_subjects(&mut self, subjects: &[String]) {
        for subject in subjects {
            if self.row(subject).is_none() {
                debug!(subject = %subject, "New subject added to run checklist");
                self.rows.push(ChecklistRow::new(subject.clone()));
            }
        }
    }

    /// Fill in the input image for every row that has none yet.
    ///
    /// Looks for files carrying `tag` under `<inputs_dir>/<subject>/`. No
    /// match leaves a note; several matches are narrowed by `filter`
    /// (substring on the file name) and still-ambiguous rows get a note
    /// instead of a guess.
    pub fn find_images(&mut self, inputs_dir: &Path, tag: &str, filter: Option<&str>) -> Result<()> {
        for row in &mut self.rows {
            if !row.fa_nii.is_empty() || !row.date_ran.is_empty() {
                continue;
            }

            let subject_dir = inputs_dir.join(&row.id);
            if !subject_dir.is_dir() {
                row.notes = format!("no input directory for {tag}");
                continue;
            }

            let mut candidates = fsutil::get_files_with_tag(&subject_dir, tag, true)?;
            if candidates.len() > 1 {
                if let Some(filter) = filter {
                    candidates.retain(|p| {
                        p.file_name()
                            .map(|n| n.to_string_lossy().contains(filter))
                            .unwrap_or(false)
                    });
                }
            }

            match candidates.len() {
                0 => {
                    row.notes = format!("no image matching {tag} found");
                }
                1 => {
                    let name = candidates[0]
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    debug!(subject = %row.id, image = %name, "Input image selected");
                    row.fa_nii = name;
                    row.notes.clear();
                }
                n => {
                    row.notes = format!("{n} images matching {tag}, skipping");
                }
            }
        }
        Ok(())
    }

    /// Record that the pipeline was started for a subject today.
    pub fn mark_ran(&mut self, id: &str) {
        let today = chrono::Local::now().format("%Y-%m-%d").to_string();
        if let Some(row) = self.row_mut(id) {
            row.date_ran = today;
        }
    }

    /// Write the checklist back out.
    pub fn save(&self) -> Result<()> {
        let mut writer = csv::Writer::from_path(&self.path)?;
        for row in &self.rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        info!(path = %self.path.display(), rows = self.rows.len(), "Run checklist saved");
        Ok(())
    }
}
