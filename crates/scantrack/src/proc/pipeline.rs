//! ENIGMA-DTI run coordinator.
//!
//! Walks the pipeline input directory, reconciles the run checklist,
//! builds a batch of per-subject commands for every subject that still
//! lacks its completed-output sentinel, and submits the batch plus a
//! dependent consolidation job.
//!
//! Idempotency rests on the sentinel file alone: a subject whose ROI
//! summary CSV exists is never queued again. Two coordinators racing
//! between the sentinel check and job completion can double-submit; the
//! window is accepted, the per-subject work is safe to repeat.

use super::checklist::ProcChecklist;
use super::{ProcError, Result};
use crate::config::StudyConfig;
use crate::fsutil;
use crate::metadata::MetadataStore;
use crate::queue::{JobHandle, JobSpec, Queue};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const RUN_CHECKLIST_FILE: &str = "ENIGMA-DTI-checklist.csv";
pub const RUN_SCRIPT: &str = "run_enigmadti.sh";
pub const POST_SCRIPT: &str = "concatresults.sh";

/// Options for one pipeline run, mapped from the CLI flags.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Tag selecting the input image within each subject directory.
    pub fa_tag: String,
    /// Only process subjects whose id contains this substring.
    pub subject_filter: Option<String>,
    /// Narrow ambiguous input-image matches by file-name substring.
    pub fa_filter: Option<String>,
    /// Only process subjects signed off in the QC checklist.
    pub qc_transfer: bool,
    pub walltime: String,
    pub walltime_post: String,
    /// Submit only the consolidation job.
    pub post_only: bool,
    /// Suppress the consolidation job.
    pub no_post: bool,
    pub dry_run: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            fa_tag: "_FA.nii.gz".to_string(),
            subject_filter: None,
            fa_filter: None,
            qc_transfer: false,
            walltime: "2:00:00".to_string(),
            walltime_post: "2:00:00".to_string(),
            post_only: false,
            no_post: false,
            dry_run: false,
        }
    }
}

/// What a run did, for reporting.
#[derive(Debug)]
pub struct RunSummary {
    pub queued: usize,
    pub already_done: usize,
    pub batch_job: Option<JobHandle>,
    pub post_job: Option<JobHandle>,
}

/// Run the pipeline coordinator once for a study.
pub async fn run_pipeline(
    config: &StudyConfig,
    store: &MetadataStore,
    options: &RunOptions,
) -> Result<RunSummary> {
    let inputs_dir = config.get_path("dtifit")?;
    let output_dir = fsutil::define_folder(config.get_path("enigma")?)?;

    ensure_script(&output_dir.join(RUN_SCRIPT), &run_script_body(&output_dir))?;
    ensure_script(&output_dir.join(POST_SCRIPT), &post_script_body(&output_dir))?;

    let mut checklist = ProcChecklist::load_or_create(output_dir.join(RUN_CHECKLIST_FILE))?;

    let mut subjects = fsutil::get_subjects(&inputs_dir)?;
    if !config.study_tags.is_empty() {
        subjects.retain(|s| match scantrack_ids::parse(s) {
            Ok(ident) => match scantrack_ids::validate(&ident, &config.study_tags) {
                Ok(()) => true,
                Err(err) => {
                    warn!(subject = %s, %err, "Skipping unregistered subject");
                    false
                }
            },
            Err(_) => false,
        });
    }
    if let Some(filter) = &options.subject_filter {
        subjects.retain(|s| s.contains(filter.as_str()));
    }
    if options.qc_transfer {
        let qc = store.read_checklist().await?;
        subjects.retain(|s| qc.get(s).map(|c| !c.is_empty()).unwrap_or(false));
    }

    checklist.add_new_subjects(&subjects);
    checklist.find_images(&inputs_dir, &options.fa_tag, options.fa_filter.as_deref())?;

    // Build the batch of subjects still missing their output sentinel.
    let run_script = output_dir.join(RUN_SCRIPT);
    let mut queued: Vec<(String, String)> = Vec::new();
    let mut already_done = 0usize;
    for row in checklist.rows() {
        if !row.runnable() {
            continue;
        }
        if sentinel_path(&output_dir, &row.id, &row.fa_nii).exists() {
            debug!(subject = %row.id, "Output sentinel present, skipping");
            already_done += 1;
            continue;
        }
        let fa_image = inputs_dir.join(&row.id).join(&row.fa_nii);
        queued.push((
            row.id.clone(),
            format!("bash {} {} {}", run_script.display(), row.id, fa_image.display()),
        ));
    }

    let queue = Queue::from_config(&config.queue, options.dry_run);
    let submitted = submit_run(&queue, &output_dir, &queued, options, &mut checklist);

    // The checklist (new subjects, resolved images, notes) is written
    // regardless of submission outcome; only actually-queued rows carry a
    // date_ran stamp.
    if options.dry_run {
        info!("Dry run, run checklist not persisted");
    } else {
        checklist.save()?;
    }

    let (batch_job, post_job) = submitted?;

    Ok(RunSummary {
        queued: queued.len(),
        already_done,
        batch_job,
        post_job,
    })
}

fn submit_run(
    queue: &Queue,
    output_dir: &Path,
    queued: &[(String, String)],
    options: &RunOptions,
    checklist: &mut ProcChecklist,
) -> Result<(Option<JobHandle>, Option<JobHandle>)> {
    let prefix = job_prefix();

    let batch_job = if options.post_only {
        info!("Post-only run, skipping the subject batch");
        None
    } else if queued.is_empty() {
        info!("Nothing to queue, all subjects up to date");
        None
    } else {
        let batch_dir = tempfile::TempDir::new()?;
        let batch_path = batch_dir.path().join("commands.txt");
        let mut batch = std::fs::File::create(&batch_path)?;
        for (_, command) in queued {
            writeln!(batch, "{command}")?;
        }
        batch.flush()?;

        let spec = JobSpec {
            name: prefix.clone(),
            walltime: options.walltime.clone(),
            afterok: None,
        };
        info!(job = %prefix, subjects = queued.len(), "Submitting subject batch");
        let handle = queue.submit_batch_file(&batch_path, &spec)?;

        for (subject, _) in queued {
            checklist.mark_ran(subject);
        }
        Some(handle)
    };

    let post_job = if options.no_post {
        None
    } else if batch_job.is_some() || options.post_only {
        let spec = JobSpec {
            name: format!("{prefix}_post"),
            walltime: options.walltime_post.clone(),
            afterok: batch_job.clone(),
        };
        let command = format!("bash {}", output_dir.join(POST_SCRIPT).display());
        info!(job = %spec.name, "Submitting consolidation job");
        Some(queue.submit(&command, &spec)?)
    } else {
        None
    };

    Ok((batch_job, post_job))
}

/// The completed-output sentinel: the skeletonised ROI summary the
/// pipeline writes last.
pub fn sentinel_path(output_dir: &Path, subject: &str, fa_nii: &str) -> PathBuf {
    let stem = fsutil::splitext(fa_nii).0;
    output_dir
        .join(subject)
        .join("ROI")
        .join(format!("{stem}skel_ROIout_avg.csv"))
}

/// Timestamped job-name prefix shared by a run's batch and its
/// consolidation job.
fn job_prefix() -> String {
    format!("edti_{}", chrono::Local::now().format("%Y%m%d-%H%M%S"))
}

fn run_script_body(output_dir: &Path) -> String {
    format!(
        "#!/bin/bash\n\
         # Generated by scantrack. Delete this file to regenerate it.\n\
         # Usage: {RUN_SCRIPT} <subject_id> <fa_image>\n\
         set -e\n\
         subject=\"$1\"\n\
         fa_image=\"$2\"\n\
         doInd-enigma-dti.py --calc-all --outdir {}/\"$subject\" \"$fa_image\"\n",
        output_dir.display()
    )
}

fn post_script_body(output_dir: &Path) -> String {
    format!(
        "#!/bin/bash\n\
         # Generated by scantrack. Delete this file to regenerate it.\n\
         set -e\n\
         concatcsv-enigmadti.py {out} {out}/enigmaDTI-results.csv\n",
        out = output_dir.display()
    )
}

/// Write the script if absent. If present, its content must match what we
/// would generate now, so a run never silently mixes outputs produced
/// under different options.
fn ensure_script(path: &Path, body: &str) -> Result<()> {
    match std::fs::read_to_string(path) {
        Ok(existing) => {
            if existing != body {
                warn!(script = %path.display(), "Existing run script differs from expected content");
                return Err(ProcError::ScriptDrift {
                    path: path.to_path_buf(),
                });
            }
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            std::fs::write(path, body)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
            }
            info!(script = %path.display(), "Run script generated");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        MetadataBackend, MetadataConfig, QueueConfig, QueueKind, StudyConfig,
    };
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn test_config(base: &Path) -> StudyConfig {
        let mut paths = HashMap::new();
        paths.insert("meta".to_string(), PathBuf::from("metadata"));
        paths.insert("dtifit".to_string(), PathBuf::from("dtifit"));
        paths.insert("enigma".to_string(), PathBuf::from("enigma"));
        StudyConfig {
            nickname: "STUDY01".to_string(),
            study_tag: "STU01".to_string(),
            base_dir: base.to_path_buf(),
            paths,
            study_tags: HashMap::new(),
            scantypes: Vec::new(),
            metadata: MetadataConfig {
                backend: MetadataBackend::File,
                dashboard_db: None,
                default_user: "tester".to_string(),
            },
            queue: QueueConfig {
                backend: QueueKind::Qbatch,
                cpu_cores: 1,
                partition: None,
                workdir: base.to_path_buf(),
            },
            redcap: None,
        }
    }

    fn seed_subject(base: &Path, subject: &str) {
        let dir = base.join("dtifit").join(subject);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{subject}_DTI60_03_Ax_FA.nii.gz")), "").unwrap();
    }

    fn dry_options() -> RunOptions {
        RunOptions {
            dry_run: true,
            ..RunOptions::default()
        }
    }

    async fn file_store(config: &StudyConfig) -> MetadataStore {
        MetadataStore::from_config(config, true).await.unwrap()
    }

    #[tokio::test]
    async fn test_new_subject_is_queued() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        seed_subject(tmp.path(), "STU01SITE0001_01");
        let store = file_store(&config).await;

        let summary = run_pipeline(&config, &store, &dry_options()).await.unwrap();
        assert_eq!(summary.queued, 1);
        assert_eq!(summary.already_done, 0);
        assert!(summary.batch_job.is_some());
        assert!(summary.post_job.is_some());
    }

    #[tokio::test]
    async fn test_sentinel_makes_second_run_a_noop() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        seed_subject(tmp.path(), "STU01SITE0001_01");
        let store = file_store(&config).await;

        let output = config.get_path("enigma").unwrap();
        let sentinel = sentinel_path(
            &output,
            "STU01SITE0001_01",
            "STU01SITE0001_01_DTI60_03_Ax_FA.nii.gz",
        );
        std::fs::create_dir_all(sentinel.parent().unwrap()).unwrap();
        std::fs::write(&sentinel, "").unwrap();

        let summary = run_pipeline(&config, &store, &dry_options()).await.unwrap();
        assert_eq!(summary.queued, 0);
        assert_eq!(summary.already_done, 1);
        assert!(summary.batch_job.is_none());
        assert!(summary.post_job.is_none());
    }

    #[tokio::test]
    async fn test_post_only_skips_batch() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        seed_subject(tmp.path(), "STU01SITE0001_01");
        let store = file_store(&config).await;

        let options = RunOptions {
            post_only: true,
            ..dry_options()
        };
        let summary = run_pipeline(&config, &store, &options).await.unwrap();
        assert!(summary.batch_job.is_none());
        assert!(summary.post_job.is_some());
    }

    #[tokio::test]
    async fn test_no_post_suppresses_consolidation() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        seed_subject(tmp.path(), "STU01SITE0001_01");
        let store = file_store(&config).await;

        let options = RunOptions {
            no_post: true,
            ..dry_options()
        };
        let summary = run_pipeline(&config, &store, &options).await.unwrap();
        assert!(summary.batch_job.is_some());
        assert!(summary.post_job.is_none());
    }

    #[tokio::test]
    async fn test_subject_filter() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        seed_subject(tmp.path(), "STU01SITE0001_01");
        seed_subject(tmp.path(), "STU01SITE0002_01");
        let store = file_store(&config).await;

        let options = RunOptions {
            subject_filter: Some("0002".to_string()),
            ..dry_options()
        };
        let summary = run_pipeline(&config, &store, &options).await.unwrap();
        assert_eq!(summary.queued, 1);
    }

    #[tokio::test]
    async fn test_unregistered_site_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config
            .study_tags
            .insert("STU01".to_string(), vec!["SITE".to_string()]);
        seed_subject(tmp.path(), "STU01SITE0001_01");
        seed_subject(tmp.path(), "STU01ABC0002_01");
        let store = file_store(&config).await;

        let summary = run_pipeline(&config, &store, &dry_options()).await.unwrap();
        assert_eq!(summary.queued, 1);
    }

    #[tokio::test]
    async fn test_qc_transfer_requires_sign_off() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        seed_subject(tmp.path(), "STU01SITE0001_01");
        seed_subject(tmp.path(), "STU01SITE0002_01");

        // Only one subject is signed off in the QC checklist.
        let store = MetadataStore::from_config(&config, false).await.unwrap();
        let mut delta = HashMap::new();
        delta.insert("STU01SITE0001_01".to_string(), "reviewed".to_string());
        delta.insert("STU01SITE0002_01".to_string(), String::new());
        store.update_checklist(&delta).await.unwrap();

        let options = RunOptions {
            qc_transfer: true,
            ..dry_options()
        };
        let summary = run_pipeline(&config, &store, &options).await.unwrap();
        assert_eq!(summary.queued, 1);
    }

    #[tokio::test]
    async fn test_run_script_drift_aborts() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        seed_subject(tmp.path(), "STU01SITE0001_01");
        let store = file_store(&config).await;

        let output = fsutil::define_folder(config.get_path("enigma").unwrap()).unwrap();
        std::fs::write(output.join(RUN_SCRIPT), "#!/bin/bash\necho edited\n").unwrap();

        let err = run_pipeline(&config, &store, &dry_options()).await.unwrap_err();
        assert!(matches!(err, ProcError::ScriptDrift { .. }));
    }

    #[tokio::test]
    async fn test_checklist_persisted_when_submission_fails() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        seed_subject(tmp.path(), "STU01SITE0001_01");
        let store = file_store(&config).await;

        // Make the queue frontend unfindable so submission fails.
        std::env::set_var("PATH", tmp.path().join("nobin").display().to_string());

        let err = run_pipeline(&config, &store, &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcError::Submission(_)));

        let output = config.get_path("enigma").unwrap();
        let checklist = ProcChecklist::load_or_create(output.join(RUN_CHECKLIST_FILE)).unwrap();
        let row = checklist.row("STU01SITE0001_01").unwrap();
        assert_eq!(row.fa_nii, "STU01SITE0001_01_DTI60_03_Ax_FA.nii.gz");
        assert!(row.date_ran.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_leaves_checklist_unwritten() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        seed_subject(tmp.path(), "STU01SITE0001_01");
        let store = file_store(&config).await;

        run_pipeline(&config, &store, &dry_options()).await.unwrap();
        let output = config.get_path("enigma").unwrap();
        assert!(!output.join(RUN_CHECKLIST_FILE).exists());

        // A real run persists it. The sentinel keeps the queue empty so
        // nothing is actually submitted.
        let sentinel = sentinel_path(
            &output,
            "STU01SITE0001_01",
            "STU01SITE0001_01_DTI60_03_Ax_FA.nii.gz",
        );
        std::fs::create_dir_all(sentinel.parent().unwrap()).unwrap();
        std::fs::write(&sentinel, "").unwrap();

        run_pipeline(&config, &store, &RunOptions::default()).await.unwrap();
        assert!(output.join(RUN_CHECKLIST_FILE).exists());
    }
}
