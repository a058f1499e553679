//! `scantrack run` - submit the ENIGMA-DTI pipeline for a study.

use crate::metadata::MetadataStore;
use crate::proc::pipeline::{run_pipeline, RunOptions};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug)]
pub struct RunArgs {
    pub config: PathBuf,
    pub fa_tag: String,
    pub subject_filter: Option<String>,
    pub fa_filter: Option<String>,
    pub qc_transfer: bool,
    pub walltime: String,
    pub walltime_post: String,
    pub post_only: bool,
    pub no_post: bool,
    pub dry_run: bool,
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = super::load_config(&args.config)?;
    let store = MetadataStore::from_config(&config, args.dry_run).await?;

    let options = RunOptions {
        fa_tag: args.fa_tag,
        subject_filter: args.subject_filter,
        fa_filter: args.fa_filter,
        qc_transfer: args.qc_transfer,
        walltime: args.walltime,
        walltime_post: args.walltime_post,
        post_only: args.post_only,
        no_post: args.no_post,
        dry_run: args.dry_run,
    };

    let summary = run_pipeline(&config, &store, &options).await?;

    info!(
        queued = summary.queued,
        already_done = summary.already_done,
        "Pipeline run finished"
    );
    if let Some(job) = &summary.batch_job {
        println!("Submitted batch job: {}", job.name);
    }
    if let Some(job) = &summary.post_job {
        println!("Submitted consolidation job: {}", job.name);
    }
    if summary.batch_job.is_none() && summary.post_job.is_none() {
        println!("Nothing to do.");
    }

    Ok(())
}
