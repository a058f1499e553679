//! `scantrack redcap` - import scan-completed records into the dashboard.

use anyhow::bail;
use scantrack_db::DashboardDb;
use std::path::PathBuf;

#[derive(Debug)]
pub struct RedcapArgs {
    pub config: PathBuf,
    pub dry_run: bool,
}

pub async fn run(args: RedcapArgs) -> anyhow::Result<()> {
    let config = super::load_config(&args.config)?;

    let db_path = match &config.metadata.dashboard_db {
        Some(path) => path,
        None => bail!("The redcap import needs metadata.dashboard_db in the study config"),
    };
    let db = DashboardDb::open(db_path).await?;

    let summary = crate::redcap::import_scan_completed(&config, &db, args.dry_run).await?;
    println!(
        "Imported {} records, skipped {}.",
        summary.imported, summary.skipped
    );

    Ok(())
}
