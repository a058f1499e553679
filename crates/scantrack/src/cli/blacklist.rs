//! `scantrack blacklist` - show or update the scan blacklist.

use crate::metadata::MetadataStore;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug)]
pub enum BlacklistAction {
    Show,
    Update { scan: String, reason: String },
}

#[derive(Debug)]
pub struct BlacklistArgs {
    pub config: PathBuf,
    pub action: BlacklistAction,
    pub dry_run: bool,
}

pub async fn run(args: BlacklistArgs) -> anyhow::Result<()> {
    let config = super::load_config(&args.config)?;
    let store = MetadataStore::from_config(&config, args.dry_run).await?;

    match args.action {
        BlacklistAction::Show => {
            let entries = store.read_blacklist().await?;
            let mut scans: Vec<&String> = entries.keys().collect();
            scans.sort();
            for scan in scans {
                println!("{scan}\t{}", entries[scan]);
            }
        }
        BlacklistAction::Update { scan, reason } => {
            let mut delta = HashMap::new();
            delta.insert(scan.clone(), reason);
            store.update_blacklist(&delta).await?;
            println!("Updated blacklist entry for {scan}.");
        }
    }

    Ok(())
}
