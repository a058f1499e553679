//! `scantrack checklist` - show or update the QC checklist.

use crate::metadata::MetadataStore;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug)]
pub enum ChecklistAction {
    Show,
    Update {
        subject: String,
        comment: Option<String>,
    },
}

#[derive(Debug)]
pub struct ChecklistArgs {
    pub config: PathBuf,
    pub action: ChecklistAction,
    pub dry_run: bool,
}

pub async fn run(args: ChecklistArgs) -> anyhow::Result<()> {
    let config = super::load_config(&args.config)?;
    let store = MetadataStore::from_config(&config, args.dry_run).await?;

    match args.action {
        ChecklistAction::Show => {
            let entries = store.read_checklist().await?;
            let mut subjects: Vec<&String> = entries.keys().collect();
            subjects.sort();
            for subject in subjects {
                let comment = &entries[subject];
                if comment.is_empty() {
                    println!("{subject}");
                } else {
                    println!("{subject}\t{comment}");
                }
            }
        }
        ChecklistAction::Update { subject, comment } => {
            let mut delta = HashMap::new();
            delta.insert(subject.clone(), comment.unwrap_or_default());
            store.update_checklist(&delta).await?;
            println!("Updated checklist entry for {subject}.");
        }
    }

    Ok(())
}
