//! CLI command implementations.
//!
//! Each command gets its own module with a plain `Args` struct and a
//! `run(args)` entry point; argument parsing itself lives in `main.rs`.

pub mod blacklist;
pub mod checklist;
pub mod redcap;
pub mod run;

use crate::config::StudyConfig;
use anyhow::Context;
use std::path::Path;

/// Load the study configuration, with a pointer at the failing file.
pub fn load_config(path: &Path) -> anyhow::Result<StudyConfig> {
    StudyConfig::load(path)
        .with_context(|| format!("Failed to load study config from {}", path.display()))
}
