//! Pipeline processing: the per-pipeline run checklist and the run
//! coordinator that fans subjects out to the cluster queue.

pub mod checklist;
pub mod pipeline;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcError>;

#[derive(Error, Debug)]
pub enum ProcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checklist error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] crate::metadata::MetadataError),

    #[error("Submission error: {0}")]
    Submission(#[from] crate::queue::SubmissionError),

    #[error("Run script {path} differs from the expected content; remove it to regenerate")]
    ScriptDrift { path: std::path::PathBuf },
}
