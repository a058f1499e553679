//! Cluster queue submission.
//!
//! Two flavors behind one interface: piped `qbatch` (dependencies are
//! expressed by job name) and script-file `sbatch` (dependencies need the
//! numeric job id parsed back out of the submission output). The flavor is
//! fixed by the study configuration; callers never branch on it.

use crate::config::{QueueConfig, QueueKind};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info, warn};

pub type Result<T> = std::result::Result<T, SubmissionError>;

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("Could not parse a job id from sbatch output: {0:?}")]
    ParseJobId(String),
}

/// Submission parameters for one job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub walltime: String,
    /// Run only after this job completed successfully.
    pub afterok: Option<JobHandle>,
}

/// A submitted (or dry-run) job. The id is only known for flavors whose
/// submission output reports one.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub name: String,
    pub id: Option<String>,
}

/// Queue frontend for one study.
pub struct Queue {
    kind: QueueKind,
    cpu_cores: u32,
    partition: Option<String>,
    workdir: PathBuf,
    dry_run: bool,
}

impl Queue {
    pub fn from_config(config: &QueueConfig, dry_run: bool) -> Self {
        Self {
            kind: config.backend,
            cpu_cores: config.cpu_cores,
            partition: config.partition.clone(),
            workdir: config.workdir.clone(),
            dry_run,
        }
    }

    /// Submit a single shell command as a job.
    pub fn submit(&self, command: &str, spec: &JobSpec) -> Result<JobHandle> {
        if self.dry_run {
            info!(job = %spec.name, %command, "Dry run, not submitting");
            return Ok(JobHandle {
                name: spec.name.clone(),
                id: None,
            });
        }

        match self.kind {
            QueueKind::Qbatch => self.submit_qbatch(command, None, spec),
            QueueKind::Slurm => {
                let script = self.write_script(&spec.name, command)?;
                self.submit_sbatch(&script, spec)
            }
        }
    }

    /// Submit a command file (one command per line) as a batch job.
    pub fn submit_batch_file(&self, path: &Path, spec: &JobSpec) -> Result<JobHandle> {
        if self.dry_run {
            info!(job = %spec.name, file = %path.display(), "Dry run, not submitting batch");
            return Ok(JobHandle {
                name: spec.name.clone(),
                id: None,
            });
        }

        match self.kind {
            QueueKind::Qbatch => self.submit_qbatch("", Some(path), spec),
            QueueKind::Slurm => {
                // sbatch wants a single script, so wrap the command file.
                let command = format!("bash {}", path.display());
                let script = self.write_script(&spec.name, &command)?;
                self.submit_sbatch(&script, spec)
            }
        }
    }

    fn submit_qbatch(
        &self,
        command: &str,
        batch_file: Option<&Path>,
        spec: &JobSpec,
    ) -> Result<JobHandle> {
        let mut cmd = Command::new("qbatch");
        cmd.current_dir(&self.workdir)
            .arg("-N")
            .arg(&spec.name)
            .arg("--walltime")
            .arg(&spec.walltime)
            .arg("--ppj")
            .arg(self.cpu_cores.to_string());

        if let Some(dep) = &spec.afterok {
            cmd.arg("--afterok").arg(&dep.name);
        }

        match batch_file {
            Some(path) => {
                cmd.arg(path);
                debug!(job = %spec.name, file = %path.display(), "Submitting qbatch file");
                let output = cmd
                    .output()
                    .map_err(|source| SubmissionError::Spawn {
                        program: "qbatch",
                        source,
                    })?;
                check_status("qbatch", &output)?;
            }
            None => {
                cmd.arg("-").stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
                debug!(job = %spec.name, %command, "Submitting piped qbatch job");
                let mut child = cmd.spawn().map_err(|source| SubmissionError::Spawn {
                    program: "qbatch",
                    source,
                })?;
                if let Some(stdin) = child.stdin.as_mut() {
                    stdin.write_all(command.as_bytes())?;
                    stdin.write_all(b"\n")?;
                }
                let output = child.wait_with_output()?;
                check_status("qbatch", &output)?;
            }
        }

        info!(job = %spec.name, "Job submitted");
        // qbatch resolves dependencies by name, no id needed.
        Ok(JobHandle {
            name: spec.name.clone(),
            id: None,
        })
    }

    fn submit_sbatch(&self, script: &Path, spec: &JobSpec) -> Result<JobHandle> {
        let mut cmd = Command::new("sbatch");
        cmd.current_dir(&self.workdir)
            .arg("--job-name")
            .arg(&spec.name)
            .arg("-c")
            .arg(self.cpu_cores.to_string())
            .arg("-t")
            .arg(&spec.walltime)
            .arg("-o")
            .arg(self.workdir.join(format!("{}.out", spec.name)))
            .arg("-D")
            .arg(&self.workdir);

        if let Some(partition) = &self.partition {
            cmd.arg("-p").arg(partition);
        }

        if let Some(dep) = &spec.afterok {
            match &dep.id {
                Some(id) => {
                    cmd.arg(format!("--dependency=afterok:{id}"));
                }
                None => {
                    warn!(
                        job = %spec.name,
                        depends_on = %dep.name,
                        "Dependency job has no id, submitting without the dependency"
                    );
                }
            }
        }

        cmd.arg(script);
        debug!(job = %spec.name, script = %script.display(), "Submitting sbatch job");
        let output = cmd.output().map_err(|source| SubmissionError::Spawn {
            program: "sbatch",
            source,
        })?;
        check_status("sbatch", &output)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = parse_sbatch_job_id(&stdout)
            .ok_or_else(|| SubmissionError::ParseJobId(stdout.to_string()))?;

        info!(job = %spec.name, id = %id, "Job submitted");
        Ok(JobHandle {
            name: spec.name.clone(),
            id: Some(id),
        })
    }

    fn write_script(&self, name: &str, command: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.workdir)?;
        let path = self.workdir.join(format!("{name}.sh"));
        std::fs::write(&path, format!("#!/bin/bash\n{command}\n"))?;
        Ok(path)
    }
}

fn check_status(program: &'static str, output: &std::process::Output) -> Result<()> {
    if output.status.success() {
        Ok(())
    } else {
        Err(SubmissionError::CommandFailed {
            program,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Pull the job id out of `Submitted batch job 12345`.
fn parse_sbatch_job_id(stdout: &str) -> Option<String> {
    stdout
        .split_whitespace()
        .last()
        .filter(|token| token.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;

    fn config(kind: QueueKind) -> QueueConfig {
        QueueConfig {
            backend: kind,
            cpu_cores: 2,
            partition: None,
            workdir: PathBuf::from("/tmp"),
        }
    }

    #[test]
    fn test_parse_sbatch_job_id() {
        assert_eq!(
            parse_sbatch_job_id("Submitted batch job 12345\n").as_deref(),
            Some("12345")
        );
        assert!(parse_sbatch_job_id("something went wrong").is_none());
        assert!(parse_sbatch_job_id("").is_none());
    }

    #[test]
    fn test_dry_run_returns_handle_without_id() {
        let queue = Queue::from_config(&config(QueueKind::Slurm), true);
        let spec = JobSpec {
            name: "edti_test".to_string(),
            walltime: "2:00:00".to_string(),
            afterok: None,
        };
        let handle = queue.submit("echo hi", &spec).unwrap();
        assert_eq!(handle.name, "edti_test");
        assert!(handle.id.is_none());
    }

    #[test]
    fn test_dry_run_batch_file_never_touches_queue() {
        let queue = Queue::from_config(&config(QueueKind::Qbatch), true);
        let spec = JobSpec {
            name: "edti_batch".to_string(),
            walltime: "2:00:00".to_string(),
            afterok: None,
        };
        let handle = queue
            .submit_batch_file(Path::new("/nonexistent/cmds"), &spec)
            .unwrap();
        assert!(handle.id.is_none());
    }
}
