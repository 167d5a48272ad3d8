use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::{BatchError, Result};
use crate::job::Job;

/// Observed state of a job's child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exit code, `None` when the process was killed by a signal. Kept for
    /// logging only; it does not decide whether the job succeeded.
    Exited(Option<i32>),
}

/// A spawned job process and the log file capturing its output.
#[derive(Debug)]
pub struct JobProcess {
    child: Child,
    pid: Option<u32>,
    log_path: PathBuf,
}

impl JobProcess {
    /// Check on the process without blocking.
    pub fn poll(&mut self) -> ProcessState {
        match self.child.try_wait() {
            Ok(None) => ProcessState::Running,
            Ok(Some(status)) => ProcessState::Exited(status.code()),
            Err(e) => {
                // The child can no longer be waited on; treat it as gone and let
                // the output-file check decide the job's fate.
                tracing::warn!(pid = ?self.pid, error = %e, "Failed to poll job process");
                ProcessState::Exited(None)
            }
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Send SIGKILL. Returns once the signal is sent, not when the process
    /// has exited.
    pub fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::warn!(pid = ?self.pid, error = %e, "Failed to kill job process");
        }
    }
}

/// Spawns job processes with stdout and stderr redirected to one log file.
///
/// Commands are executed directly, never through a shell.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    work_dir: PathBuf,
}

impl ProcessSupervisor {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Open the job's log file (truncating it) and start the process.
    /// Returns as soon as the process is started.
    pub fn spawn(&self, job: &Job) -> Result<JobProcess> {
        let spawn_err = |source: std::io::Error| BatchError::Spawn {
            job_id: job.id.clone(),
            source,
        };

        let (program, args) = job.argv.split_first().ok_or_else(|| {
            spawn_err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command",
            ))
        })?;

        std::fs::create_dir_all(&self.work_dir).map_err(spawn_err)?;
        let log_path = job.resolve_log_path(&self.work_dir);
        let stdout = File::create(&log_path).map_err(spawn_err)?;
        let stderr = stdout.try_clone().map_err(spawn_err)?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(spawn_err)?;
        let pid = child.id();

        tracing::info!(
            job_id = %job.id,
            batch_id = %job.batch_id,
            pid = ?pid,
            command = %job.argv.join(" "),
            log_file = %log_path.display(),
            "Started job process"
        );

        Ok(JobProcess {
            child,
            pid,
            log_path,
        })
    }
}
