//! Ordered ledger of undo actions for kernel and filesystem resources.
//!
//! A job is pushed immediately after the resource it releases has been
//! successfully allocated, so the stack always mirrors what actually
//! exists. Unwinding pops from the tail: the last resource built is the
//! first one released.

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use crate::error::Result;
use crate::host::Host;

/// One undo action together with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupJob {
    /// Recursively remove a directory (the staging area).
    RemoveDir(PathBuf),
    /// Unlink a file that must exist.
    RemoveFile(PathBuf),
    /// Unlink a file that may never have been created.
    RemoveFileIfExists(PathBuf),
    /// Release a loop device.
    DetachLoop(PathBuf),
    /// Remove a device-mapper node by name.
    RemoveDm(String),
}

impl CleanupJob {
    /// Execute the job. Detach and remove retry on busy devices inside `host`.
    pub fn run(&self, host: &dyn Host) -> Result<()> {
        match self {
            CleanupJob::RemoveDir(dir) => fs::remove_dir_all(dir)?,
            CleanupJob::RemoveFile(file) => fs::remove_file(file)?,
            CleanupJob::RemoveFileIfExists(file) => match fs::remove_file(file) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                other => other?,
            },
            CleanupJob::DetachLoop(device) => host.loop_detach(device)?,
            CleanupJob::RemoveDm(name) => host.dm_remove(name)?,
        }
        Ok(())
    }
}

impl fmt::Display for CleanupJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupJob::RemoveDir(p) => write!(f, "remove directory {}", p.display()),
            CleanupJob::RemoveFile(p) => write!(f, "remove file {}", p.display()),
            CleanupJob::RemoveFileIfExists(p) => write!(f, "remove file {} (if present)", p.display()),
            CleanupJob::DetachLoop(p) => write!(f, "detach loop device {}", p.display()),
            CleanupJob::RemoveDm(name) => write!(f, "remove device-mapper node {}", name),
        }
    }
}

/// What an unwind did.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Jobs executed, in execution order.
    pub ran: Vec<CleanupJob>,
    /// Jobs that failed, with the failure message.
    pub failed: Vec<(CleanupJob, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// LIFO stack of cleanup jobs.
#[derive(Debug, Default)]
pub struct CleanupStack {
    jobs: Vec<CleanupJob>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the undo action for a resource that now exists.
    pub fn push(&mut self, job: CleanupJob) {
        tracing::debug!(%job, depth = self.jobs.len() + 1, "registered cleanup job");
        self.jobs.push(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Pending jobs, oldest first.
    pub fn jobs(&self) -> &[CleanupJob] {
        &self.jobs
    }

    /// Take every pending job, leaving the stack empty.
    ///
    /// Lets a caller release a lock before running the (slow) jobs.
    pub fn drain(&mut self) -> Vec<CleanupJob> {
        std::mem::take(&mut self.jobs)
    }

    /// Pop and run every job, newest first.
    ///
    /// Failures are logged and recorded, never raised, and never stop the
    /// remaining jobs. Calling this on an empty stack is a no-op.
    pub fn run_all(&mut self, host: &dyn Host) -> CleanupReport {
        unwind(self.drain(), host)
    }
}

/// Run `jobs` in reverse order, collecting failures.
pub fn unwind(mut jobs: Vec<CleanupJob>, host: &dyn Host) -> CleanupReport {
    let mut report = CleanupReport::default();

    while let Some(job) = jobs.pop() {
        match job.run(host) {
            Ok(()) => tracing::debug!(%job, "cleanup job done"),
            Err(e) => {
                tracing::warn!(%job, error = %e, "cleanup job failed");
                report.failed.push((job.clone(), e.to_string()));
            }
        }
        report.ran.push(job);
    }

    report
}
