//! Error types for medium snapshotting.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for snapdisk operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while classifying, snapshotting or tearing down a medium.
#[derive(Error, Debug)]
pub enum Error {
    /// The medium kind is understood but not supported (e.g. a non-root directory).
    #[error("Unsupported medium `{}': {reason}", .path.display())]
    UnsupportedMedium { path: PathBuf, reason: String },

    /// The medium is not a directory, regular file or block device.
    #[error("Invalid medium `{}': {reason}", .path.display())]
    InvalidMedium { path: PathBuf, reason: String },

    /// No writable location is available for temporary files.
    #[error("No writable temporary directory found among: {candidates}")]
    NoCandidate { candidates: String },

    /// A privileged helper exited with a non-zero status.
    #[error("'{program}' failed (exit code {code}){}", stderr_suffix(.stderr))]
    ExternalTool {
        program: String,
        code: i32,
        stderr: String,
    },

    /// A detach/remove call found the device in use. Retried before escalation.
    #[error("'{program}' reports device busy: {stderr}")]
    Busy { program: String, stderr: String },

    /// A live image handle already owns this device.
    #[error("Device `{}' already has a live image handle", .0.display())]
    DeviceInUse(PathBuf),

    /// The image handle is not (or no longer) registered.
    #[error("Image handle #{0} is not registered")]
    UnknownImage(u64),

    /// The manager is tearing down and accepts no new allocations.
    #[error("Disk is shutting down")]
    ShuttingDown,

    /// The host bundling collaborator failed.
    #[error("Host bundling failed: {0}")]
    Bundle(String),

    /// Output of a helper could not be understood.
    #[error("Cannot parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true for failures worth retrying (device busy).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Busy { .. })
    }
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(":\n{}", stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_tool_message_includes_stderr() {
        let err = Error::ExternalTool {
            program: "dmsetup".into(),
            code: 1,
            stderr: "device-mapper: create ioctl failed".into(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("'dmsetup' failed (exit code 1)"));
        assert!(msg.contains("create ioctl failed"));
    }

    #[test]
    fn test_external_tool_message_without_stderr() {
        let err = Error::ExternalTool {
            program: "losetup".into(),
            code: 2,
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "'losetup' failed (exit code 2)");
    }

    #[test]
    fn test_only_busy_is_transient() {
        let busy = Error::Busy {
            program: "losetup".into(),
            stderr: "Device or resource busy".into(),
        };
        assert!(busy.is_transient());
        assert!(!Error::ShuttingDown.is_transient());
    }
}
