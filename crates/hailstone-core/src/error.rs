//! Error types for planning, dispatch and persistence.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for hailstone operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Closed set of I/O outcome kinds.
///
/// File and mapping failures are reported through this taxonomy so callers
/// never branch on platform error codes. Success is `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoKind {
    /// Permission denied or the resource is locked.
    BadAccess,
    /// A mapped pointer was null or otherwise unusable.
    BadAddress,
    /// A mapped pointer or region violated a required alignment.
    BadAlignment,
    /// File contents could not be read, written or understood.
    BadFile,
    /// An offset fell outside the region it refers to.
    BadOffset,
    /// The path is malformed, a directory, or already taken.
    BadPath,
    /// Truncated data or a size that does not fit.
    BadSize,
    /// The file or directory does not exist.
    NotFound,
    /// Allocation failed.
    OutOfMemory,
}

impl IoKind {
    /// Classifies a standard I/O error.
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => IoKind::NotFound,
            io::ErrorKind::PermissionDenied | io::ErrorKind::WouldBlock => IoKind::BadAccess,
            io::ErrorKind::OutOfMemory => IoKind::OutOfMemory,
            io::ErrorKind::UnexpectedEof | io::ErrorKind::WriteZero => IoKind::BadSize,
            io::ErrorKind::InvalidInput | io::ErrorKind::AlreadyExists => IoKind::BadPath,
            _ => IoKind::BadFile,
        }
    }

    /// Stable lowercase name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            IoKind::BadAccess => "bad_access",
            IoKind::BadAddress => "bad_address",
            IoKind::BadAlignment => "bad_alignment",
            IoKind::BadFile => "bad_file",
            IoKind::BadOffset => "bad_offset",
            IoKind::BadPath => "bad_path",
            IoKind::BadSize => "bad_size",
            IoKind::NotFound => "not_found",
            IoKind::OutOfMemory => "out_of_memory",
        }
    }
}

impl fmt::Display for IoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hailstone error types.
#[derive(Debug, Error)]
pub enum Error {
    /// The device cannot host a viable plan.
    #[error("planning failed: {0}")]
    Planning(String),

    /// Fewer than two slots fit the budget.
    #[error("insufficient slots: {available} fit the budget, at least 2 are required")]
    InsufficientSlots { available: u64 },

    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Device bootstrap or resource creation failed.
    #[error("device error: {0}")]
    Device(String),

    /// Queue submission failed.
    #[error("submission failed for slot {slot}: {message}")]
    Submission { slot: usize, message: String },

    /// Waiting on a slot failed.
    #[error("wait failed for slot {slot}: {message}")]
    Wait { slot: usize, message: String },

    /// Device output disagrees with the host reference.
    #[error("validation mismatch at {value}: device reported {device}, host computed {host}")]
    Validation { value: u128, device: u16, host: u16 },

    /// The search cursor would leave 128-bit range.
    #[error("search space exhausted at {0}")]
    Exhausted(u128),

    /// Checkpoint could not be read or written.
    #[error("checkpoint {kind} at {}: {message}", path.display())]
    Checkpoint {
        kind: IoKind,
        path: PathBuf,
        message: String,
    },

    /// Checkpoint contents are structurally invalid.
    #[error("corrupted checkpoint: {0}")]
    CorruptedCheckpoint(String),

    /// Pipeline cache could not be read or written.
    #[error("pipeline cache {kind}: {message}")]
    PipelineCache { kind: IoKind, message: String },

    /// Shader source could not be compiled or loaded.
    #[error("shader error: {0}")]
    Shader(String),

    /// Generic classified I/O failure.
    #[error("I/O {kind}: {message}")]
    Io { kind: IoKind, message: String },

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io {
            kind: IoKind::classify(&err),
            message: err.to_string(),
        }
    }
}

impl Error {
    /// Create a planning error.
    pub fn planning(message: impl Into<String>) -> Self {
        Error::Planning(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Create a device error.
    pub fn device(message: impl Into<String>) -> Self {
        Error::Device(message.into())
    }

    /// Create a submission error for a slot.
    pub fn submission(slot: usize, message: impl fmt::Display) -> Self {
        Error::Submission {
            slot,
            message: message.to_string(),
        }
    }

    /// Create a wait error for a slot.
    pub fn wait(slot: usize, message: impl fmt::Display) -> Self {
        Error::Wait {
            slot,
            message: message.to_string(),
        }
    }

    /// Create a classified I/O error with a custom message.
    pub fn io(kind: IoKind, message: impl Into<String>) -> Self {
        Error::Io {
            kind,
            message: message.into(),
        }
    }

    /// Wrap an I/O error raised while touching a checkpoint file.
    pub fn checkpoint(path: impl Into<PathBuf>, err: &io::Error) -> Self {
        Error::Checkpoint {
            kind: IoKind::classify(err),
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Wrap an I/O error raised while touching the pipeline cache.
    pub fn pipeline_cache(err: &io::Error) -> Self {
        Error::PipelineCache {
            kind: IoKind::classify(err),
            message: err.to_string(),
        }
    }

    /// Returns the I/O kind if this error carries one.
    pub fn io_kind(&self) -> Option<IoKind> {
        match self {
            Error::Checkpoint { kind, .. }
            | Error::PipelineCache { kind, .. }
            | Error::Io { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Check if this error must abort the search.
    ///
    /// Checkpoint and pipeline-cache failures are logged and the run
    /// continues; everything else terminates it.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Checkpoint { .. } | Error::CorruptedCheckpoint(_) | Error::PipelineCache { .. }
        )
    }

    /// Check if the error happened before any GPU object existed.
    pub fn is_planning(&self) -> bool {
        matches!(
            self,
            Error::Planning(_) | Error::InsufficientSlots { .. } | Error::Config(_)
        )
    }

    /// Get error category for logs and reports.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Planning(_) => "planning",
            Error::InsufficientSlots { .. } => "insufficient_slots",
            Error::Config(_) => "config",
            Error::Device(_) => "device",
            Error::Submission { .. } => "submission",
            Error::Wait { .. } => "wait",
            Error::Validation { .. } => "validation",
            Error::Exhausted(_) => "exhausted",
            Error::Checkpoint { .. } => "checkpoint",
            Error::CorruptedCheckpoint(_) => "corrupted_checkpoint",
            Error::PipelineCache { .. } => "pipeline_cache",
            Error::Shader(_) => "shader",
            Error::Io { .. } => "io",
            Error::Json(_) => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_kind_classification() {
        let not_found = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(IoKind::classify(&not_found), IoKind::NotFound);

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(IoKind::classify(&denied), IoKind::BadAccess);

        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "short");
        assert_eq!(IoKind::classify(&eof), IoKind::BadSize);

        let other = io::Error::other("weird");
        assert_eq!(IoKind::classify(&other), IoKind::BadFile);
    }

    #[test]
    fn test_fatality() {
        let err = Error::checkpoint("state.json", &io::Error::other("disk full"));
        assert!(!err.is_fatal());
        assert_eq!(err.io_kind(), Some(IoKind::BadFile));

        assert!(Error::submission(1, "device lost").is_fatal());
        assert!(Error::InsufficientSlots { available: 1 }.is_planning());
    }

    #[test]
    fn test_from_io_error() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        assert_eq!(err.category(), "io");
        assert_eq!(err.io_kind(), Some(IoKind::NotFound));
    }
}
