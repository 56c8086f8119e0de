//! Error taxonomy shared by enumeration, resolution, dispatch and reset

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Process exit status for a fully successful run
pub const EXIT_OK: i32 = 0;
/// An operation was attempted but failed
pub const EXIT_FAILED: i32 = 1;
/// Target and mode cannot be combined, or a target could not be parsed
pub const EXIT_INVALID_ARGUMENT: i32 = 2;
/// No enumerated device or hub matched the target
pub const EXIT_NOT_FOUND: i32 = 3;
/// Unbind succeeded but bind did not; the branch is left powered off
pub const EXIT_PARTIAL_RESET: i32 = 4;

#[derive(Debug, Error)]
pub enum ResetError {
    #[error("{what} not found")]
    NotFound { what: String, path: Option<PathBuf> },

    #[error("permission denied while trying to {op} {path}: {source}")]
    Permission {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} is busy (held by another process or driver)")]
    Busy { path: PathBuf },

    #[error("failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unbound {path} but bind failed, the device stays unbound until '{id}' is written to {bind_file}: {source}")]
    PartialReset {
        path: PathBuf,
        id: String,
        bind_file: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, ResetError>;

impl ResetError {
    /// Classify an I/O failure on `path` into the taxonomy.
    pub fn from_io(op: &'static str, path: &Path, source: io::Error) -> Self {
        let path = path.to_path_buf();
        match source.kind() {
            io::ErrorKind::PermissionDenied => ResetError::Permission { op, path, source },
            io::ErrorKind::ResourceBusy | io::ErrorKind::WouldBlock => ResetError::Busy { path },
            io::ErrorKind::NotFound => ResetError::NotFound {
                what: path.display().to_string(),
                path: Some(path),
            },
            _ => ResetError::Io { op, path, source },
        }
    }

    /// `what` names the missing thing relative to `path`, e.g. "parent hub of".
    pub fn not_found(what: &str, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        ResetError::NotFound {
            what: format!("{} {}", what, path.display()),
            path: Some(path),
        }
    }

    /// Nothing in the snapshot matched `target`.
    pub fn no_match(target: impl std::fmt::Display) -> Self {
        ResetError::NotFound {
            what: format!("device matching {}", target),
            path: None,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        ResetError::InvalidArgument(msg.into())
    }

    /// Path the failure refers to, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            ResetError::NotFound { path, .. } => path.as_deref(),
            ResetError::Permission { path, .. }
            | ResetError::Busy { path }
            | ResetError::Io { path, .. }
            | ResetError::PartialReset { path, .. } => Some(path),
            ResetError::InvalidArgument(_) => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ResetError::NotFound { .. } => EXIT_NOT_FOUND,
            ResetError::InvalidArgument(_) => EXIT_INVALID_ARGUMENT,
            ResetError::PartialReset { .. } => EXIT_PARTIAL_RESET,
            ResetError::Permission { .. } | ResetError::Busy { .. } | ResetError::Io { .. } => {
                EXIT_FAILED
            }
        }
    }
}
