use std::{io, path::Path, path::PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RemoteError>;

#[derive(Error, Debug)]
pub enum RemoteError {
    /// The session could not be established, or could not be
    /// re-established after a connectivity failure.
    #[error("Connection error: {0}")]
    Connection(String),
    /// A single connectivity failure on a live channel. Absorbed by the
    /// retry wrapper; callers only see it if the retry failed as well.
    #[error("Connection lost: {0}")]
    Disconnected(String),
    #[error("Path not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),
    #[error("Path already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
    /// The local and remote entries disagree on their kind, or an entry
    /// occupies a role it cannot fill (e.g. a file where a directory is
    /// needed).
    #[error("Conflicting entries: {0}")]
    Conflict(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RemoteError {
    /// Classify a raw IO error against the path the operation touched.
    ///
    /// Semantic errors become their typed variants, errors that indicate a
    /// broken or stale connection become [`RemoteError::Disconnected`], and
    /// everything else stays a plain IO error.
    pub fn from_io(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => {
                Self::PermissionDenied(path.to_path_buf())
            }
            io::ErrorKind::AlreadyExists => {
                Self::AlreadyExists(path.to_path_buf())
            }
            kind if is_connectivity_kind(kind) => {
                Self::Disconnected(err.to_string())
            }
            _ => Self::Io(err),
        }
    }

    /// Return true if the error is attributable to a broken or stale
    /// connection, as opposed to a semantic filesystem error.
    ///
    /// Only these errors are eligible for the retry-on-disconnect policy.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Self::Disconnected(_) => true,
            Self::Io(err) => is_connectivity_kind(err.kind()),
            _ => false,
        }
    }
}

fn is_connectivity_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}
