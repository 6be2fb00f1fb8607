//! Error taxonomy shared by the backup store, restart runner and console.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::models::RestartPhase;

#[derive(Debug, Error)]
pub enum KeeperError {
    /// The source file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A destination (backup or tracked file) could not be written.
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The safety copy taken before an overwrite failed; nothing was written.
    #[error("backup failed, target left untouched: {0}")]
    BackupFailed(#[source] Box<KeeperError>),

    /// The backup succeeded but the new content could not be written.
    #[error("write failed after backup {backup}: {source}")]
    WriteFailed {
        backup: String,
        #[source]
        source: Box<KeeperError>,
    },

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error("stop phase failed ({reason})\n{output}")]
    StopPhaseFailed { reason: String, output: String },

    #[error("start phase failed ({reason})\n{output}")]
    StartPhaseFailed { reason: String, output: String },

    /// A path resolved outside the configured root, or into a backup folder.
    #[error("invalid path {0:?}")]
    PathInvalid(String),

    #[error("no orchestration command available: {0}")]
    CommandUnavailable(String),

    #[error("not authenticated")]
    Unauthenticated,

    #[error("{0} is not an admin")]
    Forbidden(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("config error: {0}")]
    Config(String),
}

impl KeeperError {
    pub fn read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    pub fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }

    pub fn phase_failed(phase: RestartPhase, reason: String, output: String) -> Self {
        match phase {
            RestartPhase::Stop => Self::StopPhaseFailed { reason, output },
            RestartPhase::Start => Self::StartPhaseFailed { reason, output },
        }
    }
}

pub type Result<T> = std::result::Result<T, KeeperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_failure_keeps_output_in_message() {
        let err = KeeperError::phase_failed(
            RestartPhase::Stop,
            "exit status 1".into(),
            "network busy".into(),
        );
        assert!(matches!(err, KeeperError::StopPhaseFailed { .. }));
        let text = err.to_string();
        assert!(text.contains("exit status 1"));
        assert!(text.contains("network busy"));
    }

    #[test]
    fn backup_failed_wraps_cause() {
        let inner = KeeperError::read("a.yml", io::Error::from(io::ErrorKind::NotFound));
        let err = KeeperError::BackupFailed(Box::new(inner));
        assert!(err.to_string().contains("a.yml"));
    }
}
