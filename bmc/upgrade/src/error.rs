// Licensed under the Apache-2.0 license

use qspi::{QspiError, VersionError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error("download failed: {0}")]
    Download(String),
    #[error("archive is {len} bytes, expected at least {min}")]
    ArchiveTooSmall { len: u64, min: u64 },
    #[error("bad archive: {0}")]
    Archive(String),
    #[error("package has no volume support, use --legacy to downgrade to legacy versions")]
    UnsupportedDowngrade,
    #[error("volume is not mounted, run flashselect --mount first")]
    NotMounted,
    #[error("config {}: {message}", .path.display())]
    Config { path: PathBuf, message: String },
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid unit number {0}")]
    InvalidUnit(u8),
    #[error(transparent)]
    Qspi(#[from] QspiError),
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error("upgrade state machine stopped in state {0}")]
    StateMachine(String),
}

pub type UpgradeResult<T> = Result<T, UpgradeError>;

impl UpgradeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        UpgradeError::Io {
            path: path.into(),
            source,
        }
    }
}
