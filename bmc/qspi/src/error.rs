// Licensed under the Apache-2.0 license

use crate::version::VersionError;
use flash_layout::{LayoutError, PartitionId};
use nix::errno::Errno;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QspiError {
    #[error("{op} failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: Errno,
    },
    #[error("erase of block 0x{offset:x} failed: {source}")]
    Erase {
        offset: u32,
        #[source]
        source: Errno,
    },
    #[error("{}: {source}", .path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{op} {}: {source}", .path.display())]
    Mount {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: Errno,
    },
    #[error("verify failed for partition {partition} at offset 0x{offset:x}")]
    Verify { partition: PartitionId, offset: u32 },
    #[error("{what} is {len} bytes, limit is {limit}")]
    Size {
        what: String,
        len: usize,
        limit: usize,
    },
    #[error("range 0x{offset:x}+0x{len:x} is outside the 0x{device_size:x} byte device")]
    OutOfRange {
        offset: u64,
        len: u64,
        device_size: u32,
    },
    #[error("env CRC mismatch: stored 0x{stored:08x}, computed 0x{computed:08x}")]
    EnvCrc { stored: u32, computed: u32 },
    #[error("invalid env entry {0:?}")]
    EnvFormat(String),
    #[error("mount inconsistency: {0}")]
    MountInconsistency(String),
    #[error("{0} is mounted or attached, unmount required")]
    UnmountRequired(String),
    #[error("volume container is not UBI formatted")]
    NotFormatted,
    #[error("volume: {0}")]
    Volume(String),
    #[error("MTD partition {0:?} not found")]
    MtdNotFound(String),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Version(#[from] VersionError),
}

pub type QspiResult<T> = Result<T, QspiError>;

impl QspiError {
    pub(crate) fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        QspiError::File {
            path: path.into(),
            source,
        }
    }
}
