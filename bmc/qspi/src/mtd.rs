// Licensed under the Apache-2.0 license

//! Linux MTD character device backend.

use crate::device::{check_range, FlashDevice, FlashInfo};
use crate::error::{QspiError, QspiResult};
use log::debug;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

/// `struct mtd_info_user` from `mtd/mtd-abi.h`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MtdInfoUser {
    pub type_: u8,
    pub _pad: [u8; 3],
    pub flags: u32,
    pub size: u32,
    pub erasesize: u32,
    pub writesize: u32,
    pub oobsize: u32,
    pub padding: u64,
}

/// `struct erase_info_user` from `mtd/mtd-abi.h`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EraseInfoUser {
    pub start: u32,
    pub length: u32,
}

nix::ioctl_read!(mem_get_info, b'M', 1, MtdInfoUser);
nix::ioctl_write_ptr!(mem_erase, b'M', 2, EraseInfoUser);

pub struct MtdFlash {
    path: PathBuf,
    file: File,
    info: FlashInfo,
}

impl MtdFlash {
    pub fn open(path: impl AsRef<Path>) -> QspiResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| QspiError::file(&path, e))?;

        let mut raw = MtdInfoUser::new_zeroed();
        // SAFETY: `raw` matches the kernel's mtd_info_user layout and lives
        // across the call.
        unsafe { mem_get_info(file.as_raw_fd(), &mut raw) }.map_err(|source| {
            QspiError::Ioctl {
                op: "MEMGETINFO",
                source,
            }
        })?;
        let info = FlashInfo {
            erase_block_size: raw.erasesize,
            total_size: raw.size,
        };
        debug!(
            "{}: size 0x{:x}, erase block 0x{:x}",
            path.display(),
            info.total_size,
            info.erase_block_size
        );
        Ok(Self { path, file, info })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FlashDevice for MtdFlash {
    fn info(&self) -> FlashInfo {
        self.info
    }

    fn erase_block(&mut self, offset: u32) -> QspiResult<()> {
        let req = EraseInfoUser {
            start: offset,
            length: self.info.erase_block_size,
        };
        // SAFETY: `req` matches the kernel's erase_info_user layout.
        unsafe { mem_erase(self.file.as_raw_fd(), &req) }
            .map_err(|source| QspiError::Erase { offset, source })?;
        Ok(())
    }

    fn read_range(&self, offset: u32, buf: &mut [u8]) -> QspiResult<()> {
        check_range(&self.info, offset.into(), buf.len() as u64)?;
        self.file
            .read_exact_at(buf, offset.into())
            .map_err(|e| QspiError::file(&self.path, e))
    }

    fn write_range(&mut self, offset: u32, data: &[u8]) -> QspiResult<()> {
        check_range(&self.info, offset.into(), data.len() as u64)?;
        self.file
            .write_all_at(data, offset.into())
            .map_err(|e| QspiError::file(&self.path, e))
    }
}

/// Finds the unit number of the MTD partition called `name` in a
/// `/proc/mtd` listing.
pub fn name_to_unit(proc_mtd: &str, name: &str) -> Option<u32> {
    proc_mtd.lines().find_map(|line| {
        let (dev, rest) = line.split_once(':')?;
        let label = rest.split_whitespace().nth(2)?.trim_matches('"');
        if label != name {
            return None;
        }
        dev.strip_prefix("mtd")?.parse().ok()
    })
}

/// Reads `proc_mtd` and resolves `name` to its `/dev/mtdN` path.
pub fn find_device(proc_mtd: &Path, name: &str) -> QspiResult<(u32, PathBuf)> {
    let listing =
        std::fs::read_to_string(proc_mtd).map_err(|e| QspiError::file(proc_mtd, e))?;
    let unit =
        name_to_unit(&listing, name).ok_or_else(|| QspiError::MtdNotFound(name.into()))?;
    Ok((unit, PathBuf::from(format!("/dev/mtd{unit}"))))
}
