// Licensed under the Apache-2.0 license

//! UBI control through the kernel ioctl interface and sysfs.

use crate::error::{QspiError, QspiResult};
use crate::mount::VolumeControl;
use log::debug;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

const UBI_MAGIC: &[u8; 4] = b"UBI#";
const UBI_DEV_NUM: i32 = 0;
const UBI_VOL_NUM_AUTO: i32 = -1;
const UBI_DYNAMIC_VOLUME: i8 = 3;
const UBI_MAX_VOLUME_NAME: usize = 127;

/// `struct ubi_attach_req` from `mtd/ubi-user.h`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct UbiAttachReq {
    pub ubi_num: i32,
    pub mtd_num: i32,
    pub vid_hdr_offset: i32,
    pub max_beb_per1024: i16,
    pub disable_fm: i8,
    pub need_resv_pool: i8,
    pub padding: [u8; 8],
}

/// `struct ubi_mkvol_req` from `mtd/ubi-user.h`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct UbiMkvolReq {
    pub vol_id: i32,
    pub alignment: i32,
    pub bytes: i64,
    pub vol_type: i8,
    pub flags: u8,
    pub name_len: i16,
    pub padding2: [u8; 4],
    pub name: [u8; UBI_MAX_VOLUME_NAME + 1],
}

nix::ioctl_write_ptr!(ubi_attach, b'o', 64, UbiAttachReq);
nix::ioctl_write_ptr!(ubi_detach, b'o', 65, i32);
nix::ioctl_write_ptr!(ubi_mkvol, b'o', 0, UbiMkvolReq);

/// UBI device 0 built on one MTD partition.
pub struct UbiControl {
    mtd_unit: u32,
    container: PathBuf,
    ctrl: PathBuf,
    device: PathBuf,
    sysfs: PathBuf,
    attached_marker: PathBuf,
}

impl UbiControl {
    pub fn new(mtd_unit: u32, container: impl Into<PathBuf>) -> Self {
        Self {
            mtd_unit,
            container: container.into(),
            ctrl: PathBuf::from("/dev/ubi_ctrl"),
            device: PathBuf::from("/dev/ubi0"),
            sysfs: PathBuf::from("/sys/class/ubi/ubi0"),
            attached_marker: PathBuf::from("/sys/devices/virtual/ubi/ubi0"),
        }
    }

    /// Overrides the control and sysfs locations.
    pub fn with_paths(
        mut self,
        ctrl: impl Into<PathBuf>,
        device: impl Into<PathBuf>,
        sysfs: impl Into<PathBuf>,
        attached_marker: impl Into<PathBuf>,
    ) -> Self {
        self.ctrl = ctrl.into();
        self.device = device.into();
        self.sysfs = sysfs.into();
        self.attached_marker = attached_marker.into();
        self
    }

    fn open(path: &Path) -> QspiResult<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| QspiError::file(path, e))
    }

    fn read_sysfs_u64(&self, name: &str) -> QspiResult<u64> {
        let path = self.sysfs.join(name);
        let text = fs::read_to_string(&path).map_err(|e| QspiError::file(&path, e))?;
        text.trim()
            .parse()
            .map_err(|_| QspiError::Volume(format!("{}: bad value {:?}", path.display(), text)))
    }
}

impl VolumeControl for UbiControl {
    fn is_formatted(&self) -> QspiResult<bool> {
        let mut file =
            File::open(&self.container).map_err(|e| QspiError::file(&self.container, e))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .map_err(|e| QspiError::file(&self.container, e))?;
        Ok(&magic == UBI_MAGIC)
    }

    fn is_attached(&self) -> QspiResult<bool> {
        match fs::metadata(&self.attached_marker) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(QspiError::file(&self.attached_marker, e)),
        }
    }

    fn attach(&mut self) -> QspiResult<()> {
        let ctrl = Self::open(&self.ctrl)?;
        let mut req = UbiAttachReq::new_zeroed();
        req.ubi_num = UBI_DEV_NUM;
        req.mtd_num = self.mtd_unit as i32;
        debug!("Attaching mtd{} as ubi{}", self.mtd_unit, UBI_DEV_NUM);
        // SAFETY: `req` matches the kernel's ubi_attach_req layout.
        unsafe { ubi_attach(ctrl.as_raw_fd(), &req) }.map_err(|source| QspiError::Ioctl {
            op: "UBI_IOCATT",
            source,
        })?;
        Ok(())
    }

    fn detach(&mut self) -> QspiResult<()> {
        let ctrl = Self::open(&self.ctrl)?;
        let num = UBI_DEV_NUM;
        // SAFETY: the request is a single i32.
        unsafe { ubi_detach(ctrl.as_raw_fd(), &num) }.map_err(|source| QspiError::Ioctl {
            op: "UBI_IOCDET",
            source,
        })?;
        Ok(())
    }

    fn find_volume(&self, name: &str) -> QspiResult<Option<PathBuf>> {
        let entries = match fs::read_dir(&self.sysfs) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(QspiError::file(&self.sysfs, e)),
        };
        let prefix = format!("ubi{UBI_DEV_NUM}_");
        for entry in entries {
            let entry = entry.map_err(|e| QspiError::file(&self.sysfs, e))?;
            let dir = entry.file_name().to_string_lossy().into_owned();
            if !dir.starts_with(&prefix) {
                continue;
            }
            let name_path = entry.path().join("name");
            let vol_name =
                fs::read_to_string(&name_path).map_err(|e| QspiError::file(&name_path, e))?;
            if vol_name.trim_end() == name {
                return Ok(Some(PathBuf::from("/dev").join(dir)));
            }
        }
        Ok(None)
    }

    fn available_bytes(&self) -> QspiResult<u64> {
        Ok(self.read_sysfs_u64("avail_eraseblocks")? * self.read_sysfs_u64("eraseblock_size")?)
    }

    fn create_volume(&mut self, name: &str, bytes: u64) -> QspiResult<()> {
        if name.len() > UBI_MAX_VOLUME_NAME {
            return Err(QspiError::Size {
                what: "volume name".into(),
                len: name.len(),
                limit: UBI_MAX_VOLUME_NAME,
            });
        }
        let mut req = UbiMkvolReq::new_zeroed();
        req.vol_id = UBI_VOL_NUM_AUTO;
        req.alignment = 1;
        req.bytes = bytes as i64;
        req.vol_type = UBI_DYNAMIC_VOLUME;
        req.name_len = name.len() as i16;
        req.name[..name.len()].copy_from_slice(name.as_bytes());

        let dev = Self::open(&self.device)?;
        // SAFETY: `req` matches the kernel's ubi_mkvol_req layout.
        unsafe { ubi_mkvol(dev.as_raw_fd(), &req) }.map_err(|source| QspiError::Ioctl {
            op: "UBI_IOCMKVOL",
            source,
        })?;
        Ok(())
    }
}
