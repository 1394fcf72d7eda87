// Licensed under the Apache-2.0 license

use crate::error::{QspiError, QspiResult};
use crate::mount::MountOps;
use nix::mount::{mount, umount, MsFlags};
use std::path::{Path, PathBuf};

/// The kernel mount table, read from `/proc/mounts`.
pub struct SystemMounts {
    table: PathBuf,
}

impl SystemMounts {
    pub fn new() -> Self {
        Self::with_table("/proc/mounts")
    }

    pub fn with_table(table: impl Into<PathBuf>) -> Self {
        Self {
            table: table.into(),
        }
    }
}

impl Default for SystemMounts {
    fn default() -> Self {
        Self::new()
    }
}

/// Finds the device mounted on `mountpoint` in a `/proc/mounts` listing.
/// The last matching line wins, as later mounts shadow earlier ones.
pub fn find_mount(table: &str, mountpoint: &Path) -> Option<String> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let dev = fields.next()?;
            let mp = fields.next()?;
            (Path::new(mp) == mountpoint).then(|| dev.to_string())
        })
        .last()
}

impl MountOps for SystemMounts {
    fn backing_device(&self, mountpoint: &Path) -> QspiResult<Option<String>> {
        let table =
            std::fs::read_to_string(&self.table).map_err(|e| QspiError::file(&self.table, e))?;
        Ok(find_mount(&table, mountpoint))
    }

    fn mount(
        &mut self,
        source: &Path,
        target: &Path,
        fstype: Option<&str>,
        bind: bool,
    ) -> QspiResult<()> {
        let flags = if bind {
            MsFlags::MS_BIND
        } else {
            MsFlags::empty()
        };
        mount(Some(source), target, fstype, flags, None::<&str>).map_err(|source| {
            QspiError::Mount {
                op: "mount",
                path: target.to_path_buf(),
                source,
            }
        })
    }

    fn unmount(&mut self, target: &Path) -> QspiResult<()> {
        umount(target).map_err(|source| QspiError::Mount {
            op: "umount",
            path: target.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "rootfs / rootfs rw 0 0
/dev/ubi0_0 /perm ubifs rw,relatime 0 0
/dev/ubi0_0 /etc ubifs rw,relatime 0 0
tmpfs /tmp tmpfs rw 0 0
";

    #[test]
    fn test_find_mount() {
        assert_eq!(
            find_mount(MOUNTS, Path::new("/perm")).as_deref(),
            Some("/dev/ubi0_0")
        );
        assert_eq!(
            find_mount(MOUNTS, Path::new("/etc")).as_deref(),
            Some("/dev/ubi0_0")
        );
        assert_eq!(find_mount(MOUNTS, Path::new("/boot")), None);
    }

    #[test]
    fn test_backing_device_from_table() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("mounts");
        std::fs::write(&table, MOUNTS).unwrap();
        let mounts = SystemMounts::with_table(&table);
        assert_eq!(
            mounts.backing_device(Path::new("/tmp")).unwrap().as_deref(),
            Some("tmpfs")
        );
    }
}
