// Licensed under the Apache-2.0 license
#![allow(dead_code)]

use log::LevelFilter;
use nix::errno::Errno;
use qspi::error::QspiError;
use qspi::{MountOps, MountOrchestrator, QspiResult, VolumeControl};
use simple_logger::SimpleLogger;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEVICE: &str = "/dev/ubi0_0";
pub const MACHINE: &str = "platina-mk1-bmc";

pub fn init_logger() {
    let _ = SimpleLogger::new().with_level(LevelFilter::Debug).init();
}

/// In-memory mount table. Bind mounts inherit the device of the mount
/// holding their source.
#[derive(Default)]
pub struct FakeMounts {
    pub table: BTreeMap<PathBuf, String>,
    pub log: Vec<String>,
}

impl FakeMounts {
    pub fn with(mounts: &[(PathBuf, &str)]) -> Self {
        Self {
            table: mounts
                .iter()
                .map(|(mp, dev)| (mp.clone(), dev.to_string()))
                .collect(),
            log: Vec::new(),
        }
    }
}

impl MountOps for FakeMounts {
    fn backing_device(&self, mountpoint: &Path) -> QspiResult<Option<String>> {
        Ok(self.table.get(mountpoint).cloned())
    }

    fn mount(
        &mut self,
        source: &Path,
        target: &Path,
        _fstype: Option<&str>,
        bind: bool,
    ) -> QspiResult<()> {
        let dev = if bind {
            self.table
                .iter()
                .filter(|(mp, _)| source.starts_with(mp))
                .max_by_key(|(mp, _)| mp.as_os_str().len())
                .map(|(_, dev)| dev.clone())
                .unwrap_or_else(|| "rootfs".into())
        } else {
            source.display().to_string()
        };
        self.log
            .push(format!("mount {} {}", source.display(), target.display()));
        self.table.insert(target.to_path_buf(), dev);
        Ok(())
    }

    fn unmount(&mut self, target: &Path) -> QspiResult<()> {
        if self.table.remove(target).is_none() {
            return Err(QspiError::Mount {
                op: "umount",
                path: target.to_path_buf(),
                source: Errno::EINVAL,
            });
        }
        self.log.push(format!("umount {}", target.display()));
        Ok(())
    }
}

/// UBI stand-in. Attaching an erased container formats it, as the kernel
/// does.
pub struct FakeVolumes {
    pub formatted: bool,
    pub attached: bool,
    pub volumes: Vec<String>,
    pub available: u64,
    pub log: Vec<String>,
}

impl FakeVolumes {
    pub fn new(formatted: bool, attached: bool) -> Self {
        Self {
            formatted,
            attached,
            volumes: if formatted {
                vec!["perm".into()]
            } else {
                Vec::new()
            },
            available: 118 * 0x1_0000,
            log: Vec::new(),
        }
    }
}

impl VolumeControl for FakeVolumes {
    fn is_formatted(&self) -> QspiResult<bool> {
        Ok(self.formatted)
    }

    fn is_attached(&self) -> QspiResult<bool> {
        Ok(self.attached)
    }

    fn attach(&mut self) -> QspiResult<()> {
        if self.attached {
            return Err(QspiError::Ioctl {
                op: "UBI_IOCATT",
                source: Errno::EEXIST,
            });
        }
        self.attached = true;
        self.formatted = true;
        self.log.push("attach".into());
        Ok(())
    }

    fn detach(&mut self) -> QspiResult<()> {
        if !self.attached {
            return Err(QspiError::Ioctl {
                op: "UBI_IOCDET",
                source: Errno::EINVAL,
            });
        }
        self.attached = false;
        self.log.push("detach".into());
        Ok(())
    }

    fn find_volume(&self, name: &str) -> QspiResult<Option<PathBuf>> {
        if !self.attached {
            return Ok(None);
        }
        Ok(self
            .volumes
            .iter()
            .position(|v| v == name)
            .map(|i| PathBuf::from(format!("/dev/ubi0_{i}"))))
    }

    fn available_bytes(&self) -> QspiResult<u64> {
        Ok(self.available)
    }

    fn create_volume(&mut self, name: &str, bytes: u64) -> QspiResult<()> {
        self.volumes.push(name.into());
        self.log.push(format!("mkvol {name} {bytes}"));
        Ok(())
    }
}

/// Scratch root with live `/boot` and `/etc` trees.
pub fn scratch_root() -> tempfile::TempDir {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir_all(root.path().join("boot")).unwrap();
    fs::create_dir_all(root.path().join("etc")).unwrap();
    fs::write(root.path().join("etc/hostname"), "bmc").unwrap();
    root
}

/// Mount table of a fully mounted volume layout under `root`.
pub fn volume_mounts(root: &Path) -> FakeMounts {
    FakeMounts::with(&[
        (root.join("perm"), DEVICE),
        (root.join("etc"), DEVICE),
        (root.join("boot"), DEVICE),
    ])
}

pub fn orchestrator(
    root: &Path,
    mounts: FakeMounts,
    volumes: FakeVolumes,
) -> MountOrchestrator<FakeMounts, FakeVolumes> {
    MountOrchestrator::new(mounts, volumes, root, DEVICE, MACHINE)
}
