// Licensed under the Apache-2.0 license
#![allow(dead_code)]

use flash_layout::{PartitionId, FLASH_SIZE};
use log::LevelFilter;
use qspi::ram::RamFlash;
use qspi::{
    image_file_name, EnvStore, FlashDevice, FlashInfo, ImageWriter, MountOps, MountOrchestrator,
    QspiError, QspiResult, VolumeControl,
};
use simple_logger::SimpleLogger;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use upgrade::{Backend, HttpSource, UpgradeConfig, UpgradeController, UpgradeOptions};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub const DEVICE: &str = "/dev/ubi0_0";
pub const MACHINE: &str = "platina-mk1-bmc";
pub const BLOCK: u32 = 0x10000;
pub const DEFAULT_ENV: [&str; 3] = [
    "baudrate=115200",
    "bootargs=console=ttymxc0,115200n8 ip=dhcp",
    "bootdelay=3",
];

pub type TestBackend = Backend<RamFlash, FakeMounts, FakeVolumes>;

pub fn init_logger() {
    let _ = SimpleLogger::new().with_level(LevelFilter::Debug).init();
}

pub fn file_name(id: PartitionId) -> String {
    image_file_name(MACHINE, id)
}

/// Boot loader image larger than the minimum archive size.
pub fn bootloader() -> Vec<u8> {
    (0..2048u32).map(|i| (i % 251) as u8).collect()
}

pub fn env_image() -> Vec<u8> {
    qspi::env::encode(&DEFAULT_ENV).unwrap()
}

/// Writes `<server>/<version>/<machine>.zip` holding `files`.
pub fn write_archive(server: &Path, version: &str, files: &[(String, Vec<u8>)]) {
    let dir = server.join(version);
    fs::create_dir_all(&dir).unwrap();
    let file = fs::File::create(dir.join(format!("{MACHINE}.zip"))).unwrap();
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o644);
    for (name, data) in files {
        zip.start_file(name.as_str(), options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

/// Package for the legacy layout: separate kernel and initramfs.
pub fn legacy_package(version: &str) -> Vec<(String, Vec<u8>)> {
    vec![
        (file_name(PartitionId::Bootloader), bootloader()),
        (file_name(PartitionId::DeviceTree), b"device-tree".to_vec()),
        (file_name(PartitionId::Env), env_image()),
        (file_name(PartitionId::Kernel), b"kernel".to_vec()),
        (file_name(PartitionId::Initramfs), b"initramfs".to_vec()),
        (file_name(PartitionId::PerUnit), b"dhcp\0".to_vec()),
        (file_name(PartitionId::Version), version.as_bytes().to_vec()),
    ]
}

/// Package with a combined image, optionally marked as volume capable.
pub fn volume_package(version: &str, marker: bool) -> Vec<(String, Vec<u8>)> {
    let mut files = vec![
        (file_name(PartitionId::Bootloader), bootloader()),
        (file_name(PartitionId::DeviceTree), b"device-tree".to_vec()),
        (file_name(PartitionId::Env), env_image()),
        (file_name(PartitionId::Image), b"itb-image".to_vec()),
        (file_name(PartitionId::PerUnit), b"dhcp\0".to_vec()),
        (file_name(PartitionId::Version), version.as_bytes().to_vec()),
    ];
    if marker {
        files.push((format!("{MACHINE}-v2"), Vec::new()));
    }
    files
}

/// Flash holding a legacy install of `version` with the default env.
pub fn legacy_flash(version: &str, per: &[u8]) -> RamFlash {
    let mut flash = RamFlash::new(BLOCK, FLASH_SIZE);
    EnvStore::new(&mut flash).store(&DEFAULT_ENV).unwrap();
    let mut writer = ImageWriter::new(&mut flash);
    writer
        .write_and_verify(Some(per), &PartitionId::PerUnit.partition())
        .unwrap();
    writer
        .write_and_verify(Some(version.as_bytes()), &PartitionId::Version.partition())
        .unwrap();
    flash.clear_erase_log();
    flash
}

/// Scratch root with `/boot`, `/etc`, a work directory and a package
/// server directory.
pub struct Scratch {
    pub root: tempfile::TempDir,
    pub server: tempfile::TempDir,
}

impl Scratch {
    pub fn setup() -> Self {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("boot")).unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(root.path().join("etc/hostname"), "bmc").unwrap();
        Self {
            root,
            server: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }

    pub fn boot_file(&self, id: PartitionId) -> PathBuf {
        self.path("boot").join(file_name(id))
    }

    pub fn work_dir(&self) -> PathBuf {
        self.path("work")
    }

    pub fn config(&self) -> UpgradeConfig {
        UpgradeConfig {
            root: self.root.path().to_path_buf(),
            work_dir: self.work_dir(),
            ..UpgradeConfig::default()
        }
    }

    pub fn options(&self, version: &str) -> UpgradeOptions {
        UpgradeOptions {
            server: format!("file://{}", self.server.path().display()),
            version: version.into(),
            ..UpgradeOptions::default()
        }
    }

    /// Mount table of a fully mounted volume layout.
    pub fn volume_mounts(&self) -> FakeMounts {
        FakeMounts::with(&[
            (self.path("perm"), DEVICE),
            (self.path("etc"), DEVICE),
            (self.path("boot"), DEVICE),
        ])
    }

    pub fn controller(
        &self,
        flash: RamFlash,
        mounts: FakeMounts,
        volumes: FakeVolumes,
    ) -> UpgradeController<TestBackend> {
        self.controller_with(flash, mounts, volumes)
    }

    pub fn controller_with<F: FlashDevice>(
        &self,
        flash: F,
        mounts: FakeMounts,
        volumes: FakeVolumes,
    ) -> UpgradeController<Backend<F, FakeMounts, FakeVolumes>> {
        let orchestrator =
            MountOrchestrator::new(mounts, volumes, self.root.path(), DEVICE, MACHINE);
        let backend = Backend {
            flash,
            orchestrator,
            source: Box::new(HttpSource::new(Duration::from_secs(5))),
        };
        UpgradeController::new(backend, self.config())
    }
}

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
        _bind: bool,
    ) -> QspiResult<()> {
        self.log
            .push(format!("mount {} {}", source.display(), target.display()));
        self.table.insert(target.to_path_buf(), DEVICE.into());
        Ok(())
    }

    fn unmount(&mut self, target: &Path) -> QspiResult<()> {
        self.table
            .remove(target)
            .ok_or_else(|| QspiError::Volume(format!("{} not mounted", target.display())))?;
        self.log.push(format!("umount {}", target.display()));
        Ok(())
    }
}

pub struct FakeVolumes {
    pub formatted: bool,
    pub attached: bool,
    pub log: Vec<String>,
}

impl FakeVolumes {
    pub fn new(formatted: bool, attached: bool) -> Self {
        Self {
            formatted,
            attached,
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
        self.attached = true;
        self.log.push("attach".into());
        Ok(())
    }

    fn detach(&mut self) -> QspiResult<()> {
        self.attached = false;
        self.log.push("detach".into());
        Ok(())
    }

    fn find_volume(&self, _name: &str) -> QspiResult<Option<PathBuf>> {
        Ok(self.attached.then(|| PathBuf::from(DEVICE)))
    }

    fn available_bytes(&self) -> QspiResult<u64> {
        Ok(0)
    }

    fn create_volume(&mut self, name: &str, _bytes: u64) -> QspiResult<()> {
        Err(QspiError::Volume(format!("unexpected mkvol {name}")))
    }
}

/// Flash with one bit stuck at zero, so programming `0xff` over it never
/// reads back.
pub struct StuckBitFlash {
    pub inner: RamFlash,
    pub offset: u32,
    pub mask: u8,
}

impl FlashDevice for StuckBitFlash {
    fn info(&self) -> FlashInfo {
        self.inner.info()
    }

    fn erase_block(&mut self, offset: u32) -> QspiResult<()> {
        self.inner.erase_block(offset)
    }

    fn read_range(&self, offset: u32, buf: &mut [u8]) -> QspiResult<()> {
        self.inner.read_range(offset, buf)?;
        if let Some(i) = self.offset.checked_sub(offset) {
            if let Some(b) = buf.get_mut(i as usize) {
                *b &= !self.mask;
            }
        }
        Ok(())
    }

    fn write_range(&mut self, offset: u32, data: &[u8]) -> QspiResult<()> {
        self.inner.write_range(offset, data)
    }
}
