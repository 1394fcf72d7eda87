// Licensed under the Apache-2.0 license

//! Sequencing of the volume-backed storage layout.
//!
//! In the volume layout the `perm` UBI volume is mounted on `/perm`, and
//! `/perm/etc` and `/perm/boot` are bind-mounted over `/etc` and `/boot`.
//! The live trees from the root filesystem stay reachable through bind
//! mounts under `/volatile`. The mount table and the UBI attachment are
//! probed again before every step; nothing is cached between operations.

use crate::copy::copy_recurse;
use crate::device::FlashDevice;
use crate::error::{QspiError, QspiResult};
use crate::image_file_name;
use crate::ipcfg::ip_command;
use crate::writer::ImageWriter;
use flash_layout::PartitionId;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// Mountpoints of the volume layout, in unmount order.
pub const MOUNTPOINTS: [&str; 3] = ["boot", "etc", "perm"];
/// Trees persisted into the volume, with whether the copy overwrites
/// existing files.
const PERSISTED_TREES: [(&str, bool); 2] = [("etc", false), ("boot", true)];
pub const PERM_VOLUME: &str = "perm";
const PERM_FSTYPE: &str = "ubifs";
const VOLATILE: &str = "volatile";
const START_SCRIPT: &str = "etc/goes/start";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unattached,
    AttachedUnmounted,
    AttachedMounted,
}

/// Access to the live mount table.
pub trait MountOps {
    /// Device backing `mountpoint`, or `None` when nothing is mounted there.
    fn backing_device(&self, mountpoint: &Path) -> QspiResult<Option<String>>;

    fn mount(
        &mut self,
        source: &Path,
        target: &Path,
        fstype: Option<&str>,
        bind: bool,
    ) -> QspiResult<()>;

    fn unmount(&mut self, target: &Path) -> QspiResult<()>;
}

/// Control of the UBI device built on the volume container.
pub trait VolumeControl {
    /// Whether the container holds UBI data.
    fn is_formatted(&self) -> QspiResult<bool>;
    fn is_attached(&self) -> QspiResult<bool>;
    fn attach(&mut self) -> QspiResult<()>;
    fn detach(&mut self) -> QspiResult<()>;
    /// Device node of the volume called `name`, if it exists.
    fn find_volume(&self, name: &str) -> QspiResult<Option<PathBuf>>;
    /// Bytes available for new volumes.
    fn available_bytes(&self) -> QspiResult<u64>;
    fn create_volume(&mut self, name: &str, bytes: u64) -> QspiResult<()>;
}

pub struct MountOrchestrator<M, V> {
    mounts: M,
    volumes: V,
    root: PathBuf,
    device: String,
    machine: String,
}

impl<M: MountOps, V: VolumeControl> MountOrchestrator<M, V> {
    /// `root` prefixes every path handled, `device` is the volume device the
    /// mountpoints must be backed by.
    pub fn new(
        mounts: M,
        volumes: V,
        root: impl Into<PathBuf>,
        device: impl Into<String>,
        machine: impl Into<String>,
    ) -> Self {
        Self {
            mounts,
            volumes,
            root: root.into(),
            device: device.into(),
            machine: machine.into(),
        }
    }

    pub fn mounts(&self) -> &M {
        &self.mounts
    }

    pub fn volumes(&self) -> &V {
        &self.volumes
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn boot_dir(&self) -> PathBuf {
        self.path("boot")
    }

    pub fn is_formatted(&self) -> QspiResult<bool> {
        self.volumes.is_formatted()
    }

    /// Mountpoints that currently have something mounted, with the device.
    fn mounted(&self) -> QspiResult<Vec<(PathBuf, String)>> {
        let mut mounted = Vec::new();
        for mp in MOUNTPOINTS {
            let path = self.path(mp);
            if let Some(dev) = self.mounts.backing_device(&path)? {
                mounted.push((path, dev));
            }
        }
        Ok(mounted)
    }

    /// Probes the mount table and the attachment. Valid states have either
    /// nothing mounted, or all mountpoints on the volume device with UBI
    /// attached.
    pub fn check_consistency(&self) -> QspiResult<MountState> {
        let attached = self.volumes.is_attached()?;
        let mounted = self.mounted()?;
        if let Some((path, dev)) = mounted.iter().find(|(_, dev)| *dev != self.device) {
            return Err(QspiError::MountInconsistency(format!(
                "unexpected mount on {}: {dev}",
                path.display()
            )));
        }
        let state = match (attached, mounted.len()) {
            (false, 0) => MountState::Unattached,
            (true, 0) => MountState::AttachedUnmounted,
            (true, n) if n == MOUNTPOINTS.len() => MountState::AttachedMounted,
            (false, n) if n == MOUNTPOINTS.len() => {
                return Err(QspiError::MountInconsistency(
                    "mounted but UBI not attached".into(),
                ))
            }
            (_, n) => {
                return Err(QspiError::MountInconsistency(format!(
                    "{n} of {} mountpoints mounted",
                    MOUNTPOINTS.len()
                )))
            }
        };
        debug!("Mount state {:?}", state);
        Ok(state)
    }

    /// Unmounts the volume layout and detaches UBI.
    ///
    /// Without `allow_unmount`, anything mounted or attached is an error.
    /// The live `/boot` and `/etc` are first copied into `/volatile` so the
    /// running system keeps its configuration.
    pub fn release(&mut self, allow_unmount: bool) -> QspiResult<()> {
        let mounted = self.mounted()?;
        let attached = self.volumes.is_attached()?;
        if let Some((path, _)) = mounted.first() {
            if !allow_unmount {
                return Err(QspiError::UnmountRequired(path.display().to_string()));
            }
        }
        if attached && !allow_unmount {
            return Err(QspiError::UnmountRequired("UBI device".into()));
        }
        if !mounted.is_empty() && !attached {
            return Err(QspiError::MountInconsistency(
                "mounted but UBI not attached".into(),
            ));
        }

        for (dir, _) in PERSISTED_TREES.iter().rev() {
            let volatile = self.path(VOLATILE).join(dir);
            copy_recurse(&self.path(dir), &volatile, true)?;
        }
        for mp in MOUNTPOINTS {
            let path = self.path(mp);
            let Some(dev) = self.mounts.backing_device(&path)? else {
                continue;
            };
            if dev != self.device {
                debug!("{} is backed by {dev}, not {}", path.display(), self.device);
            }
            info!("Unmounting {}", path.display());
            self.mounts.unmount(&path)?;
        }
        if attached {
            info!("Detaching UBI");
            self.volumes.detach()?;
        }
        Ok(())
    }

    /// Attaches a formatted container and mounts the volume layout. With
    /// `persist`, the volatile trees are copied into the volume afterwards.
    pub fn attach_and_mount(&mut self, persist: bool) -> QspiResult<()> {
        if !self.volumes.is_formatted()? {
            return Err(QspiError::NotFormatted);
        }
        let state = self.check_consistency()?;
        if state != MountState::Unattached {
            return Err(QspiError::MountInconsistency(format!(
                "expected unattached volume, found {state:?}"
            )));
        }
        self.volumes.attach()?;

        let perm = self.path(PERM_VOLUME);
        let device = PathBuf::from(&self.device);
        self.mounts.mount(&device, &perm, Some(PERM_FSTYPE), false)?;
        for (dir, _) in PERSISTED_TREES {
            let live = self.path(dir);
            self.mounts.mount(&perm.join(dir), &live, None, true)?;
        }
        if persist {
            for (dir, _) in PERSISTED_TREES.iter().rev() {
                copy_recurse(&self.path(VOLATILE).join(dir), &perm.join(dir), true)?;
            }
        }
        info!("Mounted {} on {}", self.device, perm.display());
        Ok(())
    }

    /// Boot-time setup: converts a legacy container if needed, then attaches
    /// and mounts the volume layout. Already mounted is a no-op.
    pub fn setup_volume<F, C>(&mut self, flash: &mut F, container: &mut C) -> QspiResult<()>
    where
        F: FlashDevice + ?Sized,
        C: FlashDevice + ?Sized,
    {
        match self.check_consistency()? {
            MountState::AttachedMounted => {
                info!("Volume already mounted");
                return Ok(());
            }
            MountState::AttachedUnmounted => {
                return Err(QspiError::MountInconsistency(
                    "UBI attached but not mounted".into(),
                ))
            }
            MountState::Unattached => {}
        }
        if self.volumes.is_formatted()? {
            self.mount_volume()
        } else {
            self.migrate_legacy_to_volume(flash, container)
        }
    }

    /// Moves a legacy-layout device to the volume layout.
    ///
    /// The application partitions are stashed into `/boot`, the network start
    /// script is derived from the per-unit IP setting, the container is
    /// erased and the volume layout is created and mounted.
    pub fn migrate_legacy_to_volume<F, C>(
        &mut self,
        flash: &mut F,
        container: &mut C,
    ) -> QspiResult<()>
    where
        F: FlashDevice + ?Sized,
        C: FlashDevice + ?Sized,
    {
        if self.volumes.is_formatted()? {
            return Err(QspiError::Volume("container is already formatted".into()));
        }
        if self.check_consistency()? != MountState::Unattached {
            return Err(QspiError::MountInconsistency(
                "cannot migrate with UBI attached".into(),
            ));
        }
        self.stash_legacy_partitions(flash)?;

        let size = container.info().total_size;
        info!("Erasing volume container (0x{:x} bytes)", size);
        container.erase_range(0, size)?;

        self.mount_volume()
    }

    fn stash_legacy_partitions<F: FlashDevice + ?Sized>(&self, flash: &mut F) -> QspiResult<()> {
        let boot = self.boot_dir();
        fs::create_dir_all(&boot).map_err(|e| QspiError::file(&boot, e))?;
        let writer = ImageWriter::new(flash);

        let image = writer.read_partition(&PartitionId::Image.partition())?;
        self.stash(PartitionId::Image, trim_erased(&image))?;

        let per = writer.read_partition(&PartitionId::PerUnit.partition())?;
        let (per, ip) = match per.iter().position(|&b| b == 0) {
            Some(nul) => (&per[..=nul], String::from_utf8_lossy(&per[..nul]).into_owned()),
            None => (&per[..], String::new()),
        };
        self.stash(PartitionId::PerUnit, per)?;

        if ip.is_empty() {
            warn!("No per-unit IP setting, network start script not written");
        } else {
            let script = ip_command(&ip);
            let path = self.path(START_SCRIPT);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| QspiError::file(parent, e))?;
            }
            fs::write(&path, script).map_err(|e| QspiError::file(&path, e))?;
            info!("Wrote {}", path.display());
        }

        let version = writer.read_partition(&PartitionId::Version.partition())?;
        self.stash(PartitionId::Version, trim_erased(&version))
    }

    fn stash(&self, id: PartitionId, data: &[u8]) -> QspiResult<()> {
        let path = self.boot_dir().join(image_file_name(&self.machine, id));
        fs::write(&path, data).map_err(|e| QspiError::file(&path, e))?;
        info!("Stashed {} ({} bytes) in {}", id, data.len(), path.display());
        Ok(())
    }

    /// Attaches, creates the `perm` volume if missing and mounts the layout,
    /// seeding the volume from the live trees.
    fn mount_volume(&mut self) -> QspiResult<()> {
        self.volumes.attach()?;
        let volume = match self.volumes.find_volume(PERM_VOLUME)? {
            Some(volume) => volume,
            None => {
                let bytes = self.volumes.available_bytes()?;
                info!("Creating {} volume of {} bytes", PERM_VOLUME, bytes);
                self.volumes.create_volume(PERM_VOLUME, bytes)?;
                self.volumes.find_volume(PERM_VOLUME)?.ok_or_else(|| {
                    QspiError::Volume(format!("{PERM_VOLUME} missing after create"))
                })?
            }
        };

        let perm = self.path(PERM_VOLUME);
        let volatile = self.path(VOLATILE);
        for dir in [&perm, &volatile] {
            fs::create_dir_all(dir).map_err(|e| QspiError::file(dir, e))?;
        }
        info!("Mounting {} on {}", volume.display(), perm.display());
        self.mounts.mount(&volume, &perm, Some(PERM_FSTYPE), false)?;

        for (dir, overwrite) in PERSISTED_TREES {
            let live = self.path(dir);
            let shadow = volatile.join(dir);
            let persisted = perm.join(dir);
            fs::create_dir_all(&live).map_err(|e| QspiError::file(&live, e))?;
            copy_recurse(&live, &persisted, overwrite)?;
            fs::create_dir_all(&shadow).map_err(|e| QspiError::file(&shadow, e))?;
            self.mounts.mount(&live, &shadow, None, true)?;
            self.mounts.mount(&persisted, &live, None, true)?;
        }
        Ok(())
    }
}

/// Strips the trailing erased bytes of a raw partition read.
pub fn trim_erased(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|&b| b != 0xff).map_or(0, |i| i + 1);
    &data[..end]
}
