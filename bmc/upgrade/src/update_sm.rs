// Licensed under the Apache-2.0 license

use crate::archive::{fetch_and_stage, ArchiveSource, FetchRequest, StagedArchive};
use crate::config::UpgradeConfig;
use crate::error::{UpgradeError, UpgradeResult};
use flash_layout::{Layout, PartitionId, BOOT_PARTITIONS};
use log::{debug, error, info, warn};
use qspi::ipcfg::{per_file, DEFAULT_PER};
use qspi::{
    image_file_name, is_newer, EnvStore, FlashDevice, ImageWriter, MountOps, MountOrchestrator,
    VersionTag, VolumeControl,
};
use smlang::statemachine;
use std::sync::mpsc::Sender;

// Define the state machine
statemachine! {
    derive_states: [Debug, Clone],
    derive_events: [Clone, Debug],
    transitions: {
        *Idle + StartUpgrade / on_start_upgrade = Downloading,
        Downloading + ArchiveReady / on_archive_ready = VersionGate,
        VersionGate + GatePassed / on_gate_passed = Migrating,
        VersionGate + GateSkipped(String) / on_gate_skipped = Done,
        Migrating + LayoutReady / on_layout_ready = Flashing,
        Flashing + ImagesWritten / on_images_written = UpdatingEnv,
        UpdatingEnv + EnvUpdated / on_env_updated = Done,

        _ + Abort / on_abort = Failed
    }
}

/// Images installed into `/boot` by a volume-layout upgrade.
const VOLUME_IMAGES: [PartitionId; 3] =
    [PartitionId::Image, PartitionId::PerUnit, PartitionId::Version];

/// The storage an upgrade operates on.
pub trait UpgradeBackend {
    type Flash: FlashDevice;
    type Mounts: MountOps;
    type Volumes: VolumeControl;

    fn flash(&mut self) -> &mut Self::Flash;
    fn orchestrator(&mut self) -> &mut MountOrchestrator<Self::Mounts, Self::Volumes>;
    fn source(&self) -> &dyn ArchiveSource;
}

impl<B: UpgradeBackend + ?Sized> UpgradeBackend for &mut B {
    type Flash = B::Flash;
    type Mounts = B::Mounts;
    type Volumes = B::Volumes;

    fn flash(&mut self) -> &mut Self::Flash {
        (**self).flash()
    }

    fn orchestrator(&mut self) -> &mut MountOrchestrator<Self::Mounts, Self::Volumes> {
        (**self).orchestrator()
    }

    fn source(&self) -> &dyn ArchiveSource {
        (**self).source()
    }
}

/// Flash, mount orchestration and archive source bundled for an upgrade.
pub struct Backend<F, M, V> {
    pub flash: F,
    pub orchestrator: MountOrchestrator<M, V>,
    pub source: Box<dyn ArchiveSource>,
}

impl<F: FlashDevice, M: MountOps, V: VolumeControl> UpgradeBackend for Backend<F, M, V> {
    type Flash = F;
    type Mounts = M;
    type Volumes = V;

    fn flash(&mut self) -> &mut F {
        &mut self.flash
    }

    fn orchestrator(&mut self) -> &mut MountOrchestrator<M, V> {
        &mut self.orchestrator
    }

    fn source(&self) -> &dyn ArchiveSource {
        self.source.as_ref()
    }
}

/// Per-invocation upgrade options.
#[derive(Debug, Clone, Default)]
pub struct UpgradeOptions {
    pub server: String,
    pub version: String,
    pub tftp: bool,
    /// Skip the version gate.
    pub force: bool,
    /// Program the raw legacy partitions even on a volume-layout device.
    pub legacy: bool,
}

/// Where the application images end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetLayout {
    /// Raw flash partitions.
    Legacy,
    /// Files in `/boot` on the `perm` volume.
    Volume,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    Upgraded(TargetLayout),
    /// Stopped at the version gate, storage untouched.
    Skipped(String),
}

/// The installed version blob: the `/boot` file on a formatted volume, the
/// version partition otherwise. `None` when the file is missing.
pub(crate) fn installed_version_blob<B: UpgradeBackend>(
    backend: &mut B,
    machine: &str,
) -> UpgradeResult<Option<Vec<u8>>> {
    let orchestrator = backend.orchestrator();
    if orchestrator.is_formatted()? {
        let path = orchestrator
            .boot_dir()
            .join(image_file_name(machine, PartitionId::Version));
        return match std::fs::read(&path) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(UpgradeError::io(path, e)),
        };
    }
    let blob =
        ImageWriter::new(backend.flash()).read_partition(&PartitionId::Version.partition())?;
    Ok(Some(blob))
}

fn send_next<B: UpgradeBackend>(
    ctx: &mut InnerContext<B>,
    step: UpgradeResult<Events>,
) -> Result<(), ()> {
    match step {
        Ok(event) => ctx.event_queue.send(event).map_err(|_| ()),
        Err(e) => {
            error!("Upgrade failed: {e}");
            ctx.error = Some(e);
            ctx.event_queue.send(Events::Abort).map_err(|_| ())?;
            Err(())
        }
    }
}

impl<B: UpgradeBackend> InnerContext<B> {
    fn staged(&self) -> UpgradeResult<&StagedArchive> {
        self.staged
            .as_ref()
            .ok_or_else(|| UpgradeError::StateMachine("no staged archive".into()))
    }

    fn target(&self) -> UpgradeResult<TargetLayout> {
        self.target
            .ok_or_else(|| UpgradeError::StateMachine("no target layout".into()))
    }

    fn download(&mut self) -> UpgradeResult<Events> {
        let archive_name = self.config.archive_name();
        let request = FetchRequest {
            server: &self.options.server,
            version: &self.options.version,
            archive_name: &archive_name,
            tftp: self.options.tftp,
        };
        let staged = fetch_and_stage(
            self.backend.source(),
            &request,
            &self.config.work_dir,
            &self.config.machine,
            self.config.min_archive_size,
        )?;
        info!("Staged {} in {}", archive_name, staged.dir().display());
        self.staged = Some(staged);
        Ok(Events::ArchiveReady)
    }

    fn version_gate(&mut self) -> UpgradeResult<Events> {
        if self.options.force {
            info!("Forced upgrade, skipping version check");
            return Ok(Events::GatePassed);
        }
        let installed = installed_version_blob(&mut self.backend, &self.config.machine)?;
        let Some(current) = installed.and_then(|b| VersionTag::from_version_blob(&b).ok()) else {
            return Ok(Events::GateSkipped(
                "couldn't find the installed version".into(),
            ));
        };
        let Some(blob) = self.staged()?.version_blob()? else {
            return Ok(Events::GateSkipped(
                "couldn't find the version number in the package".into(),
            ));
        };
        let candidate = match VersionTag::from_version_blob(&blob) {
            Ok(candidate) => candidate,
            Err(e) => return Ok(Events::GateSkipped(format!("package version error: {e}"))),
        };
        if current == VersionTag::Dev || candidate == VersionTag::Dev {
            info!("Development version ({current} -> {candidate}), skipping version check");
            return Ok(Events::GatePassed);
        }
        if is_newer(&current, &candidate)? {
            info!("Upgrading {current} -> {candidate}");
            Ok(Events::GatePassed)
        } else {
            Ok(Events::GateSkipped(format!(
                "package version {candidate} is not newer than {current}"
            )))
        }
    }

    /// The per-unit configuration the device runs with: the `/boot` file on
    /// a formatted volume, the partition contents otherwise.
    fn persisted_per(&mut self, formatted: bool) -> UpgradeResult<Vec<u8>> {
        if !formatted {
            let per = ImageWriter::new(self.backend.flash())
                .read_partition(&PartitionId::PerUnit.partition())?;
            if let Some(nul) = per.iter().position(|&b| b == 0) {
                if nul > 0 {
                    return Ok(per[..=nul].to_vec());
                }
            }
            warn!("No per-unit config in flash, using default of ip=dhcp");
            return Ok(DEFAULT_PER.to_vec());
        }
        let path = per_file(&self.backend.orchestrator().boot_dir(), &self.config.machine);
        match std::fs::read(&path) {
            Ok(per) => Ok(per),
            Err(e) => {
                warn!("Error reading {}: {e}, using default of ip=dhcp", path.display());
                Ok(DEFAULT_PER.to_vec())
            }
        }
    }

    fn prepare_layout(&mut self) -> UpgradeResult<Events> {
        let formatted = self.backend.orchestrator().is_formatted()?;
        let target = if self.options.legacy || !formatted {
            TargetLayout::Legacy
        } else {
            TargetLayout::Volume
        };
        let marker = self.config.volume_marker();
        if target == TargetLayout::Volume && !self.staged()?.supports_volume(&marker) {
            return Err(UpgradeError::UnsupportedDowngrade);
        }

        let per = self.persisted_per(formatted)?;
        self.staged()?.stage(PartitionId::PerUnit, &per)?;

        if target == TargetLayout::Legacy && formatted {
            info!("Unmounting volume for legacy downgrade");
            self.backend.orchestrator().release(true)?;
        }
        debug!("Target layout {:?}", target);
        self.target = Some(target);
        Ok(Events::LayoutReady)
    }

    fn flash_images(&mut self) -> UpgradeResult<Events> {
        let target = self.target()?;
        let boot = self.backend.orchestrator().boot_dir();
        let staged = self
            .staged
            .as_ref()
            .ok_or_else(|| UpgradeError::StateMachine("no staged archive".into()))?;
        let mut writer = ImageWriter::new(self.backend.flash());

        for id in BOOT_PARTITIONS {
            writer.write_file(&staged.image_path(id), &id.partition())?;
        }

        match target {
            TargetLayout::Legacy => {
                let combined = staged
                    .read(PartitionId::Image)?
                    .is_some_and(|image| !image.is_empty());
                let layout = if combined {
                    Layout::Current
                } else {
                    Layout::Legacy
                };
                info!("Programming {layout} layout");
                for partition in layout.application_partitions() {
                    writer.write_file(&staged.image_path(partition.id), &partition)?;
                }
            }
            TargetLayout::Volume => {
                for id in VOLUME_IMAGES {
                    let name = image_file_name(&self.config.machine, id);
                    let data = staged
                        .read(id)?
                        .ok_or_else(|| UpgradeError::Archive(format!("missing {name}")))?;
                    let dst = boot.join(&name);
                    std::fs::write(&dst, &data).map_err(|e| UpgradeError::io(&dst, e))?;
                    info!("Installed {}", dst.display());
                }
            }
        }
        Ok(Events::ImagesWritten)
    }

    fn update_env(&mut self) -> UpgradeResult<Events> {
        let update = match self.target()? {
            TargetLayout::Legacy => {
                EnvStore::new(self.backend.flash()).update_env_from_persisted_ip()?
            }
            TargetLayout::Volume => {
                let per = self.staged()?.read(PartitionId::PerUnit)?;
                let per = per.unwrap_or_else(|| DEFAULT_PER.to_vec());
                EnvStore::new(self.backend.flash()).update_env_from_per_blob(&per)?
            }
        };
        debug!("Env update: {:?}", update);
        Ok(Events::EnvUpdated)
    }
}

pub trait StateMachineActions {
    // Actions
    fn on_start_upgrade(&mut self, ctx: &mut InnerContext<impl UpgradeBackend>) -> Result<(), ()> {
        let step = ctx.download();
        send_next(ctx, step)
    }

    fn on_archive_ready(&mut self, ctx: &mut InnerContext<impl UpgradeBackend>) -> Result<(), ()> {
        let step = ctx.version_gate();
        send_next(ctx, step)
    }

    fn on_gate_passed(&mut self, ctx: &mut InnerContext<impl UpgradeBackend>) -> Result<(), ()> {
        let step = ctx.prepare_layout();
        send_next(ctx, step)
    }

    fn on_gate_skipped(
        &mut self,
        ctx: &mut InnerContext<impl UpgradeBackend>,
        reason: String,
    ) -> Result<(), ()> {
        info!("Aborting, {reason}");
        ctx.outcome = Some(UpgradeOutcome::Skipped(reason));
        Ok(())
    }

    fn on_layout_ready(&mut self, ctx: &mut InnerContext<impl UpgradeBackend>) -> Result<(), ()> {
        let step = ctx.flash_images();
        send_next(ctx, step)
    }

    fn on_images_written(
        &mut self,
        ctx: &mut InnerContext<impl UpgradeBackend>,
    ) -> Result<(), ()> {
        let step = ctx.update_env();
        send_next(ctx, step)
    }

    fn on_env_updated(&mut self, ctx: &mut InnerContext<impl UpgradeBackend>) -> Result<(), ()> {
        let target = ctx.target().map_err(|_| ())?;
        info!("Upgrade complete");
        ctx.outcome = Some(UpgradeOutcome::Upgraded(target));
        Ok(())
    }

    fn on_abort(&mut self, ctx: &mut InnerContext<impl UpgradeBackend>) -> Result<(), ()> {
        if ctx.error.is_none() {
            ctx.error = Some(UpgradeError::StateMachine("aborted".into()));
        }
        ctx.staged = None;
        Ok(())
    }
}

// Implement the context struct
pub struct DefaultActions;
impl StateMachineActions for DefaultActions {}

pub struct InnerContext<B: UpgradeBackend> {
    backend: B,
    pub config: UpgradeConfig,
    pub options: UpgradeOptions,
    pub event_queue: Sender<Events>,
    // Unpacked archive, removed when dropped
    pub staged: Option<StagedArchive>,
    pub target: Option<TargetLayout>,
    pub outcome: Option<UpgradeOutcome>,
    pub error: Option<UpgradeError>,
}

pub struct Context<T: StateMachineActions, B: UpgradeBackend> {
    inner: T,
    pub inner_ctx: InnerContext<B>,
}

impl<T: StateMachineActions, B: UpgradeBackend> Context<T, B> {
    pub fn new(
        context: T,
        backend: B,
        config: UpgradeConfig,
        options: UpgradeOptions,
        event_queue: Sender<Events>,
    ) -> Self {
        Self {
            inner: context,
            inner_ctx: InnerContext {
                backend,
                config,
                options,
                event_queue,
                staged: None,
                target: None,
                outcome: None,
                error: None,
            },
        }
    }
}

// Macros to delegate the state machine actions to the custom StateMachineActions passed to the state machine
// This allows overriding the implementation of the actions
macro_rules! delegate_to_inner_action {
    ($($fn_name:ident ($($arg:ident : $arg_ty:ty),*) -> $ret:ty),* $(,)?) => {
        $(
            fn $fn_name(&mut self, $($arg: $arg_ty),*) -> $ret {
                debug!("Upgrade Action: {}", stringify!($fn_name));
                self.inner.$fn_name(&mut self.inner_ctx, $($arg),*)
            }
        )*
    };
}

impl<T: StateMachineActions, B: UpgradeBackend> StateMachineContext for Context<T, B> {
    delegate_to_inner_action! {
        on_start_upgrade() -> Result<(),()>,
        on_archive_ready() -> Result<(),()>,
        on_gate_passed() -> Result<(),()>,
        on_gate_skipped(reason : String) -> Result<(),()>,
        on_layout_ready() -> Result<(),()>,
        on_images_written() -> Result<(),()>,
        on_env_updated() -> Result<(),()>,
        on_abort() -> Result<(),()>,
    }
}
