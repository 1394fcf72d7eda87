// Licensed under the Apache-2.0 license

use crate::archive::{fetch_and_stage, FetchRequest};
use crate::config::UpgradeConfig;
use crate::error::{UpgradeError, UpgradeResult};
use crate::update_sm::{
    self, installed_version_blob, Context, DefaultActions, StateMachineActions, UpgradeBackend,
    UpgradeOptions, UpgradeOutcome,
};
use flash_layout::{Layout, Partition};
use log::{debug, error, info};
use qspi::version::version_json;
use qspi::{ImageWriter, MountState, QspiError, VersionTag};
use std::sync::mpsc;

/// Version information of the installed firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledVersion {
    pub version: Option<VersionTag>,
    pub json: Option<String>,
}

pub struct UpgradeController<B: UpgradeBackend> {
    backend: B,
    config: UpgradeConfig,
}

impl<B: UpgradeBackend> UpgradeController<B> {
    pub fn new(backend: B, config: UpgradeConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Refuses to start on a half-mounted device. An unformatted container
    /// must have nothing attached or mounted; a formatted one must be fully
    /// mounted.
    pub fn preflight(&mut self) -> UpgradeResult<MountState> {
        let orchestrator = self.backend.orchestrator();
        let formatted = orchestrator.is_formatted()?;
        let state = orchestrator.check_consistency()?;
        match (formatted, state) {
            (false, MountState::Unattached) | (true, MountState::AttachedMounted) => Ok(state),
            (false, _) => Err(QspiError::MountInconsistency(
                "volume container is not formatted but UBI is attached".into(),
            )
            .into()),
            (true, _) => Err(UpgradeError::NotMounted),
        }
    }

    /// Preflight followed by the full upgrade sequence.
    pub fn upgrade(&mut self, options: &UpgradeOptions) -> UpgradeResult<UpgradeOutcome> {
        self.preflight()?;
        self.run(options)
    }

    pub fn run(&mut self, options: &UpgradeOptions) -> UpgradeResult<UpgradeOutcome> {
        self.run_with(DefaultActions, options)
    }

    /// Drives the upgrade state machine from `Idle` until it reaches `Done`
    /// or `Failed`.
    pub fn run_with<T: StateMachineActions>(
        &mut self,
        actions: T,
        options: &UpgradeOptions,
    ) -> UpgradeResult<UpgradeOutcome> {
        let (event_queue_tx, event_queue_rx) = mpsc::channel();
        let mut sm = update_sm::StateMachine::new(Context::new(
            actions,
            &mut self.backend,
            self.config.clone(),
            options.clone(),
            event_queue_tx.clone(),
        ));
        event_queue_tx
            .send(update_sm::Events::StartUpgrade)
            .map_err(|e| UpgradeError::StateMachine(e.to_string()))?;

        while let Ok(ev) = event_queue_rx.try_recv() {
            debug!("Upgrade state machine state: {:?}, event {:?}", sm.state(), ev);
            if sm.process_event(ev).is_err() {
                error!("Error processing upgrade event");
                // The failing action queued an abort
            }
            if matches!(
                sm.state(),
                update_sm::States::Done | update_sm::States::Failed
            ) {
                break;
            }
        }

        let state = format!("{:?}", sm.state());
        let ctx = &mut sm.context_mut().inner_ctx;
        if let Some(err) = ctx.error.take() {
            return Err(err);
        }
        ctx.outcome
            .take()
            .ok_or(UpgradeError::StateMachine(state))
    }

    /// Fetches the archive only to report the packaged version.
    pub fn server_version(
        &mut self,
        options: &UpgradeOptions,
    ) -> UpgradeResult<Option<VersionTag>> {
        let archive_name = self.config.archive_name();
        let request = FetchRequest {
            server: &options.server,
            version: &options.version,
            archive_name: &archive_name,
            tftp: options.tftp,
        };
        let staged = fetch_and_stage(
            self.backend.source(),
            &request,
            &self.config.work_dir,
            &self.config.machine,
            self.config.min_archive_size,
        )?;
        match staged.version_blob()? {
            Some(blob) => Ok(Some(VersionTag::from_version_blob(&blob)?)),
            None => Ok(None),
        }
    }

    pub fn installed_version(&mut self) -> UpgradeResult<InstalledVersion> {
        let Some(blob) = installed_version_blob(&mut self.backend, &self.config.machine)? else {
            return Ok(InstalledVersion {
                version: None,
                json: None,
            });
        };
        Ok(InstalledVersion {
            version: VersionTag::from_version_blob(&blob).ok(),
            json: version_json(&blob).map(str::to_string),
        })
    }

    /// CRC32 of every partition of `layout` as currently programmed.
    pub fn checksums(&mut self, layout: Layout) -> UpgradeResult<Vec<(Partition, u32)>> {
        let writer = ImageWriter::new(self.backend.flash());
        let mut sums = Vec::new();
        for partition in layout.partitions() {
            let data = writer.read_partition(partition)?;
            let crc = crc32fast::hash(&data);
            info!("{}: crc32 0x{:08x}", partition.id, crc);
            sums.push((*partition, crc));
        }
        Ok(sums)
    }
}
