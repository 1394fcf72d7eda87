// Licensed under the Apache-2.0 license

//! Selection between the two QSPI flash units.

use crate::error::{UpgradeError, UpgradeResult};
use log::debug;
use qspi::{MountOps, MountOrchestrator, VolumeControl};
use std::path::PathBuf;

pub const UNIT_COUNT: u8 = 2;

pub trait UnitSelector {
    fn selected(&self) -> UpgradeResult<u8>;
    fn select(&mut self, unit: u8) -> UpgradeResult<()>;
}

/// QSPI mux select line exported through sysfs. `0` selects QSPI0.
pub struct GpioMuxSelector {
    value: PathBuf,
}

impl GpioMuxSelector {
    pub fn new(value: impl Into<PathBuf>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl UnitSelector for GpioMuxSelector {
    fn selected(&self) -> UpgradeResult<u8> {
        let text = std::fs::read_to_string(&self.value)
            .map_err(|e| UpgradeError::io(&self.value, e))?;
        match text.trim() {
            "0" => Ok(0),
            "1" => Ok(1),
            other => Err(UpgradeError::Config {
                path: self.value.clone(),
                message: format!("unexpected mux value {other:?}"),
            }),
        }
    }

    fn select(&mut self, unit: u8) -> UpgradeResult<()> {
        std::fs::write(&self.value, format!("{unit}\n"))
            .map_err(|e| UpgradeError::io(&self.value, e))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SelectOptions {
    /// Unmount and detach the current unit first.
    pub unmount: bool,
    /// Attach and mount the newly selected unit.
    pub mount: bool,
    /// Copy the volatile trees into the new unit's volume.
    pub update: bool,
}

/// Switches to `unit`, or to the current unit again when `None`.
///
/// Switching with anything mounted or attached requires `unmount`. Returns
/// the unit selected afterwards.
pub fn flash_select<S, M, V>(
    selector: &mut S,
    orchestrator: &mut MountOrchestrator<M, V>,
    unit: Option<u8>,
    options: SelectOptions,
) -> UpgradeResult<u8>
where
    S: UnitSelector + ?Sized,
    M: MountOps,
    V: VolumeControl,
{
    let unit = match unit {
        Some(unit) if unit >= UNIT_COUNT => return Err(UpgradeError::InvalidUnit(unit)),
        Some(unit) => unit,
        None => selector.selected()?,
    };
    orchestrator.release(options.unmount)?;
    selector.select(unit)?;
    debug!("Mux set to QSPI{unit}");
    if options.mount || options.update {
        orchestrator.attach_and_mount(options.update)?;
    }
    Ok(unit)
}
