// Licensed under the Apache-2.0 license

//! QSPI flash storage for the BMC: raw flash access, partition programming,
//! the boot environment, firmware versions and the volume-backed layout.

pub mod copy;
pub mod device;
pub mod env;
pub mod error;
pub mod ipcfg;
pub mod mount;
pub mod mounts;
pub mod mtd;
pub mod ram;
pub mod ubi;
pub mod version;
pub mod writer;

pub use device::{FlashDevice, FlashInfo};
pub use env::{EnvStore, EnvUpdate};
pub use error::{QspiError, QspiResult};
pub use mount::{MountOps, MountOrchestrator, MountState, VolumeControl};
pub use version::{is_newer, VersionError, VersionTag};
pub use writer::{ImageWriter, WriteOutcome};

use flash_layout::PartitionId;

/// Name of a staged or stashed image file, `<machine>-<tag>.bin`.
pub fn image_file_name(machine: &str, id: PartitionId) -> String {
    format!("{machine}-{}.bin", id.tag())
}
