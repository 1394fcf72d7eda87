// Licensed under the Apache-2.0 license

//! Firmware upgrade and QSPI unit selection for the BMC.

pub mod archive;
pub mod config;
pub mod controller;
pub mod error;
pub mod selector;
pub mod update_sm;

pub use archive::{ArchiveSource, FetchRequest, HttpSource, StagedArchive};
pub use config::UpgradeConfig;
pub use controller::{InstalledVersion, UpgradeController};
pub use error::{UpgradeError, UpgradeResult};
pub use selector::{flash_select, GpioMuxSelector, SelectOptions, UnitSelector};
pub use update_sm::{Backend, TargetLayout, UpgradeBackend, UpgradeOptions, UpgradeOutcome};
