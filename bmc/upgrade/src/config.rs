// Licensed under the Apache-2.0 license

use crate::error::{UpgradeError, UpgradeResult};
use log::debug;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/bmcflash.toml";

/// Tool configuration, read from TOML. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpgradeConfig {
    pub machine: String,
    pub server: String,
    pub version: String,
    /// Raw QSPI device holding the partition table.
    pub mtd_device: PathBuf,
    pub proc_mtd: PathBuf,
    pub proc_mounts: PathBuf,
    /// MTD partition name of the volume container.
    pub container_name: String,
    /// Prefix of every filesystem path handled.
    pub root: PathBuf,
    pub work_dir: PathBuf,
    /// Volume device the mountpoints must be backed by.
    pub volume_device: String,
    pub download_timeout_secs: u64,
    pub min_archive_size: u64,
    /// sysfs value file of the QSPI mux select GPIO.
    pub mux_gpio: PathBuf,
    pub ubi_ctrl: PathBuf,
    pub ubi_device: PathBuf,
    pub ubi_sysfs: PathBuf,
    pub ubi_attached_marker: PathBuf,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            machine: "platina-mk1-bmc".into(),
            server: "downloads.platinasystems.com".into(),
            version: "LATEST".into(),
            mtd_device: "/dev/mtd0".into(),
            proc_mtd: "/proc/mtd".into(),
            proc_mounts: "/proc/mounts".into(),
            container_name: "ubi".into(),
            root: "/".into(),
            work_dir: "/var/run/goes/upgrade".into(),
            volume_device: "/dev/ubi0_0".into(),
            download_timeout_secs: 300,
            min_archive_size: 1000,
            mux_gpio: "/sys/class/gpio/qspi_mux_sel/value".into(),
            ubi_ctrl: "/dev/ubi_ctrl".into(),
            ubi_device: "/dev/ubi0".into(),
            ubi_sysfs: "/sys/class/ubi/ubi0".into(),
            ubi_attached_marker: "/sys/devices/virtual/ubi/ubi0".into(),
        }
    }
}

impl UpgradeConfig {
    pub fn from_toml(text: &str, path: &Path) -> UpgradeResult<Self> {
        toml::from_str(text).map_err(|e| UpgradeError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Loads `path`. A missing file at the default location yields the
    /// defaults; an explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> UpgradeResult<Self> {
        let (path, required) = match path {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_CONFIG_PATH), false),
        };
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text, path),
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(UpgradeError::io(path, e)),
        }
    }

    pub fn archive_name(&self) -> String {
        format!("{}.zip", self.machine)
    }

    /// Marker file shipped in packages that support the volume layout.
    pub fn volume_marker(&self) -> String {
        format!("{}-v2", self.machine)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }
}
