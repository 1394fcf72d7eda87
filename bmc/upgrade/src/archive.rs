// Licensed under the Apache-2.0 license

//! Fetching and unpacking the firmware archive, `<machine>.zip`.

use crate::error::{UpgradeError, UpgradeResult};
use flash_layout::PartitionId;
use log::{debug, info};
use qspi::image_file_name;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Where to get an archive from.
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    /// Host, URL, `file://` URL or local directory.
    pub server: &'a str,
    pub version: &'a str,
    pub archive_name: &'a str,
    pub tftp: bool,
}

impl FetchRequest<'_> {
    pub fn url(&self) -> String {
        let base = if self.server.contains("://") {
            self.server.to_string()
        } else {
            format!("http://{}", self.server)
        };
        format!(
            "{}/{}/{}",
            base.trim_end_matches('/'),
            self.version,
            self.archive_name
        )
    }

    fn local_path(&self) -> Option<PathBuf> {
        let dir = match self.server.strip_prefix("file://") {
            Some(dir) => Path::new(dir),
            None if self.server.starts_with('/') => Path::new(self.server),
            None => return None,
        };
        Some(dir.join(self.version).join(self.archive_name))
    }
}

pub trait ArchiveSource {
    /// Stores the archive at `dest` and returns its size in bytes.
    fn fetch(&self, request: &FetchRequest, dest: &Path) -> UpgradeResult<u64>;
}

/// HTTP(S) download with a local-path fallback for `file://` servers.
pub struct HttpSource {
    timeout: Duration,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn download(&self, url: &str, dest: &Path) -> UpgradeResult<u64> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| UpgradeError::Download(e.to_string()))?;
        let mut response = client
            .get(url)
            .send()
            .map_err(|e| UpgradeError::Download(format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpgradeError::Download(format!("{url}: HTTP {status}")));
        }
        let mut file = File::create(dest).map_err(|e| UpgradeError::io(dest, e))?;
        let len = response
            .copy_to(&mut file)
            .map_err(|e| UpgradeError::Download(format!("{url}: {e}")))?;
        file.flush().map_err(|e| UpgradeError::io(dest, e))?;
        Ok(len)
    }
}

impl ArchiveSource for HttpSource {
    fn fetch(&self, request: &FetchRequest, dest: &Path) -> UpgradeResult<u64> {
        if request.tftp {
            return Err(UpgradeError::Download(
                "TFTP transfers are not available".into(),
            ));
        }
        if let Some(src) = request.local_path() {
            info!("Copying {}", src.display());
            return std::fs::copy(&src, dest)
                .map_err(|e| UpgradeError::Download(format!("{}: {e}", src.display())));
        }
        let url = request.url();
        info!("Downloading {url}");
        self.download(&url, dest)
    }
}

/// Fetches and unpacks an archive into a fresh directory under `work_dir`.
/// Archives smaller than `min_size` are rejected before unpacking.
pub fn fetch_and_stage(
    source: &dyn ArchiveSource,
    request: &FetchRequest,
    work_dir: &Path,
    machine: &str,
    min_size: u64,
) -> UpgradeResult<StagedArchive> {
    std::fs::create_dir_all(work_dir).map_err(|e| UpgradeError::io(work_dir, e))?;
    let dir = tempfile::Builder::new()
        .prefix("upgrade-")
        .tempdir_in(work_dir)
        .map_err(|e| UpgradeError::io(work_dir, e))?;
    let zip_path = dir.path().join(request.archive_name);
    let len = source.fetch(request, &zip_path)?;
    if len < min_size {
        return Err(UpgradeError::ArchiveTooSmall { len, min: min_size });
    }
    debug!("Fetched {} ({len} bytes)", request.archive_name);
    StagedArchive::unpack(dir, &zip_path, machine)
}

/// An unpacked archive. The directory is removed on drop.
pub struct StagedArchive {
    dir: TempDir,
    machine: String,
}

impl StagedArchive {
    pub fn unpack(dir: TempDir, zip_path: &Path, machine: &str) -> UpgradeResult<Self> {
        let file = File::open(zip_path).map_err(|e| UpgradeError::io(zip_path, e))?;
        let mut zip =
            zip::ZipArchive::new(file).map_err(|e| UpgradeError::Archive(e.to_string()))?;
        for i in 0..zip.len() {
            let mut entry = zip
                .by_index(i)
                .map_err(|e| UpgradeError::Archive(e.to_string()))?;
            if entry.is_dir() {
                continue;
            }
            let Some(name) = entry.enclosed_name() else {
                return Err(UpgradeError::Archive(format!(
                    "unsafe entry name {}",
                    entry.name()
                )));
            };
            let dest = dir.path().join(name);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|e| UpgradeError::io(parent, e))?;
            }
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|e| UpgradeError::Archive(format!("{}: {e}", entry.name())))?;
            std::fs::write(&dest, &data).map_err(|e| UpgradeError::io(&dest, e))?;
            debug!("Unpacked {} ({} bytes)", dest.display(), data.len());
        }
        std::fs::remove_file(zip_path).map_err(|e| UpgradeError::io(zip_path, e))?;
        Ok(Self {
            dir,
            machine: machine.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn image_path(&self, id: PartitionId) -> PathBuf {
        self.dir.path().join(image_file_name(&self.machine, id))
    }

    /// Contents of the staged image for `id`, `None` when absent.
    pub fn read(&self, id: PartitionId) -> UpgradeResult<Option<Vec<u8>>> {
        let path = self.image_path(id);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(UpgradeError::io(path, e)),
        }
    }

    /// Replaces the staged image for `id`.
    pub fn stage(&self, id: PartitionId, data: &[u8]) -> UpgradeResult<()> {
        let path = self.image_path(id);
        std::fs::write(&path, data).map_err(|e| UpgradeError::io(path, e))
    }

    /// Raw version blob of the package.
    pub fn version_blob(&self) -> UpgradeResult<Option<Vec<u8>>> {
        self.read(PartitionId::Version)
    }

    /// Whether the package ships `marker`, flagging support for the volume
    /// layout.
    pub fn supports_volume(&self, marker: &str) -> bool {
        self.dir.path().join(marker).exists()
    }
}
