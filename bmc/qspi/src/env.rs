// Licensed under the Apache-2.0 license

//! Boot-loader environment blob.
//!
//! The blob is [`ENV_SIZE`] bytes at the start of the env partition: a
//! little-endian CRC32 of the remaining bytes, followed by NUL-terminated
//! `key=value` strings and an empty string marking the end. The payload is
//! zero padded.

use crate::device::FlashDevice;
use crate::error::{QspiError, QspiResult};
use crate::writer::ImageWriter;
use flash_layout::{PartitionId, ENV_CRC_SIZE, ENV_DATA_SIZE, ENV_SIZE};
use log::{debug, info};

const BOOTARGS_KEY: &str = "bootargs=";
const IP_TOKEN: &str = "ip=";

/// Longest per-unit IP string that is treated as a setting. Anything longer
/// is an unprogrammed or corrupt partition.
pub const MAX_PERSISTED_IP_LEN: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Env {
    pub entries: Vec<String>,
    /// Index of the `bootargs=` entry, if present.
    pub bootargs: Option<usize>,
}

impl Env {
    pub fn new(entries: Vec<String>) -> Self {
        let bootargs = entries.iter().position(|e| e.starts_with(BOOTARGS_KEY));
        Self { entries, bootargs }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find_map(|e| {
            let (k, v) = e.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

pub fn decode(blob: &[u8]) -> QspiResult<Env> {
    if blob.len() < ENV_SIZE {
        return Err(QspiError::Size {
            what: "env blob".into(),
            len: blob.len(),
            limit: ENV_SIZE,
        });
    }
    let mut crc = [0u8; ENV_CRC_SIZE];
    crc.copy_from_slice(&blob[..ENV_CRC_SIZE]);
    let stored = u32::from_le_bytes(crc);
    let payload = &blob[ENV_CRC_SIZE..ENV_SIZE];
    let computed = crc32fast::hash(payload);
    if stored != computed {
        return Err(QspiError::EnvCrc { stored, computed });
    }

    let entries = payload
        .split(|&b| b == 0)
        .take_while(|e| !e.is_empty())
        .map(|e| {
            String::from_utf8(e.to_vec())
                .map_err(|_| QspiError::EnvFormat(String::from_utf8_lossy(e).into_owned()))
        })
        .collect::<QspiResult<Vec<_>>>()?;
    Ok(Env::new(entries))
}

pub fn encode<S: AsRef<str>>(entries: &[S]) -> QspiResult<Vec<u8>> {
    let mut payload = Vec::with_capacity(ENV_DATA_SIZE);
    for entry in entries {
        let entry = entry.as_ref();
        if entry.is_empty() || entry.contains('\0') {
            return Err(QspiError::EnvFormat(entry.into()));
        }
        payload.extend_from_slice(entry.as_bytes());
        payload.push(0);
    }
    // The empty string terminating the list.
    let len = payload.len() + 1;
    if len > ENV_DATA_SIZE {
        return Err(QspiError::Size {
            what: "env".into(),
            len,
            limit: ENV_DATA_SIZE,
        });
    }
    payload.resize(ENV_DATA_SIZE, 0);

    let mut blob = Vec::with_capacity(ENV_SIZE);
    blob.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    blob.extend_from_slice(&payload);
    Ok(blob)
}

/// Extracts the persisted IP setting from a per-unit blob: the text up to
/// the first NUL.
pub fn persisted_ip(per: &[u8]) -> Option<&str> {
    let end = per.iter().position(|&b| b == 0)?;
    let ip = std::str::from_utf8(&per[..end]).ok()?;
    (!ip.is_empty() && ip.len() <= MAX_PERSISTED_IP_LEN).then_some(ip)
}

/// Result of re-applying the persisted IP to the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvUpdate {
    Updated,
    /// The per-unit blob holds no usable IP setting.
    NoPersistedIp,
    /// `bootargs` is missing or has no `ip=` token.
    NoIpToken,
    Unchanged,
}

pub struct EnvStore<'a, F: FlashDevice + ?Sized> {
    flash: &'a mut F,
}

impl<'a, F: FlashDevice + ?Sized> EnvStore<'a, F> {
    pub fn new(flash: &'a mut F) -> Self {
        Self { flash }
    }

    pub fn load(&self) -> QspiResult<Env> {
        let env = PartitionId::Env.partition();
        let mut blob = vec![0u8; ENV_SIZE];
        self.flash.read_range(env.offset, &mut blob)?;
        decode(&blob)
    }

    pub fn store<S: AsRef<str>>(&mut self, entries: &[S]) -> QspiResult<()> {
        let blob = encode(entries)?;
        ImageWriter::new(&mut *self.flash)
            .write_and_verify(Some(&blob), &PartitionId::Env.partition())?;
        Ok(())
    }

    /// Splices the IP stored in the per-unit partition into `bootargs`.
    pub fn update_env_from_persisted_ip(&mut self) -> QspiResult<EnvUpdate> {
        let per = ImageWriter::new(&mut *self.flash)
            .read_partition(&PartitionId::PerUnit.partition())?;
        self.update_env_from_per_blob(&per)
    }

    /// Same as [`Self::update_env_from_persisted_ip`] with the per-unit
    /// contents supplied by the caller.
    pub fn update_env_from_per_blob(&mut self, per: &[u8]) -> QspiResult<EnvUpdate> {
        let Some(ip) = persisted_ip(per) else {
            info!("No ip= in per-unit config, skipping env update");
            return Ok(EnvUpdate::NoPersistedIp);
        };
        let mut env = self.load()?;
        let Some(idx) = env.bootargs else {
            info!("No bootargs in env, skipping env update");
            return Ok(EnvUpdate::NoIpToken);
        };
        let Some((head, current)) = env.entries[idx].split_once(IP_TOKEN) else {
            info!("No ip= in bootargs, skipping env update");
            return Ok(EnvUpdate::NoIpToken);
        };
        if current == ip {
            info!("No ip change, skipping env update");
            return Ok(EnvUpdate::Unchanged);
        }
        let updated = format!("{head}{IP_TOKEN}{ip}");
        debug!("bootargs: {:?} -> {:?}", env.entries[idx], updated);
        env.entries[idx] = updated;
        self.store(&env.entries)?;
        info!("Updated env ip={ip}");
        Ok(EnvUpdate::Updated)
    }
}
