// Licensed under the Apache-2.0 license

use crate::device::{check_range, FlashDevice, FlashInfo};
use crate::error::{QspiError, QspiResult};

/// In-memory NOR flash. Erase sets bytes to 0xFF, programming ANDs bits in.
#[derive(Debug, Clone)]
pub struct RamFlash {
    erase_block_size: u32,
    data: Vec<u8>,
    erased: Vec<u32>,
}

impl RamFlash {
    pub fn new(erase_block_size: u32, total_size: u32) -> Self {
        Self {
            erase_block_size,
            data: vec![0xff; total_size as usize],
            erased: Vec::new(),
        }
    }

    /// Creates a device holding `contents` at `offset`, with the rest blank.
    pub fn with_contents(
        erase_block_size: u32,
        total_size: u32,
        offset: u32,
        contents: &[u8],
    ) -> Self {
        let mut flash = Self::new(erase_block_size, total_size);
        let start = offset as usize;
        flash.data[start..start + contents.len()].copy_from_slice(contents);
        flash
    }

    /// Block starts erased so far, in issue order.
    pub fn erased_blocks(&self) -> &[u32] {
        &self.erased
    }

    pub fn clear_erase_log(&mut self) {
        self.erased.clear();
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Overwrites bytes without erase semantics, to simulate corruption.
    pub fn poke(&mut self, offset: u32, bytes: &[u8]) {
        let start = offset as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

impl FlashDevice for RamFlash {
    fn info(&self) -> FlashInfo {
        FlashInfo {
            erase_block_size: self.erase_block_size,
            total_size: self.data.len() as u32,
        }
    }

    fn erase_block(&mut self, offset: u32) -> QspiResult<()> {
        check_range(&self.info(), offset.into(), self.erase_block_size.into())?;
        if offset % self.erase_block_size != 0 {
            return Err(QspiError::Erase {
                offset,
                source: nix::errno::Errno::EINVAL,
            });
        }
        let start = offset as usize;
        self.data[start..start + self.erase_block_size as usize].fill(0xff);
        self.erased.push(offset);
        Ok(())
    }

    fn read_range(&self, offset: u32, buf: &mut [u8]) -> QspiResult<()> {
        check_range(&self.info(), offset.into(), buf.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_range(&mut self, offset: u32, data: &[u8]) -> QspiResult<()> {
        check_range(&self.info(), offset.into(), data.len() as u64)?;
        let start = offset as usize;
        for (dst, src) in self.data[start..start + data.len()].iter_mut().zip(data) {
            *dst &= *src;
        }
        Ok(())
    }
}
