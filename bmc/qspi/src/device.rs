// Licensed under the Apache-2.0 license

use crate::error::{QspiError, QspiResult};
use log::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashInfo {
    pub erase_block_size: u32,
    pub total_size: u32,
}

/// Raw access to one NOR flash device.
///
/// Programming can only clear bits, so a range must be erased before it is
/// written. Every failure is returned to the caller as is; nothing is retried
/// and no record of partial progress is kept.
pub trait FlashDevice {
    fn info(&self) -> FlashInfo;

    /// Erases the single block starting at `offset`, which must be aligned.
    fn erase_block(&mut self, offset: u32) -> QspiResult<()>;

    fn read_range(&self, offset: u32, buf: &mut [u8]) -> QspiResult<()>;

    fn write_range(&mut self, offset: u32, data: &[u8]) -> QspiResult<()>;

    /// Erases every block touched by `[offset, offset + len)`, in ascending
    /// order. Erasing an erased block is harmless, so a failed call can be
    /// repeated from the start.
    fn erase_range(&mut self, offset: u32, len: u32) -> QspiResult<()> {
        let info = self.info();
        let block = u64::from(info.erase_block_size.max(1));
        let end = u64::from(offset) + u64::from(len);
        check_range(&info, u64::from(offset), u64::from(len))?;

        let mut start = u64::from(offset) / block * block;
        let end = end.div_ceil(block) * block;
        while start < end {
            let block_start = start as u32;
            info!("Erasing block 0x{:06x}", block_start);
            self.erase_block(block_start)?;
            start += block;
        }
        Ok(())
    }
}

pub(crate) fn check_range(info: &FlashInfo, offset: u64, len: u64) -> QspiResult<()> {
    if offset + len > u64::from(info.total_size) {
        return Err(QspiError::OutOfRange {
            offset,
            len,
            device_size: info.total_size,
        });
    }
    Ok(())
}
