// Licensed under the Apache-2.0 license

use crate::device::FlashDevice;
use crate::error::{QspiError, QspiResult};
use flash_layout::Partition;
use log::info;
use std::io::ErrorKind;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// No staged image, the partition was left untouched.
    Skipped,
    Written,
}

/// Erase, program and verify of whole partitions.
pub struct ImageWriter<'a, F: FlashDevice + ?Sized> {
    flash: &'a mut F,
}

impl<'a, F: FlashDevice + ?Sized> ImageWriter<'a, F> {
    pub fn new(flash: &'a mut F) -> Self {
        Self { flash }
    }

    /// Programs `image` into `partition`, padded with 0xFF to the partition
    /// size, then reads the range back and compares it.
    pub fn write_and_verify(
        &mut self,
        image: Option<&[u8]>,
        partition: &Partition,
    ) -> QspiResult<WriteOutcome> {
        let image = match image {
            Some(image) if !image.is_empty() => image,
            _ => {
                info!("No image for {}, skipping", partition.id);
                return Ok(WriteOutcome::Skipped);
            }
        };
        let size = partition.size as usize;
        if image.len() > size {
            return Err(QspiError::Size {
                what: format!("{} image", partition.id),
                len: image.len(),
                limit: size,
            });
        }

        let mut padded = vec![0xff; size];
        padded[..image.len()].copy_from_slice(image);

        self.flash.erase_range(partition.offset, partition.size)?;
        info!(
            "Programming {} ({} bytes) at 0x{:06x}",
            partition.id,
            image.len(),
            partition.offset
        );
        self.flash.write_range(partition.offset, &padded)?;

        let readback = self.read_partition(partition)?;
        if let Some(i) = readback.iter().zip(&padded).position(|(a, b)| a != b) {
            return Err(QspiError::Verify {
                partition: partition.id,
                offset: partition.offset + i as u32,
            });
        }
        info!("Verify passed: {}", partition.id);
        Ok(WriteOutcome::Written)
    }

    /// Like [`Self::write_and_verify`] with the image read from `path`. A
    /// missing file counts as an absent image.
    pub fn write_file(&mut self, path: &Path, partition: &Partition) -> QspiResult<WriteOutcome> {
        match std::fs::read(path) {
            Ok(image) => self.write_and_verify(Some(&image), partition),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("{} not staged, skipping", path.display());
                Ok(WriteOutcome::Skipped)
            }
            Err(e) => Err(QspiError::file(path, e)),
        }
    }

    pub fn read_partition(&self, partition: &Partition) -> QspiResult<Vec<u8>> {
        let mut buf = vec![0u8; partition.size as usize];
        self.flash.read_range(partition.offset, &mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ram::RamFlash;
    use flash_layout::{PartitionId, FLASH_SIZE};

    const BLOCK: u32 = 0x10000;

    /// Flash whose reads come back with one bit stuck low.
    struct StuckBit {
        inner: RamFlash,
        offset: u32,
    }

    impl FlashDevice for StuckBit {
        fn info(&self) -> crate::FlashInfo {
            self.inner.info()
        }
        fn erase_block(&mut self, offset: u32) -> QspiResult<()> {
            self.inner.erase_block(offset)
        }
        fn read_range(&self, offset: u32, buf: &mut [u8]) -> QspiResult<()> {
            self.inner.read_range(offset, buf)?;
            if (offset..offset + buf.len() as u32).contains(&self.offset) {
                buf[(self.offset - offset) as usize] &= 0xfe;
            }
            Ok(())
        }
        fn write_range(&mut self, offset: u32, data: &[u8]) -> QspiResult<()> {
            self.inner.write_range(offset, data)
        }
    }

    #[test]
    fn test_short_image_is_padded() {
        let mut flash = RamFlash::new(BLOCK, FLASH_SIZE);
        let part = PartitionId::DeviceTree.partition();
        let outcome = ImageWriter::new(&mut flash)
            .write_and_verify(Some(b"dtb!"), &part)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);

        let start = part.offset as usize;
        let data = &flash.contents()[start..start + part.size as usize];
        assert_eq!(&data[..4], b"dtb!");
        assert!(data[4..].iter().all(|&b| b == 0xff));
        assert_eq!(flash.erased_blocks(), &[0x80000, 0x90000, 0xa0000, 0xb0000]);
    }

    #[test]
    fn test_rewrite_over_programmed_data() {
        let mut flash = RamFlash::new(BLOCK, FLASH_SIZE);
        let part = PartitionId::PerUnit.partition();
        let mut writer = ImageWriter::new(&mut flash);
        writer.write_and_verify(Some(b"\x00\x00"), &part).unwrap();
        writer.write_and_verify(Some(b"dhcp\0"), &part).unwrap();
        assert_eq!(&writer.read_partition(&part).unwrap()[..6], b"dhcp\0\xff");
    }

    #[test]
    fn test_oversized_image_rejected_before_erase() {
        let mut flash = RamFlash::new(BLOCK, FLASH_SIZE);
        let part = PartitionId::Version.partition();
        let image = vec![0u8; part.size as usize + 1];
        let err = ImageWriter::new(&mut flash)
            .write_and_verify(Some(&image), &part)
            .unwrap_err();
        assert!(matches!(err, QspiError::Size { .. }));
        assert!(flash.erased_blocks().is_empty());
    }

    #[test]
    fn test_empty_and_missing_images_skip() {
        let mut flash = RamFlash::new(BLOCK, FLASH_SIZE);
        let part = PartitionId::Kernel.partition();
        let mut writer = ImageWriter::new(&mut flash);
        assert_eq!(
            writer.write_and_verify(None, &part).unwrap(),
            WriteOutcome::Skipped
        );
        assert_eq!(
            writer.write_and_verify(Some(&[]), &part).unwrap(),
            WriteOutcome::Skipped
        );

        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            writer
                .write_file(&dir.path().join("missing.bin"), &part)
                .unwrap(),
            WriteOutcome::Skipped
        );
        let empty = dir.path().join("empty.bin");
        std::fs::write(&empty, b"").unwrap();
        assert_eq!(
            writer.write_file(&empty, &part).unwrap(),
            WriteOutcome::Skipped
        );
        assert!(flash.erased_blocks().is_empty());
    }

    #[test]
    fn test_verify_failure_reports_offset() {
        let part = PartitionId::Bootloader.partition();
        let mut flash = StuckBit {
            inner: RamFlash::new(BLOCK, FLASH_SIZE),
            offset: 0x1234,
        };
        let err = ImageWriter::new(&mut flash)
            .write_and_verify(Some(&[0xffu8; 0x2000]), &part)
            .unwrap_err();
        match err {
            QspiError::Verify { partition, offset } => {
                assert_eq!(partition, PartitionId::Bootloader);
                assert_eq!(offset, 0x1234);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
