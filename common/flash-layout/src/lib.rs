// Licensed under the Apache-2.0 license
#![no_std]

//! QSPI flash partition table of the BMC.
//!
//! The boot ROM and boot loader locate every partition at a fixed offset, so
//! the table is a compile-time constant. Two layouts share the address space:
//! the legacy one with separate kernel and initramfs partitions, and the
//! current one with a single combined image. Each layout is validated once
//! before use.

use core::fmt;

/// Total size of one QSPI device.
pub const FLASH_SIZE: u32 = 0x100_0000;

/// Size of the boot-loader environment blob.
pub const ENV_SIZE: usize = 8192;
/// Size of the CRC32 header at the start of the environment blob.
pub const ENV_CRC_SIZE: usize = 4;
/// Size of the `key=value` payload following the CRC header.
pub const ENV_DATA_SIZE: usize = ENV_SIZE - ENV_CRC_SIZE;

/// Version string location inside the version partition.
pub const VERSION_OFFSET: usize = 0x000;
pub const VERSION_LEN: usize = 0x008;
/// Length of the `dev` marker of development builds.
pub const VERSION_DEV_LEN: usize = 0x003;
/// Offset of the optional JSON description inside the version partition.
pub const VERSION_JSON_OFFSET: usize = 0x100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionId {
    Bootloader,
    DeviceTree,
    Env,
    Kernel,
    Initramfs,
    Image,
    PerUnit,
    Version,
}

impl PartitionId {
    pub const ALL: [PartitionId; 8] = [
        PartitionId::Bootloader,
        PartitionId::DeviceTree,
        PartitionId::Env,
        PartitionId::Kernel,
        PartitionId::Initramfs,
        PartitionId::Image,
        PartitionId::PerUnit,
        PartitionId::Version,
    ];

    /// Short tag used in staged image file names (`<machine>-<tag>.bin`).
    pub const fn tag(&self) -> &'static str {
        match self {
            PartitionId::Bootloader => "ubo",
            PartitionId::DeviceTree => "dtb",
            PartitionId::Env => "env",
            PartitionId::Kernel => "ker",
            PartitionId::Initramfs => "ini",
            PartitionId::Image => "itb",
            PartitionId::PerUnit => "per",
            PartitionId::Version => "ver",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.tag() == tag)
    }

    pub const fn partition(&self) -> Partition {
        match self {
            PartitionId::Bootloader => BOOTLOADER,
            PartitionId::DeviceTree => DEVICE_TREE,
            PartitionId::Env => ENV,
            PartitionId::Kernel => KERNEL,
            PartitionId::Initramfs => INITRAMFS,
            PartitionId::Image => IMAGE,
            PartitionId::PerUnit => PER_UNIT,
            PartitionId::Version => VERSION,
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub id: PartitionId,
    pub offset: u32,
    pub size: u32,
}

impl Partition {
    pub const fn new(id: PartitionId, offset: u32, size: u32) -> Self {
        Self { id, offset, size }
    }

    /// Exclusive end address. Computed in 64 bits so a bogus entry cannot wrap.
    pub const fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }

    pub const fn overlaps(&self, other: &Partition) -> bool {
        (self.offset as u64) < other.end() && (other.offset as u64) < self.end()
    }
}

pub const BOOTLOADER: Partition = Partition::new(PartitionId::Bootloader, 0x000000, 0x080000);
pub const DEVICE_TREE: Partition = Partition::new(PartitionId::DeviceTree, 0x080000, 0x040000);
pub const ENV: Partition = Partition::new(PartitionId::Env, 0x0c0000, 0x040000);
pub const KERNEL: Partition = Partition::new(PartitionId::Kernel, 0x100000, 0x200000);
pub const INITRAMFS: Partition = Partition::new(PartitionId::Initramfs, 0x300000, 0x300000);
pub const IMAGE: Partition = Partition::new(PartitionId::Image, 0x100000, 0x800000);
pub const PER_UNIT: Partition = Partition::new(PartitionId::PerUnit, 0xf80000, 0x040000);
pub const VERSION: Partition = Partition::new(PartitionId::Version, 0xfc0000, 0x040000);

const LEGACY_PARTITIONS: [Partition; 7] = [
    BOOTLOADER,
    DEVICE_TREE,
    ENV,
    KERNEL,
    INITRAMFS,
    PER_UNIT,
    VERSION,
];

const CURRENT_PARTITIONS: [Partition; 6] =
    [BOOTLOADER, DEVICE_TREE, ENV, IMAGE, PER_UNIT, VERSION];

/// Boot-critical partitions, written first by every upgrade.
pub const BOOT_PARTITIONS: [PartitionId; 3] = [
    PartitionId::Bootloader,
    PartitionId::DeviceTree,
    PartitionId::Env,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Separate kernel and initramfs partitions.
    Legacy,
    /// One combined image partition.
    Current,
}

impl Layout {
    pub const fn partitions(&self) -> &'static [Partition] {
        match self {
            Layout::Legacy => &LEGACY_PARTITIONS,
            Layout::Current => &CURRENT_PARTITIONS,
        }
    }

    pub fn partition(&self, id: PartitionId) -> Option<Partition> {
        self.partitions().iter().copied().find(|p| p.id == id)
    }

    /// Application partitions written after the boot-critical ones, in
    /// programming order.
    pub fn application_partitions(&self) -> impl Iterator<Item = Partition> {
        self.partitions()
            .iter()
            .copied()
            .filter(|p| !BOOT_PARTITIONS.contains(&p.id))
    }

    /// Checks that the layout fits `device_size` and that no two partitions
    /// overlap.
    pub fn validate(&self, device_size: u32) -> Result<(), LayoutError> {
        let parts = self.partitions();
        for (i, a) in parts.iter().enumerate() {
            if a.size == 0 {
                return Err(LayoutError::Empty(a.id));
            }
            if a.end() > device_size as u64 {
                return Err(LayoutError::OutOfBounds {
                    id: a.id,
                    end: a.end(),
                    device_size,
                });
            }
            if let Some(b) = parts[i + 1..].iter().find(|b| a.overlaps(b)) {
                return Err(LayoutError::Overlap { a: a.id, b: b.id });
            }
        }
        Ok(())
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::Legacy => f.write_str("legacy"),
            Layout::Current => f.write_str("current"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    Empty(PartitionId),
    OutOfBounds {
        id: PartitionId,
        end: u64,
        device_size: u32,
    },
    Overlap {
        a: PartitionId,
        b: PartitionId,
    },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::Empty(id) => write!(f, "partition {id} has zero size"),
            LayoutError::OutOfBounds {
                id,
                end,
                device_size,
            } => write!(
                f,
                "partition {id} ends at 0x{end:x}, past device size 0x{device_size:x}"
            ),
            LayoutError::Overlap { a, b } => write!(f, "partitions {a} and {b} overlap"),
        }
    }
}

impl core::error::Error for LayoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layouts_validate() {
        Layout::Legacy.validate(FLASH_SIZE).unwrap();
        Layout::Current.validate(FLASH_SIZE).unwrap();
    }

    #[test]
    fn test_layout_too_small_device() {
        assert_eq!(
            Layout::Current.validate(0x80_0000),
            Err(LayoutError::OutOfBounds {
                id: PartitionId::Image,
                end: 0x90_0000,
                device_size: 0x80_0000,
            })
        );
    }

    #[test]
    fn test_legacy_and_combined_image_overlap() {
        assert!(KERNEL.overlaps(&IMAGE));
        assert!(INITRAMFS.overlaps(&IMAGE));
        assert!(!KERNEL.overlaps(&INITRAMFS));
        assert!(!ENV.overlaps(&KERNEL));
    }

    #[test]
    fn test_application_order() {
        let mut legacy = Layout::Legacy.application_partitions().map(|p| p.id);
        assert_eq!(legacy.next(), Some(PartitionId::Kernel));
        assert_eq!(legacy.next(), Some(PartitionId::Initramfs));
        assert_eq!(legacy.next(), Some(PartitionId::PerUnit));
        assert_eq!(legacy.next(), Some(PartitionId::Version));
        assert_eq!(legacy.next(), None);

        let mut current = Layout::Current.application_partitions().map(|p| p.id);
        assert_eq!(current.next(), Some(PartitionId::Image));
    }

    #[test]
    fn test_tags() {
        for id in PartitionId::ALL {
            assert_eq!(PartitionId::from_tag(id.tag()), Some(id));
            assert_eq!(id.partition().id, id);
        }
        assert_eq!(PartitionId::from_tag("xyz"), None);
    }
}
