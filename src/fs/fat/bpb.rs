//! BIOS Parameter Block Parsing
//!
//! Parses the partition's boot sector into [`FatVolume`], the fixed
//! geometry every other FAT operation derives its disk addresses from.
//! FAT type is classified from the data-area cluster count, never from
//! the volume label strings; Microsoft's spec is explicit that the
//! strings are unreliable.

use static_assertions::const_assert_eq;

use crate::fs::fat::FatError;
use crate::io::block::SECTOR_SIZE;

// Cluster-count thresholds from the FAT specification.
const FAT12_MAX_CLUSTERS: u32 = 4085;
const FAT16_MAX_CLUSTERS: u32 = 65525;

const_assert_eq!(SECTOR_SIZE, 512);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat16,
    Fat32,
}

/// Where the root directory lives; the two FAT generations differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootDir {
    /// FAT16: a fixed run of sectors between the FATs and the data
    /// area, holding exactly `entries` slots.
    Region { first_sector: u32, entries: u16 },
    /// FAT32: an ordinary cluster chain starting here.
    Chain { first_cluster: u32 },
}

/// Parsed, validated volume geometry.
///
/// `offset` is in 512-byte disk blocks; everything else is in the
/// volume's own sector size, which may be larger.
#[derive(Debug, Clone, Copy)]
pub struct FatVolume {
    /// Disk blocks from the start of the drive to the partition.
    pub offset: u64,
    pub fat_type: FatType,
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u16,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub sectors_per_fat: u32,
    pub root_dir: RootDir,
    /// Sectors occupied by the FAT16 root directory region; zero on
    /// FAT32.
    pub root_dir_sectors: u32,
    pub cluster_count: u32,
    // Derived values used on every access.
    pub bytes_per_cluster: u32,
    pub entries_per_sector: u16,
    pub blks_per_sector: u16,
    pub blks_per_cluster: u16,
}

fn le16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

impl FatVolume {
    /// Parse the boot sector of a partition starting `offset` disk
    /// blocks into the drive.
    pub fn parse(offset: u64, bpb: &[u8; SECTOR_SIZE]) -> Result<Self, FatError> {
        if le16(bpb, 510) != 0xAA55 {
            return Err(FatError::BadSignature);
        }

        let bytes_per_sector = le16(bpb, 11);
        match bytes_per_sector {
            512 | 1024 | 2048 | 4096 => {}
            other => return Err(FatError::BadBytesPerSector(other)),
        }

        let sectors_per_cluster = bpb[13];
        if !sectors_per_cluster.is_power_of_two() {
            return Err(FatError::BadSectorsPerCluster(sectors_per_cluster));
        }

        let root_entries = le16(bpb, 17);
        let root_dir_sectors =
            (u32::from(root_entries) * 32).div_ceil(u32::from(bytes_per_sector));

        let sectors_per_fat = match le16(bpb, 22) {
            0 => le32(bpb, 36),
            small => u32::from(small),
        };
        let total_sectors = match le16(bpb, 19) {
            0 => le32(bpb, 32),
            small => u32::from(small),
        };

        let reserved_sectors = le16(bpb, 14);
        let num_fats = bpb[16];

        let first_data_sector = u32::from(reserved_sectors)
            + u32::from(num_fats) * sectors_per_fat
            + root_dir_sectors;
        let data_sectors = total_sectors.saturating_sub(first_data_sector);
        let cluster_count = data_sectors / u32::from(sectors_per_cluster);

        let (fat_type, root_dir) = if cluster_count < FAT12_MAX_CLUSTERS {
            return Err(FatError::Fat12Unsupported(cluster_count));
        } else if cluster_count < FAT16_MAX_CLUSTERS {
            let first_sector =
                u32::from(reserved_sectors) + u32::from(num_fats) * sectors_per_fat;
            (
                FatType::Fat16,
                RootDir::Region {
                    first_sector,
                    entries: root_entries,
                },
            )
        } else {
            (
                FatType::Fat32,
                RootDir::Chain {
                    first_cluster: le32(bpb, 44),
                },
            )
        };

        Ok(Self {
            offset,
            fat_type,
            bytes_per_sector,
            sectors_per_cluster: u16::from(sectors_per_cluster),
            reserved_sectors,
            num_fats,
            sectors_per_fat,
            root_dir,
            root_dir_sectors,
            cluster_count,
            bytes_per_cluster: u32::from(bytes_per_sector) * u32::from(sectors_per_cluster),
            entries_per_sector: bytes_per_sector / 32,
            blks_per_sector: bytes_per_sector / SECTOR_SIZE as u16,
            blks_per_cluster: (u32::from(bytes_per_sector) * u32::from(sectors_per_cluster)
                / SECTOR_SIZE as u32) as u16,
        })
    }

    /// Disk block of the first sector of `cluster` in the data area.
    pub fn cluster_lba(&self, cluster: u32) -> u64 {
        let volume_sector = u64::from(self.reserved_sectors)
            + u64::from(self.num_fats) * u64::from(self.sectors_per_fat)
            + u64::from(self.root_dir_sectors)
            + u64::from(cluster - 2) * u64::from(self.sectors_per_cluster);
        self.offset + volume_sector * u64::from(self.blks_per_sector)
    }

    /// Disk block of the first sector of the FAT16 root directory
    /// region.
    pub fn root_region_lba(&self, first_sector: u32) -> u64 {
        self.offset + u64::from(first_sector) * u64::from(self.blks_per_sector)
    }

    /// Locate the FAT entry for `cluster`: the volume-relative sector
    /// holding it and the byte offset within that sector.
    pub fn fat_entry_location(&self, cluster: u32) -> (u32, usize) {
        let entry_width = match self.fat_type {
            FatType::Fat16 => 2,
            FatType::Fat32 => 4,
        };
        let fat_offset = cluster * entry_width;
        let sector = u32::from(self.reserved_sectors) + fat_offset / u32::from(self.bytes_per_sector);
        let offset = (fat_offset % u32::from(self.bytes_per_sector)) as usize;
        (sector, offset)
    }
}
