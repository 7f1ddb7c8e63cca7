//! Partition and Filesystem Detection
//!
//! One-shot scan of sector zero that classifies the partition scheme,
//! probes each primary partition entry for a filesystem it recognizes
//! and mounts the matching driver into the VFS.
//!
//! Drives repartitioned over USB bridges sometimes carry an MBR written
//! with a larger logical sector size, leaving every partition offset
//! scaled. A multiplier hint stored in the MBR code area lets each
//! probe retry at the scaled offset when the nominal one holds nothing.

use alloc::boxed::Box;
use alloc::string::String;
use core::fmt;
use core::fmt::Write as _;

use log::{debug, error, info, warn};

use crate::fs::fat::{self, FatError};
use crate::fs::vfs::{Filesystem, Vfs};
use crate::fs::FsError;
use crate::io::block::{DiskError, SharedDisk, SECTOR_SIZE};

/// Byte offset of the partition table in the MBR.
const PART_TABLE_OFFSET: usize = 446;
/// Size of one partition table entry.
const PART_ENTRY_SIZE: usize = 16;
/// Number of primary partition entries.
const PART_ENTRIES: usize = 4;

/// Magic at the start of the vendor firmware partition.
const FIRMWARE_MAGIC: &[u8; 4] = b"]ih[";
/// EXT2 superblock magic, at byte 56 of the second sector of the
/// partition.
const EXT2_MAGIC: u16 = 0xEF53;
const EXT2_MAGIC_OFFSET: usize = 56;

/// Partition type codes the scan understands.
mod part_type {
    /// Nominally "empty"; the vendor uses it for the firmware
    /// partition in slot 0.
    pub const EMPTY: u8 = 0x00;
    pub const FAT: u8 = 0x0B;
    pub const EXT2: u8 = 0x83;
}

/// Errors that end a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectError {
    /// Sector zero matches no known partition scheme.
    InvalidMbr,
    /// The scheme was recognized but no partition entry validated.
    NoPartitions,
    /// Apple partition scheme found with no collaborator registered.
    UnsupportedScheme,
    /// A FAT partition probed valid but failed to mount.
    Mount(FatError),
    Disk(DiskError),
}

impl fmt::Display for DetectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectError::InvalidMbr => write!(f, "sector zero is not a recognized partition map"),
            DetectError::NoPartitions => write!(f, "no valid partitions found"),
            DetectError::UnsupportedScheme => write!(f, "unsupported partition scheme"),
            DetectError::Mount(e) => write!(f, "mount failed: {e}"),
            DetectError::Disk(e) => write!(f, "disk error: {e}"),
        }
    }
}

impl From<DiskError> for DetectError {
    fn from(e: DiskError) -> Self {
        DetectError::Disk(e)
    }
}

/// Constructor for an out-of-tree filesystem driver, dispatched by
/// partition type.
pub type NewFsFn = fn(slot: u8, offset: u64, disk: SharedDisk) -> Result<Box<dyn Filesystem>, FsError>;

/// Collaborator handling the Apple partition scheme; receives the raw
/// first sector and takes over the whole scan.
pub type AppleScanFn =
    fn(sector0: &[u8; SECTOR_SIZE], disk: &SharedDisk, vfs: &mut Vfs) -> Result<u32, DetectError>;

/// MBR scanner with pluggable constructors for the filesystems this
/// crate does not implement itself. The FAT driver is built in.
pub struct Detector {
    ext2: Option<NewFsFn>,
    firmware: Option<NewFsFn>,
    apple: Option<AppleScanFn>,
}

impl Detector {
    pub fn new() -> Self {
        Self {
            ext2: None,
            firmware: None,
            apple: None,
        }
    }

    pub fn with_ext2(mut self, f: NewFsFn) -> Self {
        self.ext2 = Some(f);
        self
    }

    pub fn with_firmware(mut self, f: NewFsFn) -> Self {
        self.firmware = Some(f);
        self
    }

    pub fn with_apple(mut self, f: AppleScanFn) -> Self {
        self.apple = Some(f);
        self
    }

    /// Read sector zero, classify the scheme and mount every partition
    /// that probes valid. Returns the count of valid partitions.
    pub fn scan(&self, disk: &SharedDisk, vfs: &mut Vfs) -> Result<u32, DetectError> {
        let mut sector0 = [0u8; SECTOR_SIZE];
        disk.lock().read_blocks(&mut sector0, 0, 1)?;

        if u16::from_le_bytes([sector0[510], sector0[511]]) == 0xAA55 {
            info!("[DETECT] DOS partition map");
            return self.scan_mbr(&sector0, disk, vfs);
        }

        if sector0[0] == b'E' && sector0[1] == b'R' {
            info!("[DETECT] Apple partition scheme");
            return match self.apple {
                Some(f) => f(&sector0, disk, vfs),
                None => Err(DetectError::UnsupportedScheme),
            };
        }

        error!(
            "[DETECT] invalid MBR: signature {:#06x}, disk id {:#010x}",
            u16::from_le_bytes([sector0[510], sector0[511]]),
            u32::from_le_bytes([sector0[440], sector0[441], sector0[442], sector0[443]]),
        );
        error!("[DETECT] sector zero starts: {}", hex_preview(&sector0[..32]));
        Err(DetectError::InvalidMbr)
    }

    fn scan_mbr(
        &self,
        mbr: &[u8; SECTOR_SIZE],
        disk: &SharedDisk,
        vfs: &mut Vfs,
    ) -> Result<u32, DetectError> {
        let multiplier = block_multiplier(mbr);
        let mut found = 0u32;

        for slot in 0..PART_ENTRIES {
            let entry = &mbr[PART_TABLE_OFFSET + slot * PART_ENTRY_SIZE..];
            let ptype = entry[4];
            let offset = u64::from(u32::from_le_bytes([
                entry[8], entry[9], entry[10], entry[11],
            ]));
            let slot = slot as u8;

            match ptype {
                part_type::EMPTY if slot == 0 => {
                    // The vendor stores the firmware partition under the
                    // "empty" type code, always in slot 0.
                    match self.probe(disk, offset, multiplier, 0, |s| &s[..4] == FIRMWARE_MAGIC)? {
                        Some(offset) => {
                            found += 1;
                            info!("[DETECT] [{}]: firmware at {}", slot, offset);
                            self.mount_hook(self.firmware, slot, offset, disk, vfs);
                        }
                        None => error!("[DETECT] [{}]: bad firmware entry", slot),
                    }
                }
                part_type::EMPTY => debug!("[DETECT] [{}]: empty", slot),
                part_type::EXT2 => {
                    let probe = self.probe(disk, offset, multiplier, 2, |s| {
                        u16::from_le_bytes([s[EXT2_MAGIC_OFFSET], s[EXT2_MAGIC_OFFSET + 1]])
                            == EXT2_MAGIC
                    })?;
                    match probe {
                        Some(offset) => {
                            found += 1;
                            info!("[DETECT] [{}]: ext2 at {}", slot, offset);
                            self.mount_hook(self.ext2, slot, offset, disk, vfs);
                        }
                        None => error!("[DETECT] [{}]: bad ext2 entry", slot),
                    }
                }
                part_type::FAT => {
                    let probe = self.probe(disk, offset, multiplier, 0, |s| {
                        u16::from_le_bytes([s[510], s[511]]) == 0xAA55
                    })?;
                    match probe {
                        Some(offset) => {
                            found += 1;
                            info!("[DETECT] [{}]: FAT at {}", slot, offset);
                            let fs = fat::new_fatfs(slot, offset, disk.clone())
                                .map_err(DetectError::Mount)?;
                            vfs.register(slot, fs);
                        }
                        None => error!("[DETECT] [{}]: bad FAT entry", slot),
                    }
                }
                other => warn!("[DETECT] [{}]: unknown type {:#04x}", slot, other),
            }
        }

        if found == 0 {
            error!("[DETECT] no valid partitions found");
            return Err(DetectError::NoPartitions);
        }

        info!("[DETECT] {} valid partitions", found);
        Ok(found)
    }

    /// Probe a partition at its nominal offset and, failing that, at
    /// the multiplier-scaled offset. `extra` shifts the probe within
    /// the partition; the shift itself is never scaled.
    fn probe(
        &self,
        disk: &SharedDisk,
        offset: u64,
        multiplier: u64,
        extra: u64,
        test: impl Fn(&[u8; SECTOR_SIZE]) -> bool,
    ) -> Result<Option<u64>, DiskError> {
        let mut buf = [0u8; SECTOR_SIZE];

        disk.lock().read_blocks(&mut buf, offset + extra, 1)?;
        if test(&buf) {
            return Ok(Some(offset));
        }

        if multiplier > 1 {
            let scaled = offset * multiplier;
            disk.lock().read_blocks(&mut buf, scaled + extra, 1)?;
            if test(&buf) {
                return Ok(Some(scaled));
            }
        }

        Ok(None)
    }

    /// Mount a partition through a pluggable constructor, if one is
    /// registered. A constructor failure skips the partition rather
    /// than ending the scan.
    fn mount_hook(
        &self,
        hook: Option<NewFsFn>,
        slot: u8,
        offset: u64,
        disk: &SharedDisk,
        vfs: &mut Vfs,
    ) {
        let Some(hook) = hook else { return };
        match hook(slot, offset, disk.clone()) {
            Ok(fs) => vfs.register(slot, fs),
            Err(e) => error!("[DETECT] [{}]: mount failed: {}", slot, e),
        }
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

/// Sector-size multiplier hint from the MBR code area; values outside
/// 1..=4 mean the hint is absent or garbage and the offsets are taken
/// as written.
fn block_multiplier(mbr: &[u8; SECTOR_SIZE]) -> u64 {
    let hint = u64::from(mbr[11] | mbr[12]) / 2;
    if (1..=4).contains(&hint) {
        hint
    } else {
        1
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    let mut out = String::new();
    for b in bytes {
        let _ = write!(out, "{b:02x} ");
    }
    out
}
