//! Block Device Contract
//!
//! Everything above the driver sees the disk as an array of 512-byte
//! blocks addressed by absolute sector number. The driver decides for
//! itself which reads go through its cache; callers only choose between
//! the cached path and the uncached bulk path.

use alloc::sync::Arc;
use core::fmt;

use spin::Mutex;

/// Every transfer unit in this stack is a 512-byte sector.
pub const SECTOR_SIZE: usize = 512;

/// Geometry and addressing capabilities reported by the drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    /// Total addressable sectors.
    pub total_sectors: u64,
    /// Legacy cylinder/head/sector triple from the identify data.
    pub chs: [u16; 3],
    /// Drive implements the 48-bit address feature set.
    pub lba48: bool,
    /// Hardware reads must start on a `2^alignment_log2` sector boundary.
    ///
    /// Zero for well-behaved drives. Some drives return corrupt data for
    /// reads that start on odd sectors; large drives need coarser
    /// alignment still.
    pub alignment_log2: u8,
}

impl DiskGeometry {
    /// Capacity in whole mebibytes.
    pub fn size_mb(&self) -> u64 {
        self.total_sectors / 2048
    }
}

/// Errors surfaced by the block layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// Register probe found no controller at the given base address.
    NoController,
    /// Identify data carried a checksum byte and the checksum failed.
    IdentifyChecksum,
    /// Sector number not addressable with the drive's LBA mode.
    LbaOutOfRange(u64),
    /// Drive raised ERR or DF during a transfer; error register value.
    Io(u8),
    /// Drive dropped DRQ before the full transfer completed.
    ShortTransfer,
}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskError::NoController => write!(f, "no ATA controller present"),
            DiskError::IdentifyChecksum => write!(f, "identify data checksum mismatch"),
            DiskError::LbaOutOfRange(lba) => write!(f, "sector {lba:#x} beyond addressable range"),
            DiskError::Io(err) => write!(f, "device error {err:#04x}"),
            DiskError::ShortTransfer => write!(f, "device ended transfer early"),
        }
    }
}

/// A disk presented as an array of 512-byte sectors.
pub trait BlockDevice: Send {
    /// Read `count` sectors starting at `sector` through the block cache.
    ///
    /// `dst` must hold at least `count * SECTOR_SIZE` bytes.
    fn read_blocks(&mut self, dst: &mut [u8], sector: u64, count: usize) -> Result<(), DiskError>;

    /// Read `count` sectors without polluting the cache.
    ///
    /// Meant for large streaming reads (file contents) where caching
    /// would only evict more useful sectors.
    fn read_blocks_uncached(
        &mut self,
        dst: &mut [u8],
        sector: u64,
        count: usize,
    ) -> Result<(), DiskError>;

    /// Geometry reported at identify time.
    fn geometry(&self) -> DiskGeometry;

    /// Spin the drive down. `variation` selects between the standard
    /// standby opcode and the vendor alternatives some drive
    /// generations want.
    fn standby(&mut self, variation: u8);

    /// Put the drive to sleep; it stays unresponsive until reset. The
    /// loader issues this before handing control to an OS that brings
    /// its own driver.
    fn sleep(&mut self);
}

/// Shared handle to the one physical disk.
///
/// Filesystem drivers each hold a clone; the mutex is uncontended in the
/// single-threaded loader but keeps the ownership story honest.
pub type SharedDisk = Arc<Mutex<dyn BlockDevice>>;
