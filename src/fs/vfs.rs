//! Virtual Filesystem Dispatch
//!
//! Small fixed dispatch table between the boot menu and the mounted
//! filesystem drivers. Paths select a driver either by filesystem-type
//! alias (`[fat32]/loader.cfg`) or by partition position
//! (`(hd0,1)/loader.cfg`); the remainder of the path is handed to the
//! driver untouched.
//!
//! Global file handles are indices into a fixed table mapping each open
//! file to its driver slot and driver-local descriptor.

use alloc::boxed::Box;

use log::warn;

use crate::fs::{FsError, SeekFrom};

/// Hard limit of mounted filesystems, one per primary partition entry.
pub const MAX_FS: usize = 4;
/// Hard limit of concurrently open files.
pub const MAX_FILES: usize = 10;

/// Filesystem families the path grammar can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    /// Vendor firmware partition holding raw OS images.
    Firmware,
    Fat,
    Ext2,
    HfsPlus,
}

/// A mounted filesystem driver.
///
/// Descriptors returned by `open` are driver-local; the VFS wraps them
/// in its own handle table.
pub trait Filesystem: Send {
    fn fs_type(&self) -> FsType;

    /// Open `path`, rooted at the filesystem root, with `/` separators
    /// and no leading slash.
    fn open(&mut self, path: &str) -> Result<u32, FsError>;

    /// Release a descriptor. Closing an already-closed descriptor is a
    /// no-op.
    fn close(&mut self, fd: u32);

    /// Read from the current position, clamped to end of file. Returns
    /// bytes read.
    fn read(&mut self, fd: u32, dst: &mut [u8]) -> Result<usize, FsError>;

    /// Reposition; the target must land within `0..=length`.
    fn seek(&mut self, fd: u32, pos: SeekFrom) -> Result<(), FsError>;

    fn tell(&mut self, fd: u32) -> Result<u64, FsError>;

    /// Integrity word for the file, for drivers whose format carries
    /// one. The FAT driver has nothing to report; the firmware
    /// partition driver does.
    fn checksum(&mut self, _fd: u32) -> Option<u32> {
        None
    }
}

#[derive(Clone, Copy)]
struct Handle {
    slot: usize,
    fd: u32,
}

/// The dispatch table: one driver per partition slot plus the global
/// open-file table.
pub struct Vfs {
    slots: [Option<Box<dyn Filesystem>>; MAX_FS],
    handles: [Option<Handle>; MAX_FILES],
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
            handles: [None; MAX_FILES],
        }
    }

    /// Mount `fs` at partition slot `slot`. A later mount at the same
    /// slot replaces the earlier one.
    pub fn register(&mut self, slot: u8, fs: Box<dyn Filesystem>) {
        let slot = slot as usize;
        if slot >= MAX_FS {
            warn!("[VFS] ignoring mount at out-of-range slot {}", slot);
            return;
        }
        if self.slots[slot].is_some() {
            warn!("[VFS] replacing filesystem at slot {}", slot);
        }
        self.slots[slot] = Some(fs);
    }

    /// Lowest mounted slot holding a filesystem of type `ty`.
    pub fn find_part(&self, ty: FsType) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|fs| fs.fs_type() == ty))
    }

    /// Number of mounted filesystems.
    pub fn mounted(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Split a path into the partition slot it addresses and the
    /// driver-local remainder.
    ///
    /// Aliases map to the first mounted filesystem of the family;
    /// `[linux]` prefers EXT2 and falls back to HFS+. The positional
    /// form `(hd0,N)` addresses slot `N` directly.
    fn resolve<'p>(&self, path: &'p str) -> Result<(usize, &'p str), FsError> {
        let bytes = path.as_bytes();

        if bytes.first() == Some(&b'[') {
            let part = if ["[dos]", "[fat]", "[win]", "[vfat]", "[fat32]"]
                .iter()
                .any(|a| path.starts_with(a))
            {
                self.find_part(FsType::Fat)
            } else if ["[ext]", "[ext2]"].iter().any(|a| path.starts_with(a)) {
                self.find_part(FsType::Ext2)
            } else if ["[hfs]", "[hfs+]"].iter().any(|a| path.starts_with(a)) {
                self.find_part(FsType::HfsPlus)
            } else if path.starts_with("[linux]") {
                self.find_part(FsType::Ext2)
                    .or_else(|| self.find_part(FsType::HfsPlus))
            } else {
                None
            };

            // The remainder starts one past the "]/" that closes the
            // alias.
            let close = path.find(']').ok_or(FsError::BadPath)?;
            let rest = path.get(close + 2..).ok_or(FsError::BadPath)?;
            return part.map(|p| (p, rest)).ok_or(FsError::BadPath);
        }

        if let Some(tail) = path.strip_prefix("(hd0,") {
            // "(hd0,N)/" is exactly eight characters.
            let digit = tail.as_bytes().first().copied().ok_or(FsError::BadPath)?;
            if !digit.is_ascii_digit() || tail.as_bytes().get(1) != Some(&b')') {
                return Err(FsError::BadPath);
            }
            let slot = (digit - b'0') as usize;
            if slot >= MAX_FS {
                return Err(FsError::BadPath);
            }
            let rest = path.get(8..).ok_or(FsError::BadPath)?;
            return Ok((slot, rest));
        }

        Err(FsError::BadPath)
    }

    /// Open a file by aliased or positional path.
    pub fn open(&mut self, path: &str) -> Result<usize, FsError> {
        let (slot, rest) = self.resolve(path)?;
        let fs = self.slots[slot].as_mut().ok_or(FsError::BadPath)?;

        let free = self
            .handles
            .iter()
            .position(|h| h.is_none())
            .ok_or(FsError::HandleTableFull)?;

        let fd = fs.open(rest)?;
        self.handles[free] = Some(Handle { slot, fd });
        Ok(free)
    }

    fn handle(&self, handle: usize) -> Result<Handle, FsError> {
        self.handles
            .get(handle)
            .copied()
            .flatten()
            .ok_or(FsError::BadHandle)
    }

    /// Close a handle. Closing an unopened handle is a no-op.
    pub fn close(&mut self, handle: usize) {
        if let Ok(h) = self.handle(handle) {
            if let Some(fs) = self.slots[h.slot].as_mut() {
                fs.close(h.fd);
            }
            self.handles[handle] = None;
        }
    }

    pub fn read(&mut self, handle: usize, dst: &mut [u8]) -> Result<usize, FsError> {
        let h = self.handle(handle)?;
        let fs = self.slots[h.slot].as_mut().ok_or(FsError::BadHandle)?;
        fs.read(h.fd, dst)
    }

    pub fn seek(&mut self, handle: usize, pos: SeekFrom) -> Result<(), FsError> {
        let h = self.handle(handle)?;
        let fs = self.slots[h.slot].as_mut().ok_or(FsError::BadHandle)?;
        fs.seek(h.fd, pos)
    }

    pub fn tell(&mut self, handle: usize) -> Result<u64, FsError> {
        let h = self.handle(handle)?;
        let fs = self.slots[h.slot].as_mut().ok_or(FsError::BadHandle)?;
        fs.tell(h.fd)
    }

    /// Integrity word for an open file, if its driver carries one.
    pub fn checksum(&mut self, handle: usize) -> Result<Option<u32>, FsError> {
        let h = self.handle(handle)?;
        let fs = self.slots[h.slot].as_mut().ok_or(FsError::BadHandle)?;
        Ok(fs.checksum(h.fd))
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}
