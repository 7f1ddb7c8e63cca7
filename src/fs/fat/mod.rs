//! Read-Only FAT16/FAT32 Driver
//!
//! Mounts a FAT partition by parsing its BIOS Parameter Block, walks
//! directories with long-filename support and streams file contents
//! through the block layer. Whole-cluster reads bypass the block cache;
//! directory and FAT sectors go through it, and the driver additionally
//! keeps the most recently used FAT sector in its own buffer.

pub mod bpb;
pub mod dir;

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use log::{info, warn};

use crate::fs::vfs::{Filesystem, FsType};
use crate::fs::{FsError, SeekFrom};
use crate::io::block::{DiskError, SharedDisk, SECTOR_SIZE};

pub use bpb::{FatType, FatVolume, RootDir};

/// Hard limit of concurrently open files per mounted FAT volume.
pub const MAX_HANDLES: usize = 10;

/// Errors detected while mounting a FAT partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatError {
    /// Boot sector lacks the 0xAA55 signature.
    BadSignature,
    /// Bytes-per-sector is not one of the four legal values.
    BadBytesPerSector(u16),
    /// Sectors-per-cluster is not a power of two up to 128.
    BadSectorsPerCluster(u8),
    /// Cluster count classifies the volume as FAT12.
    Fat12Unsupported(u32),
    Disk(DiskError),
}

impl fmt::Display for FatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatError::BadSignature => write!(f, "boot sector signature missing"),
            FatError::BadBytesPerSector(v) => write!(f, "illegal bytes per sector {v}"),
            FatError::BadSectorsPerCluster(v) => write!(f, "illegal sectors per cluster {v}"),
            FatError::Fat12Unsupported(n) => {
                write!(f, "volume has {n} clusters, FAT12 is not supported")
            }
            FatError::Disk(e) => write!(f, "disk error: {e}"),
        }
    }
}

impl From<DiskError> for FatError {
    fn from(e: DiskError) -> Self {
        FatError::Disk(e)
    }
}

/// Per-file state behind a driver-local descriptor.
#[derive(Clone, Copy)]
struct OpenFile {
    first_cluster: u32,
    length: u32,
    position: u32,
}

/// Cursor over one directory, whichever shape it has.
struct DirState {
    /// FAT16 fixed root region, if that is what we are walking.
    region: Option<(u32, u16)>,
    cluster: u32,
    entry_idx: u32,
}

impl DirState {
    fn root(vol: &FatVolume) -> Self {
        match vol.root_dir {
            RootDir::Region {
                first_sector,
                entries,
            } => Self {
                region: Some((first_sector, entries)),
                cluster: 0,
                entry_idx: 0,
            },
            RootDir::Chain { first_cluster } => Self::chain(first_cluster),
        }
    }

    fn chain(first_cluster: u32) -> Self {
        Self {
            region: None,
            cluster: first_cluster,
            entry_idx: 0,
        }
    }
}

/// A mounted FAT volume.
pub struct FatFs {
    disk: SharedDisk,
    vol: FatVolume,
    /// Most recently used FAT sector, tagged with its volume-relative
    /// sector number.
    fat_buf: Vec<u8>,
    fat_buf_sector: Option<u32>,
    /// One cluster of scratch space; directory walks use its first
    /// sector.
    cluster_buf: Vec<u8>,
    handles: [Option<OpenFile>; MAX_HANDLES],
}

impl FatFs {
    /// Mount the partition starting `offset` disk blocks into the
    /// drive.
    pub fn mount(offset: u64, disk: SharedDisk) -> Result<Self, FatError> {
        let mut boot = [0u8; SECTOR_SIZE];
        disk.lock().read_blocks(&mut boot, offset, 1)?;

        let vol = FatVolume::parse(offset, &boot)?;
        match vol.fat_type {
            FatType::Fat16 => info!("[FAT] FAT16, {} clusters", vol.cluster_count),
            FatType::Fat32 => info!("[FAT] FAT32, {} clusters", vol.cluster_count),
        }

        Ok(Self {
            disk,
            fat_buf: vec![0; usize::from(vol.bytes_per_sector)],
            fat_buf_sector: None,
            cluster_buf: vec![0; vol.bytes_per_cluster as usize],
            vol,
            handles: [None; MAX_HANDLES],
        })
    }

    /// Follow the FAT one step. `Ok(None)` is end of chain; reserved
    /// and bad-cluster markers end the chain too.
    fn next_cluster(&mut self, cluster: u32) -> Result<Option<u32>, FsError> {
        let (sector, offset) = self.vol.fat_entry_location(cluster);

        if self.fat_buf_sector != Some(sector) {
            let lba = self.vol.offset + u64::from(sector) * u64::from(self.vol.blks_per_sector);
            self.disk
                .lock()
                .read_blocks(&mut self.fat_buf, lba, usize::from(self.vol.blks_per_sector))?;
            self.fat_buf_sector = Some(sector);
        }

        let next = match self.vol.fat_type {
            FatType::Fat16 => {
                let v = u32::from(u16::from_le_bytes([
                    self.fat_buf[offset],
                    self.fat_buf[offset + 1],
                ]));
                ((2..0xFFF0).contains(&v)).then_some(v)
            }
            FatType::Fat32 => {
                // Only 28 bits of a FAT32 entry are the cluster number.
                let v = u32::from_le_bytes([
                    self.fat_buf[offset],
                    self.fat_buf[offset + 1],
                    self.fat_buf[offset + 2],
                    self.fat_buf[offset + 3],
                ]) & 0x0FFF_FFFF;
                ((2..0x0FFF_FFF0).contains(&v)).then_some(v)
            }
        };

        Ok(next)
    }

    /// Next raw 32-byte entry of the directory, loading sectors as the
    /// cursor crosses into them. `Ok(None)` is the hard end of the
    /// directory (region exhausted or chain ended).
    fn next_raw_entry(
        &mut self,
        st: &mut DirState,
    ) -> Result<Option<[u8; dir::ENTRY_SIZE]>, FsError> {
        let eps = u32::from(self.vol.entries_per_sector);
        let idx = st.entry_idx;
        st.entry_idx += 1;

        // The region bound holds for every entry, not just the ones
        // that open a new sector; the advertised count need not be a
        // multiple of entries-per-sector.
        if let Some((_, entries)) = st.region {
            if idx >= u32::from(entries) {
                return Ok(None);
            }
        }

        if idx % eps != 0 {
            // Still inside the sector loaded by a previous call.
            let off = ((idx % eps) as usize) * dir::ENTRY_SIZE;
            let mut entry = [0u8; dir::ENTRY_SIZE];
            entry.copy_from_slice(&self.cluster_buf[off..off + dir::ENTRY_SIZE]);
            return Ok(Some(entry));
        }

        let mut sector_idx = idx / eps;
        let base_lba = match st.region {
            Some((first_sector, _)) => self.vol.root_region_lba(first_sector),
            None => {
                sector_idx %= u32::from(self.vol.sectors_per_cluster);
                if sector_idx == 0 && idx > 0 {
                    match self.next_cluster(st.cluster)? {
                        Some(c) => st.cluster = c,
                        None => return Ok(None),
                    }
                }
                self.vol.cluster_lba(st.cluster)
            }
        };

        let lba = base_lba + u64::from(sector_idx) * u64::from(self.vol.blks_per_sector);
        let bps = usize::from(self.vol.bytes_per_sector);
        self.disk.lock().read_blocks(
            &mut self.cluster_buf[..bps],
            lba,
            usize::from(self.vol.blks_per_sector),
        )?;

        let mut entry = [0u8; dir::ENTRY_SIZE];
        entry.copy_from_slice(&self.cluster_buf[..dir::ENTRY_SIZE]);
        Ok(Some(entry))
    }

    /// Next decoded entry, with LFN slots folded into the short entry
    /// they decorate.
    fn next_entry(
        &mut self,
        st: &mut DirState,
        lfn: &mut dir::LfnAssembler,
    ) -> Result<Option<dir::DirEntry>, FsError> {
        while let Some(raw) = self.next_raw_entry(st)? {
            match raw[0] {
                dir::ENTRY_END => return Ok(None),
                dir::ENTRY_DELETED => continue,
                _ => {}
            }
            if raw[11] == dir::ATTR_LFN {
                lfn.push_slot(&raw);
                continue;
            }
            return Ok(Some(dir::decode_entry(&self.vol, &raw, lfn)));
        }
        Ok(None)
    }

    /// Resolve `path` from the root, one `/`-separated segment at a
    /// time. Intermediate segments must name directories; the final
    /// segment must name a file. Matching is case-insensitive against
    /// both name forms.
    fn find_file(&mut self, path: &str) -> Result<Option<OpenFile>, FsError> {
        let mut st = DirState::root(&self.vol);
        let mut lfn = dir::LfnAssembler::new();
        let mut rest = path;

        'descend: loop {
            let (seg, next) = match rest.split_once('/') {
                Some((seg, next)) => (seg, Some(next)),
                None => (rest, None),
            };

            while let Some(entry) = self.next_entry(&mut st, &mut lfn)? {
                if entry.is_volume_label() {
                    continue;
                }
                if entry.is_directory() {
                    if let Some(next) = next {
                        if entry.matches(seg) {
                            st = DirState::chain(entry.first_cluster);
                            lfn.reset();
                            rest = next;
                            continue 'descend;
                        }
                    }
                } else if next.is_none() && entry.matches(seg) {
                    return Ok(Some(OpenFile {
                        first_cluster: entry.first_cluster,
                        length: entry.size,
                        position: 0,
                    }));
                }
            }
            return Ok(None);
        }
    }

    /// The parsed volume geometry.
    pub fn volume(&self) -> &FatVolume {
        &self.vol
    }

    fn file(&self, fd: u32) -> Result<OpenFile, FsError> {
        self.handles
            .get(fd as usize)
            .copied()
            .flatten()
            .ok_or(FsError::BadHandle)
    }
}

impl Filesystem for FatFs {
    fn fs_type(&self) -> FsType {
        FsType::Fat
    }

    fn open(&mut self, path: &str) -> Result<u32, FsError> {
        let file = match self.find_file(path)? {
            Some(f) => f,
            None => {
                warn!("[FAT] {} not found", path);
                return Err(FsError::NotFound);
            }
        };

        let slot = self
            .handles
            .iter()
            .position(|h| h.is_none())
            .ok_or(FsError::HandleTableFull)?;
        self.handles[slot] = Some(file);
        Ok(slot as u32)
    }

    fn close(&mut self, fd: u32) {
        if let Some(slot) = self.handles.get_mut(fd as usize) {
            *slot = None;
        }
    }

    fn read(&mut self, fd: u32, dst: &mut [u8]) -> Result<usize, FsError> {
        let file = self.file(fd)?;

        let remaining = file.length - file.position;
        let to_read = (dst.len() as u32).min(remaining);
        if to_read == 0 {
            return Ok(0);
        }

        let bpc = self.vol.bytes_per_cluster;

        // Fast-forward the chain to the cluster holding the current
        // position.
        let mut cluster = file.first_cluster;
        for _ in 0..file.position / bpc {
            cluster = self.next_cluster(cluster)?.ok_or(FsError::Corrupt)?;
        }

        let mut done: u32 = 0;
        while done < to_read {
            let pos = file.position + done;
            if done > 0 && pos % bpc == 0 {
                cluster = self.next_cluster(cluster)?.ok_or(FsError::Corrupt)?;
            }

            let off = (pos % bpc) as usize;
            let chunk = (bpc - off as u32).min(to_read - done) as usize;
            let lba = self.vol.cluster_lba(cluster);
            let blks = usize::from(self.vol.blks_per_cluster);

            if chunk == bpc as usize {
                // Whole cluster straight into the caller's buffer,
                // bypassing the cache.
                let dst = &mut dst[done as usize..done as usize + chunk];
                self.disk.lock().read_blocks_uncached(dst, lba, blks)?;
            } else {
                self.disk
                    .lock()
                    .read_blocks(&mut self.cluster_buf, lba, blks)?;
                dst[done as usize..done as usize + chunk]
                    .copy_from_slice(&self.cluster_buf[off..off + chunk]);
            }

            done += chunk as u32;
        }

        if let Some(slot) = self.handles.get_mut(fd as usize) {
            *slot = Some(OpenFile {
                position: file.position + to_read,
                ..file
            });
        }
        Ok(to_read as usize)
    }

    fn seek(&mut self, fd: u32, pos: SeekFrom) -> Result<(), FsError> {
        let file = self.file(fd)?;

        let target = match pos {
            SeekFrom::Start(n) => i64::try_from(n).map_err(|_| FsError::OutOfBounds)?,
            SeekFrom::Current(n) => i64::from(file.position) + n,
            SeekFrom::End(n) => i64::from(file.length) + n,
        };
        if target < 0 || target > i64::from(file.length) {
            return Err(FsError::OutOfBounds);
        }

        if let Some(slot) = self.handles.get_mut(fd as usize) {
            *slot = Some(OpenFile {
                position: target as u32,
                ..file
            });
        }
        Ok(())
    }

    fn tell(&mut self, fd: u32) -> Result<u64, FsError> {
        Ok(u64::from(self.file(fd)?.position))
    }
}

/// Constructor with the signature the partition detector dispatches
/// through.
pub fn new_fatfs(
    _slot: u8,
    offset: u64,
    disk: SharedDisk,
) -> Result<Box<dyn Filesystem>, FatError> {
    Ok(Box::new(FatFs::mount(offset, disk)?))
}
