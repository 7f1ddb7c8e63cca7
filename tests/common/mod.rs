//! Shared test fixtures: an emulated ATA drive behind the register-level
//! bus trait, a RAM-backed block device, and builders for identify data,
//! MBRs and small FAT volume images.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use bootdisk::fs::fat::dir::lfn_checksum;
use bootdisk::hal::pio::{cmd, reg, AtaBus, NUM_REGS};
use bootdisk::io::block::{BlockDevice, DiskError, DiskGeometry, SECTOR_SIZE};

/// Register-level emulation of a single polled ATA drive over an
/// in-memory image. Reads past the end of the image return zeroes, so
/// images only need to materialize the sectors tests actually touch.
pub struct MockAtaBus {
    regs: [u8; NUM_REGS],
    image: Vec<u8>,
    identify: [u8; SECTOR_SIZE],
    pending: Vec<u16>,
    cursor: usize,
    error: bool,
    probe_ok: bool,
    fail_reads: bool,
    /// Every read command issued to the drive, as (lba, count).
    pub reads: Arc<Mutex<Vec<(u64, u32)>>>,
    /// Non-read commands, in issue order.
    pub commands: Arc<Mutex<Vec<u8>>>,
}

impl MockAtaBus {
    pub fn new(image: Vec<u8>, identify: [u8; SECTOR_SIZE]) -> Self {
        Self {
            regs: [0; NUM_REGS],
            image,
            identify,
            pending: Vec::new(),
            cursor: 0,
            error: false,
            probe_ok: true,
            fail_reads: false,
            reads: Arc::new(Mutex::new(Vec::new())),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A bus with nothing behind it: register writes do not stick.
    pub fn absent() -> Self {
        let mut bus = Self::new(Vec::new(), [0; SECTOR_SIZE]);
        bus.probe_ok = false;
        bus
    }

    /// Make every read command end in a device error.
    pub fn fail_reads(&mut self) {
        self.fail_reads = true;
    }

    pub fn hw_reads(&self) -> usize {
        self.reads.lock().unwrap().len()
    }

    fn exec(&mut self, command: u8) {
        self.error = false;
        match command {
            cmd::IDENTIFY_DEVICE => {
                self.pending = words_of(&self.identify);
                self.cursor = 0;
            }
            cmd::READ_SECTORS => {
                let lba = u64::from(self.regs[reg::LBA0])
                    | u64::from(self.regs[reg::LBA1]) << 8
                    | u64::from(self.regs[reg::LBA2]) << 16
                    | u64::from(self.regs[reg::DEVICEHEAD] & 0x0F) << 24;
                let count = match self.regs[reg::SECT_COUNT] {
                    0 => 256,
                    n => u32::from(n),
                };
                self.queue_read(lba, count);
            }
            cmd::READ_SECTORS_EXT => {
                let lba = u64::from(self.regs[reg::LBA0])
                    | u64::from(self.regs[reg::LBA1]) << 8
                    | u64::from(self.regs[reg::LBA2]) << 16
                    | u64::from(self.regs[reg::LBA3]) << 24
                    | u64::from(self.regs[reg::LBA4]) << 32
                    | u64::from(self.regs[reg::LBA5]) << 40;
                let count = u32::from(self.regs[reg::SECT_COUNT])
                    | u32::from(self.regs[reg::SECCOUNT_HIGH]) << 8;
                let count = if count == 0 { 65536 } else { count };
                self.queue_read(lba, count);
            }
            other => self.commands.lock().unwrap().push(other),
        }
    }

    fn queue_read(&mut self, lba: u64, count: u32) {
        self.reads.lock().unwrap().push((lba, count));
        if self.fail_reads {
            self.error = true;
            self.pending.clear();
            self.cursor = 0;
            return;
        }

        let mut bytes = vec![0u8; count as usize * SECTOR_SIZE];
        let start = lba as usize * SECTOR_SIZE;
        if start < self.image.len() {
            let avail = (self.image.len() - start).min(bytes.len());
            bytes[..avail].copy_from_slice(&self.image[start..start + avail]);
        }
        self.pending = words_of(&bytes);
        self.cursor = 0;
    }

    fn status(&self) -> u8 {
        let mut s = 0x40; // DRDY
        if self.error {
            s |= 0x01; // ERR
        } else if self.cursor < self.pending.len() {
            s |= 0x08; // DRQ
        }
        s
    }
}

impl AtaBus for MockAtaBus {
    fn outb(&mut self, r: usize, val: u8) {
        if self.probe_ok {
            self.regs[r] = val;
        }
        if r == reg::COMMAND {
            self.exec(val);
        }
    }

    fn inb(&mut self, r: usize) -> u8 {
        match r {
            reg::STATUS | reg::ALTSTATUS => self.status(),
            reg::ERROR => {
                if self.error {
                    0x04 // ABRT
                } else {
                    0
                }
            }
            _ => self.regs[r],
        }
    }

    fn inw(&mut self, r: usize) -> u16 {
        if r == reg::DATA && self.cursor < self.pending.len() {
            let w = self.pending[self.cursor];
            self.cursor += 1;
            w
        } else {
            0
        }
    }
}

fn words_of(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|p| u16::from_le_bytes([p[0], p[1]]))
        .collect()
}

/// Builder for IDENTIFY DEVICE response sectors.
pub struct IdentifyBuilder {
    model: &'static str,
    serial: &'static str,
    firmware: &'static str,
    sectors: u64,
    lba48: bool,
    checksum: bool,
    corrupt_checksum: bool,
}

impl IdentifyBuilder {
    pub fn new() -> Self {
        Self {
            model: "FUJITSU MHT2040AT",
            serial: "NT50T234",
            firmware: "0022",
            sectors: 78_140_160, // ~40GB
            lba48: false,
            checksum: true,
            corrupt_checksum: false,
        }
    }

    pub fn model(mut self, model: &'static str) -> Self {
        self.model = model;
        self
    }

    pub fn sectors(mut self, sectors: u64) -> Self {
        self.sectors = sectors;
        self
    }

    pub fn lba48(mut self) -> Self {
        self.lba48 = true;
        self
    }

    pub fn no_checksum(mut self) -> Self {
        self.checksum = false;
        self
    }

    pub fn corrupt_checksum(mut self) -> Self {
        self.corrupt_checksum = true;
        self
    }

    pub fn build(self) -> [u8; SECTOR_SIZE] {
        let mut raw = [0u8; SECTOR_SIZE];
        let mut word = |idx: usize, val: u16| {
            raw[2 * idx..2 * idx + 2].copy_from_slice(&val.to_le_bytes());
        };

        // CHS geometry.
        word(1, 16383);
        word(3, 16);
        word(6, 63);
        // ATA/ATAPI-6.
        word(80, 1 << 6);

        if self.lba48 {
            word(83, 1 << 10);
            word(100, self.sectors as u16);
            word(101, (self.sectors >> 16) as u16);
            word(102, (self.sectors >> 32) as u16);
            word(103, (self.sectors >> 48) as u16);
        } else {
            word(60, self.sectors as u16);
            word(61, (self.sectors >> 16) as u16);
        }

        put_ata_string(&mut raw, 27, 20, self.model);
        put_ata_string(&mut raw, 10, 10, self.serial);
        put_ata_string(&mut raw, 23, 4, self.firmware);

        if self.checksum {
            raw[510] = 0xA5;
            let sum = raw[..511].iter().fold(0u8, |a, &b| a.wrapping_add(b));
            raw[511] = sum.wrapping_neg();
            if self.corrupt_checksum {
                raw[511] = raw[511].wrapping_add(1);
            }
        }

        raw
    }
}

impl Default for IdentifyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Store an ASCII string as identify-data words: two characters per
/// word, first character in the high byte, space padded.
fn put_ata_string(raw: &mut [u8; SECTOR_SIZE], word_off: usize, words: usize, s: &str) {
    let mut padded = s.as_bytes().to_vec();
    padded.resize(words * 2, b' ');
    for i in 0..words {
        raw[2 * (word_off + i)] = padded[2 * i + 1];
        raw[2 * (word_off + i) + 1] = padded[2 * i];
    }
}

/// RAM-backed block device for filesystem-level tests. Reads past the
/// end of the image return zeroes.
pub struct MockDisk {
    image: Vec<u8>,
    pub cached_reads: Arc<Mutex<usize>>,
    pub uncached_reads: Arc<Mutex<usize>>,
}

impl MockDisk {
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            image,
            cached_reads: Arc::new(Mutex::new(0)),
            uncached_reads: Arc::new(Mutex::new(0)),
        }
    }

    fn copy_out(&self, dst: &mut [u8], sector: u64, count: usize) {
        let len = count * SECTOR_SIZE;
        dst[..len].fill(0);
        let start = sector as usize * SECTOR_SIZE;
        if start < self.image.len() {
            let avail = (self.image.len() - start).min(len);
            dst[..avail].copy_from_slice(&self.image[start..start + avail]);
        }
    }
}

impl BlockDevice for MockDisk {
    fn read_blocks(&mut self, dst: &mut [u8], sector: u64, count: usize) -> Result<(), DiskError> {
        *self.cached_reads.lock().unwrap() += 1;
        self.copy_out(dst, sector, count);
        Ok(())
    }

    fn read_blocks_uncached(
        &mut self,
        dst: &mut [u8],
        sector: u64,
        count: usize,
    ) -> Result<(), DiskError> {
        *self.uncached_reads.lock().unwrap() += 1;
        self.copy_out(dst, sector, count);
        Ok(())
    }

    fn geometry(&self) -> DiskGeometry {
        DiskGeometry {
            total_sectors: 1 << 20,
            chs: [16383, 16, 63],
            lba48: false,
            alignment_log2: 0,
        }
    }

    fn standby(&mut self, _variation: u8) {}

    fn sleep(&mut self) {}
}

/// Write `bytes` into `disk` at the given absolute block and byte
/// offset, growing the image as needed.
pub fn write_at(disk: &mut Vec<u8>, block: u64, offset: usize, bytes: &[u8]) {
    let start = block as usize * SECTOR_SIZE + offset;
    if disk.len() < start + bytes.len() {
        disk.resize(start + bytes.len(), 0);
    }
    disk[start..start + bytes.len()].copy_from_slice(bytes);
}

/// An MBR with the given (type, lba offset) primary entries and a valid
/// signature.
pub fn mbr(entries: &[(u8, u32)]) -> [u8; SECTOR_SIZE] {
    let mut sector = [0u8; SECTOR_SIZE];
    for (i, &(ptype, offset)) in entries.iter().enumerate() {
        let base = 446 + i * 16;
        sector[base + 4] = ptype;
        sector[base + 8..base + 12].copy_from_slice(&offset.to_le_bytes());
    }
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

/// A 32-byte directory entry.
pub fn dirent(name11: &[u8; 11], attr: u8, cluster: u32, size: u32) -> [u8; 32] {
    let mut e = [0u8; 32];
    e[..11].copy_from_slice(name11);
    e[11] = attr;
    e[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
    e[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
    e[28..32].copy_from_slice(&size.to_le_bytes());
    e
}

/// One LFN slot carrying 13 characters of `text`.
pub fn lfn_slot(seq: u8, checksum: u8, text: &str) -> [u8; 32] {
    let mut e = [0u8; 32];
    e[0] = seq;
    e[11] = 0x0F;
    e[13] = checksum;
    let mut chars = text.chars();
    let mut terminated = false;
    for (start, units) in [(1usize, 5usize), (14, 6), (28, 2)] {
        for u in 0..units {
            let unit: u16 = match chars.next() {
                Some(c) => c as u16,
                None if !terminated => {
                    terminated = true;
                    0x0000
                }
                None => 0xFFFF,
            };
            e[start + 2 * u..start + 2 * u + 2].copy_from_slice(&unit.to_le_bytes());
        }
    }
    e
}

// Layout constants for the canned FAT32 image.
pub const FAT32_PART: u64 = 64;
const F32_RESERVED: u64 = 32;
const F32_FAT_SECTORS: u64 = 600;
const F32_TOTAL_SECTORS: u32 = 70_000;
const F32_DATA: u64 = FAT32_PART + F32_RESERVED + 2 * F32_FAT_SECTORS;

pub const KERNEL_LEN: usize = 1200;
pub const LOADER_CFG: &[u8] = b"default=linux\ntimeout=5\n";
pub const LONG_CONTENT: &[u8] = b"hello long name";

pub fn kernel_bytes() -> Vec<u8> {
    (0..KERNEL_LEN).map(|i| (i % 251) as u8).collect()
}

fn f32_cluster_block(cluster: u32) -> u64 {
    F32_DATA + u64::from(cluster - 2)
}

fn fat32_entry(disk: &mut Vec<u8>, cluster: u32, value: u32) {
    let fat_start = FAT32_PART + F32_RESERVED;
    let byte = u64::from(cluster) * 4;
    write_at(
        disk,
        fat_start + byte / SECTOR_SIZE as u64,
        (byte % SECTOR_SIZE as u64) as usize,
        &value.to_le_bytes(),
    );
}

/// Full disk image: MBR with a FAT32 partition in slot 1 and a small
/// populated volume. 512-byte clusters so multi-cluster files stay
/// small.
///
/// Contents:
/// - `LOADER.CFG` in the root
/// - `long file name.txt` (LFN over alias `LONGFI~1.TXT`)
/// - `ORPHAN.TXT` preceded by an LFN run with a bad checksum
/// - `BOOT/KERNEL.BIN`, three clusters long
pub fn build_fat32_disk() -> Vec<u8> {
    let mut disk = Vec::new();

    write_at(&mut disk, 0, 0, &mbr(&[(0x83, 0), (0x0B, FAT32_PART as u32)]));

    // Boot sector.
    let mut bpb = [0u8; SECTOR_SIZE];
    bpb[11..13].copy_from_slice(&512u16.to_le_bytes());
    bpb[13] = 1; // sectors per cluster
    bpb[14..16].copy_from_slice(&(F32_RESERVED as u16).to_le_bytes());
    bpb[16] = 2; // FAT copies
    bpb[32..36].copy_from_slice(&F32_TOTAL_SECTORS.to_le_bytes());
    bpb[36..40].copy_from_slice(&(F32_FAT_SECTORS as u32).to_le_bytes());
    bpb[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
    bpb[510] = 0x55;
    bpb[511] = 0xAA;
    write_at(&mut disk, FAT32_PART, 0, &bpb);

    // FAT chains: root (2), kernel (3 -> 4 -> 5), boot dir (6),
    // loader.cfg (7), long-name file (8).
    const EOC: u32 = 0x0FFF_FFFF;
    fat32_entry(&mut disk, 0, 0x0FFF_FFF8);
    fat32_entry(&mut disk, 1, EOC);
    fat32_entry(&mut disk, 2, EOC);
    fat32_entry(&mut disk, 3, 4);
    fat32_entry(&mut disk, 4, 5);
    fat32_entry(&mut disk, 5, EOC);
    fat32_entry(&mut disk, 6, EOC);
    fat32_entry(&mut disk, 7, EOC);
    fat32_entry(&mut disk, 8, EOC);

    // Root directory, cluster 2.
    let root = f32_cluster_block(2);
    let mut entries: Vec<[u8; 32]> = Vec::new();
    entries.push(dirent(b"BOOTVOL    ", 0x08, 0, 0));
    entries.push(dirent(b"LOADER  CFG", 0x20, 7, LOADER_CFG.len() as u32));
    // A deleted entry the walker must skip.
    let mut deleted = dirent(b"OLD     CFG", 0x20, 9, 1);
    deleted[0] = 0xE5;
    entries.push(deleted);

    let long_alias = *b"LONGFI~1TXT";
    let sum = lfn_checksum(&long_alias);
    entries.push(lfn_slot(0x42, sum, "e.txt"));
    entries.push(lfn_slot(0x01, sum, "long file nam"));
    entries.push(dirent(&long_alias, 0x20, 8, LONG_CONTENT.len() as u32));

    // Orphan LFN run: checksum does not match the entry that follows.
    let orphan = *b"ORPHAN  TXT";
    entries.push(lfn_slot(0x41, lfn_checksum(&orphan).wrapping_add(1), "ghost.txt"));
    entries.push(dirent(&orphan, 0x20, 8, LONG_CONTENT.len() as u32));

    entries.push(dirent(b"BOOT       ", 0x10, 6, 0));

    for (i, e) in entries.iter().enumerate() {
        write_at(&mut disk, root, i * 32, e);
    }

    // BOOT directory, cluster 6.
    let boot = f32_cluster_block(6);
    write_at(&mut disk, boot, 0, &dirent(b".          ", 0x10, 6, 0));
    write_at(&mut disk, boot, 32, &dirent(b"..         ", 0x10, 0, 0));
    write_at(
        &mut disk,
        boot,
        64,
        &dirent(b"KERNEL  BIN", 0x20, 3, KERNEL_LEN as u32),
    );

    // File contents.
    write_at(&mut disk, f32_cluster_block(7), 0, LOADER_CFG);
    write_at(&mut disk, f32_cluster_block(8), 0, LONG_CONTENT);
    let kernel = kernel_bytes();
    write_at(&mut disk, f32_cluster_block(3), 0, &kernel[..512]);
    write_at(&mut disk, f32_cluster_block(4), 0, &kernel[512..1024]);
    write_at(&mut disk, f32_cluster_block(5), 0, &kernel[1024..]);

    disk
}

// Layout constants for the canned FAT16 volume (no MBR; mounted
// directly at an offset).
pub const FAT16_PART: u64 = 16;
const F16_RESERVED: u64 = 4;
const F16_FAT_SECTORS: u64 = 40;
const F16_ROOT_ENTRIES: u16 = 512;
const F16_ROOT_SECTORS: u64 = 32;
const F16_TOTAL_SECTORS: u32 = 10_000;
const F16_ROOT: u64 = FAT16_PART + F16_RESERVED + 2 * F16_FAT_SECTORS;
const F16_DATA: u64 = F16_ROOT + F16_ROOT_SECTORS;

pub const CONFIG_TXT: &[u8] = b"backlight=on\n";

fn f16_cluster_block(cluster: u32) -> u64 {
    F16_DATA + u64::from(cluster - 2)
}

/// FAT16 volume with a root-region directory. `CONFIG.TXT` sits at
/// entry 20, past the first root sector, so lookups must walk the
/// region.
pub fn build_fat16_volume() -> Vec<u8> {
    let mut disk = Vec::new();

    let mut bpb = [0u8; SECTOR_SIZE];
    bpb[11..13].copy_from_slice(&512u16.to_le_bytes());
    bpb[13] = 1;
    bpb[14..16].copy_from_slice(&(F16_RESERVED as u16).to_le_bytes());
    bpb[16] = 2;
    bpb[17..19].copy_from_slice(&F16_ROOT_ENTRIES.to_le_bytes());
    bpb[22..24].copy_from_slice(&(F16_FAT_SECTORS as u16).to_le_bytes());
    bpb[32..36].copy_from_slice(&F16_TOTAL_SECTORS.to_le_bytes());
    bpb[510] = 0x55;
    bpb[511] = 0xAA;
    write_at(&mut disk, FAT16_PART, 0, &bpb);

    // FAT: clusters 0 and 1 reserved, 2 holds the file.
    let fat_start = FAT16_PART + F16_RESERVED;
    write_at(&mut disk, fat_start, 0, &0xFFF8u16.to_le_bytes());
    write_at(&mut disk, fat_start, 2, &0xFFFFu16.to_le_bytes());
    write_at(&mut disk, fat_start, 4, &0xFFFFu16.to_le_bytes());

    // Root region: 20 deleted entries push the file into the second
    // sector of the region, so lookups must cross a sector boundary.
    let mut deleted = dirent(b"GONE    TXT", 0x20, 0, 0);
    deleted[0] = 0xE5;
    for i in 0..20 {
        write_at(&mut disk, F16_ROOT + i / 16, (i % 16) as usize * 32, &deleted);
    }
    write_at(
        &mut disk,
        F16_ROOT + 1,
        4 * 32,
        &dirent(b"CONFIG  TXT", 0x20, 2, CONFIG_TXT.len() as u32),
    );

    write_at(&mut disk, f16_cluster_block(2), 0, CONFIG_TXT);

    // Materialize the whole claimed volume so directory walks read
    // zeroed sectors, not out-of-range ones.
    let end = (FAT16_PART + u64::from(F16_TOTAL_SECTORS)) as usize * SECTOR_SIZE;
    if disk.len() < end {
        disk.resize(end, 0);
    }

    disk
}

/// FAT16 volume whose root region advertises only 20 entries, a count
/// that is not a multiple of entries-per-sector. A plausible file entry
/// sits right past the advertised count, in the same sector as the last
/// legal slots; the walker must never surface it.
pub fn build_fat16_narrow_root() -> Vec<u8> {
    let mut disk = Vec::new();

    let mut bpb = [0u8; SECTOR_SIZE];
    bpb[11..13].copy_from_slice(&512u16.to_le_bytes());
    bpb[13] = 1;
    bpb[14..16].copy_from_slice(&(F16_RESERVED as u16).to_le_bytes());
    bpb[16] = 2;
    bpb[17..19].copy_from_slice(&20u16.to_le_bytes());
    bpb[22..24].copy_from_slice(&(F16_FAT_SECTORS as u16).to_le_bytes());
    bpb[32..36].copy_from_slice(&F16_TOTAL_SECTORS.to_le_bytes());
    bpb[510] = 0x55;
    bpb[511] = 0xAA;
    write_at(&mut disk, FAT16_PART, 0, &bpb);

    let fat_start = FAT16_PART + F16_RESERVED;
    write_at(&mut disk, fat_start, 0, &0xFFF8u16.to_le_bytes());
    write_at(&mut disk, fat_start, 2, &0xFFFFu16.to_le_bytes());
    write_at(&mut disk, fat_start, 4, &0xFFFFu16.to_le_bytes());

    // All 20 advertised entries are deleted; entry 20 is out of bounds.
    let mut deleted = dirent(b"GONE    TXT", 0x20, 0, 0);
    deleted[0] = 0xE5;
    for i in 0..20 {
        write_at(&mut disk, F16_ROOT + i / 16, (i % 16) as usize * 32, &deleted);
    }
    write_at(
        &mut disk,
        F16_ROOT + 1,
        4 * 32,
        &dirent(b"PHANTOM TXT", 0x20, 2, 4),
    );

    let end = (FAT16_PART + u64::from(F16_TOTAL_SECTORS)) as usize * SECTOR_SIZE;
    if disk.len() < end {
        disk.resize(end, 0);
    }

    disk
}
