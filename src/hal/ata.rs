//! ATA/PIO Disk Driver
//!
//! Polled PIO driver for the single fixed drive. Supports IDENTIFY
//! DEVICE, LBA28 and LBA48 multiple-block reads, power management
//! commands and a small LRU block cache.
//!
//! Some drives with physical sectors larger than 512 bytes refuse reads
//! that do not start on a physical sector boundary. The driver therefore
//! rounds every hardware read down to the drive's alignment boundary and
//! reads the whole aligned run; on the cached path the extra blocks land
//! in the cache instead of being wasted.

use log::{error, info};

use crate::hal::pio::{cmd, control, devhead, reg, AtaBus, Status};
use crate::io::block::{BlockDevice, DiskError, DiskGeometry, SECTOR_SIZE};
use crate::io::cache::BlockCache;

/// Largest sector addressable with the 28-bit command set.
const LBA28_MAX: u64 = 0x0FFF_FFFF;

/// The one ATA device, behind whatever bus reaches its registers.
pub struct AtaDisk<B: AtaBus> {
    bus: B,
    geom: DiskGeometry,
    cache: BlockCache,
    model: [u8; 40],
    serial: [u8; 20],
    firmware: [u8; 8],
    // Last command issued, kept for error diagnostics.
    last_command: u8,
    last_sector: u64,
    last_count: u16,
}

impl<B: AtaBus> AtaDisk<B> {
    /// Probe the controller, identify the drive and build the driver.
    ///
    /// Fails if no controller answers the register probe, if the
    /// identify data fails its integrity check or if the identify
    /// transfer ends in a device error.
    pub fn identify(bus: B) -> Result<Self, DiskError> {
        let mut disk = Self {
            bus,
            geom: DiskGeometry {
                total_sectors: 0,
                chs: [0; 3],
                lba48: false,
                alignment_log2: 0,
            },
            cache: BlockCache::new(),
            model: [b' '; 40],
            serial: [b' '; 20],
            firmware: [b' '; 8],
            last_command: 0,
            last_sector: 0,
            last_count: 0,
        };

        if !disk.probe_controller() {
            error!("[ATA] no controller found");
            return Err(DiskError::NoController);
        }

        disk.identify_device()?;
        Ok(disk)
    }

    /// Check that a controller is actually present by writing patterns
    /// to two general-purpose registers and reading them back.
    fn probe_controller(&mut self) -> bool {
        self.bus.outb(reg::DEVICEHEAD, 0xA0 | devhead::DEVICE_0);
        self.delay_400ns();

        self.bus.outb(reg::SECT_COUNT, 0x55);
        self.bus.outb(reg::LBA0, 0xAA);
        self.bus.outb(reg::SECT_COUNT, 0xAA);
        self.bus.outb(reg::LBA0, 0x55);
        self.bus.outb(reg::SECT_COUNT, 0x55);
        self.bus.outb(reg::LBA0, 0xAA);

        self.bus.inb(reg::SECT_COUNT) == 0x55 && self.bus.inb(reg::LBA0) == 0xAA
    }

    fn command(&mut self, cmd: u8) {
        self.last_command = cmd;
        self.bus.outb(reg::COMMAND, cmd);
    }

    /// Burn at least 400ns by reading the alternate status register.
    fn delay_400ns(&mut self) {
        for _ in 0..16 {
            let _ = self.bus.inb(reg::ALTSTATUS);
        }
    }

    fn status(&mut self) -> Status {
        Status::from_bits_retain(self.bus.inb(reg::STATUS))
    }

    /// Spin until the drive drops BSY. The drive is the only other agent
    /// in the system, so there is nothing sensible to do on a hang but
    /// keep waiting.
    fn wait_not_busy(&mut self) {
        while Status::from_bits_retain(self.bus.inb(reg::ALTSTATUS)).contains(Status::BSY) {
            core::hint::spin_loop();
        }
    }

    /// Transfer up to `count` blocks of read data from the data
    /// register. `None` discards the data. Returns bytes received; the
    /// transfer ends early if the drive drops DRQ or raises ERR.
    fn transfer_block(&mut self, mut dst: Option<&mut [u8]>, count: usize) -> usize {
        let words = (SECTOR_SIZE / 2) * count;
        let mut received = 0usize;

        for i in 0..words {
            self.wait_not_busy();
            let status = self.status();
            if status.intersection(Status::ERR | Status::DRQ) != Status::DRQ {
                break;
            }
            let word = self.bus.inw(reg::DATA);
            if let Some(buf) = dst.as_deref_mut() {
                buf[2 * i] = word as u8;
                buf[2 * i + 1] = (word >> 8) as u8;
            }
            received += 1;
        }

        received * 2
    }

    /// Pull the data phase of a read command: transfer `count` blocks,
    /// wait out any trailing busy state and check how the command ended.
    fn receive_read_data(&mut self, dst: Option<&mut [u8]>, count: usize) -> Result<(), DiskError> {
        let bytes = self.transfer_block(dst, count);

        self.wait_not_busy();

        let status = self.status();
        if status.contains(Status::ERR) {
            let err = self.bus.inb(reg::ERROR);
            error!(
                "[ATA] device error: status {:#04x} error {:#04x} command {:#04x}",
                status.bits(),
                err,
                self.last_command
            );
            if self.last_command == cmd::READ_SECTORS || self.last_command == cmd::READ_SECTORS_EXT
            {
                error!(
                    "[ATA]   sector {} count {}",
                    self.last_sector, self.last_count
                );
            }
            return Err(DiskError::Io(err));
        }

        if bytes != count * SECTOR_SIZE {
            error!(
                "[ATA] short transfer: expected {} bytes, received {}",
                count * SECTOR_SIZE,
                bytes
            );
            return Err(DiskError::ShortTransfer);
        }

        Ok(())
    }

    fn identify_device(&mut self) -> Result<(), DiskError> {
        self.bus.outb(reg::DEVICEHEAD, 0xA0 | devhead::DEVICE_0);
        self.bus.outb(reg::FEATURES, 0);
        self.bus.outb(reg::CONTROL, control::NIEN);
        self.bus.outb(reg::SECT_COUNT, 0);
        self.bus.outb(reg::LBA0, 0);
        self.bus.outb(reg::LBA1, 0);
        self.bus.outb(reg::LBA2, 0);

        self.command(cmd::IDENTIFY_DEVICE);
        self.delay_400ns();

        let mut raw = [0u8; SECTOR_SIZE];
        self.receive_read_data(Some(&mut raw), 1)?;

        // Word 255 optionally carries an integrity word: signature 0xA5
        // in the low byte, checksum in the high byte. The unsigned sum
        // of all 512 bytes is zero when the data is intact.
        if raw[510] == 0xA5 {
            let sum = raw.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
            if sum != 0 {
                error!("[ATA] identify checksum mismatch (sum {:#04x})", sum);
                return Err(DiskError::IdentifyChecksum);
            }
            info!("[ATA] identify ok (checksum pass)");
        } else {
            info!("[ATA] identify ok (no checksum)");
        }

        let word = |idx: usize| u16::from_le_bytes([raw[2 * idx], raw[2 * idx + 1]]);

        // Word 80: major version bitfield, one bit per standard revision.
        let version = word(80);
        if version != 0x0000 && version != 0xFFFF {
            for bit in (2..=14).rev() {
                if version & (1 << bit) != 0 {
                    if bit > 3 {
                        info!("[ATA] ATA/ATAPI-{}", bit);
                    } else {
                        info!("[ATA] ATA-{}", bit);
                    }
                    break;
                }
            }
        }

        copy_ata_string(&mut self.model, &raw, 27);
        copy_ata_string(&mut self.serial, &raw, 10);
        copy_ata_string(&mut self.firmware, &raw, 23);

        info!("[ATA] model: {}", self.model());
        info!("[ATA] serial: {}", self.serial());
        info!("[ATA] firmware: {}", self.firmware_rev());

        self.geom.chs = [word(1), word(3), word(6)];
        info!(
            "[ATA] CHS: {}/{}/{}",
            self.geom.chs[0], self.geom.chs[1], self.geom.chs[2]
        );

        // Word 83 bit 10 is the only authoritative LBA48 indicator; the
        // capacity words must not be used to infer it.
        self.geom.lba48 = word(83) & (1 << 10) != 0;

        self.geom.total_sectors = if self.geom.lba48 {
            u64::from(word(100))
                | u64::from(word(101)) << 16
                | u64::from(word(102)) << 32
                | u64::from(word(103)) << 48
        } else {
            u64::from(word(60)) | u64::from(word(61)) << 16
        };

        let size_mb = self.geom.size_mb();
        info!(
            "[ATA] {}, {}.{}GB",
            if self.geom.lba48 { "LBA48" } else { "LBA28" },
            size_mb / 1024,
            (size_mb % 1024) / 10
        );

        self.geom.alignment_log2 = self.detect_alignment_quirk(size_mb);

        Ok(())
    }

    /// Some drive families only complete reads that cover whole physical
    /// sectors. The Toshiba 10GAH drives use 1024-byte sectors and fail
    /// reads starting at odd LBAs; drives past 127GiB are assumed to
    /// carry 4KiB sectors.
    fn detect_alignment_quirk(&self, size_mb: u64) -> u8 {
        let model = &self.model;
        if model.starts_with(b"TOSHIBA ") && &model[12..17] == b"10GAH" {
            info!("[ATA] enabling Toshiba 10GAH alignment quirk");
            1
        } else if size_mb > 127 * 1024 {
            info!("[ATA] large drive, using 4K-aligned reads");
            3
        } else {
            0
        }
    }

    /// Program the task file for a read at `lba` and issue the command.
    fn send_read_command(&mut self, lba: u64, count: u16) {
        self.last_sector = lba;
        self.last_count = count;

        // LBA28 carries address bits 24-27 in the head nibble; LBA48
        // leaves it clear.
        let head = if self.geom.lba48 {
            0
        } else {
            ((lba >> 24) & 0x0F) as u8
        };
        self.bus.outb(
            reg::DEVICEHEAD,
            0xA0 | devhead::LBA_ADDRESSING | devhead::DEVICE_0 | head,
        );
        self.delay_400ns();
        self.bus.outb(reg::FEATURES, 0);
        self.bus.outb(reg::CONTROL, control::NIEN | 0x08);

        if self.geom.lba48 {
            // The controller requires the high-order register bytes to
            // be written before the low-order ones.
            self.bus.outb(reg::SECCOUNT_HIGH, (count >> 8) as u8);
            self.bus.outb(reg::LBA3, (lba >> 24) as u8);
            self.bus.outb(reg::LBA4, (lba >> 32) as u8);
            self.bus.outb(reg::LBA5, (lba >> 40) as u8);
        }

        self.bus.outb(reg::SECT_COUNT, count as u8);
        self.bus.outb(reg::LBA0, lba as u8);
        self.bus.outb(reg::LBA1, (lba >> 8) as u8);
        self.bus.outb(reg::LBA2, (lba >> 16) as u8);

        if self.geom.lba48 {
            self.command(cmd::READ_SECTORS_EXT);
        } else {
            self.command(cmd::READ_SECTORS);
        }

        self.delay_400ns();
        self.delay_400ns();
    }

    /// Read one block, going to the hardware only on a cache miss.
    ///
    /// Hardware reads are widened to the drive's alignment boundary; on
    /// the cached path every block of the widened run is kept.
    fn read_block_at(
        &mut self,
        dst: &mut [u8],
        sector: u64,
        use_cache: bool,
    ) -> Result<(), DiskError> {
        if use_cache {
            if let Some(data) = self.cache.lookup(sector) {
                dst[..SECTOR_SIZE].copy_from_slice(data);
                return Ok(());
            }
        }

        if !self.geom.lba48 && sector > LBA28_MAX {
            error!(
                "[ATA] sector {} is beyond LBA28 addressing",
                sector
            );
            return Err(DiskError::LbaOutOfRange(sector));
        }

        let run = 1u64 << self.geom.alignment_log2;
        let first = sector & !(run - 1);

        self.send_read_command(first, run as u16);

        if use_cache {
            let mut block = [0u8; SECTOR_SIZE];
            for lba in first..first + run {
                self.receive_read_data(Some(&mut block), 1)?;
                self.cache.insert(lba, &block);
                if lba == sector {
                    dst[..SECTOR_SIZE].copy_from_slice(&block);
                }
            }
            self.cache.bump();
        } else {
            for lba in first..first + run {
                if lba == sector {
                    self.receive_read_data(Some(&mut dst[..SECTOR_SIZE]), 1)?;
                } else {
                    self.receive_read_data(None, 1)?;
                }
            }
        }

        Ok(())
    }

    fn read_loop(
        &mut self,
        dst: &mut [u8],
        sector: u64,
        count: usize,
        use_cache: bool,
    ) -> Result<(), DiskError> {
        for n in 0..count {
            let chunk = &mut dst[n * SECTOR_SIZE..(n + 1) * SECTOR_SIZE];
            self.read_block_at(chunk, sector + n as u64, use_cache)?;
        }
        Ok(())
    }

    pub fn model(&self) -> &str {
        trimmed_str(&self.model)
    }

    pub fn serial(&self) -> &str {
        trimmed_str(&self.serial)
    }

    pub fn firmware_rev(&self) -> &str {
        trimmed_str(&self.firmware)
    }

    /// Drop all cached blocks.
    pub fn flush_cache(&mut self) {
        self.cache.clear();
    }
}

impl<B: AtaBus + Send> BlockDevice for AtaDisk<B> {
    fn read_blocks(&mut self, dst: &mut [u8], sector: u64, count: usize) -> Result<(), DiskError> {
        self.read_loop(dst, sector, count, true)
    }

    fn read_blocks_uncached(
        &mut self,
        dst: &mut [u8],
        sector: u64,
        count: usize,
    ) -> Result<(), DiskError> {
        self.read_loop(dst, sector, count, false)
    }

    fn geometry(&self) -> DiskGeometry {
        self.geom
    }

    /// Variations 1-4 issue vendor-specific standby opcodes that some
    /// drive generations want instead of the standard command.
    fn standby(&mut self, variation: u8) {
        let opcode = match variation {
            1 => 0x94,
            2 => 0x96,
            3 => 0xE0,
            4 => 0xE2,
            _ => cmd::STANDBY,
        };
        self.command(opcode);
        self.delay_400ns();
        self.wait_not_busy();
        // Reading the status register clears the interrupt some drives
        // raise on entering standby.
        let _ = self.bus.inb(reg::STATUS);
    }

    fn sleep(&mut self) {
        self.command(cmd::SLEEP);
        self.delay_400ns();
        self.delay_400ns();
        self.wait_not_busy();
        self.delay_400ns();
        self.delay_400ns();
        // The drive raises an interrupt when ready to sleep and waits
        // for the status read that acknowledges it.
        let _ = self.bus.inb(reg::STATUS);
    }
}

/// Copy an identify-data ASCII field starting at `word_off` words in.
/// The drive stores two characters per word with the first character in
/// the high byte, so each byte pair is swapped on the way out.
fn copy_ata_string(dst: &mut [u8], raw: &[u8; SECTOR_SIZE], word_off: usize) {
    for (i, pair) in dst.chunks_exact_mut(2).enumerate() {
        pair[0] = raw[2 * (word_off + i) + 1];
        pair[1] = raw[2 * (word_off + i)];
    }
}

fn trimmed_str(field: &[u8]) -> &str {
    let end = field
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map_or(0, |p| p + 1);
    core::str::from_utf8(&field[..end]).unwrap_or("")
}
