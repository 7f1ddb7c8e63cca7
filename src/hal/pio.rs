//! ATA Register File and PIO Bus Access
//!
//! The ATA controller on the target is reached through memory-mapped
//! registers rather than x86 port I/O. The command block sits at the IDE
//! base address with registers spaced 4 bytes apart (the PP chips align
//! their I/O registers on 4-byte boundaries); the control block sits at
//! `base + 0x200`. The LBA48 high-order registers are one byte above
//! their LBA28 counterparts.
//!
//! The [`AtaBus`] trait abstracts the register file so the driver can be
//! exercised against an emulated drive on the host.

use bitflags::bitflags;

/// Number of mapped register slots.
pub const NUM_REGS: usize = 14;

/// ATA register indices (slots into the bus address table)
pub mod reg {
    /// Data register, 16 bits wide
    pub const DATA: usize = 0x0;
    /// Error register (read)
    pub const ERROR: usize = 0x1;
    /// Features register (write)
    pub const FEATURES: usize = 0x1;
    /// Sector count / LBA48 sector count low
    pub const SECT_COUNT: usize = 0x2;
    /// LBA bits 0-7
    pub const LBA0: usize = 0x3;
    /// LBA bits 8-15
    pub const LBA1: usize = 0x4;
    /// LBA bits 16-23
    pub const LBA2: usize = 0x5;
    /// Device select + LBA mode + head nibble
    pub const DEVICEHEAD: usize = 0x6;
    /// Status register (read)
    pub const STATUS: usize = 0x7;
    /// Command register (write)
    pub const COMMAND: usize = 0x7;
    /// Device control register (write)
    pub const CONTROL: usize = 0x8;
    /// Alternate status: same as STATUS but does not ack interrupts
    pub const ALTSTATUS: usize = 0x8;
    /// Device address register
    pub const DA: usize = 0x9;
    /// LBA48 sector count high
    pub const SECCOUNT_HIGH: usize = 0xA;
    /// LBA bits 24-31
    pub const LBA3: usize = 0xB;
    /// LBA bits 32-39
    pub const LBA4: usize = 0xC;
    /// LBA bits 40-47
    pub const LBA5: usize = 0xD;
}

/// ATA commands
pub mod cmd {
    pub const IDENTIFY_DEVICE: u8 = 0xEC;
    pub const READ_SECTORS: u8 = 0x20;
    pub const READ_SECTORS_EXT: u8 = 0x24;
    pub const STANDBY: u8 = 0xE0;
    pub const SLEEP: u8 = 0xE6;
}

/// Device control register bits
pub mod control {
    /// nIEN: disable INTRQ assertion (we poll, never take interrupts)
    pub const NIEN: u8 = 0x02;
    /// SRST: host software reset
    pub const SRST: u8 = 0x04;
    /// HOB: high-order byte select (48-bit feature set)
    pub const HOB: u8 = 0x80;
}

/// Device/head register bits
pub mod devhead {
    pub const DEVICE_0: u8 = 0x00;
    pub const DEVICE_1: u8 = 0x10;
    pub const LBA_ADDRESSING: u8 = 0x40;
}

bitflags! {
    /// ATA status register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        /// Device is handling a command; other bits are invalid while set
        const BSY = 0x80;
        /// Device ready
        const DRDY = 0x40;
        /// Device fault
        const DF = 0x20;
        /// Seek complete
        const DSC = 0x10;
        /// Ready to transfer a word of data
        const DRQ = 0x08;
        /// Corrected data
        const CORR = 0x04;
        /// Index
        const IDX = 0x02;
        /// Error; details in the error register
        const ERR = 0x01;
    }
}

/// Register-level access to an ATA controller.
///
/// Exactly one command is outstanding at a time and every access is
/// synchronous; implementations never queue or reorder.
pub trait AtaBus {
    /// Write a byte to a command/control block register.
    fn outb(&mut self, reg: usize, val: u8);
    /// Read a byte from a command/control block register.
    fn inb(&mut self, reg: usize) -> u8;
    /// Read a 16-bit word from the data register.
    fn inw(&mut self, reg: usize) -> u16;
}

/// Memory-mapped ATA bus as found on the target hardware.
pub struct MmioBus {
    regs: [usize; NUM_REGS],
}

impl MmioBus {
    /// Build the register address table for an IDE block at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the physical address of a live ATA controller
    /// register block, identity-mapped and safe to access with volatile
    /// loads and stores.
    pub unsafe fn new(base: usize) -> Self {
        let base2 = base + 0x200;
        let mut regs = [0usize; NUM_REGS];

        regs[reg::DATA] = base;
        regs[reg::FEATURES] = base + 4;
        regs[reg::SECT_COUNT] = base + 2 * 4;
        regs[reg::LBA0] = base + 3 * 4;
        regs[reg::LBA1] = base + 4 * 4;
        regs[reg::LBA2] = base + 5 * 4;
        regs[reg::DEVICEHEAD] = base + 6 * 4;
        regs[reg::COMMAND] = base + 7 * 4;
        regs[reg::CONTROL] = base2 + 6 * 4;
        regs[reg::DA] = base2 + 7 * 4;

        // LBA48 high-order registers live one byte above their LBA28
        // counterparts.
        regs[reg::SECCOUNT_HIGH] = regs[reg::SECT_COUNT] + 1;
        regs[reg::LBA3] = regs[reg::LBA0] + 1;
        regs[reg::LBA4] = regs[reg::LBA1] + 1;
        regs[reg::LBA5] = regs[reg::LBA2] + 1;

        Self { regs }
    }
}

impl AtaBus for MmioBus {
    fn outb(&mut self, reg: usize, val: u8) {
        unsafe { core::ptr::write_volatile(self.regs[reg] as *mut u8, val) }
    }

    fn inb(&mut self, reg: usize) -> u8 {
        // Registers read back as 32-bit quantities; only the low byte
        // carries data.
        unsafe { core::ptr::read_volatile(self.regs[reg] as *const u32) as u8 }
    }

    fn inw(&mut self, reg: usize) -> u16 {
        unsafe { core::ptr::read_volatile(self.regs[reg] as *const u16) }
    }
}
