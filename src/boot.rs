//! Storage Bring-Up
//!
//! Called once after assembly start-up has installed the allocator.
//! Identifies the drive, scans the partition map and returns the ready
//! storage stack. There is no recovery path at this stage: a drive or
//! partition-map failure leaves nothing to boot from, so errors are
//! logged and the machine is parked.

use alloc::sync::Arc;

use log::error;
use spin::Mutex;

use crate::fs::detect::Detector;
use crate::fs::vfs::Vfs;
use crate::hal::ata::AtaDisk;
use crate::hal::pio::MmioBus;
use crate::io::block::SharedDisk;

/// The fully initialized storage stack.
pub struct Storage {
    pub disk: SharedDisk,
    pub vfs: Vfs,
}

impl Storage {
    /// Bring up the disk behind the IDE register block at `ide_base`
    /// and mount every partition `detector` recognizes.
    ///
    /// Parks the machine if no usable drive or partition is found.
    ///
    /// # Safety
    ///
    /// `ide_base` must be the physical address of a live ATA controller
    /// register block, identity-mapped and safe for volatile access.
    /// Must be called at most once, after the global allocator is up.
    pub unsafe fn init(ide_base: usize, detector: Detector) -> Storage {
        let bus = MmioBus::new(ide_base);

        let disk = match AtaDisk::identify(bus) {
            Ok(disk) => disk,
            Err(e) => {
                error!("[BOOT] drive bring-up failed: {}", e);
                halt();
            }
        };

        let disk: SharedDisk = Arc::new(Mutex::new(disk));
        let mut vfs = Vfs::new();

        if let Err(e) = detector.scan(&disk, &mut vfs) {
            error!("[BOOT] partition scan failed: {}", e);
            halt();
        }

        Storage { disk, vfs }
    }
}

/// Park the machine. Interrupts are never enabled, so a plain spin is
/// as stopped as this hardware gets.
pub fn halt() -> ! {
    loop {
        core::hint::spin_loop();
    }
}
