//! Bootdisk — the storage stack of a multi-OS bootloader for ARM-based
//! portable media players.
//!
//! Turns raw PIO-accessed disk hardware into named, seekable files that a
//! boot menu can load as executable images. Everything runs without an
//! operating system: single-threaded, polling-based, no interrupts.
//!
//! # Subsystems
//!
//! - **hal** - Hardware layer: ATA register file and the PIO disk driver
//! - **io** - Block device contract and the LRU block cache
//! - **fs** - Partition detection, VFS dispatch, FAT16/FAT32 driver
//! - **boot** - Entry point called after assembly bring-up, fatal-halt policy
//!
//! # Boot flow
//!
//! ```text
//! startup.S ─▶ Storage::init ─▶ AtaDisk::identify ─▶ Detector::scan ─▶ Vfs
//!                                                      │
//!                                 FatFs::mount ◀───────┘ (per partition)
//! ```
//!
//! Callers outside this crate (the boot menu and config loader) then issue
//! `vfs.open("[fat32]/loader.cfg")` and read through the returned handle.
//!
//! The crate is `no_std` and allocates through whatever global allocator
//! the surrounding loader installs (a bump allocator on real hardware).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod boot;
pub mod fs;
pub mod hal;
pub mod io;

pub use boot::Storage;
pub use fs::vfs::Vfs;
pub use io::block::{BlockDevice, DiskGeometry, SharedDisk, SECTOR_SIZE};
