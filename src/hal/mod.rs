//! Hardware Abstraction Layer
//!
//! Register-level PIO access and the ATA disk driver.

pub mod ata;
pub mod pio;
