//! LRU Block Cache
//!
//! Small fixed cache of recently read sectors. Metadata and FAT sectors
//! get touched over and over during a directory walk, and every hardware
//! read costs a full polled PIO transfer, so even 16 slots pay for
//! themselves many times over.
//!
//! Recency is tracked with a monotonically increasing tick counter. A
//! cache hit advances the counter and stamps the slot; a run of inserts
//! stamps every new slot with the same tick and the counter is advanced
//! once at the end of the run, so a multi-sector fill counts as a single
//! access.

use crate::io::block::SECTOR_SIZE;

/// Number of cached sectors.
pub const CACHE_BLOCKS: usize = 16;

/// Sector number that can never appear on the bus; marks a free slot.
const INVALID_SECTOR: u64 = u64::MAX;

struct Slot {
    sector: u64,
    tick: u64,
    data: [u8; SECTOR_SIZE],
}

/// Fixed-capacity LRU cache of disk sectors.
pub struct BlockCache {
    slots: [Slot; CACHE_BLOCKS],
    ticks: u64,
}

impl BlockCache {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot {
                sector: INVALID_SECTOR,
                tick: 0,
                data: [0; SECTOR_SIZE],
            }),
            ticks: 0,
        }
    }

    /// Drop all cached sectors.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.sector = INVALID_SECTOR;
            slot.tick = 0;
        }
        self.ticks = 0;
    }

    /// Look up `sector`; on a hit the slot becomes most recently used.
    pub fn lookup(&mut self, sector: u64) -> Option<&[u8; SECTOR_SIZE]> {
        let idx = self.slots.iter().position(|s| s.sector == sector)?;
        self.ticks += 1;
        self.slots[idx].tick = self.ticks;
        Some(&self.slots[idx].data)
    }

    /// Insert `sector`, evicting the least recently used slot.
    ///
    /// All sectors inserted during one fill run share the same age;
    /// call [`bump`] once after the run to commit it.
    ///
    /// [`bump`]: BlockCache::bump
    pub fn insert(&mut self, sector: u64, data: &[u8; SECTOR_SIZE]) {
        // Reuse the slot if the sector is already cached.
        let mut victim = 0;
        if let Some(idx) = self.slots.iter().position(|s| s.sector == sector) {
            victim = idx;
        } else {
            for (idx, slot) in self.slots.iter().enumerate() {
                if slot.tick < self.slots[victim].tick {
                    victim = idx;
                }
            }
        }
        let slot = &mut self.slots[victim];
        slot.sector = sector;
        // Stamp ahead of the counter so a fresh run outranks the free
        // slots (tick 0) and does not keep reusing the first one.
        slot.tick = self.ticks + 1;
        slot.data.copy_from_slice(data);
    }

    /// Advance the tick counter after a fill run.
    pub fn bump(&mut self) {
        self.ticks += 1;
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}
