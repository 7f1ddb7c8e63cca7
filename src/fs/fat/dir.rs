//! Directory Entry Decoding
//!
//! 32-byte raw entries, 8.3 short name assembly and long filename (LFN)
//! reconstruction. LFN slots precede the short entry they decorate in
//! reverse sequence order; each slot carries 13 UCS-2 characters and a
//! checksum of the short entry's raw name that binds the two together.

use alloc::string::String;

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::fs::fat::{FatType, FatVolume};

/// Size of an on-disk directory entry.
pub const ENTRY_SIZE: usize = 32;

/// First byte of a free (deleted) entry.
pub const ENTRY_DELETED: u8 = 0xE5;
/// First byte marking the end of the directory.
pub const ENTRY_END: u8 = 0x00;

/// Longest long filename the format allows.
const LFN_MAX: usize = 255;
/// Characters carried by one LFN slot.
const LFN_CHARS_PER_SLOT: usize = 13;

const_assert_eq!(ENTRY_SIZE, 32);

bitflags! {
    /// Directory entry attribute byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const READ_ONLY    = 0x01;
        const HIDDEN       = 0x02;
        const SYSTEM       = 0x04;
        const VOLUME_LABEL = 0x08;
        const DIRECTORY    = 0x10;
        const ARCHIVE      = 0x20;
    }
}

/// All four low attribute bits set marks an LFN slot.
pub const ATTR_LFN: u8 = 0x0F;

/// A decoded directory entry, ready for name matching.
pub struct DirEntry {
    pub short_name: String,
    /// Present only when a valid LFN run immediately preceded the entry
    /// and its checksum matched.
    pub long_name: Option<String>,
    pub attr: Attributes,
    pub first_cluster: u32,
    pub size: u32,
}

impl DirEntry {
    pub fn is_directory(&self) -> bool {
        self.attr.contains(Attributes::DIRECTORY)
    }

    pub fn is_volume_label(&self) -> bool {
        self.attr.contains(Attributes::VOLUME_LABEL)
    }

    /// Case-insensitive match against either name form.
    pub fn matches(&self, name: &str) -> bool {
        self.short_name.eq_ignore_ascii_case(name)
            || self
                .long_name
                .as_deref()
                .is_some_and(|ln| ln.eq_ignore_ascii_case(name))
    }
}

/// Checksum binding LFN slots to their 8.3 entry: rotate right and add,
/// over the raw 11-byte name field.
pub fn lfn_checksum(raw_name: &[u8; 11]) -> u8 {
    raw_name.iter().fold(0u8, |sum, &b| {
        (if sum & 1 != 0 { 0x80u8 } else { 0 })
            .wrapping_add(sum >> 1)
            .wrapping_add(b)
    })
}

/// Map one UCS-2 code unit to ASCII. Characters outside the printable
/// ASCII range cannot be represented and poison the whole name.
fn ucs2_to_ascii(unit: u16) -> Result<Option<u8>, ()> {
    match unit {
        // Terminator, and the 0xFFFF padding that follows it.
        0x0000 | 0xFFFF => Ok(None),
        0x0020..=0x007E => Ok(Some(unit as u8)),
        _ => Err(()),
    }
}

/// Accumulates LFN slots until the short entry they belong to arrives.
pub struct LfnAssembler {
    name: [u8; LFN_MAX + LFN_CHARS_PER_SLOT],
    checksum: u8,
    valid: bool,
}

impl LfnAssembler {
    pub fn new() -> Self {
        Self {
            name: [0; LFN_MAX + LFN_CHARS_PER_SLOT],
            checksum: 0,
            valid: false,
        }
    }

    pub fn reset(&mut self) {
        self.valid = false;
    }

    /// Feed one LFN slot (an entry whose attribute byte is
    /// [`ATTR_LFN`]).
    pub fn push_slot(&mut self, entry: &[u8; ENTRY_SIZE]) {
        // Bit 7 of the sequence byte is reserved and carries no
        // meaning; sequence numbers start at 1.
        let seq = entry[0] & 0x7F;
        let index = usize::from(seq & 0x1F);
        if index == 0 || (index - 1) * LFN_CHARS_PER_SLOT >= LFN_MAX {
            self.valid = false;
            return;
        }

        // Bit 6 marks the last logical (first physical) slot; it opens
        // a new name and carries the authoritative checksum.
        if seq & 0x40 != 0 {
            self.name.fill(0);
            self.checksum = entry[13];
            self.valid = true;
        }
        if !self.valid {
            return;
        }

        let base = (index - 1) * LFN_CHARS_PER_SLOT;
        // The 13 characters are split across three fields of the slot.
        let regions: [(usize, usize); 3] = [(1, 5), (14, 6), (28, 2)];
        let mut pos = base;
        for (start, units) in regions {
            for u in 0..units {
                let unit = u16::from_le_bytes([entry[start + 2 * u], entry[start + 2 * u + 1]]);
                match ucs2_to_ascii(unit) {
                    Ok(Some(ch)) => self.name[pos] = ch,
                    Ok(None) => self.name[pos] = 0,
                    Err(()) => {
                        // Valid UCS-2, but not representable here. Fall
                        // back to the short name for this entry.
                        self.valid = false;
                        return;
                    }
                }
                pos += 1;
            }
        }
    }

    /// Hand over the assembled name, if the run was complete and its
    /// checksum matches the short entry's.
    pub fn take(&mut self, short_checksum: u8) -> Option<String> {
        if !self.valid || self.checksum != short_checksum {
            self.valid = false;
            return None;
        }
        self.valid = false;
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(LFN_MAX);
        core::str::from_utf8(&self.name[..len])
            .ok()
            .map(String::from)
    }
}

impl Default for LfnAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Assemble the display form of an entry's 8.3 name. Volume labels keep
/// all eleven characters with no dot; everything else gets the usual
/// `NAME.EXT` with padding stripped.
pub fn short_name(entry: &[u8; ENTRY_SIZE]) -> String {
    let mut raw = [0u8; 11];
    raw.copy_from_slice(&entry[..11]);
    // 0x05 in the first byte stands in for a real 0xE5.
    if raw[0] == 0x05 {
        raw[0] = ENTRY_DELETED;
    }

    let attr = Attributes::from_bits_truncate(entry[11]);
    let mut out = String::new();

    if attr.contains(Attributes::VOLUME_LABEL) {
        for &b in raw.iter() {
            out.push(b as char);
        }
        while out.ends_with(' ') {
            out.pop();
        }
        return out;
    }

    for &b in raw[..8].iter() {
        out.push(b as char);
    }
    while out.ends_with(' ') {
        out.pop();
    }

    let ext: &[u8] = &raw[8..];
    let ext_len = ext.iter().rposition(|&b| b != b' ').map_or(0, |p| p + 1);
    if ext_len > 0 {
        out.push('.');
        for &b in ext[..ext_len].iter() {
            out.push(b as char);
        }
    }

    out
}

/// Decode a non-LFN raw entry.
pub fn decode_entry(vol: &FatVolume, entry: &[u8; ENTRY_SIZE], lfn: &mut LfnAssembler) -> DirEntry {
    let mut raw_name = [0u8; 11];
    raw_name.copy_from_slice(&entry[..11]);

    let mut first_cluster = u32::from(u16::from_le_bytes([entry[26], entry[27]]));
    if vol.fat_type == FatType::Fat32 {
        first_cluster |= u32::from(u16::from_le_bytes([entry[20], entry[21]])) << 16;
    }

    DirEntry {
        short_name: short_name(entry),
        long_name: lfn.take(lfn_checksum(&raw_name)),
        attr: Attributes::from_bits_truncate(entry[11]),
        first_cluster,
        size: u32::from_le_bytes([entry[28], entry[29], entry[30], entry[31]]),
    }
}
