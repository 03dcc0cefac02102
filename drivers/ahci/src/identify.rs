//! IDENTIFY DEVICE data
//!
//! Parses the 256-word block returned by IDENTIFY (PACKET) DEVICE.

use alloc::string::String;

use super::consts::{ATA_DEFAULT_SECTOR_SIZE, ATA_IDENTIFY_SIZE};

const WORD_SERIAL: usize = 10;
const WORD_FIRMWARE: usize = 23;
const WORD_MODEL: usize = 27;
const WORD_LBA28_SECTORS: usize = 60;
const WORD_COMMAND_SET_2: usize = 83;
const WORD_LBA48_SECTORS: usize = 100;
const WORD_SECTOR_SIZE: usize = 106;
const WORD_LOGICAL_SECTOR_SIZE: usize = 117;

/// Word 83 bit 10: 48-bit address feature set supported
const LBA48_SUPPORTED: u16 = 1 << 10;

/// Word 106 bit 14 set and bit 15 clear mark the word as valid
const SECTOR_SIZE_VALID_MASK: u16 = 0xC000;
const SECTOR_SIZE_VALID: u16 = 0x4000;
const MULTIPLE_LOGICAL_PER_PHYSICAL: u16 = 1 << 13;
const LOGICAL_LONGER_THAN_256_WORDS: u16 = 1 << 12;
const LOGICAL_PER_PHYSICAL_EXP_MASK: u16 = 0xF;

/// Parsed IDENTIFY block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyData {
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub lba48: bool,
    /// User addressable sectors (LBA48 count when supported, else LBA28)
    pub sector_count: u64,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
}

impl IdentifyData {
    /// Parse a raw 512-byte IDENTIFY block (little-endian words).
    pub fn parse(raw: &[u8]) -> Self {
        debug_assert!(raw.len() >= ATA_IDENTIFY_SIZE);
        let word = |index: usize| u16::from_le_bytes([raw[index * 2], raw[index * 2 + 1]]);

        let lba48 = word(WORD_COMMAND_SET_2) & LBA48_SUPPORTED != 0;
        let sector_count = if lba48 {
            (0..4).fold(0u64, |acc, i| acc | (word(WORD_LBA48_SECTORS + i) as u64) << (16 * i))
        } else {
            word(WORD_LBA28_SECTORS) as u64 | (word(WORD_LBA28_SECTORS + 1) as u64) << 16
        };

        let mut logical_sector_size = ATA_DEFAULT_SECTOR_SIZE;
        let mut physical_sector_size = ATA_DEFAULT_SECTOR_SIZE;
        let sector_info = word(WORD_SECTOR_SIZE);
        if sector_info & SECTOR_SIZE_VALID_MASK == SECTOR_SIZE_VALID {
            if sector_info & LOGICAL_LONGER_THAN_256_WORDS != 0 {
                // Size is given in words
                let words = word(WORD_LOGICAL_SECTOR_SIZE) as u32
                    | (word(WORD_LOGICAL_SECTOR_SIZE + 1) as u32) << 16;
                if words != 0 {
                    logical_sector_size = words * 2;
                }
            }
            physical_sector_size = logical_sector_size;
            if sector_info & MULTIPLE_LOGICAL_PER_PHYSICAL != 0 {
                physical_sector_size <<= sector_info & LOGICAL_PER_PHYSICAL_EXP_MASK;
            }
        }

        Self {
            model: ata_string(raw, WORD_MODEL, 20),
            serial: ata_string(raw, WORD_SERIAL, 10),
            firmware: ata_string(raw, WORD_FIRMWARE, 4),
            lba48,
            sector_count,
            logical_sector_size,
            physical_sector_size,
        }
    }
}

/// ATA strings store two characters per word, high byte first.
fn ata_string(raw: &[u8], first_word: usize, words: usize) -> String {
    let mut out = String::with_capacity(words * 2);
    for i in 0..words {
        let offset = (first_word + i) * 2;
        for byte in [raw[offset + 1], raw[offset]] {
            out.push(if byte.is_ascii_graphic() || byte == b' ' { byte as char } else { ' ' });
        }
    }
    String::from(out.trim())
}

/// Build an IDENTIFY block, used by the simulated drive.
#[cfg(test)]
pub(crate) fn build_identify_block(
    model: &str,
    sectors: u64,
    lba48: bool,
    logical_sector_size: Option<u32>,
) -> [u8; ATA_IDENTIFY_SIZE] {
    let mut raw = [0u8; ATA_IDENTIFY_SIZE];
    let mut put = |index: usize, value: u16| {
        raw[index * 2..index * 2 + 2].copy_from_slice(&value.to_le_bytes());
    };

    let mut name = [b' '; 40];
    for (dst, src) in name.iter_mut().zip(model.bytes()) {
        *dst = src;
    }
    for i in 0..20 {
        put(WORD_MODEL + i, (name[i * 2] as u16) << 8 | name[i * 2 + 1] as u16);
    }
    put(WORD_SERIAL, u16::from_be_bytes(*b"SN"));
    put(WORD_FIRMWARE, u16::from_be_bytes(*b"FW"));

    if lba48 {
        put(WORD_COMMAND_SET_2, LBA48_SUPPORTED);
        for i in 0..4 {
            put(WORD_LBA48_SECTORS + i, (sectors >> (16 * i)) as u16);
        }
    }
    let lba28 = sectors.min(0x0FFF_FFFF);
    put(WORD_LBA28_SECTORS, lba28 as u16);
    put(WORD_LBA28_SECTORS + 1, (lba28 >> 16) as u16);

    if let Some(size) = logical_sector_size {
        let words = size / 2;
        put(WORD_SECTOR_SIZE, SECTOR_SIZE_VALID | LOGICAL_LONGER_THAN_256_WORDS);
        put(WORD_LOGICAL_SECTOR_SIZE, words as u16);
        put(WORD_LOGICAL_SECTOR_SIZE + 1, (words >> 16) as u16);
    }
    raw
}
