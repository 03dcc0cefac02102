//! AHCI Command Structures
//!
//! Hardware-defined layouts (AHCI 1.3.1, little endian) for the command
//! list, command table, Register Host-to-Device FIS and PRDT. The structs
//! are plain values; `encode`/`decode` are the only places that know the
//! byte layout, so DMA memory is only ever touched through byte slices.

use bitflags::bitflags;
use static_assertions::{assert_eq_size, const_assert};
use x86_64::PhysAddr;

use super::consts::*;

#[inline]
fn put_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn get_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

#[inline]
fn get_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn split_address(address: PhysAddr) -> (u32, u32) {
    let raw = address.as_u64();
    (raw as u32, (raw >> 32) as u32)
}

fn join_address(low: u32, high: u32) -> PhysAddr {
    PhysAddr::new(((high as u64) << 32) | low as u64)
}

bitflags! {
    /// Command header DW0 attribute bits (the low five bits hold the FIS length).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandHeaderFlags: u16 {
        /// ATAPI command
        const ATAPI = 1 << 5;
        /// Host to device data direction
        const WRITE = 1 << 6;
        /// PRDs may be prefetched by the HBA
        const PREFETCHABLE = 1 << 7;
        const RESET = 1 << 8;
        const BIST = 1 << 9;
        /// Clear PxTFD.BSY on R_OK
        const CLEAR_BUSY = 1 << 10;
    }
}

const CFL_MASK: u16 = 0x1F;

/// Command header (one per command slot) - 32 bytes (DW0..DW7)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandHeader {
    /// DW0 low: cfl(5) | a | w | p | r | b | c
    pub attributes: u16,
    /// DW0 high: PRDT entry count
    pub prdt_length: u16,
    /// DW1: PRD byte count transferred, written by the HBA
    pub prd_byte_count: u32,
    /// DW2: command table base address (128 byte aligned)
    pub command_table_base: u32,
    /// DW3: command table base address upper 32 bits
    pub command_table_base_upper: u32,
    pub reserved: [u32; 4],
}

assert_eq_size!(CommandHeader, [u8; HBA_CMD_HEADER_SIZE]);
const_assert!(HBA_CMD_SLOT_MAX * HBA_CMD_HEADER_SIZE <= PAGE_SIZE);

impl CommandHeader {
    pub fn new(
        fis_dwords: u16,
        flags: CommandHeaderFlags,
        prdt_length: u16,
        command_table: PhysAddr,
    ) -> Self {
        let (low, high) = split_address(command_table);
        Self {
            attributes: (fis_dwords & CFL_MASK) | flags.bits(),
            prdt_length,
            prd_byte_count: 0,
            command_table_base: low,
            command_table_base_upper: high,
            reserved: [0; 4],
        }
    }

    /// Command FIS length in dwords
    pub fn fis_length(&self) -> u16 {
        self.attributes & CFL_MASK
    }

    pub fn flags(&self) -> CommandHeaderFlags {
        CommandHeaderFlags::from_bits_truncate(self.attributes)
    }

    pub fn command_table_address(&self) -> PhysAddr {
        join_address(self.command_table_base, self.command_table_base_upper)
    }

    /// Byte offset of slot `slot` inside the command list
    pub fn offset_of(slot: usize) -> usize {
        debug_assert!(slot < HBA_CMD_SLOT_MAX);
        slot * HBA_CMD_HEADER_SIZE
    }

    pub fn encode(&self, out: &mut [u8]) {
        let out = &mut out[..HBA_CMD_HEADER_SIZE];
        put_u16(out, 0, self.attributes);
        put_u16(out, 2, self.prdt_length);
        put_u32(out, 4, self.prd_byte_count);
        put_u32(out, 8, self.command_table_base);
        put_u32(out, 12, self.command_table_base_upper);
        for (i, word) in self.reserved.iter().enumerate() {
            put_u32(out, 16 + i * 4, *word);
        }
    }

    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            attributes: get_u16(bytes, 0),
            prdt_length: get_u16(bytes, 2),
            prd_byte_count: get_u32(bytes, 4),
            command_table_base: get_u32(bytes, 8),
            command_table_base_upper: get_u32(bytes, 12),
            reserved: [
                get_u32(bytes, 16),
                get_u32(bytes, 20),
                get_u32(bytes, 24),
                get_u32(bytes, 28),
            ],
        }
    }
}

/// PRDT entry - 16 bytes
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrdtEntry {
    /// Data base address (word aligned)
    pub data_base: u32,
    /// Data base address upper 32 bits
    pub data_base_upper: u32,
    pub reserved: u32,
    /// Byte count - 1 (22 bits) | interrupt on completion (bit 31)
    pub byte_count: u32,
}

assert_eq_size!(PrdtEntry, [u8; HBA_PRDT_ENTRY_SIZE]);

const PRDT_INTERRUPT: u32 = 1 << 31;
const PRDT_BYTE_COUNT_MASK: u32 = PRDT_MAX_BYTES - 1;

impl PrdtEntry {
    /// Describe `length` bytes at `address`; `length` must be even and in 2..=4MB.
    pub fn new(address: PhysAddr, length: u32, interrupt_on_completion: bool) -> Self {
        debug_assert!(length > 0 && length <= PRDT_MAX_BYTES && length % 2 == 0);
        let (low, high) = split_address(address);
        let mut byte_count = (length - 1) & PRDT_BYTE_COUNT_MASK;
        if interrupt_on_completion {
            byte_count |= PRDT_INTERRUPT;
        }
        Self {
            data_base: low,
            data_base_upper: high,
            reserved: 0,
            byte_count,
        }
    }

    pub fn address(&self) -> PhysAddr {
        join_address(self.data_base, self.data_base_upper)
    }

    /// Region length in bytes
    pub fn length(&self) -> usize {
        (self.byte_count & PRDT_BYTE_COUNT_MASK) as usize + 1
    }

    pub fn interrupt_on_completion(&self) -> bool {
        self.byte_count & PRDT_INTERRUPT != 0
    }

    pub fn encode(&self, out: &mut [u8]) {
        put_u32(out, 0, self.data_base);
        put_u32(out, 4, self.data_base_upper);
        put_u32(out, 8, self.reserved);
        put_u32(out, 12, self.byte_count);
    }

    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            data_base: get_u32(bytes, 0),
            data_base_upper: get_u32(bytes, 4),
            reserved: get_u32(bytes, 8),
            byte_count: get_u32(bytes, 12),
        }
    }
}

/// Register - Host to Device FIS (command) - 20 bytes
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FisRegH2D {
    pub fis_type: u8,
    /// pmport:4 | rsv:3 | c:1
    pub pmport_c: u8,
    pub command: u8,
    pub featurel: u8,

    pub lba0: u8,
    pub lba1: u8,
    pub lba2: u8,
    pub device: u8,

    pub lba3: u8,
    pub lba4: u8,
    pub lba5: u8,
    pub featureh: u8,

    pub countl: u8,
    pub counth: u8,
    pub icc: u8,
    pub control: u8,

    pub rsv: [u8; 4],
}

assert_eq_size!(FisRegH2D, [u8; FIS_REG_H2D_SIZE]);

impl FisRegH2D {
    /// Command FIS for `command`, port multiplier 0, C bit set
    pub fn command(command: u8) -> Self {
        Self {
            fis_type: FIS_TYPE_REG_H2D,
            pmport_c: FIS_H2D_COMMAND_BIT,
            command,
            ..Default::default()
        }
    }

    /// Split a 48-bit LBA into the low and high 3-byte fields
    pub fn set_lba(&mut self, lba: u64) {
        debug_assert!(lba < 1 << 48);
        self.lba0 = lba as u8;
        self.lba1 = (lba >> 8) as u8;
        self.lba2 = (lba >> 16) as u8;
        self.lba3 = (lba >> 24) as u8;
        self.lba4 = (lba >> 32) as u8;
        self.lba5 = (lba >> 40) as u8;
    }

    pub fn set_count(&mut self, count: u16) {
        self.countl = count as u8;
        self.counth = (count >> 8) as u8;
    }

    pub fn lba(&self) -> u64 {
        self.lba0 as u64
            | (self.lba1 as u64) << 8
            | (self.lba2 as u64) << 16
            | (self.lba3 as u64) << 24
            | (self.lba4 as u64) << 32
            | (self.lba5 as u64) << 40
    }

    pub fn count(&self) -> u16 {
        self.countl as u16 | (self.counth as u16) << 8
    }

    pub fn is_command(&self) -> bool {
        self.pmport_c & FIS_H2D_COMMAND_BIT != 0
    }

    pub fn encode(&self, out: &mut [u8]) {
        let fields = [
            self.fis_type, self.pmport_c, self.command, self.featurel,
            self.lba0, self.lba1, self.lba2, self.device,
            self.lba3, self.lba4, self.lba5, self.featureh,
            self.countl, self.counth, self.icc, self.control,
        ];
        out[..16].copy_from_slice(&fields);
        out[16..FIS_REG_H2D_SIZE].copy_from_slice(&self.rsv);
    }

    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            fis_type: bytes[0],
            pmport_c: bytes[1],
            command: bytes[2],
            featurel: bytes[3],
            lba0: bytes[4],
            lba1: bytes[5],
            lba2: bytes[6],
            device: bytes[7],
            lba3: bytes[8],
            lba4: bytes[9],
            lba5: bytes[10],
            featureh: bytes[11],
            countl: bytes[12],
            counth: bytes[13],
            icc: bytes[14],
            control: bytes[15],
            rsv: [bytes[16], bytes[17], bytes[18], bytes[19]],
        }
    }
}

/// Command table backed by one page: 64-byte command FIS area, 16-byte
/// ATAPI command, reserved, then the PRDT from offset 0x80.
pub struct CommandTable<'a> {
    bytes: &'a mut [u8],
}

impl<'a> CommandTable<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        debug_assert!(bytes.len() >= CMD_TBL_PRDT_OFFSET);
        Self { bytes }
    }

    /// PRDT entries this table has room for
    pub fn prdt_capacity(&self) -> usize {
        (self.bytes.len() - CMD_TBL_PRDT_OFFSET) / HBA_PRDT_ENTRY_SIZE
    }

    /// Zero the FIS, ATAPI command and reserved areas
    pub fn clear_header(&mut self) {
        self.bytes[..CMD_TBL_PRDT_OFFSET].fill(0);
    }

    pub fn set_fis(&mut self, fis: &FisRegH2D) {
        let area = &mut self.bytes[CMD_TBL_CFIS_OFFSET..CMD_TBL_CFIS_OFFSET + CMD_TBL_CFIS_SIZE];
        area.fill(0);
        fis.encode(area);
    }

    pub fn set_prdt_entry(&mut self, index: usize, entry: &PrdtEntry) {
        assert!(index < self.prdt_capacity());
        let offset = Self::prdt_offset(index);
        entry.encode(&mut self.bytes[offset..offset + HBA_PRDT_ENTRY_SIZE]);
    }

    /// Byte offset of PRDT entry `index` inside a command table
    pub fn prdt_offset(index: usize) -> usize {
        CMD_TBL_PRDT_OFFSET + index * HBA_PRDT_ENTRY_SIZE
    }

    /// Decode the command FIS out of raw table bytes
    pub fn read_fis(bytes: &[u8]) -> FisRegH2D {
        FisRegH2D::decode(&bytes[CMD_TBL_CFIS_OFFSET..])
    }

    /// Decode PRDT entry `index` out of raw table bytes
    pub fn read_prdt_entry(bytes: &[u8], index: usize) -> PrdtEntry {
        PrdtEntry::decode(&bytes[Self::prdt_offset(index)..])
    }
}

/// Data transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Data transfer from device to host
    DeviceToHost,
    /// Data transfer from host to device
    HostToDevice,
}

/// ATA command representation
///
/// Everything needed to fill a command slot: the FIS contents and the
/// header attributes that go with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtaCommand {
    /// ATA command code
    pub command: u8,
    /// LBA address (48-bit)
    pub lba: u64,
    /// Sector count
    pub count: u16,
    /// Device register
    pub device: u8,
    /// Transfer direction
    pub direction: TransferDirection,
}

impl AtaCommand {
    /// IDENTIFY DEVICE, or IDENTIFY PACKET DEVICE for ATAPI devices
    pub fn identify(atapi: bool) -> Self {
        Self {
            command: if atapi { ATA_CMD_ATAPI_IDENT } else { ATA_CMD_IDENTIFY },
            lba: 0,
            count: 0,
            device: 0,
            direction: TransferDirection::DeviceToHost,
        }
    }

    /// READ DMA EXT command (48-bit LBA)
    pub fn read_dma_ext(lba: u64, sectors: u16) -> Self {
        Self {
            command: ATA_CMD_READ_DMA_EXT,
            lba,
            count: sectors,
            device: ATA_USE_LBA_ADDRESSING,
            direction: TransferDirection::DeviceToHost,
        }
    }

    /// WRITE DMA EXT command (48-bit LBA)
    pub fn write_dma_ext(lba: u64, sectors: u16) -> Self {
        Self {
            command: ATA_CMD_WRITE_DMA_EXT,
            lba,
            count: sectors,
            device: ATA_USE_LBA_ADDRESSING,
            direction: TransferDirection::HostToDevice,
        }
    }

    /// Build Command FIS (Frame Information Structure)
    pub fn build_fis(&self) -> FisRegH2D {
        let mut fis = FisRegH2D::command(self.command);
        fis.device = self.device;
        fis.set_lba(self.lba);
        fis.set_count(self.count);
        fis
    }

    /// Command header attributes for this command
    pub fn header_flags(&self) -> CommandHeaderFlags {
        let mut flags = CommandHeaderFlags::PREFETCHABLE | CommandHeaderFlags::CLEAR_BUSY;
        if self.direction == TransferDirection::HostToDevice {
            flags |= CommandHeaderFlags::WRITE;
        }
        // IDENTIFY PACKET DEVICE is a plain PIO command, only PACKET carries an ACMD
        if self.command == ATA_CMD_PACKET {
            flags |= CommandHeaderFlags::ATAPI;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_header_layout() {
        let header = CommandHeader::new(
            FIS_REG_H2D_DWORDS,
            CommandHeaderFlags::WRITE | CommandHeaderFlags::PREFETCHABLE,
            3,
            PhysAddr::new(0x1_2345_6000),
        );
        let mut bytes = [0xFFu8; HBA_CMD_HEADER_SIZE];
        header.encode(&mut bytes);

        // CFL=5, W and P set
        assert_eq!(bytes[0], 0x05 | 0x40 | 0x80);
        assert_eq!(bytes[1], 0x00);
        assert_eq!(&bytes[2..4], &[3, 0]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[0x00, 0x60, 0x45, 0x23]);
        assert_eq!(&bytes[12..16], &[0x01, 0, 0, 0]);
        assert!(bytes[16..].iter().all(|&b| b == 0));

        let decoded = CommandHeader::decode(&bytes);
        assert_eq!(decoded.fis_length(), 5);
        assert_eq!(decoded.command_table_address().as_u64(), 0x1_2345_6000);
        assert!(decoded.flags().contains(CommandHeaderFlags::WRITE));
    }

    #[test]
    fn test_fis_lba48_split() {
        let fis = AtaCommand::read_dma_ext(0xBEEF_CAFE_1234, 0x0102).build_fis();
        let mut bytes = [0u8; FIS_REG_H2D_SIZE];
        fis.encode(&mut bytes);

        assert_eq!(bytes[0], FIS_TYPE_REG_H2D);
        assert_eq!(bytes[1], 0x80);
        assert_eq!(bytes[2], ATA_CMD_READ_DMA_EXT);
        // LBA 7:0, 15:8, 23:16 then device
        assert_eq!(&bytes[4..8], &[0x34, 0x12, 0xFE, ATA_USE_LBA_ADDRESSING]);
        // LBA 31:24, 39:32, 47:40
        assert_eq!(&bytes[8..11], &[0xCA, 0xEF, 0xBE]);
        assert_eq!(&bytes[12..14], &[0x02, 0x01]);

        let decoded = FisRegH2D::decode(&bytes);
        assert_eq!(decoded.lba(), 0xBEEF_CAFE_1234);
        assert_eq!(decoded.count(), 0x0102);
        assert!(decoded.is_command());
    }

    #[test]
    fn test_prdt_entry_byte_count() {
        let entry = PrdtEntry::new(PhysAddr::new(0x8000), PAGE_SIZE as u32, false);
        let mut bytes = [0u8; HBA_PRDT_ENTRY_SIZE];
        entry.encode(&mut bytes);
        assert_eq!(&bytes[12..16], &[0xFF, 0x0F, 0, 0]);
        assert_eq!(PrdtEntry::decode(&bytes).length(), PAGE_SIZE);

        let last = PrdtEntry::new(PhysAddr::new(0x9000), 512, true);
        assert_eq!(last.byte_count, 511 | (1 << 31));
        assert!(last.interrupt_on_completion());
    }

    #[test]
    fn test_command_table_placement() {
        let mut page = [0xAAu8; PAGE_SIZE];
        let mut table = CommandTable::new(&mut page);
        assert_eq!(table.prdt_capacity(), PRDT_ENTRIES_PER_TABLE);

        table.clear_header();
        table.set_fis(&AtaCommand::identify(false).build_fis());
        table.set_prdt_entry(1, &PrdtEntry::new(PhysAddr::new(0x4000), 512, false));

        assert_eq!(page[0], FIS_TYPE_REG_H2D);
        assert_eq!(page[2], ATA_CMD_IDENTIFY);
        assert!(page[FIS_REG_H2D_SIZE..CMD_TBL_PRDT_OFFSET].iter().all(|&b| b == 0));
        assert_eq!(CommandTable::read_prdt_entry(&page, 1).address().as_u64(), 0x4000);
        assert_eq!(CommandTable::read_fis(&page).command, ATA_CMD_IDENTIFY);
    }

    #[test]
    fn test_header_flags_follow_direction() {
        assert!(AtaCommand::write_dma_ext(0, 1).header_flags().contains(CommandHeaderFlags::WRITE));
        assert!(!AtaCommand::read_dma_ext(0, 1).header_flags().contains(CommandHeaderFlags::WRITE));
        assert_eq!(AtaCommand::identify(true).command, ATA_CMD_ATAPI_IDENT);
        assert!(!AtaCommand::identify(true).header_flags().contains(CommandHeaderFlags::ATAPI));
        assert!(!AtaCommand::identify(true).header_flags().contains(CommandHeaderFlags::WRITE));
    }
}
