// Low-level AHCI / SATA constants.
// Based on AHCI 1.3.1 and the ATA/ATAPI command set.
// Offsets are relative to the start of one port's register block
// (ABAR + 0x100 + port * 0x80). Do NOT poke these directly from driver
// code; go through `PortRegisters` so the access can be simulated.

#![allow(dead_code)]

/// Maximums & sizes
pub const HBA_MAX_PORTS: usize = 32;
pub const HBA_PORT_SIZE: usize = 0x80;
pub const HBA_CMD_SLOT_MAX: usize = 32;
pub const HBA_CMD_HEADER_SIZE: usize = 32;
pub const HBA_PRDT_ENTRY_SIZE: usize = 16;
pub const HBA_CMD_TBL_HEADER: usize = 128; // cfis(64) + acmd(16) + rsv(48)
pub const HBA_FIS_SIZE: usize = 256;

pub const PAGE_SIZE: usize = 4096;

/// PRDT entries that fit in the single page backing a command table.
pub const PRDT_ENTRIES_PER_TABLE: usize = (PAGE_SIZE - HBA_CMD_TBL_HEADER) / HBA_PRDT_ENTRY_SIZE;

/// PRDT byte count max (4MB) per entry, stored as count - 1 in 22 bits.
pub const PRDT_MAX_BYTES: u32 = 0x40_0000;

/* Command table layout */
pub const CMD_TBL_CFIS_OFFSET: usize = 0x00;
pub const CMD_TBL_CFIS_SIZE: usize = 64;
pub const CMD_TBL_ACMD_OFFSET: usize = 0x40;
pub const CMD_TBL_ACMD_SIZE: usize = 16;
pub const CMD_TBL_PRDT_OFFSET: usize = 0x80;

/* Per-port register offsets */
pub const PORT_CLB: usize = 0x00;  // Command list base address (1K aligned)
pub const PORT_CLBU: usize = 0x04; // Command list base address upper 32 bits
pub const PORT_FB: usize = 0x08;   // FIS base address (256 byte aligned)
pub const PORT_FBU: usize = 0x0C;  // FIS base address upper 32 bits
pub const PORT_IS: usize = 0x10;   // Interrupt status
pub const PORT_IE: usize = 0x14;   // Interrupt enable
pub const PORT_CMD: usize = 0x18;  // Command and status
pub const PORT_TFD: usize = 0x20;  // Task file data
pub const PORT_SIG: usize = 0x24;  // Signature
pub const PORT_SSTS: usize = 0x28; // SATA status (SStatus)
pub const PORT_SCTL: usize = 0x2C; // SATA control (SControl)
pub const PORT_SERR: usize = 0x30; // SATA error (SError)
pub const PORT_SACT: usize = 0x34; // SATA active (SActive)
pub const PORT_CI: usize = 0x38;   // Command issue

/* Port command (PxCMD) bits */
pub const PORT_CMD_ST: u32 = 1 << 0;  // Start
pub const PORT_CMD_SUD: u32 = 1 << 1; // Spin-Up Device
pub const PORT_CMD_POD: u32 = 1 << 2; // Power On Device
pub const PORT_CMD_CLO: u32 = 1 << 3; // Command List Override
pub const PORT_CMD_FRE: u32 = 1 << 4; // FIS Receive Enable
pub const PORT_CMD_FR: u32 = 1 << 14; // FIS Receive Running
pub const PORT_CMD_CR: u32 = 1 << 15; // Command List Running
pub const PORT_CMD_ICC_SHIFT: u32 = 28;
pub const PORT_CMD_ICC_MASK: u32 = 0xF << PORT_CMD_ICC_SHIFT;
pub const PORT_CMD_ICC_ACTIVE: u32 = 0x1;

/* PxTFD status byte bits */
pub const ATA_DEV_BUSY: u32 = 1 << 7;
pub const ATA_DEV_DRQ: u32 = 1 << 3;
pub const ATA_DEV_ERR: u32 = 1 << 0;

/* PxSSTS fields */
pub const SSTS_DET_MASK: u32 = 0xF;
pub const SSTS_DET_NO_DEV: u32 = 0x0;
pub const SSTS_DET_PRESENT_NO_PHY: u32 = 0x1;
pub const SSTS_DET_PRESENT: u32 = 0x3;
pub const SSTS_DET_DISABLED: u32 = 0x4;

/* PxSCTL DET field */
pub const SCTL_DET_MASK: u32 = 0xF;
pub const SCTL_DET_NONE: u32 = 0x0;
pub const SCTL_DET_INIT: u32 = 0x1;
pub const SCTL_DET_DISABLE: u32 = 0x4;

/* Port Signature values */
pub const SATA_SIG_ATA: u32 = 0x0000_0101;
pub const SATA_SIG_ATAPI: u32 = 0xEB14_0101;
pub const SATA_SIG_SEMB: u32 = 0xC33C_0101;
pub const SATA_SIG_PM: u32 = 0x9669_0101;

/* FIS types */
pub const FIS_TYPE_REG_H2D: u8 = 0x27; // Register – host to device
pub const FIS_TYPE_REG_D2H: u8 = 0x34; // Register – device to host
pub const FIS_REG_H2D_SIZE: usize = 20;
pub const FIS_REG_H2D_DWORDS: u16 = (FIS_REG_H2D_SIZE / 4) as u16;
pub const FIS_H2D_COMMAND_BIT: u8 = 1 << 7;

/* ATA opcodes */
pub const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
pub const ATA_CMD_WRITE_DMA_EXT: u8 = 0x35;
pub const ATA_CMD_IDENTIFY: u8 = 0xEC;
pub const ATA_CMD_ATAPI_IDENT: u8 = 0xA1;
pub const ATA_CMD_PACKET: u8 = 0xA0;

/// Device register value selecting LBA addressing.
pub const ATA_USE_LBA_ADDRESSING: u8 = 1 << 6;

pub const ATA_IDENTIFY_SIZE: usize = 512;
pub const ATA_DEFAULT_SECTOR_SIZE: u32 = 512;
