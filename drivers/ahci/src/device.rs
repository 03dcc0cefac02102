//! AHCI Device Abstraction
//!
//! Device classification from the port signature, the parameters cached
//! after a successful IDENTIFY, and the disk object handed to the block
//! layer once a port has an ATA device behind it.

use alloc::string::String;

use super::consts::*;
use super::identify::IdentifyData;

/// Device type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    /// Standard SATA hard drive or SSD
    Ata,
    /// ATAPI device (CD/DVD/BD drives)
    Atapi,
    /// Enclosure management bridge
    Semb,
    /// Port multiplier
    PortMultiplier,
    /// Unknown device type
    Unknown(u32),
}

impl DeviceType {
    /// Create device type from signature
    pub fn from_signature(sig: u32) -> Self {
        match sig {
            SATA_SIG_ATA => DeviceType::Ata,
            SATA_SIG_ATAPI => DeviceType::Atapi,
            SATA_SIG_SEMB => DeviceType::Semb,
            SATA_SIG_PM => DeviceType::PortMultiplier,
            other => DeviceType::Unknown(other),
        }
    }

    pub fn is_atapi(&self) -> bool {
        matches!(self, DeviceType::Atapi)
    }
}

/// Connected-device parameters cached after IDENTIFY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceParameters {
    pub device_type: DeviceType,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
    /// Highest block index the device accepts (the reported sector count)
    pub max_addressable_block: u64,
    pub lba48: bool,
}

impl DeviceParameters {
    pub fn from_identify(device_type: DeviceType, data: &IdentifyData) -> Self {
        Self {
            device_type,
            logical_sector_size: data.logical_sector_size,
            physical_sector_size: data.physical_sector_size,
            max_addressable_block: data.sector_count,
            lba48: data.lba48,
        }
    }

    pub fn is_atapi(&self) -> bool {
        self.device_type.is_atapi()
    }

    /// Check that `count` blocks starting at `lba` lie on the device
    pub fn contains_range(&self, lba: u64, count: u32) -> bool {
        lba.checked_add(count as u64)
            .map_or(false, |end| end <= self.max_addressable_block)
    }
}

/// SATA disk exposed to the block layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SataDisk {
    controller_id: u32,
    port_index: u32,
    logical_sector_size: u32,
    physical_sector_size: u32,
    max_addressable_block: u64,
    model: String,
    serial: String,
    firmware: String,
}

impl SataDisk {
    /// Create a disk for `port_index` on controller `controller_id`
    pub fn new(
        controller_id: u32,
        port_index: u32,
        logical_sector_size: u32,
        max_addressable_block: u64,
    ) -> Self {
        Self {
            controller_id,
            port_index,
            logical_sector_size,
            physical_sector_size: logical_sector_size,
            max_addressable_block,
            model: String::new(),
            serial: String::new(),
            firmware: String::new(),
        }
    }

    /// Attach the identification strings and physical sector size
    pub fn with_identity(mut self, data: &IdentifyData) -> Self {
        self.physical_sector_size = data.physical_sector_size;
        self.model = data.model.clone();
        self.serial = data.serial.clone();
        self.firmware = data.firmware.clone();
        self
    }

    pub fn controller_id(&self) -> u32 {
        self.controller_id
    }

    pub fn port_index(&self) -> u32 {
        self.port_index
    }

    pub fn logical_sector_size(&self) -> u32 {
        self.logical_sector_size
    }

    pub fn physical_sector_size(&self) -> u32 {
        self.physical_sector_size
    }

    pub fn max_addressable_block(&self) -> u64 {
        self.max_addressable_block
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.max_addressable_block * self.logical_sector_size as u64
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn firmware(&self) -> &str {
        &self.firmware
    }
}
