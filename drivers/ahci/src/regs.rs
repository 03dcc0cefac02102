//! AHCI Port Register Access
//!
//! The port driver never dereferences MMIO addresses itself. Every register
//! access goes through [`PortRegisters`], a byte-offset read/write interface
//! with read-modify-write helpers. Production code binds it to the mapped
//! HBA memory with [`MmioPortRegisters`]; tests bind it to a simulated port.

use core::sync::atomic::{fence, Ordering};
use bitflags::bitflags;
use volatile::Volatile;
use x86_64::VirtAddr;

use super::consts::*;

/// Byte-addressable access to one port's register block.
///
/// Offsets are the `PORT_*` constants; all registers are 32 bits wide.
pub trait PortRegisters: Send {
    /// Read the 32-bit register at `offset`
    fn read(&self, offset: usize) -> u32;

    /// Write the 32-bit register at `offset`
    fn write(&self, offset: usize, value: u32);

    /// Set `mask` bits with a read-modify-write
    fn set_bits(&self, offset: usize, mask: u32) {
        let value = self.read(offset);
        self.write(offset, value | mask);
    }

    /// Clear `mask` bits with a read-modify-write
    fn clear_bits(&self, offset: usize, mask: u32) {
        let value = self.read(offset);
        self.write(offset, value & !mask);
    }

    /// Write back the current value, clearing write-1-to-clear registers
    /// (PxIS, PxSERR) of exactly the bits that were observed.
    fn write_back(&self, offset: usize) -> u32 {
        let value = self.read(offset);
        self.write(offset, value);
        value
    }
}

/// Register block of a real port, mapped uncached into kernel space.
#[derive(Debug)]
pub struct MmioPortRegisters {
    base: VirtAddr,
}

impl MmioPortRegisters {
    /// Bind to the registers of `port` behind the HBA mapped at `abar`.
    ///
    /// # Safety
    /// `abar` must be the virtual address of the mapped, uncached HBA memory
    /// and must stay mapped for the lifetime of the returned value.
    pub unsafe fn new(abar: VirtAddr, port: usize) -> Self {
        assert!(port < HBA_MAX_PORTS);
        Self {
            base: abar + (0x100 + port * HBA_PORT_SIZE) as u64,
        }
    }

    fn register_ptr(&self, offset: usize) -> *mut u32 {
        debug_assert!(offset < HBA_PORT_SIZE && offset % 4 == 0);
        (self.base + offset as u64).as_mut_ptr::<u32>()
    }
}

// The mapping is owned by the controller and shared by nothing else on this port.
unsafe impl Send for MmioPortRegisters {}

impl PortRegisters for MmioPortRegisters {
    fn read(&self, offset: usize) -> u32 {
        let register = unsafe { &*self.register_ptr(offset) };
        Volatile::new_read_only(register).read()
    }

    fn write(&self, offset: usize, value: u32) {
        let register = unsafe { &mut *self.register_ptr(offset) };
        Volatile::new(register).write(value);
    }
}

/// Full fence between descriptor writes and the register write that hands
/// them to the HBA, and around command engine start/stop.
#[inline]
pub fn full_memory_barrier() {
    fence(Ordering::SeqCst);
}

bitflags! {
    /// Generic host capabilities (CAP) the port cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HbaCapabilities: u32 {
        /// Supports 64-bit addressing (S64A)
        const S64A = 1 << 31;
        /// Supports native command queuing (SNCQ)
        const SNCQ = 1 << 30;
        /// Supports staggered spin-up (SSS)
        const SSS = 1 << 27;
        /// Supports command list override (SCLO)
        const SCLO = 1 << 24;
        const _ = !0;
    }
}

bitflags! {
    /// Port Command and Status (PxCMD)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortCommand: u32 {
        const ST = PORT_CMD_ST;
        const SUD = PORT_CMD_SUD;
        const POD = PORT_CMD_POD;
        const CLO = PORT_CMD_CLO;
        const FRE = PORT_CMD_FRE;
        const FR = PORT_CMD_FR;
        const CR = PORT_CMD_CR;
        /// Cold presence detection capable
        const CPD = 1 << 20;
        const _ = !0;
    }
}

bitflags! {
    /// Port Interrupt Status / Enable (PxIS, PxIE). Write 1 to clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortInterrupt: u32 {
        /// Device to Host Register FIS
        const DHRS = 1 << 0;
        /// PIO Setup FIS
        const PSS = 1 << 1;
        /// DMA Setup FIS
        const DSS = 1 << 2;
        /// Set Device Bits FIS
        const SDBS = 1 << 3;
        /// Unknown FIS
        const UFS = 1 << 4;
        /// Descriptor Processed
        const DPS = 1 << 5;
        /// Port Connect Change
        const PCS = 1 << 6;
        /// Device Mechanical Presence
        const DMPS = 1 << 7;
        /// PhyRdy Change
        const PRCS = 1 << 22;
        /// Incorrect Port Multiplier
        const IPMS = 1 << 23;
        /// Overflow
        const OFS = 1 << 24;
        /// Interface Non-fatal Error
        const INFS = 1 << 26;
        /// Interface Fatal Error
        const IFS = 1 << 27;
        /// Host Bus Data Error
        const HBDS = 1 << 28;
        /// Host Bus Fatal Error
        const HBFS = 1 << 29;
        /// Task File Error
        const TFES = 1 << 30;
        /// Cold Port Detect
        const CPDS = 1 << 31;
    }
}

impl PortInterrupt {
    /// Conditions that send the port back through `reset()`.
    pub const RESET_CONDITIONS: Self = Self::PRCS.union(Self::PCS).union(Self::INFS);

    /// Conditions after which the port is shut down.
    pub const FATAL_CONDITIONS: Self = Self::IFS.union(Self::HBFS);

    /// Everything the port enables once it is operable.
    pub const ENABLED: Self = Self::DHRS
        .union(Self::PSS)
        .union(Self::DSS)
        .union(Self::SDBS)
        .union(Self::UFS)
        .union(Self::DPS)
        .union(Self::PCS)
        .union(Self::PRCS)
        .union(Self::INFS)
        .union(Self::IFS)
        .union(Self::HBDS)
        .union(Self::HBFS)
        .union(Self::TFES);
}

bitflags! {
    /// SATA Error (PxSERR). Write the observed value back to clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SataError: u32 {
        /// ERR.I recovered data integrity error
        const RECOVERED_DATA_INTEGRITY = 1 << 0;
        /// ERR.M recovered communications error
        const RECOVERED_COMMUNICATIONS = 1 << 1;
        /// ERR.T transient data integrity error
        const TRANSIENT_DATA_INTEGRITY = 1 << 8;
        /// ERR.C persistent communication or data integrity error
        const PERSISTENT_COMMUNICATION = 1 << 9;
        /// ERR.P protocol error
        const PROTOCOL = 1 << 10;
        /// ERR.E internal error
        const INTERNAL = 1 << 11;
        /// DIAG.N PhyRdy change
        const PHY_READY_CHANGE = 1 << 16;
        /// DIAG.I phy internal error
        const PHY_INTERNAL = 1 << 17;
        /// DIAG.W COMWAKE detected
        const COMM_WAKE = 1 << 18;
        /// DIAG.B 10B to 8B decode error
        const DECODE = 1 << 19;
        /// DIAG.D disparity error
        const DISPARITY = 1 << 20;
        /// DIAG.C CRC error
        const CRC = 1 << 21;
        /// DIAG.H handshake error
        const HANDSHAKE = 1 << 22;
        /// DIAG.S link sequence error
        const LINK_SEQUENCE = 1 << 23;
        /// DIAG.T transport state transition error
        const TRANSPORT_STATE = 1 << 24;
        /// DIAG.F unknown FIS type
        const UNKNOWN_FIS = 1 << 25;
        /// DIAG.X device presence changed
        const EXCHANGED = 1 << 26;
    }
}

/// View over PxSSTS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SataStatus(pub u32);

impl SataStatus {
    /// DET field
    pub fn device_detection(&self) -> u32 {
        self.0 & SSTS_DET_MASK
    }

    /// Device present and phy communication established
    pub fn is_phy_enabled(&self) -> bool {
        self.device_detection() == SSTS_DET_PRESENT
    }

    /// Phy in offline mode, interface disabled
    pub fn is_interface_disabled(&self) -> bool {
        self.device_detection() == SSTS_DET_DISABLED
    }
}
