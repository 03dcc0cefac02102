//! Simulated AHCI port for host tests
//!
//! Register file with write-1-to-clear semantics, a link that trains after
//! COMRESET and a command processor that walks the command list, command
//! table and PRDT through identity-mapped pages against a sparse RAM disk.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::slice;
use spin::Mutex;
use x86_64::structures::paging::PhysFrame;
use x86_64::{PhysAddr, VirtAddr};

use crate::command::{CommandHeader, CommandHeaderFlags, CommandTable};
use crate::config::{Delay, PortConfig};
use crate::consts::*;
use crate::dma::{DmaAllocator, DmaPage};
use crate::identify::build_identify_block;
use crate::port::{interrupts_masked, AhciPort};
use crate::regs::{HbaCapabilities, PortCommand, PortInterrupt, PortRegisters};

#[repr(C, align(4096))]
struct RawPage([u8; PAGE_SIZE]);

/// Heap-backed pages whose physical address equals their virtual address.
pub struct TestAllocator {
    outstanding: usize,
    limit: Option<usize>,
    high_pages: bool,
}

impl TestAllocator {
    pub fn new() -> Self {
        Self {
            outstanding: 0,
            limit: None,
            high_pages: false,
        }
    }

    /// Fail once `limit` pages are outstanding
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }

    /// Report every page above 4GiB (not usable by the simulated HBA)
    pub fn with_high_pages(mut self) -> Self {
        self.high_pages = true;
        self
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl DmaAllocator for TestAllocator {
    fn allocate_page(&mut self) -> Option<DmaPage> {
        if self.limit.map_or(false, |limit| self.outstanding >= limit) {
            return None;
        }
        let page = Box::into_raw(Box::new(RawPage([0; PAGE_SIZE])));
        let virt = VirtAddr::from_ptr(page);
        let phys = if self.high_pages {
            PhysAddr::new(virt.as_u64() | 1 << 48)
        } else {
            PhysAddr::new(virt.as_u64())
        };
        self.outstanding += 1;
        Some(unsafe { DmaPage::new(PhysFrame::containing_address(phys), virt) })
    }

    fn release_page(&mut self, page: DmaPage) {
        self.outstanding -= 1;
        unsafe { drop(Box::from_raw(page.virt_addr().as_mut_ptr::<RawPage>())) };
    }
}

/// Delay that returns immediately
pub struct NoDelay;

impl Delay for NoDelay {
    fn delay_us(&mut self, _us: u32) {}
}

const REGISTER_COUNT: usize = HBA_PORT_SIZE / 4;
const TFD_READY: u32 = 0x50;

/// Hardware side of the simulated port
pub struct SimState {
    regs: [u32; REGISTER_COUNT],
    /// Register writes seen so far
    pub writes: usize,
    /// Writes to PxSCTL, i.e. COMRESET activity
    pub sctl_writes: usize,
    /// ATA opcodes the device executed
    pub commands: Vec<u8>,
    /// Register writes made while local interrupts were enabled
    pub unmasked_writes: usize,
    /// PxCMD.ST went from 0 to 1 while a fatal interrupt was pending
    pub restarted_after_fatal: bool,

    signature: u32,
    identify: [u8; ATA_IDENTIFY_SIZE],
    sectors: BTreeMap<u64, Vec<u8>>,

    /// Link trains after COMRESET
    pub link_trains: bool,
    /// SError value raised instead of completing the next command
    pub serr_on_next_command: Option<u32>,
    /// Raise an interface fatal error instead of completing the next command
    pub fatal_on_next_command: bool,
    /// Device aborts the next command with a task file error
    pub abort_next_command: bool,
    /// Commands are accepted but never complete
    pub wedged: bool,
    /// PxTFD keeps BSY set
    pub busy: bool,
    /// Clearing ST neither drops CR nor clears PxCI
    pub stuck_engine: bool,
}

impl SimState {
    /// An LBA48 ATA disk with `sectors` 512-byte sectors and a trained link
    pub fn ata_disk(sectors: u64) -> Self {
        Self::with_device(
            SATA_SIG_ATA,
            build_identify_block("SIM ATA DISK", sectors, true, None),
        )
    }

    pub fn atapi_drive() -> Self {
        Self::with_device(SATA_SIG_ATAPI, build_identify_block("SIM ATAPI", 0, false, None))
    }

    /// Interface left disabled by firmware
    pub fn firmware_disabled() -> Self {
        let mut state = Self::ata_disk(1024);
        state.regs[PORT_SSTS / 4] = SSTS_DET_DISABLED;
        state.link_trains = false;
        state
    }

    fn with_device(signature: u32, identify: [u8; ATA_IDENTIFY_SIZE]) -> Self {
        let mut regs = [0u32; REGISTER_COUNT];
        regs[PORT_SSTS / 4] = 0x113;
        regs[PORT_SIG / 4] = signature;
        regs[PORT_TFD / 4] = TFD_READY;
        Self {
            regs,
            writes: 0,
            sctl_writes: 0,
            commands: Vec::new(),
            unmasked_writes: 0,
            restarted_after_fatal: false,
            signature,
            identify,
            sectors: BTreeMap::new(),
            link_trains: true,
            serr_on_next_command: None,
            fatal_on_next_command: false,
            abort_next_command: false,
            wedged: false,
            busy: false,
            stuck_engine: false,
        }
    }

    pub fn reg(&self, offset: usize) -> u32 {
        self.regs[offset / 4]
    }

    pub fn set_reg(&mut self, offset: usize, value: u32) {
        self.regs[offset / 4] = value;
    }

    /// Raise interrupt status bits as the HBA would
    pub fn raise(&mut self, status: PortInterrupt) {
        self.regs[PORT_IS / 4] |= status.bits();
    }

    pub fn sector(&self, lba: u64) -> Vec<u8> {
        self.sectors
            .get(&lba)
            .cloned()
            .unwrap_or_else(|| alloc::vec![0; ATA_DEFAULT_SECTOR_SIZE as usize])
    }

    fn write(&mut self, offset: usize, value: u32) {
        self.writes += 1;
        let index = offset / 4;
        match offset {
            PORT_IS | PORT_SERR => self.regs[index] &= !value,
            PORT_CMD => self.write_command(value),
            PORT_SCTL => self.write_sata_control(value),
            PORT_CI => {
                if self.regs[PORT_CMD / 4] & PORT_CMD_ST == 0 {
                    return;
                }
                self.regs[index] |= value;
                for slot in 0..HBA_CMD_SLOT_MAX {
                    if value & (1 << slot) != 0 {
                        self.process_command(slot);
                    }
                }
            }
            _ => self.regs[index] = value,
        }
    }

    fn write_command(&mut self, value: u32) {
        let old = PortCommand::from_bits_retain(self.regs[PORT_CMD / 4]);
        let mut cmd = PortCommand::from_bits_retain(value);
        let fatal_pending = PortInterrupt::from_bits_retain(self.reg(PORT_IS))
            .intersects(PortInterrupt::FATAL_CONDITIONS);
        if fatal_pending && cmd.contains(PortCommand::ST) && !old.contains(PortCommand::ST) {
            self.restarted_after_fatal = true;
        }

        if self.stuck_engine {
            cmd.set(PortCommand::CR, old.contains(PortCommand::CR) || cmd.contains(PortCommand::ST));
        } else {
            cmd.set(PortCommand::CR, cmd.contains(PortCommand::ST));
            if !cmd.contains(PortCommand::ST) {
                self.regs[PORT_CI / 4] = 0;
                self.regs[PORT_SACT / 4] = 0;
            }
        }
        cmd.set(PortCommand::FR, cmd.contains(PortCommand::FRE));
        self.regs[PORT_CMD / 4] = cmd.bits();
    }

    fn write_sata_control(&mut self, value: u32) {
        self.sctl_writes += 1;
        self.regs[PORT_SCTL / 4] = value;
        match value & SCTL_DET_MASK {
            SCTL_DET_INIT => {
                self.regs[PORT_SSTS / 4] = SSTS_DET_NO_DEV;
                self.regs[PORT_SIG / 4] = u32::MAX;
            }
            SCTL_DET_NONE if self.link_trains => {
                self.regs[PORT_SSTS / 4] = 0x113;
                self.regs[PORT_SIG / 4] = self.signature;
                // DIAG.N: PhyRdy changed
                self.regs[PORT_SERR / 4] |= 1 << 16;
            }
            SCTL_DET_NONE => self.regs[PORT_SSTS / 4] = SSTS_DET_PRESENT_NO_PHY,
            _ => {}
        }
    }

    fn process_command(&mut self, slot: usize) {
        let command_list = phys_to_bytes(self.base(PORT_CLB, PORT_CLBU), PAGE_SIZE);
        let header_offset = CommandHeader::offset_of(slot);
        let mut header = CommandHeader::decode(&command_list[header_offset..]);
        let table = phys_to_bytes(header.command_table_address(), PAGE_SIZE);
        let fis = CommandTable::read_fis(table);
        assert_eq!(header.fis_length(), FIS_REG_H2D_DWORDS, "command FIS length");
        assert_eq!(
            header.flags().contains(CommandHeaderFlags::WRITE),
            fis.command == ATA_CMD_WRITE_DMA_EXT,
            "write flag for command 0x{:02X}",
            fis.command
        );

        if let Some(serr) = self.serr_on_next_command.take() {
            self.regs[PORT_SERR / 4] |= serr;
            return;
        }
        if self.fatal_on_next_command {
            self.fatal_on_next_command = false;
            self.raise(PortInterrupt::IFS);
            return;
        }
        if self.abort_next_command {
            self.abort_next_command = false;
            self.abort_command();
            return;
        }
        // Only PACKET transfers an ACMD
        if header.flags().contains(CommandHeaderFlags::ATAPI) && fis.command != ATA_CMD_PACKET {
            self.abort_command();
            return;
        }
        if self.wedged {
            return;
        }

        let regions: Vec<&mut [u8]> = (0..header.prdt_length as usize)
            .map(|i| {
                let entry = CommandTable::read_prdt_entry(table, i);
                phys_to_bytes(entry.address(), entry.length())
            })
            .collect();
        let transferred: usize = regions.iter().map(|r| r.len()).sum();
        self.commands.push(fis.command);

        let sector_size = ATA_DEFAULT_SECTOR_SIZE as usize;
        match fis.command {
            ATA_CMD_IDENTIFY | ATA_CMD_ATAPI_IDENT => {
                scatter(&self.identify, regions);
            }
            ATA_CMD_READ_DMA_EXT => {
                assert_eq!(transferred, fis.count() as usize * sector_size);
                let mut data = Vec::with_capacity(transferred);
                for i in 0..fis.count() as u64 {
                    data.extend_from_slice(&self.sector(fis.lba() + i));
                }
                scatter(&data, regions);
            }
            ATA_CMD_WRITE_DMA_EXT => {
                assert_eq!(transferred, fis.count() as usize * sector_size);
                let data: Vec<u8> = regions.iter().flat_map(|r| r.iter().copied()).collect();
                for (i, chunk) in data.chunks(sector_size).enumerate() {
                    self.sectors.insert(fis.lba() + i as u64, chunk.to_vec());
                }
            }
            other => panic!("simulated device got unexpected command 0x{:02X}", other),
        }

        self.regs[PORT_TFD / 4] = TFD_READY;
        header.prd_byte_count = transferred as u32;
        header.encode(&mut command_list[header_offset..]);
        self.raise(PortInterrupt::DHRS);
        self.regs[PORT_CI / 4] &= !(1 << slot);
    }

    /// ERR with ABRT in the error field
    fn abort_command(&mut self) {
        self.regs[PORT_TFD / 4] = TFD_READY | ATA_DEV_ERR | 0x0400;
        self.raise(PortInterrupt::TFES);
    }

    fn base(&self, low: usize, high: usize) -> PhysAddr {
        PhysAddr::new((self.reg(high) as u64) << 32 | self.reg(low) as u64)
    }
}

fn phys_to_bytes(address: PhysAddr, len: usize) -> &'static mut [u8] {
    // Test pages are identity mapped and leaked.
    unsafe { slice::from_raw_parts_mut(address.as_u64() as *mut u8, len) }
}

fn scatter(data: &[u8], regions: Vec<&mut [u8]>) {
    let mut offset = 0;
    for region in regions {
        let len = region.len().min(data.len().saturating_sub(offset));
        region[..len].copy_from_slice(&data[offset..offset + len]);
        offset += region.len();
    }
}

/// Register interface bound to a shared [`SimState`]
pub struct SimRegisters(pub Arc<Mutex<SimState>>);

impl PortRegisters for SimRegisters {
    fn read(&self, offset: usize) -> u32 {
        let state = self.0.lock();
        match offset {
            PORT_TFD if state.busy => state.reg(PORT_TFD) | ATA_DEV_BUSY,
            _ => state.reg(offset),
        }
    }

    fn write(&self, offset: usize, value: u32) {
        let mut state = self.0.lock();
        if !interrupts_masked() {
            state.unmasked_writes += 1;
        }
        state.write(offset, value);
    }
}

pub type SimPort = AhciPort<SimRegisters, NoDelay>;

/// Config with short budgets so failure paths finish quickly
pub fn test_config() -> PortConfig {
    PortConfig {
        command_completion: Some(crate::config::RetryPolicy::new(50, 1)),
        ..PortConfig::default()
    }
}

/// Build a port over `state` with 64-bit addressing
pub fn sim_port(state: SimState) -> (SimPort, Arc<Mutex<SimState>>) {
    sim_port_with(state, HbaCapabilities::S64A, test_config())
}

pub fn sim_port_with(
    state: SimState,
    caps: HbaCapabilities,
    config: PortConfig,
) -> (SimPort, Arc<Mutex<SimState>>) {
    let shared = Arc::new(Mutex::new(state));
    let mut allocator = TestAllocator::new();
    let port = AhciPort::new(
        0,
        0,
        SimRegisters(shared.clone()),
        caps,
        config,
        NoDelay,
        &mut allocator,
    );
    (port, shared)
}
