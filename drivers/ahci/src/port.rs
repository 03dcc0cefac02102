//! AHCI Port Management
//!
//! This module handles AHCI port reset, device detection and identification,
//! and low-level command execution. Each port drives a single SATA device and
//! owns the command list, received FIS area and command tables for it.
//!
//! Locking: everything that touches registers or DMA descriptors lives on
//! [`PortInner`] behind one `spin::Mutex`. Methods taking `&mut PortInner` or
//! `&mut PortHardware` can only be reached with that lock held, and the lock
//! is only taken with local interrupts disabled so the port's own IRQ never
//! spins on it. Exactly one request may be in flight; a second
//! `start_request` while one is running is a caller bug and panics instead of
//! deadlocking on the lock.

use alloc::vec::Vec;
use core::hint::spin_loop;
use core::iter;
use core::sync::atomic::{AtomicBool, Ordering};
use log::{debug, error, info, log, trace, warn};
use spin::Mutex;
use x86_64::PhysAddr;

use super::command::{AtaCommand, CommandHeader, CommandTable, PrdtEntry};
use super::config::{Delay, PortConfig, SpinDelay};
use super::consts::*;
use super::device::{DeviceParameters, DeviceType, SataDisk};
use super::dma::{allocate_pages, DmaAllocator, DmaPage, DmaPagePool};
use super::error::{AhciError, AhciResult};
use super::identify::IdentifyData;
use super::regs::{
    full_memory_barrier, HbaCapabilities, PortCommand, PortInterrupt, PortRegisters, SataError,
    SataStatus,
};
use super::request::{BlockRequest, RequestResult, RequestType};
use super::scatter::ScatterList;

/// Port operational state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Firmware left the interface disabled; the port is never touched
    FirmwareDisabled,
    /// Not reset yet, or the link did not come up
    Uninitialized,
    /// Port is being reset
    Resetting,
    /// Command engine running, ready for commands
    Operable,
    /// Shut down after a fatal interface error
    FatalError,
}

/// DMA memory the HBA works from
struct PortMemory {
    command_list: DmaPage,
    fis_receive: DmaPage,
    command_tables: Vec<DmaPage>,
    identify: DmaPage,
}

impl PortMemory {
    /// Command list, received FIS area, one table per slot, IDENTIFY buffer
    const PAGES: usize = 2 + HBA_CMD_SLOT_MAX + 1;

    fn from_pages(mut pages: Vec<DmaPage>) -> Option<Self> {
        let identify = pages.pop()?;
        let command_tables = pages.split_off(2);
        let fis_receive = pages.pop()?;
        let command_list = pages.pop()?;
        debug_assert_eq!(command_tables.len(), HBA_CMD_SLOT_MAX);
        Some(Self {
            command_list,
            fis_receive,
            command_tables,
            identify,
        })
    }
}

/// Registers and descriptor memory of a port. Only reachable through the port lock.
struct PortHardware<R, D> {
    index: u32,
    registers: R,
    caps: HbaCapabilities,
    config: PortConfig,
    delay: D,
    memory: Option<PortMemory>,
}

/// State guarded by the port lock
struct PortInner<R, D> {
    hw: PortHardware<R, D>,
    dma_pool: Option<DmaPagePool>,
    state: PortState,
    parameters: Option<DeviceParameters>,
    device: Option<SataDisk>,
    controller_id: u32,
}

/// AHCI Port structure
///
/// Manages a single AHCI port including command list, received FIS area,
/// and command execution. Each port can have one connected device.
pub struct AhciPort<R: PortRegisters, D: Delay = SpinDelay> {
    index: u32,
    disabled_by_firmware: bool,
    in_flight: AtomicBool,
    inner: Mutex<PortInner<R, D>>,
}

/// Marks the single request slot of a port as taken until dropped.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn enter(flag: &'a AtomicBool, index: u32) -> Self {
        let busy = flag.swap(true, Ordering::AcqRel);
        assert!(!busy, "AHCI Port {}: request started while another is in flight", index);
        Self(flag)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(not(test))]
fn without_interrupts<F, T>(f: F) -> T
where
    F: FnOnce() -> T,
{
    x86_64::instructions::interrupts::without_interrupts(f)
}

#[cfg(test)]
std::thread_local! {
    static INTERRUPTS_MASKED: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
}

/// Host builds cannot execute `cli`; track the masked section per thread instead.
#[cfg(test)]
fn without_interrupts<F, T>(f: F) -> T
where
    F: FnOnce() -> T,
{
    let was_masked = INTERRUPTS_MASKED.with(|masked| masked.replace(true));
    let result = f();
    INTERRUPTS_MASKED.with(|masked| masked.set(was_masked));
    result
}

#[cfg(test)]
pub(crate) fn interrupts_masked() -> bool {
    INTERRUPTS_MASKED.with(|masked| masked.get())
}

impl<R: PortRegisters, D: Delay> AhciPort<R, D> {
    /// Create the port and allocate its DMA memory.
    ///
    /// If firmware disabled the interface (`PxSSTS.DET == 4`) nothing is
    /// allocated and no register is ever written. Allocation failure is not
    /// reported here; the port just never becomes operable.
    pub fn new<A>(
        controller_id: u32,
        index: u32,
        registers: R,
        caps: HbaCapabilities,
        config: PortConfig,
        delay: D,
        allocator: &mut A,
    ) -> Self
    where
        A: DmaAllocator + ?Sized,
    {
        let disabled_by_firmware = SataStatus(registers.read(PORT_SSTS)).is_interface_disabled();

        let mut memory = None;
        let mut dma_pool = None;
        let state = if disabled_by_firmware {
            info!("AHCI Port {}: interface disabled by firmware", index);
            PortState::FirmwareDisabled
        } else {
            match Self::allocate_memory(allocator, caps, &config) {
                Ok((port_memory, pool)) => {
                    memory = Some(port_memory);
                    dma_pool = Some(pool);
                }
                Err(e) => error!("AHCI Port {}: {}", index, e),
            }
            PortState::Uninitialized
        };

        Self {
            index,
            disabled_by_firmware,
            in_flight: AtomicBool::new(false),
            inner: Mutex::new(PortInner {
                hw: PortHardware {
                    index,
                    registers,
                    caps,
                    config,
                    delay,
                    memory,
                },
                dma_pool,
                state,
                parameters: None,
                device: None,
                controller_id,
            }),
        }
    }

    fn allocate_memory<A>(
        allocator: &mut A,
        caps: HbaCapabilities,
        config: &PortConfig,
    ) -> AhciResult<(PortMemory, DmaPagePool)>
    where
        A: DmaAllocator + ?Sized,
    {
        let pages = allocate_pages(allocator, caps, PortMemory::PAGES)?;
        match allocate_pages(allocator, caps, config.effective_pool_pages()) {
            Ok(pool) => PortMemory::from_pages(pages)
                .map(|memory| (memory, DmaPagePool::new(pool)))
                .ok_or(AhciError::ResourceExhaustion),
            Err(e) => {
                for page in pages {
                    allocator.release_page(page);
                }
                Err(e)
            }
        }
    }

    /// Port number on the controller
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Run `f` on the locked port state with local interrupts disabled
    fn with_inner<T>(&self, f: impl FnOnce(&mut PortInner<R, D>) -> T) -> T {
        without_interrupts(|| f(&mut *self.inner.lock()))
    }

    pub fn state(&self) -> PortState {
        self.with_inner(|inner| inner.state)
    }

    /// Resources are in place and the command engine is running
    pub fn is_operable(&self) -> bool {
        self.with_inner(|inner| inner.state == PortState::Operable && inner.has_resources())
    }

    /// The disk built by the last successful identification
    pub fn connected_device(&self) -> Option<SataDisk> {
        self.with_inner(|inner| inner.device.clone())
    }

    pub fn device_parameters(&self) -> Option<DeviceParameters> {
        self.with_inner(|inner| inner.parameters)
    }

    /// Largest request in blocks of the connected device
    pub fn max_transfer_blocks(&self) -> u32 {
        self.with_inner(|inner| match inner.parameters {
            Some(params) => {
                let bytes = inner.dma_pool.as_ref().map_or(0, DmaPagePool::capacity_bytes);
                (bytes / params.logical_sector_size as usize).min(u16::MAX as usize) as u32
            }
            None => 0,
        })
    }

    /// Bring the link up, restart the engines and identify the device.
    ///
    /// Returns false if the port is firmware-disabled or shut down, has no
    /// DMA memory, the link never comes up, or IDENTIFY fails.
    pub fn reset(&self) -> bool {
        self.with_inner(PortInner::reset)
    }

    /// Re-run IDENTIFY on an operable port and refresh the connected device.
    pub fn identify_device(&self) -> bool {
        if self.disabled_by_firmware {
            return false;
        }
        self.with_inner(|inner| {
            if inner.state != PortState::Operable {
                return false;
            }
            match inner.identify_device() {
                Ok(()) => true,
                Err(e) => {
                    log!(
                        e.severity().level(),
                        "AHCI Port {}: identify failed: {}",
                        inner.hw.index,
                        e
                    );
                    false
                }
            }
        })
    }

    /// Run one block request to completion.
    ///
    /// The request is completed exactly once, after the port lock is released.
    ///
    /// # Panics
    /// If another request is still in flight on this port.
    pub fn start_request<Q>(&self, request: &mut Q)
    where
        Q: BlockRequest + ?Sized,
    {
        let _in_flight = InFlight::enter(&self.in_flight, self.index);
        let result = if self.disabled_by_firmware {
            RequestResult::Failure
        } else {
            self.with_inner(|inner| inner.process_request(request))
        };
        request.complete(result);
    }

    /// Service this port's share of an HBA interrupt.
    pub fn handle_interrupt(&self) {
        if self.disabled_by_firmware {
            return;
        }
        self.with_inner(PortInner::handle_interrupt);
    }

    /// ATAPI media eject is not supported.
    pub fn eject(&self) {
        unimplemented!("AHCI Port {}: eject", self.index);
    }
}

impl<R: PortRegisters, D: Delay> PortInner<R, D> {
    fn has_resources(&self) -> bool {
        self.hw.memory.is_some() && self.dma_pool.is_some()
    }

    fn reset(&mut self) -> bool {
        match self.try_reset() {
            Ok(()) => true,
            Err(e) => {
                log!(e.severity().level(), "AHCI Port {}: reset failed: {}", self.hw.index, e);
                false
            }
        }
    }

    fn try_reset(&mut self) -> AhciResult<()> {
        match self.state {
            PortState::FirmwareDisabled => return Err(AhciError::FirmwareDisabled),
            PortState::FatalError => return Err(AhciError::FatalInterfaceError),
            _ => {}
        }
        if !self.has_resources() {
            return Err(AhciError::ResourceExhaustion);
        }

        debug!("AHCI Port {}: resetting", self.hw.index);
        self.state = PortState::Resetting;
        self.parameters = None;
        self.device = None;

        let result = self.bring_up();
        if result.is_err() && self.state == PortState::Resetting {
            self.state = PortState::Uninitialized;
        }
        result
    }

    fn bring_up(&mut self) -> AhciResult<()> {
        let hw = &mut self.hw;
        hw.clear_interrupt_status();
        hw.start_fis_receiving();
        hw.clear_sata_errors();

        hw.initiate_sata_reset()?;
        hw.rebase()?;
        hw.power_on();
        hw.spin_up();
        hw.start_fis_receiving();
        hw.set_active_state();
        hw.start_command_list_processing();
        hw.enable_interrupts();
        self.state = PortState::Operable;

        self.identify_device()
    }

    /// Issue IDENTIFY and cache what it reports.
    fn identify_device(&mut self) -> AhciResult<()> {
        let index = self.hw.index;
        self.parameters = None;
        self.device = None;

        let device_type = DeviceType::from_signature(self.hw.registers.read(PORT_SIG));
        let data = match self.hw.identify(device_type.is_atapi()) {
            Ok(data) => data,
            Err(AhciError::FatalInterfaceError) => {
                self.recover_from_fatal_error();
                return Err(AhciError::FatalInterfaceError);
            }
            Err(e) => return Err(e),
        };

        let params = DeviceParameters::from_identify(device_type, &data);
        self.parameters = Some(params);
        if params.is_atapi() {
            info!("AHCI Port {}: ATAPI device detected, not supported", index);
            return Ok(());
        }

        info!(
            "AHCI Port {}: {} \"{}\", {} sectors of {} bytes (physical {})",
            index,
            if params.lba48 { "LBA48" } else { "LBA28" },
            data.model,
            params.max_addressable_block,
            params.logical_sector_size,
            params.physical_sector_size
        );
        self.device = Some(
            SataDisk::new(
                self.controller_id,
                index,
                params.logical_sector_size,
                params.max_addressable_block,
            )
            .with_identity(&data),
        );
        Ok(())
    }

    fn process_request<Q>(&mut self, request: &mut Q) -> RequestResult
    where
        Q: BlockRequest + ?Sized,
    {
        match self.transfer(request) {
            Ok(()) => RequestResult::Success,
            Err(e) => {
                log!(
                    e.severity().level(),
                    "AHCI Port {}: {:?} of lba {} count {} failed: {}",
                    self.hw.index,
                    request.request_type(),
                    request.block_index(),
                    request.block_count(),
                    e
                );
                match e {
                    AhciError::MemoryFault => RequestResult::MemoryFault,
                    _ => RequestResult::Failure,
                }
            }
        }
    }

    fn transfer<Q>(&mut self, request: &mut Q) -> AhciResult<()>
    where
        Q: BlockRequest + ?Sized,
    {
        let params = match self.parameters {
            Some(params) if self.state == PortState::Operable && self.device.is_some() => params,
            Some(params) if params.is_atapi() => return Err(AhciError::UnsupportedDevice),
            _ => return Err(AhciError::NoDevice),
        };

        let direction = request.request_type();
        let lba = request.block_index();
        let count = request.block_count();
        if count == 0 || count > u16::MAX as u32 || !params.contains_range(lba, count) {
            return Err(AhciError::InvalidParameters);
        }

        let pool = self.dma_pool.as_mut().ok_or(AhciError::ResourceExhaustion)?;
        let mut list = pool.acquire(count as usize * params.logical_sector_size as usize)?;

        if direction == RequestType::Write {
            list.fill(|offset, dst| request.read_from_buffer(offset, dst))
                .map_err(|_| AhciError::MemoryFault)?;
        }

        match self.hw.access_device(direction, lba, count as u16, &list) {
            Ok(()) => {}
            Err(AhciError::FatalInterfaceError) => {
                drop(list);
                self.recover_from_fatal_error();
                return Err(AhciError::FatalInterfaceError);
            }
            Err(e) => return Err(e),
        }

        if direction == RequestType::Read {
            list.drain(|offset, src| request.write_to_buffer(offset, src))
                .map_err(|_| AhciError::MemoryFault)?;
        }
        Ok(())
    }

    fn handle_interrupt(&mut self) {
        let index = self.hw.index;
        let status = PortInterrupt::from_bits_retain(self.hw.registers.read(PORT_IS));
        trace!("AHCI Port {}: interrupt status {:?}", index, status);

        if self.state != PortState::FatalError {
            if status.intersects(PortInterrupt::FATAL_CONDITIONS) {
                error!("AHCI Port {}: fatal interface error {:?}", index, status);
                self.recover_from_fatal_error();
            } else if status.intersects(PortInterrupt::RESET_CONDITIONS) {
                info!("AHCI Port {}: link change {:?}, resetting", index, status);
                self.reset();
            }
        }

        self.hw.registers.write(PORT_IS, status.bits());
    }

    /// Stop the port for good: no command processing, no FIS receiving, no interrupts.
    fn recover_from_fatal_error(&mut self) {
        error!("AHCI Port {}: shutting down after fatal error", self.hw.index);
        self.hw.stop_command_list_processing();
        self.hw.stop_fis_receiving();
        self.hw.disable_interrupts();
        self.state = PortState::FatalError;
        self.device = None;
    }
}

/// Outcome of one look at a command in flight, `None` while it is still running
fn completion_status<R: PortRegisters>(registers: &R, index: u32, mask: u32) -> Option<AhciResult<()>> {
    let serr = registers.read(PORT_SERR);
    if serr != 0 {
        error!(
            "AHCI Port {}: SATA error 0x{:08X} {:?}",
            index,
            serr,
            SataError::from_bits_truncate(serr)
        );
        registers.write(PORT_SERR, serr);
        return Some(Err(AhciError::CommandError(serr)));
    }

    let status = PortInterrupt::from_bits_retain(registers.read(PORT_IS));
    if status.intersects(PortInterrupt::FATAL_CONDITIONS) {
        error!("AHCI Port {}: fatal error during command {:?}", index, status);
        return Some(Err(AhciError::FatalInterfaceError));
    }
    if status.contains(PortInterrupt::TFES) {
        let tfd = registers.read(PORT_TFD);
        registers.write(PORT_IS, PortInterrupt::TFES.bits());
        return Some(Err(AhciError::TaskFileError(tfd as u8)));
    }

    if registers.read(PORT_CI) & mask == 0 {
        return Some(Ok(()));
    }
    None
}

impl<R: PortRegisters, D: Delay> PortHardware<R, D> {
    fn clear_interrupt_status(&self) {
        self.registers.write(PORT_IS, u32::MAX);
    }

    fn clear_sata_errors(&self) {
        self.registers.write_back(PORT_SERR);
    }

    fn enable_interrupts(&self) {
        self.registers.write(PORT_IE, PortInterrupt::ENABLED.bits());
    }

    fn disable_interrupts(&self) {
        self.registers.write(PORT_IE, 0);
    }

    fn start_fis_receiving(&self) {
        full_memory_barrier();
        self.registers.set_bits(PORT_CMD, PortCommand::FRE.bits());
        full_memory_barrier();
    }

    fn stop_fis_receiving(&self) {
        full_memory_barrier();
        self.registers.clear_bits(PORT_CMD, PortCommand::FRE.bits());
        full_memory_barrier();
    }

    fn start_command_list_processing(&self) {
        full_memory_barrier();
        self.registers.set_bits(PORT_CMD, PortCommand::ST.bits());
        full_memory_barrier();
    }

    /// Clear ST and wait for CR to follow
    fn stop_command_list_processing(&mut self) -> bool {
        full_memory_barrier();
        self.registers.clear_bits(PORT_CMD, PortCommand::ST.bits());
        full_memory_barrier();
        let registers = &self.registers;
        let stopped = self.config.engine_stop.wait_until(&mut self.delay, || {
            registers.read(PORT_CMD) & PortCommand::CR.bits() == 0
        });
        if !stopped {
            warn!("AHCI Port {}: command list still running after stop", self.index);
        }
        stopped
    }

    /// Cycle ST so the HBA drops whatever is left in PxCI.
    ///
    /// The engine is only restarted once CR has dropped. Returns whether the
    /// slots in `mask` are clear afterwards.
    fn abort_commands(&mut self, mask: u32) -> bool {
        debug!("AHCI Port {}: restarting command list processing", self.index);
        if !self.stop_command_list_processing() {
            return false;
        }
        let cleared = self.registers.read(PORT_CI) & mask == 0;
        self.start_command_list_processing();
        cleared
    }

    /// Power on the device, only meaningful with cold presence detection
    fn power_on(&self) {
        let cmd = PortCommand::from_bits_retain(self.registers.read(PORT_CMD));
        if !cmd.contains(PortCommand::CPD) {
            return;
        }
        trace!("AHCI Port {}: power on device", self.index);
        self.registers.set_bits(PORT_CMD, PortCommand::POD.bits());
    }

    /// Spin up the device, only meaningful with staggered spin-up
    fn spin_up(&self) {
        if !self.caps.contains(HbaCapabilities::SSS) {
            return;
        }
        trace!("AHCI Port {}: spin up device", self.index);
        self.registers.set_bits(PORT_CMD, PortCommand::SUD.bits());
    }

    /// Request the Active interface power state
    fn set_active_state(&self) {
        full_memory_barrier();
        let cmd = self.registers.read(PORT_CMD);
        self.registers.write(
            PORT_CMD,
            (cmd & !PORT_CMD_ICC_MASK) | (PORT_CMD_ICC_ACTIVE << PORT_CMD_ICC_SHIFT),
        );
        full_memory_barrier();
    }

    /// COMRESET the link and wait for the PHY to come back.
    fn initiate_sata_reset(&mut self) -> AhciResult<()> {
        debug!("AHCI Port {}: COMRESET", self.index);
        self.stop_command_list_processing();
        self.spin_up();

        full_memory_barrier();
        let sctl = self.registers.read(PORT_SCTL) & !SCTL_DET_MASK;
        self.registers.write(PORT_SCTL, sctl | SCTL_DET_INIT);
        self.delay.delay_us(self.config.comreset_hold_us);
        self.registers.write(PORT_SCTL, sctl | SCTL_DET_NONE);
        full_memory_barrier();

        let registers = &self.registers;
        let link_up = self.config.link_up.wait_until(&mut self.delay, || {
            SataStatus(registers.read(PORT_SSTS)).is_phy_enabled()
        });
        self.clear_sata_errors();

        if !link_up {
            warn!(
                "AHCI Port {}: link not ready, SStatus 0x{:X}",
                self.index,
                self.registers.read(PORT_SSTS)
            );
            return Err(AhciError::LinkNotReady);
        }
        info!("AHCI Port {}: link up", self.index);
        Ok(())
    }

    /// Stop both engines and point the HBA at our command list and FIS area.
    fn rebase(&mut self) -> AhciResult<()> {
        debug!("AHCI Port {}: rebasing", self.index);
        self.stop_command_list_processing();
        self.stop_fis_receiving();

        let registers = &self.registers;
        let running = (PortCommand::CR | PortCommand::FR).bits();
        if !self.config.engine_stop.wait_until(&mut self.delay, || {
            registers.read(PORT_CMD) & running == 0
        }) {
            warn!("AHCI Port {}: engines did not stop before rebase", self.index);
        }

        let memory = self.memory.as_ref().ok_or(AhciError::ResourceExhaustion)?;
        let (clb, fb) = (memory.command_list.phys_addr(), memory.fis_receive.phys_addr());
        full_memory_barrier();
        self.registers.write(PORT_CLB, clb.as_u64() as u32);
        self.registers.write(PORT_CLBU, (clb.as_u64() >> 32) as u32);
        self.registers.write(PORT_FB, fb.as_u64() as u32);
        self.registers.write(PORT_FBU, (fb.as_u64() >> 32) as u32);
        full_memory_barrier();
        Ok(())
    }

    /// First slot with neither its issue nor its active bit set
    fn find_unused_slot(&self) -> AhciResult<usize> {
        let busy = self.registers.read(PORT_CI) | self.registers.read(PORT_SACT);
        let slot = (0..HBA_CMD_SLOT_MAX)
            .find(|slot| busy & (1 << slot) == 0)
            .ok_or(AhciError::NoAvailableSlots)?;
        debug_assert_eq!(self.registers.read(PORT_CI) & (1 << slot), 0);
        trace!("AHCI Port {}: using slot {}", self.index, slot);
        Ok(slot)
    }

    fn identify(&mut self, atapi: bool) -> AhciResult<IdentifyData> {
        let memory = self.memory.as_mut().ok_or(AhciError::ResourceExhaustion)?;
        memory.identify.zero();
        let buffer = memory.identify.phys_addr();

        self.execute(
            &AtaCommand::identify(atapi),
            iter::once((buffer, ATA_IDENTIFY_SIZE as u32)),
        )?;

        let memory = self.memory.as_ref().ok_or(AhciError::ResourceExhaustion)?;
        Ok(IdentifyData::parse(&memory.identify.bytes()[..ATA_IDENTIFY_SIZE]))
    }

    fn access_device(
        &mut self,
        direction: RequestType,
        lba: u64,
        block_count: u16,
        list: &ScatterList<'_>,
    ) -> AhciResult<()> {
        let command = match direction {
            RequestType::Read => AtaCommand::read_dma_ext(lba, block_count),
            RequestType::Write => AtaCommand::write_dma_ext(lba, block_count),
        };
        self.execute(&command, list.segments())
    }

    /// Fill a free slot with `command`, issue it and poll it to completion.
    fn execute<I>(&mut self, command: &AtaCommand, segments: I) -> AhciResult<()>
    where
        I: Iterator<Item = (PhysAddr, u32)>,
    {
        let slot = self.find_unused_slot()?;
        let memory = self.memory.as_mut().ok_or(AhciError::ResourceExhaustion)?;

        let table_page = &mut memory.command_tables[slot];
        let table_address = table_page.phys_addr();
        let mut table = CommandTable::new(table_page.bytes_mut());
        table.clear_header();
        table.set_fis(&command.build_fis());

        let mut prdt_length = 0;
        let mut segments = segments.peekable();
        while let Some((address, length)) = segments.next() {
            if prdt_length == table.prdt_capacity() {
                return Err(AhciError::BufferError);
            }
            let last = segments.peek().is_none();
            table.set_prdt_entry(prdt_length, &PrdtEntry::new(address, length, last));
            prdt_length += 1;
        }

        let header = CommandHeader::new(
            FIS_REG_H2D_DWORDS,
            command.header_flags(),
            prdt_length as u16,
            table_address,
        );
        header.encode(&mut memory.command_list.bytes_mut()[CommandHeader::offset_of(slot)..]);
        full_memory_barrier();

        let registers = &self.registers;
        let busy = ATA_DEV_BUSY | ATA_DEV_DRQ;
        if !self.config.device_ready.wait_until(&mut self.delay, || {
            registers.read(PORT_TFD) & busy == 0
        }) {
            warn!("AHCI Port {}: device busy, command 0x{:02X} not issued", self.index, command.command);
            return Err(AhciError::DeviceNotReady);
        }

        trace!(
            "AHCI Port {}: issue command 0x{:02X} lba {} count {} slot {}",
            self.index,
            command.command,
            command.lba,
            command.count,
            slot
        );
        self.registers.write(PORT_CI, 1 << slot);
        full_memory_barrier();

        let result = self.wait_for_completion(slot);
        match result {
            Ok(()) => debug_assert_eq!(self.registers.read(PORT_CI) & (1 << slot), 0),
            // Fatal recovery stops the engine, it must stay stopped
            Err(AhciError::FatalInterfaceError) => {}
            Err(_) => {
                if !self.abort_commands(1 << slot) {
                    error!("AHCI Port {}: slot {} still issued after abort", self.index, slot);
                }
            }
        }
        result
    }

    fn wait_for_completion(&mut self, slot: usize) -> AhciResult<()> {
        let mask = 1u32 << slot;
        let index = self.index;
        let registers = &self.registers;
        let mut outcome = None;

        match self.config.command_completion {
            Some(policy) => {
                policy.wait_until(&mut self.delay, || {
                    outcome = completion_status(registers, index, mask);
                    outcome.is_some()
                });
            }
            None => {
                while outcome.is_none() {
                    outcome = completion_status(registers, index, mask);
                    spin_loop();
                }
            }
        }

        outcome.unwrap_or_else(|| {
            error!("AHCI Port {}: command in slot {} timed out", index, slot);
            Err(AhciError::Timeout)
        })
    }
}
