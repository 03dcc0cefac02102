//! AHCI (Advanced Host Controller Interface) Port Driver
//!
//! Drives a single SATA port of an AHCI HBA:
//! - Port reset, link bring-up and command engine start/stop
//! - Device detection and IDENTIFY (PACKET) DEVICE
//! - DMA transfers through a per-port scatter list and PRDT
//! - Interrupt handling with reset or fatal shutdown
//!
//! ## Architecture
//!
//! - **Register layer** (`regs`): MMIO access behind the [`PortRegisters`] trait
//! - **Command layer** (`command`): command list, command table, FIS and PRDT layouts
//! - **Memory layer** (`dma`, `scatter`): DMA pages and the in-flight transfer
//! - **Port layer** (`port`): reset/recovery state machine and request lifecycle
//!
//! The HBA layer that enumerates ports and demultiplexes interrupts, and the
//! block layer that serializes callers, live outside this crate.
//!
//! ## Safety
//!
//! MMIO access is confined to [`MmioPortRegisters`] and DMA memory to
//! [`DmaPage`]. Memory barriers order descriptor writes against command issue.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod command;
pub mod config;
pub mod consts;
pub mod device;
pub mod dma;
pub mod error;
pub mod identify;
pub mod port;
pub mod regs;
pub mod request;
pub mod scatter;

#[cfg(test)]
mod sim;

pub use config::{Delay, PortConfig, RetryPolicy, SpinDelay};
pub use device::{DeviceParameters, DeviceType, SataDisk};
pub use dma::{DmaAllocator, DmaPage, DmaPagePool};
pub use error::{AhciError, AhciResult, ErrorSeverity};
pub use port::{AhciPort, PortState};
pub use regs::{HbaCapabilities, MmioPortRegisters, PortRegisters};
pub use request::{BlockRequest, MemoryFault, RequestResult, RequestType};
pub use scatter::ScatterList;
