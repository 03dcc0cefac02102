//! Block request interface
//!
//! What the block layer hands to [`AhciPort::start_request`](crate::AhciPort::start_request).
//! The caller's buffer may live in another address space, so copies go
//! through the request and can fail with [`MemoryFault`].

use core::fmt;

/// Direction of a block request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Read,
    Write,
}

/// Outcome delivered to the request's completion sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestResult {
    Success,
    /// The device or the port failed the transfer
    Failure,
    /// Copying to or from the caller's buffer faulted
    MemoryFault,
}

/// The caller's buffer could not be accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryFault;

impl fmt::Display for MemoryFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fault accessing request buffer")
    }
}

/// A single block I/O request.
pub trait BlockRequest {
    fn request_type(&self) -> RequestType;

    /// First block of the transfer
    fn block_index(&self) -> u64;

    /// Number of blocks to transfer
    fn block_count(&self) -> u32;

    /// Copy caller bytes `[offset, offset + dst.len())` into `dst` (write path)
    fn read_from_buffer(&self, offset: usize, dst: &mut [u8]) -> Result<(), MemoryFault>;

    /// Copy `src` into caller bytes starting at `offset` (read path)
    fn write_to_buffer(&mut self, offset: usize, src: &[u8]) -> Result<(), MemoryFault>;

    /// Completion sink; called exactly once per request
    fn complete(&mut self, result: RequestResult);
}
