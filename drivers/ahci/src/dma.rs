//! DMA memory for one port
//!
//! Physical pages the HBA reads and writes: the command list, the received
//! FIS area, one command table per slot, the IDENTIFY buffer and the fixed
//! pool that backs scatter lists. Pages come from a kernel-provided
//! [`DmaAllocator`] and stay mapped for the life of the port.

use alloc::vec::Vec;
use core::slice;
use x86_64::structures::paging::{PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use super::consts::PAGE_SIZE;
use super::error::{AhciError, AhciResult};
use super::regs::HbaCapabilities;
use super::scatter::ScatterList;

/// One physically contiguous, kernel-mapped page usable for DMA.
#[derive(Debug)]
pub struct DmaPage {
    frame: PhysFrame<Size4KiB>,
    virt: VirtAddr,
}

// The page is exclusively owned; only the HBA aliases it.
unsafe impl Send for DmaPage {}

impl DmaPage {
    /// # Safety
    /// `virt` must map `frame` for `PAGE_SIZE` bytes, uncached or coherent
    /// with device DMA, and nothing else may access the page while this
    /// value exists.
    pub unsafe fn new(frame: PhysFrame<Size4KiB>, virt: VirtAddr) -> Self {
        Self { frame, virt }
    }

    pub fn frame(&self) -> PhysFrame<Size4KiB> {
        self.frame
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.frame.start_address()
    }

    pub fn virt_addr(&self) -> VirtAddr {
        self.virt
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.virt.as_ptr::<u8>(), PAGE_SIZE) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.virt.as_mut_ptr::<u8>(), PAGE_SIZE) }
    }

    pub fn zero(&mut self) {
        self.bytes_mut().fill(0);
    }
}

/// Source of DMA-capable pages, implemented by the kernel's frame allocator.
pub trait DmaAllocator {
    /// Allocate and map one page, or `None` when memory is exhausted
    fn allocate_page(&mut self) -> Option<DmaPage>;

    /// Give back a page obtained from `allocate_page`
    fn release_page(&mut self, page: DmaPage);
}

/// Allocate `count` zeroed pages the HBA can address.
///
/// Without 64-bit addressing (`CAP.S64A`) a page above 4GiB is unusable and
/// counts as exhaustion. On failure everything allocated so far is released.
pub fn allocate_pages<A>(
    allocator: &mut A,
    caps: HbaCapabilities,
    count: usize,
) -> AhciResult<Vec<DmaPage>>
where
    A: DmaAllocator + ?Sized,
{
    let mut pages = Vec::with_capacity(count);
    for _ in 0..count {
        match allocator.allocate_page() {
            Some(mut page) if is_addressable(caps, page.phys_addr()) => {
                page.zero();
                pages.push(page);
            }
            other => {
                if let Some(page) = other {
                    allocator.release_page(page);
                }
                for page in pages.drain(..) {
                    allocator.release_page(page);
                }
                return Err(AhciError::ResourceExhaustion);
            }
        }
    }
    Ok(pages)
}

fn is_addressable(caps: HbaCapabilities, address: PhysAddr) -> bool {
    caps.contains(HbaCapabilities::S64A) || address.as_u64() + PAGE_SIZE as u64 <= 1 << 32
}

/// Fixed set of pages scatter lists are carved from.
///
/// Sized once at construction, so it bounds the largest single transfer.
/// Only one scatter list can borrow it at a time.
#[derive(Debug)]
pub struct DmaPagePool {
    pages: Vec<DmaPage>,
    in_use: bool,
}

impl DmaPagePool {
    pub fn new(pages: Vec<DmaPage>) -> Self {
        Self { pages, in_use: false }
    }

    /// Number of pages in the pool
    pub fn capacity(&self) -> usize {
        self.pages.len()
    }

    pub fn capacity_bytes(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    /// Check whether a scatter list currently holds the pool
    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    /// Lend out enough pages for a `bytes`-long transfer.
    pub fn acquire(&mut self, bytes: usize) -> AhciResult<ScatterList<'_>> {
        if bytes == 0 || bytes > self.capacity_bytes() {
            return Err(AhciError::InvalidParameters);
        }
        assert!(!self.in_use, "DMA pool already lent to a scatter list");
        self.in_use = true;
        Ok(ScatterList::new(self, bytes))
    }

    pub(crate) fn pages(&self) -> &[DmaPage] {
        &self.pages
    }

    pub(crate) fn pages_mut(&mut self) -> &mut [DmaPage] {
        &mut self.pages
    }

    pub(crate) fn release(&mut self) {
        debug_assert!(self.in_use);
        self.in_use = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::TestAllocator;

    #[test]
    fn test_allocate_pages_zeroes_memory() {
        let mut allocator = TestAllocator::new();
        let mut pages = allocate_pages(&mut allocator, HbaCapabilities::S64A, 2).unwrap();
        assert!(pages.iter().all(|p| p.bytes().iter().all(|&b| b == 0)));
        pages[0].bytes_mut()[0] = 0x5A;
        assert_eq!(pages[0].bytes()[0], 0x5A);
        assert_eq!(pages[0].phys_addr().as_u64(), pages[0].virt_addr().as_u64());
    }

    #[test]
    fn test_allocate_pages_releases_on_failure() {
        let mut allocator = TestAllocator::with_limit(3);
        assert_eq!(
            allocate_pages(&mut allocator, HbaCapabilities::S64A, 5).unwrap_err(),
            AhciError::ResourceExhaustion
        );
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn test_pages_above_4g_need_s64a() {
        let mut allocator = TestAllocator::new().with_high_pages();
        assert_eq!(
            allocate_pages(&mut allocator, HbaCapabilities::empty(), 1).unwrap_err(),
            AhciError::ResourceExhaustion
        );
        assert_eq!(allocator.outstanding(), 0);
        assert!(allocate_pages(&mut allocator, HbaCapabilities::S64A, 1).is_ok());
    }

    #[test]
    fn test_pool_rejects_oversized_transfer() {
        let mut allocator = TestAllocator::new();
        let pages = allocate_pages(&mut allocator, HbaCapabilities::S64A, 2).unwrap();
        let mut pool = DmaPagePool::new(pages);
        assert_eq!(pool.capacity_bytes(), 2 * PAGE_SIZE);
        assert!(pool.acquire(2 * PAGE_SIZE + 1).is_err());
        assert!(pool.acquire(0).is_err());
        assert!(!pool.is_in_use());
    }
}
