//! Scatter list for the in-flight transfer
//!
//! A `ScatterList` borrows the port's DMA pool for exactly one request.
//! It exposes the physical segments for PRDT construction and the staging
//! bytes for copying to and from the caller's buffer. Dropping it hands
//! the pool back, so every exit path of a request releases it.

use x86_64::PhysAddr;

use super::consts::PAGE_SIZE;
use super::dma::DmaPagePool;

/// DMA pages and staging area of one transfer
#[derive(Debug)]
pub struct ScatterList<'a> {
    pool: &'a mut DmaPagePool,
    len: usize,
}

impl<'a> ScatterList<'a> {
    pub(crate) fn new(pool: &'a mut DmaPagePool, len: usize) -> Self {
        debug_assert!(len > 0 && len <= pool.capacity_bytes());
        Self { pool, len }
    }

    /// Transfer length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pages backing the transfer, `ceil(len / PAGE_SIZE)`
    pub fn page_count(&self) -> usize {
        (self.len + PAGE_SIZE - 1) / PAGE_SIZE
    }

    /// Physical address and length of each segment, in transfer order
    pub fn segments(&self) -> impl Iterator<Item = (PhysAddr, u32)> + '_ {
        let len = self.len;
        self.pool.pages()[..self.page_count()]
            .iter()
            .enumerate()
            .map(move |(i, page)| {
                let chunk = (len - i * PAGE_SIZE).min(PAGE_SIZE);
                (page.phys_addr(), chunk as u32)
            })
    }

    /// Fill the staging area chunk by chunk.
    ///
    /// `fill` gets the transfer offset and the staging bytes at that offset.
    /// Stops at the first error.
    pub fn fill<E, F>(&mut self, mut fill: F) -> Result<(), E>
    where
        F: FnMut(usize, &mut [u8]) -> Result<(), E>,
    {
        let len = self.len;
        let count = self.page_count();
        for (i, page) in self.pool.pages_mut()[..count].iter_mut().enumerate() {
            let offset = i * PAGE_SIZE;
            let chunk = (len - offset).min(PAGE_SIZE);
            fill(offset, &mut page.bytes_mut()[..chunk])?;
        }
        Ok(())
    }

    /// Hand out the staging area chunk by chunk.
    pub fn drain<E, F>(&self, mut drain: F) -> Result<(), E>
    where
        F: FnMut(usize, &[u8]) -> Result<(), E>,
    {
        for (i, page) in self.pool.pages()[..self.page_count()].iter().enumerate() {
            let offset = i * PAGE_SIZE;
            let chunk = (self.len - offset).min(PAGE_SIZE);
            drain(offset, &page.bytes()[..chunk])?;
        }
        Ok(())
    }
}

impl Drop for ScatterList<'_> {
    fn drop(&mut self) {
        self.pool.release();
    }
}
