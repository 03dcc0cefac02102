//! Port timing configuration
//!
//! Every busy-wait in the port is bounded by a [`RetryPolicy`] taken from
//! [`PortConfig`], so timeout behavior can be tuned per platform and
//! shortened in tests.

use core::hint::spin_loop;

use super::consts::PRDT_ENTRIES_PER_TABLE;

/// Bounded retry: poll up to `attempts` times, sleeping `delay_us` between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_us: u32,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay_us: u32) -> Self {
        Self { attempts, delay_us }
    }

    /// Upper bound of the whole wait in microseconds.
    pub fn budget_us(&self) -> u64 {
        self.attempts as u64 * self.delay_us as u64
    }

    /// Poll `condition` until it holds or the attempts run out.
    ///
    /// The condition is checked once more after the last delay, so a zero
    /// attempt policy still performs a single check.
    pub fn wait_until<D, F>(&self, delay: &mut D, mut condition: F) -> bool
    where
        D: Delay + ?Sized,
        F: FnMut() -> bool,
    {
        for _ in 0..self.attempts {
            if condition() {
                return true;
            }
            delay.delay_us(self.delay_us);
        }
        condition()
    }
}

/// Microsecond delay source used between polls.
pub trait Delay: Send {
    fn delay_us(&mut self, us: u32);
}

/// Calibrated busy-wait delay.
#[derive(Debug, Clone, Copy)]
pub struct SpinDelay {
    spins_per_us: u32,
}

impl SpinDelay {
    pub const fn new(spins_per_us: u32) -> Self {
        Self { spins_per_us }
    }
}

impl Default for SpinDelay {
    fn default() -> Self {
        // Roughly right for a few-GHz core; the kernel should calibrate against its timer.
        Self::new(100)
    }
}

impl Delay for SpinDelay {
    fn delay_us(&mut self, us: u32) {
        for _ in 0..(us as u64 * self.spins_per_us as u64) {
            spin_loop();
        }
    }
}

/// Timing and sizing knobs for one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConfig {
    /// Poll for PHY ready after COMRESET
    pub link_up: RetryPolicy,
    /// How long DET=1 is held during COMRESET
    pub comreset_hold_us: u32,
    /// Wait for CR/FR to clear after clearing ST/FRE
    pub engine_stop: RetryPolicy,
    /// Wait for BSY/DRQ to clear before issuing a command
    pub device_ready: RetryPolicy,
    /// Wait for the issue bit to clear; `None` waits forever
    pub command_completion: Option<RetryPolicy>,
    /// Pages in the fixed DMA pool, which bounds the transfer size
    pub dma_pool_pages: usize,
}

impl PortConfig {
    pub const DEFAULT_DMA_POOL_PAGES: usize = 16;

    /// Largest transfer in bytes a request may ask for.
    pub fn max_transfer_bytes(&self) -> usize {
        self.effective_pool_pages() * super::consts::PAGE_SIZE
    }

    /// Pool size clamped to what one command table can describe.
    pub(crate) fn effective_pool_pages(&self) -> usize {
        self.dma_pool_pages.min(PRDT_ENTRIES_PER_TABLE)
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            link_up: RetryPolicy::new(1000, 10),
            comreset_hold_us: 1000,
            engine_stop: RetryPolicy::new(1000, 1000),
            device_ready: RetryPolicy::new(100, 1000),
            command_completion: Some(RetryPolicy::new(5000, 1000)),
            dma_pool_pages: Self::DEFAULT_DMA_POOL_PAGES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingDelay(u64);

    impl Delay for CountingDelay {
        fn delay_us(&mut self, us: u32) {
            self.0 += us as u64;
        }
    }

    #[test]
    fn test_retry_policy_gives_up_after_budget() {
        let policy = RetryPolicy::new(5, 10);
        let mut delay = CountingDelay(0);
        let mut polls = 0;
        assert!(!policy.wait_until(&mut delay, || {
            polls += 1;
            false
        }));
        assert_eq!(polls, 6);
        assert_eq!(delay.0, policy.budget_us());
    }

    #[test]
    fn test_retry_policy_stops_early() {
        let policy = RetryPolicy::new(100, 1000);
        let mut delay = CountingDelay(0);
        let mut polls = 0;
        assert!(policy.wait_until(&mut delay, || {
            polls += 1;
            polls == 3
        }));
        assert_eq!(delay.0, 2000);
    }

    #[test]
    fn test_default_config_budgets() {
        let config = PortConfig::default();
        assert_eq!(config.engine_stop.budget_us(), 1_000_000);
        assert_eq!(config.device_ready.budget_us(), 100_000);
        assert_eq!(config.max_transfer_bytes(), 16 * 4096);
    }
}
