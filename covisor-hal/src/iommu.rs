//! Micro-TLB synchronization helper
//!
//! The IOMMU driver owns DMA translation entirely; the only piece the
//! coprocessor core shares with it is the bounded wait for a hardware flush
//! to drain. A TLB invalidation is posted by setting a flush bit; the bit
//! stays up until the walk caches are clean. The hardware gives no interrupt
//! for completion, so the driver polls with a 1 us tick and gives up after
//! 100 us, at which point the MMU may be deadlocked.

use static_assertions::const_assert;

use crate::timer::Timer;
use crate::CoprocError;

/// Polls before the sync is abandoned.
pub const TLB_LOOP_TIMEOUT: u32 = 100;

/// Delay between polls, in nanoseconds.
pub const TLB_POLL_DELAY_NS: u64 = 1_000;

// The whole loop stays within the documented 100 us bound.
const_assert!(TLB_LOOP_TIMEOUT as u64 * TLB_POLL_DELAY_NS == 100_000);

/// Flush-status view of one micro-TLB context.
pub trait MicroTlb {
    /// True while a posted invalidation is still draining.
    fn flush_pending(&self) -> bool;
}

/// Wait for any pending TLB invalidations to complete.
///
/// Returns `TimedOut` once the poll budget is exhausted; the caller logs and
/// carries on, as the original operation cannot be undone at this point.
pub fn tlb_sync(timer: &dyn Timer, tlb: &dyn MicroTlb) -> Result<(), CoprocError> {
    let mut count: u32 = 0;

    while tlb.flush_pending() {
        core::hint::spin_loop();
        count += 1;
        if count == TLB_LOOP_TIMEOUT {
            return Err(CoprocError::TimedOut);
        }
        timer.busy_wait_ns(TLB_POLL_DELAY_NS);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualTimer;
    use core::sync::atomic::{AtomicU32, Ordering};

    struct DrainAfter(AtomicU32);

    impl MicroTlb for DrainAfter {
        fn flush_pending(&self) -> bool {
            self.0.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[test]
    fn sync_completes_when_flush_drains() {
        let timer = ManualTimer::new();
        let tlb = DrainAfter(AtomicU32::new(10));
        assert_eq!(tlb_sync(&timer, &tlb), Ok(()));
    }

    #[test]
    fn sync_times_out_on_stuck_flush() {
        struct Stuck;
        impl MicroTlb for Stuck {
            fn flush_pending(&self) -> bool {
                true
            }
        }
        let timer = ManualTimer::new();
        assert_eq!(tlb_sync(&timer, &Stuck), Err(CoprocError::TimedOut));
        // 99 polls of 1 us each before the budget ran out.
        assert_eq!(timer.current_time_ns(), 99 * TLB_POLL_DELAY_NS);
    }
}
