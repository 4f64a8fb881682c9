//! Lock-free statistics
//!
//! Counters updated at the end of each scheduling action and on the
//! attach/detach paths. Readers tolerate relaxed ordering; the numbers are
//! for diagnostics, not for control decisions.

use core::sync::atomic::{AtomicU64, Ordering};

static COPROCS_REGISTERED: AtomicU64 = AtomicU64::new(0);
static VCOPROCS_LIVE: AtomicU64 = AtomicU64::new(0);
static CONTEXT_SWITCHES: AtomicU64 = AtomicU64::new(0);
static FAILED_SWITCHES: AtomicU64 = AtomicU64::new(0);
static DISPATCH_TICKS: AtomicU64 = AtomicU64::new(0);
static TLB_SYNC_TIMEOUTS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy)]
pub struct CoprocStats {
    pub coprocs_registered: u64,
    pub vcoprocs_live: u64,
    pub context_switches: u64,
    pub failed_switches: u64,
    pub dispatch_ticks: u64,
    pub tlb_sync_timeouts: u64,
}

#[inline]
pub fn coproc_registered() {
    COPROCS_REGISTERED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn vcoproc_created() {
    VCOPROCS_LIVE.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn vcoproc_destroyed() {
    VCOPROCS_LIVE.fetch_sub(1, Ordering::Relaxed);
}

#[inline]
pub fn context_switched() {
    CONTEXT_SWITCHES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn context_switch_failed() {
    FAILED_SWITCHES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn dispatch_tick() {
    DISPATCH_TICKS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn tlb_sync_timed_out() {
    TLB_SYNC_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}

pub fn snapshot() -> CoprocStats {
    CoprocStats {
        coprocs_registered: COPROCS_REGISTERED.load(Ordering::Relaxed),
        vcoprocs_live: VCOPROCS_LIVE.load(Ordering::Relaxed),
        context_switches: CONTEXT_SWITCHES.load(Ordering::Relaxed),
        failed_switches: FAILED_SWITCHES.load(Ordering::Relaxed),
        dispatch_ticks: DISPATCH_TICKS.load(Ordering::Relaxed),
        tlb_sync_timeouts: TLB_SYNC_TIMEOUTS.load(Ordering::Relaxed),
    }
}
