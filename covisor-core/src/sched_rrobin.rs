//! Round-robin scheduling policy
//!
//! The policy bundled with the core: runnable instances wait on a FIFO
//! queue, the head gets the hardware for a fixed slice, and the preempted
//! owner goes to the tail if it still wants to run.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::any::Any;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::coproc::VcoprocInstance;
use crate::schedule::{SchedPolicy, TaskSlice, RROBIN_SLICE_NS};
use crate::CoprocError;

/// Per-instance policy data.
struct RrUnit {
    /// On the run queue right now.
    queued: AtomicBool,
    /// Wants the hardware (wake seen, no sleep since).
    runnable: AtomicBool,
}

pub struct RrobinPolicy {
    runq: Mutex<VecDeque<Arc<VcoprocInstance>>>,
    /// The policy's view of who last got the hardware. May lag reality by
    /// one failed switch; the `queued` guard keeps requeueing idempotent.
    curr: Mutex<Option<Arc<VcoprocInstance>>>,
    slice_ns: u64,
}

impl RrobinPolicy {
    pub fn new() -> Self {
        Self::with_slice(RROBIN_SLICE_NS)
    }

    pub fn with_slice(slice_ns: u64) -> Self {
        RrobinPolicy {
            runq: Mutex::new(VecDeque::new()),
            curr: Mutex::new(None),
            slice_ns,
        }
    }

    fn unit<R>(v: &VcoprocInstance, f: impl FnOnce(&RrUnit) -> R) -> Option<R> {
        let priv_ = v.sched_priv().lock();
        priv_.as_deref().and_then(|d| d.downcast_ref::<RrUnit>()).map(f)
    }

    fn enqueue(&self, v: &Arc<VcoprocInstance>) {
        let first_time = Self::unit(v, |u| !u.queued.swap(true, Ordering::AcqRel));
        if first_time == Some(true) {
            self.runq.lock().push_back(v.clone());
        }
    }
}

impl Default for RrobinPolicy {
    fn default() -> Self {
        RrobinPolicy::new()
    }
}

impl SchedPolicy for RrobinPolicy {
    fn name(&self) -> &'static str {
        "rrobin"
    }

    fn alloc_vdata(
        &self,
        _v: &Arc<VcoprocInstance>,
    ) -> Result<Box<dyn Any + Send + Sync>, CoprocError> {
        Ok(Box::new(RrUnit {
            queued: AtomicBool::new(false),
            runnable: AtomicBool::new(false),
        }))
    }

    fn free_vdata(&self, vdata: Box<dyn Any + Send + Sync>) {
        drop(vdata);
    }

    fn sleep(&self, v: &Arc<VcoprocInstance>) {
        let _ = Self::unit(v, |u| {
            u.runnable.store(false, Ordering::Release);
            u.queued.store(false, Ordering::Release);
        });
        self.runq.lock().retain(|x| !Arc::ptr_eq(x, v));
    }

    fn wake(&self, v: &Arc<VcoprocInstance>) {
        let _ = Self::unit(v, |u| u.runnable.store(true, Ordering::Release));
        self.enqueue(v);
    }

    fn yield_(&self, v: &Arc<VcoprocInstance>) {
        // The owner goes to the tail; whoever is in front of it now gets
        // the next slice.
        self.enqueue(v);
    }

    fn do_schedule(&self, _now_ns: u64) -> TaskSlice {
        let mut runq = self.runq.lock();
        let mut curr = self.curr.lock();

        let next = match runq.pop_front() {
            Some(head) => {
                let _ = Self::unit(&head, |u| u.queued.store(false, Ordering::Release));

                // Requeue the displaced owner if it still wants to run and
                // is not already waiting in line (a yield may have queued
                // it before this decision).
                if let Some(old) = curr.take() {
                    if !Arc::ptr_eq(&old, &head)
                        && Self::unit(&old, |u| {
                            u.runnable.load(Ordering::Acquire)
                                && !u.queued.swap(true, Ordering::AcqRel)
                        }) == Some(true)
                    {
                        runq.push_back(old);
                    }
                }
                Some(head)
            }
            None => {
                // Nobody is waiting: keep the owner while it is runnable,
                // idle the hardware once it is not.
                match curr.take() {
                    Some(old)
                        if Self::unit(&old, |u| u.runnable.load(Ordering::Acquire))
                            == Some(true) =>
                    {
                        Some(old)
                    }
                    _ => None,
                }
            }
        };

        *curr = next.clone();

        let time_ns = if next.is_some() { self.slice_ns } else { 0 };
        TaskSlice { task: next, time_ns }
    }
}
