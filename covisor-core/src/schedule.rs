//! Per-coprocessor scheduling
//!
//! One scheduler instance per physical coprocessor. The algorithm behind it
//! is pluggable: the core hosts the per-instance state machine, the timer
//! deadline and the context-switch orchestration, and defers every policy
//! decision to the vtable chosen at registration time.
//!
//! State machine per virtual instance:
//!
//! ```text
//!           register            wake
//! UNKNOWN ─────────► SLEEPING ──────► WAITING
//!                      ▲                 │
//!                 sleep│                 │ do_schedule
//!                      │                 ▼
//!                   RUNNING ◄───────── RUNNING
//!                      │
//!                   destroy
//!                      ▼
//!                 TERMINATING
//! ```
//!
//! For a single coprocessor, context switches are totally ordered: the
//! schedule lock serializes `do_schedule`, `ctx_switch_from` and
//! `ctx_switch_to` into one atomic unit as observed by other callers.
//! Across coprocessors there is no ordering.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::any::Any;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;
use static_assertions::const_assert;

use crate::coproc::VcoprocInstance;
use crate::monitor;
use crate::CoprocError;

/// Delay before a failed switch-out is attempted again.
pub const SCHED_RETRY_DELAY_NS: u64 = 1_000_000;

/// Default slice handed out by the bundled round-robin policy.
pub const RROBIN_SLICE_NS: u64 = 10_000_000;

// A retry must fire before the slice it interrupted would have ended.
const_assert!(SCHED_RETRY_DELAY_NS < RROBIN_SLICE_NS);

/// Lifecycle state of a virtual coprocessor instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcoprocState {
    Unknown,
    Sleeping,
    Waiting,
    Running,
    Terminating,
}

/// Scheduling decision: which instance should own the hardware next, and
/// for how long. `task == None` idles the engine; `time_ns == 0` leaves the
/// dispatch timer disarmed.
pub struct TaskSlice {
    pub task: Option<Arc<VcoprocInstance>>,
    pub time_ns: u64,
}

/// The algorithm plugged into a scheduler instance.
///
/// The core never looks inside the per-instance data produced by
/// `alloc_vdata`; it is stored on the vcoproc and handed back to the policy
/// verbatim. Hooks may be invoked from interrupt context concurrently with
/// attach/detach on other processors, so implementations carry their own
/// internal locking.
///
/// `do_schedule` commits the policy to its decision; the core reports the
/// actual outcome through [`SchedPolicy::schedule_completed`] (forwarded
/// from the driver once an asynchronous switch finishes). A policy must
/// tolerate a decision that did not take effect because the switch-out
/// failed; the core re-runs `do_schedule` after a short delay in that case.
pub trait SchedPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn init(&self) -> Result<(), CoprocError> {
        Ok(())
    }

    fn deinit(&self) {}

    /// Produce the policy-private data for a new instance.
    fn alloc_vdata(
        &self,
        v: &Arc<VcoprocInstance>,
    ) -> Result<Box<dyn Any + Send + Sync>, CoprocError>;

    /// Release data produced by `alloc_vdata`.
    fn free_vdata(&self, vdata: Box<dyn Any + Send + Sync>);

    /// Remove the instance from the runnable set.
    fn sleep(&self, v: &Arc<VcoprocInstance>);

    /// Insert the instance into the runnable set.
    fn wake(&self, v: &Arc<VcoprocInstance>);

    /// The running instance volunteers to give the hardware up.
    fn yield_(&self, v: &Arc<VcoprocInstance>);

    /// Pick the next owner of the hardware.
    fn do_schedule(&self, now_ns: u64) -> TaskSlice;

    /// A previously requested context switch finished with `status`.
    fn schedule_completed(&self, v: &Arc<VcoprocInstance>, status: i32) {
        let _ = (v, status);
    }
}

/// Kept as an extension point for policies that account for an instance
/// being left on the hardware; deliberately a no-op today.
pub fn vcoproc_continue_running(same: &Arc<VcoprocInstance>) {
    let _ = same;
}

/// Switch the physical engine from `prev` to `next`.
///
/// A switch-out failure is recoverable and aborts the switch. A switch-in
/// failure after the old context was already saved leaves the hardware in
/// no usable state at all; hypervisor integrity is lost and we panic.
pub fn vcoproc_context_switch(
    prev: Option<&Arc<VcoprocInstance>>,
    next: Option<&Arc<VcoprocInstance>>,
) -> Result<(), CoprocError> {
    if same_task(prev, next) {
        return Ok(());
    }

    // One of the two is Some here.
    let coproc = next.or(prev).unwrap().coproc();

    coproc.driver().ctx_switch_from(prev.map(|v| &**v))?;

    if let Err(e) = coproc.driver().ctx_switch_to(next.map(|v| &**v)) {
        panic!("failed to switch context to coproc \"{}\" ({:?})", coproc.path(), e);
    }

    Ok(())
}

fn same_task(a: Option<&Arc<VcoprocInstance>>, b: Option<&Arc<VcoprocInstance>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => Arc::ptr_eq(x, y),
        _ => false,
    }
}

/// Runtime record of one scheduler instance: the dispatch deadline and the
/// instance currently owning the hardware.
struct SchedRun {
    curr: Option<Arc<VcoprocInstance>>,
    timer_deadline_ns: u64,
}

/// Scheduler for one physical coprocessor.
pub struct SchedulerInstance {
    name: &'static str,
    policy: Box<dyn SchedPolicy>,
    run: Mutex<SchedRun>,
    need_resched: AtomicBool,
    /// A switch-out is in flight in the driver; dispatch and destroy stay
    /// away until the completion callback arrives.
    switching: AtomicBool,
}

impl SchedulerInstance {
    pub fn new(policy: Box<dyn SchedPolicy>) -> Result<Self, CoprocError> {
        policy.init()?;
        Ok(SchedulerInstance {
            name: policy.name(),
            policy,
            run: Mutex::new(SchedRun { curr: None, timer_deadline_ns: 0 }),
            need_resched: AtomicBool::new(false),
            switching: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register a freshly created instance with the scheduler: allocate the
    /// policy-private data and let the instance start sleeping.
    pub fn vcoproc_init(&self, v: &Arc<VcoprocInstance>) -> Result<(), CoprocError> {
        let vdata = self.policy.alloc_vdata(v)?;

        let mut state = v.state_mutex().lock();
        debug_assert_eq!(*state, VcoprocState::Unknown);
        *v.sched_priv().lock() = Some(vdata);
        *state = VcoprocState::Sleeping;
        Ok(())
    }

    /// Tear down the scheduler side of an instance. Refused with `Busy`
    /// while the instance owns the hardware or a switch involving it is
    /// still in flight; the caller must retry after the engine has been
    /// scheduled away.
    pub fn vcoproc_destroy(&self, v: &Arc<VcoprocInstance>) -> Result<(), CoprocError> {
        {
            let run = self.run.lock();
            let is_curr = run.curr.as_ref().is_some_and(|c| Arc::ptr_eq(c, v));
            if is_curr || self.switching.load(Ordering::Acquire) {
                return Err(CoprocError::Busy);
            }

            // Pull it out of the runnable set while the dispatch path is
            // excluded, so no new decision can pick it.
            self.policy.sleep(v);
            *v.state_mutex().lock() = VcoprocState::Terminating;
        }

        if let Some(vdata) = v.sched_priv().lock().take() {
            self.policy.free_vdata(vdata);
        }
        Ok(())
    }

    /// Driver hook: the instance has work and wants the hardware.
    pub fn wake(&self, v: &Arc<VcoprocInstance>) {
        {
            let mut state = v.state_mutex().lock();
            if *state != VcoprocState::Sleeping {
                return;
            }
            *state = VcoprocState::Waiting;
        }
        self.policy.wake(v);
        self.raise_schedule_request();
    }

    /// Driver hook: the instance has gone idle.
    pub fn sleep(&self, v: &Arc<VcoprocInstance>) {
        {
            let mut state = v.state_mutex().lock();
            match *state {
                VcoprocState::Waiting => *state = VcoprocState::Sleeping,
                VcoprocState::Running => {
                    // Stays on the hardware until the next dispatch; the
                    // pending mark finishes the transition at switch-out.
                    v.set_pending_sleep();
                }
                _ => return,
            }
        }
        self.policy.sleep(v);
        self.raise_schedule_request();
    }

    /// Driver hook: the running instance offers the hardware up.
    pub fn yield_(&self, v: &Arc<VcoprocInstance>) {
        {
            let mut state = v.state_mutex().lock();
            if *state != VcoprocState::Running {
                return;
            }
            *state = VcoprocState::Waiting;
        }
        self.policy.yield_(v);
        self.raise_schedule_request();
    }

    /// Ask for a dispatch on the next tick.
    pub fn raise_schedule_request(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    /// Driver callback: a previously requested context switch finished.
    pub fn context_switch_completed(&self, v: &Arc<VcoprocInstance>, status: i32) {
        self.policy.schedule_completed(v, status);
        self.switching.store(false, Ordering::Release);
        self.raise_schedule_request();
    }

    /// Snapshot of the instance currently owning the hardware.
    pub fn curr(&self) -> Option<Arc<VcoprocInstance>> {
        self.run.lock().curr.clone()
    }

    /// Currently armed dispatch deadline, `0` when disarmed.
    pub fn timer_deadline_ns(&self) -> u64 {
        self.run.lock().timer_deadline_ns
    }

    /// Platform timer entry point. Dispatches when the armed deadline has
    /// passed or a dispatch request is outstanding.
    pub fn on_timer_tick(&self, now_ns: u64) {
        monitor::dispatch_tick();

        let due = {
            let run = self.run.lock();
            run.timer_deadline_ns != 0 && now_ns >= run.timer_deadline_ns
        };
        if due || self.need_resched.load(Ordering::Acquire) {
            let _ = self.schedule(now_ns);
        }
    }

    /// Run one dispatch: ask the policy for a decision and orchestrate the
    /// context switch it implies.
    pub fn schedule(&self, now_ns: u64) -> Result<(), CoprocError> {
        if self.switching.load(Ordering::Acquire) {
            // The driver still owes us a completion for the previous
            // switch; keep the hardware as it is.
            return Err(CoprocError::Busy);
        }

        let mut run = self.run.lock();
        self.need_resched.store(false, Ordering::Release);

        let slice = self.policy.do_schedule(now_ns);
        let prev = run.curr.clone();

        if same_task(prev.as_ref(), slice.task.as_ref()) {
            if let Some(v) = &slice.task {
                // A yielded owner the policy reselects goes back to
                // running; `curr` always identifies the one RUNNING
                // instance.
                {
                    let mut state = v.state_mutex().lock();
                    if *state == VcoprocState::Waiting {
                        *state = VcoprocState::Running;
                    }
                }
                vcoproc_continue_running(v);
            }
            run.timer_deadline_ns = deadline(now_ns, slice.time_ns);
            return Ok(());
        }

        match vcoproc_context_switch(prev.as_ref(), slice.task.as_ref()) {
            Ok(()) => {}
            Err(e) => {
                // Switch-out did not complete; keep the current owner and
                // retry shortly. A Busy/Retry driver finishes the save in
                // the background and reports through
                // `context_switch_completed`.
                monitor::context_switch_failed();
                if matches!(e, CoprocError::Busy | CoprocError::Retry) {
                    self.switching.store(true, Ordering::Release);
                }
                run.timer_deadline_ns = now_ns + SCHED_RETRY_DELAY_NS;
                return Err(e);
            }
        }

        if let Some(p) = &prev {
            let mut state = p.state_mutex().lock();
            if *state == VcoprocState::Running {
                *state = if p.take_pending_sleep() {
                    VcoprocState::Sleeping
                } else {
                    VcoprocState::Waiting
                };
            }
        }
        if let Some(n) = &slice.task {
            *n.state_mutex().lock() = VcoprocState::Running;
        }

        run.curr = slice.task;
        run.timer_deadline_ns = deadline(now_ns, slice.time_ns);
        monitor::context_switched();
        Ok(())
    }
}

fn deadline(now_ns: u64, slice_ns: u64) -> u64 {
    if slice_ns != 0 {
        now_ns + slice_ns
    } else {
        0
    }
}
