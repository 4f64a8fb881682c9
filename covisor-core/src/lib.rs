#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

//! Coprocessor virtualization core
//!
//! Lets multiple guest domains share a fixed set of physical coprocessors
//! (DSPs, GPUs, accelerators) attached to the SoC. Each physical device is
//! time-multiplexed among per-domain virtual instances: the registry owns
//! the physical devices, the per-domain view threads the virtual instances
//! onto each guest, and a pluggable scheduler arbitrates the shared engine
//! through asynchronous context switches.

extern crate alloc;

pub mod coproc;
pub mod errno;
pub mod guest;
pub mod log;
pub mod monitor;
pub mod plat;
pub mod rangeset;
pub mod sched_rrobin;
pub mod schedule;

pub use covisor_hal as hal;
pub use covisor_hal::{CoprocError, DomainId, DOMID_DOM0};
