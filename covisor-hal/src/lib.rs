#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

//! Hardware abstraction layer for the covisor coprocessor core
//!
//! This crate carries the platform-facing pieces the core is built on: the
//! platform-description tree handed over by the boot firmware, the timer
//! abstraction, and the micro-TLB synchronization helper used by the
//! IOMMU-adjacent drivers.

extern crate alloc;

pub mod iommu;
pub mod platform;
pub mod timer;

pub use platform::{DeviceTree, DtNode, MmioWindow, COPROC_PROPERTY};
pub use timer::{ManualTimer, Timer};

/// Domain identifier as carried on the control interface.
pub type DomainId = u16;

/// The hardware domain.
pub const DOMID_DOM0: DomainId = 0;

/// Error taxonomy shared by the coprocessor core and its drivers.
///
/// Everything here is a recoverable return value; a failed `ctx_switch_to`
/// is the one fatal condition and is reported by panicking instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoprocError {
    /// No registered coprocessor at this path, or no node for an alias.
    NotFound,
    /// Attach requested but the instance already exists.
    AlreadyExists,
    /// Bad driver contract, empty path, dying domain.
    InvalidArgument,
    /// Allocation failed.
    OutOfMemory,
    /// The scheduler refuses an operation because the instance owns the
    /// hardware right now.
    Busy,
    /// Retry-later: the instance must be scheduled out first.
    Retry,
    /// A bounded hardware wait expired.
    TimedOut,
}
