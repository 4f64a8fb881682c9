#![no_std]

//! Covisor: coprocessor virtualization for a bare-metal hypervisor
//!
//! Facade over the workspace crates. `covisor-hal` carries the
//! platform-facing pieces, `covisor-core` the registry, per-domain
//! instance management and scheduling.

pub use covisor_core::{
    coproc, errno, guest, monitor, plat, rangeset, sched_rrobin, schedule, CoprocError,
    DomainId, DOMID_DOM0,
};
pub use covisor_hal as hal;

use covisor_core::coproc::{coproc_init, set_dom0_coprocs, CoprocDriverDesc};
use covisor_hal::platform::DeviceTree;

/// Bring the coprocessor framework up: record the boot-time dom0 list and
/// probe the platform description against the driver match table.
pub fn init(
    tree: DeviceTree,
    drivers: &[CoprocDriverDesc],
    dom0_coprocs: &str,
) -> Result<(), CoprocError> {
    set_dom0_coprocs(dom0_coprocs)?;
    coproc_init(tree, drivers);
    Ok(())
}
