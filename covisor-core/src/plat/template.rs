//! Template platform driver
//!
//! Skeleton a vendor starts from: it enumerates the MMIO windows and IRQs
//! of its node, keeps its own list of probed devices so the IRQ handler can
//! find them, and implements the driver contract with a register-file
//! save/restore stub in place of real silicon programming.

#![allow(dead_code)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use covisor_hal::iommu::{tlb_sync, MicroTlb};
use covisor_hal::platform::DtNode;
use covisor_hal::timer::ManualTimer;

use crate::coproc::{
    coproc_register, CoprocDevice, CoprocDriver, CoprocDriverDesc, VcoprocInstance,
};
use crate::sched_rrobin::RrobinPolicy;
use crate::{monitor, CoprocError, DomainId};

pub const TEMPLATE_COMPATIBLE: &str = "vendor_xxx,coproc_xxx";

/// Match-table entry for [`crate::coproc::coproc_init`].
pub const TEMPLATE_DRIVER: CoprocDriverDesc = CoprocDriverDesc {
    name: "coproc_template",
    compatible: TEMPLATE_COMPATIBLE,
    probe: template_probe,
};

/// Devices this driver has probed, for the IRQ handler's reverse lookup.
static TEMPLATE_DEVICES: Mutex<Vec<&'static CoprocDevice>> = Mutex::new(Vec::new());

/// Saved engine state of one virtual instance.
#[derive(Default)]
struct TemplateCtx {
    regs: [u64; 8],
    saved: bool,
}

/// Micro-TLB view of the template engine. The skeleton engine retires its
/// walks synchronously, so a flush is never left pending; a real driver
/// reads the flush bit of its invalidation register here.
struct EngineTlb;

impl MicroTlb for EngineTlb {
    fn flush_pending(&self) -> bool {
        false
    }
}

/// One driver object per probed device.
pub struct TemplateCoprocDriver {
    created: Mutex<BTreeSet<DomainId>>,
    hw_owner: Mutex<Option<DomainId>>,
    /// Stand-in clock until the platform timer is calibrated.
    timer: ManualTimer,
}

impl TemplateCoprocDriver {
    pub fn new() -> Self {
        TemplateCoprocDriver {
            created: Mutex::new(BTreeSet::new()),
            hw_owner: Mutex::new(None),
            timer: ManualTimer::new(),
        }
    }
}

impl Default for TemplateCoprocDriver {
    fn default() -> Self {
        TemplateCoprocDriver::new()
    }
}

impl CoprocDriver for TemplateCoprocDriver {
    fn vcoproc_init(
        &self,
        domain: DomainId,
        coproc: &'static CoprocDevice,
    ) -> Result<Arc<VcoprocInstance>, CoprocError> {
        let mut created = self.created.lock();
        if created.contains(&domain) {
            return Err(CoprocError::AlreadyExists);
        }

        let v = VcoprocInstance::new(coproc, domain);
        *v.driver_priv().lock() = Some(Box::new(TemplateCtx::default()));
        created.insert(domain);
        Ok(v)
    }

    fn vcoproc_free(&self, domain: DomainId, vcoproc: &Arc<VcoprocInstance>) {
        // Also reached for partially constructed instances; every step is
        // unconditional.
        self.created.lock().remove(&domain);
        vcoproc.driver_priv().lock().take();
    }

    fn vcoproc_is_created(&self, domain: DomainId, _coproc: &'static CoprocDevice) -> bool {
        self.created.lock().contains(&domain)
    }

    fn ctx_switch_from(&self, prev: Option<&VcoprocInstance>) -> Result<(), CoprocError> {
        if let Some(prev) = prev {
            // Drain outstanding translation walks before touching the
            // register file.
            if tlb_sync(&self.timer, &EngineTlb).is_err() {
                monitor::tlb_sync_timed_out();
                crate::log!(
                    "{}: TLB sync timed out, MMU may be deadlocked",
                    prev.coproc().path()
                );
            }

            let mut priv_ = prev.driver_priv().lock();
            if let Some(ctx) = priv_.as_deref_mut().and_then(|d| d.downcast_mut::<TemplateCtx>())
            {
                // Real silicon would drain the engine and read the register
                // file back here.
                ctx.regs = [0; 8];
                ctx.saved = true;
            }
            self.hw_owner.lock().take();
        }
        Ok(())
    }

    fn ctx_switch_to(&self, next: Option<&VcoprocInstance>) -> Result<(), CoprocError> {
        match next {
            Some(next) => {
                let mut priv_ = next.driver_priv().lock();
                if let Some(ctx) =
                    priv_.as_deref_mut().and_then(|d| d.downcast_mut::<TemplateCtx>())
                {
                    ctx.saved = false;
                }
                *self.hw_owner.lock() = Some(next.domain());
            }
            None => {
                self.hw_owner.lock().take();
            }
        }
        Ok(())
    }
}

/// Probe one matching node and register the device.
fn template_probe(node: &'static DtNode) -> Result<(), CoprocError> {
    if node.mmios().is_empty() {
        crate::log!("{}: failed to find at least one mmio", node.full_name());
        return Err(CoprocError::NotFound);
    }
    if node.irqs().is_empty() {
        crate::log!("{}: failed to find at least one irq", node.full_name());
        return Err(CoprocError::NotFound);
    }

    let dev = CoprocDevice::new(
        node.full_name(),
        node.mmios().to_vec(),
        node.irqs().to_vec(),
        Box::new(TemplateCoprocDriver::new()),
    );

    let dev = coproc_register(dev, Box::new(RrobinPolicy::new()))?;
    TEMPLATE_DEVICES.lock().push(dev);
    Ok(())
}

/// Interrupt entry for all template devices: find the owner of `irq` and
/// ask its scheduler for a dispatch.
pub fn template_irq_handler(irq: u32) {
    let devices = TEMPLATE_DEVICES.lock();
    if let Some(dev) = devices.iter().find(|d| d.irqs().contains(&irq)) {
        dev.sched().raise_schedule_request();
    }
}
