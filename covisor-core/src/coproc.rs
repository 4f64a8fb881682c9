//! Coprocessor framework
//!
//! Physical coprocessors are discovered from the platform description at
//! init and registered into a process-wide table, keyed by their canonical
//! device path: the path is the only stable identifier the control plane
//! carries, so treating it as primary key lets the attach path reject typos
//! without reserving a numeric ID space. Each guest domain holds a view of
//! the virtual instances attached to it; instances are created through the
//! driver contract and handed to the device's scheduler for
//! time-multiplexing.
//!
//! Lock hierarchy, outer to inner: domain view lock, device-registry lock,
//! per-coproc schedule lock, per-vcoproc lock. The teardown path drops the
//! view lock before detaching to keep the hierarchy intact.

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::{Mutex, Once};

use covisor_hal::platform::{DeviceTree, DtNode, MmioWindow, COPROC_PROPERTY};

use crate::guest::{self, GuestMemory, PAGE_SIZE};
use crate::schedule::{SchedPolicy, SchedulerInstance, VcoprocState};
use crate::{errno, monitor, CoprocError, DomainId, DOMID_DOM0};

/// Capability set a vendor coprocessor driver provides. These are the sole
/// extension points; no dynamic loading is involved.
pub trait CoprocDriver: Send + Sync {
    /// Construct the vendor-specific state for a new virtual instance.
    fn vcoproc_init(
        &self,
        domain: DomainId,
        coproc: &'static CoprocDevice,
    ) -> Result<Arc<VcoprocInstance>, CoprocError>;

    /// Tear an instance down. Must be safe on partially constructed
    /// instances.
    fn vcoproc_free(&self, domain: DomainId, vcoproc: &Arc<VcoprocInstance>);

    /// Does this (domain, coproc) pairing already have state?
    fn vcoproc_is_created(&self, domain: DomainId, coproc: &'static CoprocDevice) -> bool;

    /// Save hardware context for the outgoing instance; `None` means no
    /// previous owner. May fail recoverably.
    fn ctx_switch_from(&self, prev: Option<&VcoprocInstance>) -> Result<(), CoprocError>;

    /// Load hardware context for the incoming instance; `None` idles the
    /// hardware. Failure here is fatal to the hypervisor.
    fn ctx_switch_to(&self, next: Option<&VcoprocInstance>) -> Result<(), CoprocError>;
}

/// One physical coprocessor. Created while the platform description is
/// walked at init; never destroyed.
pub struct CoprocDevice {
    path: String,
    mmios: Vec<MmioWindow>,
    irqs: Vec<u32>,
    driver: Box<dyn CoprocDriver>,
    sched: Once<SchedulerInstance>,
    /// Every vcoproc instance created from this device.
    vcoprocs: Mutex<Vec<Arc<VcoprocInstance>>>,
}

impl CoprocDevice {
    pub fn new(
        path: &str,
        mmios: Vec<MmioWindow>,
        irqs: Vec<u32>,
        driver: Box<dyn CoprocDriver>,
    ) -> Self {
        CoprocDevice {
            path: String::from(path),
            mmios,
            irqs,
            driver,
            sched: Once::new(),
            vcoprocs: Mutex::new(Vec::new()),
        }
    }

    /// Canonical device path; unique within the registry.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mmios(&self) -> &[MmioWindow] {
        &self.mmios
    }

    pub fn irqs(&self) -> &[u32] {
        &self.irqs
    }

    pub fn driver(&self) -> &dyn CoprocDriver {
        &*self.driver
    }

    /// The scheduler time-multiplexing this device. Installed at
    /// registration.
    pub fn sched(&self) -> &SchedulerInstance {
        self.sched.get().expect("coproc not registered")
    }

    pub fn vcoproc_count(&self) -> usize {
        self.vcoprocs.lock().len()
    }
}

/// A virtual coprocessor instance: one per (domain, coproc) attachment.
///
/// Shared between the device's instance list and the owning domain's view;
/// the device back-reference is non-owning (devices outlive every
/// instance), which is what breaks the reference cycle.
pub struct VcoprocInstance {
    coproc: &'static CoprocDevice,
    domain: DomainId,
    state: Mutex<VcoprocState>,
    pending_sleep: AtomicBool,
    /// Policy-owned data; the core never inspects it.
    sched_priv: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    /// Vendor-driver-owned data; the core never inspects it.
    driver_priv: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl VcoprocInstance {
    pub fn new(coproc: &'static CoprocDevice, domain: DomainId) -> Arc<Self> {
        Arc::new(VcoprocInstance {
            coproc,
            domain,
            state: Mutex::new(VcoprocState::Unknown),
            pending_sleep: AtomicBool::new(false),
            sched_priv: Mutex::new(None),
            driver_priv: Mutex::new(None),
        })
    }

    pub fn coproc(&self) -> &'static CoprocDevice {
        self.coproc
    }

    pub fn domain(&self) -> DomainId {
        self.domain
    }

    pub fn state(&self) -> VcoprocState {
        *self.state.lock()
    }

    pub(crate) fn state_mutex(&self) -> &Mutex<VcoprocState> {
        &self.state
    }

    /// Slot for the scheduler policy's per-instance data.
    pub fn sched_priv(&self) -> &Mutex<Option<Box<dyn Any + Send + Sync>>> {
        &self.sched_priv
    }

    /// Slot for the vendor driver's per-instance data.
    pub fn driver_priv(&self) -> &Mutex<Option<Box<dyn Any + Send + Sync>>> {
        &self.driver_priv
    }

    pub(crate) fn set_pending_sleep(&self) {
        self.pending_sleep.store(true, Ordering::Release);
    }

    pub(crate) fn take_pending_sleep(&self) -> bool {
        self.pending_sleep.swap(false, Ordering::AcqRel)
    }
}

// ------------------------------------------------------------------
// Device registry
// ------------------------------------------------------------------

static COPROC_DEVICES: Mutex<Vec<&'static CoprocDevice>> = Mutex::new(Vec::new());
static NUM_COPROC_DEVICES: AtomicUsize = AtomicUsize::new(0);
static HOST_TREE: Once<DeviceTree> = Once::new();

/// Register a physical coprocessor. Intended for init-time use only: the
/// registry is append-only and registered devices are never destroyed.
pub fn coproc_register(
    dev: CoprocDevice,
    policy: Box<dyn SchedPolicy>,
) -> Result<&'static CoprocDevice, CoprocError> {
    if dev.path.is_empty() {
        return Err(CoprocError::InvalidArgument);
    }

    let mut devices = COPROC_DEVICES.lock();
    if devices.iter().any(|c| c.path() == dev.path) {
        return Err(CoprocError::AlreadyExists);
    }

    // Only a path that is certain to register gets a scheduler: init and
    // deinit of the policy stay paired.
    let sched = SchedulerInstance::new(policy)?;

    let dev: &'static CoprocDevice = Box::leak(Box::new(dev));
    dev.sched.call_once(|| sched);
    devices.push(dev);
    NUM_COPROC_DEVICES.fetch_add(1, Ordering::Relaxed);
    monitor::coproc_registered();

    crate::log!("registered new coproc \"{}\"", dev.path());
    Ok(dev)
}

/// Look a registered device up by canonical path. O(N) over the registered
/// count, which is bounded by hardware. The handle is copied out under the
/// registry lock; that is sound because the registry never shrinks.
pub fn find_coproc_by_path(path: &str) -> Option<&'static CoprocDevice> {
    if path.is_empty() {
        return None;
    }
    COPROC_DEVICES.lock().iter().copied().find(|c| c.path() == path)
}

pub fn num_coproc_devices() -> usize {
    NUM_COPROC_DEVICES.load(Ordering::Relaxed)
}

/// A vendor driver's entry in the probe match table.
pub struct CoprocDriverDesc {
    pub name: &'static str,
    pub compatible: &'static str,
    pub probe: fn(&'static DtNode) -> Result<(), CoprocError>,
}

/// Walk the platform description and probe every node carrying the coproc
/// property against the driver match table.
pub fn coproc_init(tree: DeviceTree, drivers: &[CoprocDriverDesc]) {
    let tree = HOST_TREE.call_once(|| tree);

    let mut num_coprocs = 0usize;
    for node in tree.nodes() {
        if !node.has_property(COPROC_PROPERTY) {
            continue;
        }
        let Some(drv) = drivers.iter().find(|d| node.is_compatible(d.compatible)) else {
            continue;
        };
        match (drv.probe)(node) {
            Ok(()) => num_coprocs += 1,
            Err(e) => {
                crate::log!("{}: probe of \"{}\" failed ({:?})", drv.name, node.full_name(), e)
            }
        }
    }

    if num_coprocs == 0 {
        crate::log!("unable to find compatible coprocs in the device tree");
    }
}

/// The decoded platform description, once `coproc_init` has run.
pub fn host_tree() -> Option<&'static DeviceTree> {
    HOST_TREE.get()
}

// ------------------------------------------------------------------
// Per-domain view
// ------------------------------------------------------------------

const DOM0_COPROCS_LEN: usize = 128;

/// Boot-time list of coprocs for the hardware domain: comma-separated
/// paths or aliases.
static DOM0_COPROCS: Mutex<heapless::String<DOM0_COPROCS_LEN>> =
    Mutex::new(heapless::String::new());

/// Install the `dom0_coprocs` boot value. Rejected if longer than the
/// 128-byte buffer the boot parser hands over.
pub fn set_dom0_coprocs(list: &str) -> Result<(), CoprocError> {
    let mut cfg = DOM0_COPROCS.lock();
    cfg.clear();
    cfg.push_str(list).map_err(|_| CoprocError::InvalidArgument)
}

/// A domain's side of the coproc picture: the ordered set of virtual
/// instances attached to it. Created with the domain, drained at domain
/// destruction.
pub struct DomainCoprocView {
    domid: DomainId,
    dying: AtomicBool,
    instances: Mutex<Vec<Arc<VcoprocInstance>>>,
}

impl DomainCoprocView {
    pub fn new(domid: DomainId) -> Self {
        DomainCoprocView {
            domid,
            dying: AtomicBool::new(false),
            instances: Mutex::new(Vec::new()),
        }
    }

    pub fn domid(&self) -> DomainId {
        self.domid
    }

    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    pub fn set_dying(&self) {
        self.dying.store(true, Ordering::Release);
    }

    pub fn num_instances(&self) -> usize {
        self.instances.lock().len()
    }

    /// Snapshot of the attached instances, in attach order.
    pub fn instances(&self) -> Vec<Arc<VcoprocInstance>> {
        self.instances.lock().clone()
    }
}

/// Domain-creation hook. Succeeds without doing anything when no coprocs
/// are registered; for dom0 additionally attaches everything named in the
/// boot-time list, and any failure there is fatal to domain init.
pub fn vcoproc_domain_init(view: &DomainCoprocView) -> Result<(), CoprocError> {
    if num_coproc_devices() == 0 {
        // The domain will never have any instances.
        return Ok(());
    }

    if view.domid() == DOMID_DOM0 {
        dom0_vcoproc_init(view)?;
    }
    Ok(())
}

fn dom0_vcoproc_init(view: &DomainCoprocView) -> Result<(), CoprocError> {
    let cfg = DOM0_COPROCS.lock().clone();
    if cfg.is_empty() {
        return Ok(());
    }

    crate::log!("got list of coprocs \"{}\" for dom{}", cfg.as_str(), view.domid());

    for item in cfg.as_str().split(',') {
        let is_alias = !item.starts_with('/');

        let node = host_tree().and_then(|t| {
            if is_alias {
                t.find_node_by_alias(item)
            } else {
                t.find_node_by_path(item)
            }
        });
        let Some(node) = node else {
            crate::log!(
                "unable to find node by {} \"{}\"",
                if is_alias { "alias" } else { "path" },
                item
            );
            return Err(CoprocError::InvalidArgument);
        };

        let path = node.full_name();
        if let Err(e) = coproc_find_and_attach(view, path) {
            crate::log!("failed to attach coproc \"{}\" to dom{} ({:?})", path, view.domid(), e);
            return Err(e);
        }
    }

    Ok(())
}

/// Domain-destruction hook: detach every remaining instance.
///
/// The view lock is dropped around each detach so the hierarchy against
/// the scheduler locks holds. `Retry` is surfaced to the caller once the
/// scheduler has been asked to idle the running instance; a later retry
/// makes progress.
pub fn vcoproc_domain_free(view: &DomainCoprocView) -> Result<(), CoprocError> {
    view.set_dying();

    loop {
        let v = { view.instances.lock().first().cloned() };
        let Some(v) = v else { break };

        match coproc_detach_from_domain(view, &v) {
            Ok(()) => continue,
            Err(CoprocError::Retry) => {
                // Take it off the hardware; the next dispatch idles the
                // engine and the retry will succeed.
                v.coproc().sched().sleep(&v);
                return Err(CoprocError::Retry);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Attach the coprocessor at `path` to a domain.
pub fn coproc_find_and_attach(view: &DomainCoprocView, path: &str) -> Result<(), CoprocError> {
    if view.is_dying() {
        return Err(CoprocError::InvalidArgument);
    }

    let coproc = find_coproc_by_path(path).ok_or(CoprocError::NotFound)?;
    coproc_attach_to_domain(view, coproc)
}

fn coproc_attach_to_domain(
    view: &DomainCoprocView,
    coproc: &'static CoprocDevice,
) -> Result<(), CoprocError> {
    if coproc.driver().vcoproc_is_created(view.domid(), coproc) {
        return Err(CoprocError::AlreadyExists);
    }

    let v = coproc.driver().vcoproc_init(view.domid(), coproc)?;

    if let Err(e) = coproc.sched().vcoproc_init(&v) {
        coproc.driver().vcoproc_free(view.domid(), &v);
        return Err(e);
    }

    coproc.vcoprocs.lock().push(v.clone());
    view.instances.lock().push(v);
    monitor::vcoproc_created();

    debug_assert!(view.num_instances() <= num_coproc_devices());

    crate::log!("attached vcoproc \"{}\" to dom{}", coproc.path(), view.domid());
    Ok(())
}

/// Detach one instance from its domain. `Retry` means the instance owns
/// the hardware right now; ask again after a yield.
pub fn coproc_detach_from_domain(
    view: &DomainCoprocView,
    v: &Arc<VcoprocInstance>,
) -> Result<(), CoprocError> {
    let coproc = v.coproc();

    match coproc.sched().vcoproc_destroy(v) {
        Ok(()) => {}
        Err(CoprocError::Busy) => return Err(CoprocError::Retry),
        Err(e) => return Err(e),
    }

    coproc.vcoprocs.lock().retain(|x| !Arc::ptr_eq(x, v));
    view.instances.lock().retain(|x| !Arc::ptr_eq(x, v));
    coproc.driver().vcoproc_free(view.domid(), v);
    monitor::vcoproc_destroyed();

    crate::log!("detached vcoproc \"{}\" from dom{}", coproc.path(), view.domid());
    Ok(())
}

/// True iff some instance on the view refers to the device at `path`.
pub fn coproc_is_attached_to_domain(view: &DomainCoprocView, path: &str) -> bool {
    let Some(coproc) = find_coproc_by_path(path) else {
        return false;
    };
    view.instances
        .lock()
        .iter()
        .any(|v| core::ptr::eq(v.coproc() as *const _, coproc as *const _))
}

// ------------------------------------------------------------------
// Control interface
// ------------------------------------------------------------------

/// The one recognized domctl subcommand.
pub const DOMCTL_ATTACH_COPROC: u32 = 1;

/// Handle a coproc domctl. The path is copied out of guest memory with a
/// one-page cap before anything looks at it. Returns 0 or a negative errno.
pub fn coproc_do_domctl(
    cmd: u32,
    view: &DomainCoprocView,
    mem: &dyn GuestMemory,
    path_addr: u64,
    size: u32,
) -> i32 {
    match cmd {
        DOMCTL_ATTACH_COPROC => {
            if view.is_dying() {
                return -errno::EINVAL;
            }

            let path = match guest::copy_string_from_guest(mem, path_addr, size as usize, PAGE_SIZE)
            {
                Ok(p) => p,
                Err(e) => return errno::from_error(e),
            };

            crate::log!("got coproc \"{}\" for dom{}", path, view.domid());

            match coproc_find_and_attach(view, &path) {
                Ok(()) => 0,
                Err(e) => {
                    crate::log!(
                        "failed to attach coproc \"{}\" to dom{} ({:?})",
                        path,
                        view.domid(),
                        e
                    );
                    errno::from_error(e)
                }
            }
        }
        _ => -errno::ENOSYS,
    }
}
