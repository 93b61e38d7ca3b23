//! Exception plumbing shared by the fault core and the proxy: the exception guard that stands in
//! for structured exception handling during guest-memory transfers, the start records embedded
//! in re-entry notifications, and the dispatcher interface used to forward proxied MMIO hooks to
//! the host.

use crate::cpu::Regs;
use crate::decode::AccessSize;
use crate::error::*;
use crate::utils::*;

// -----------------------------------------------------------------------------------------------
// Exception guard
// -----------------------------------------------------------------------------------------------

/// Behavior of the low-level exception vector when a bus or page fault hits a guarded region.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum GuardMode {
    /// Faults are fatal.
    Off,
    /// Unwind out of the guarded region.
    Return,
    /// Step over the faulting instruction.
    Skip,
}

impl Default for GuardMode {
    fn default() -> Self {
        GuardMode::Off
    }
}

/// Process-wide exception-guard state.
///
/// The guard mode is read by the exception vector to decide whether a fault inside a protected
/// memory transfer unwinds, is skipped, or is fatal; the fault counter is checked by the code
/// that owns the guarded region. Guarded regions are entered through [`ExcGuard::scope`], which
/// returns a token restoring [`GuardMode::Off`] on every exit path.
#[derive(Debug, Default)]
pub struct ExcGuard {
    mode: GuardMode,
    count: u64,
}

impl ExcGuard {
    /// Creates a disarmed guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the guard for a protected region, resetting the fault counter. The returned scope
    /// disarms the guard when dropped.
    pub fn scope(&mut self, mode: GuardMode) -> GuardScope<'_> {
        self.mode = mode;
        self.count = 0;
        GuardScope { guard: self }
    }

    /// Returns the current guard mode.
    pub fn mode(&self) -> GuardMode {
        self.mode
    }

    /// Records a fault taken inside the guarded region.
    pub fn fault(&mut self) {
        self.count += 1;
    }

    /// Returns the number of faults recorded since the guard was armed.
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Token for an armed [`ExcGuard`]; disarms it on drop.
#[derive(Debug)]
pub struct GuardScope<'a> {
    guard: &'a mut ExcGuard,
}

impl GuardScope<'_> {
    /// Records a fault taken inside the guarded region.
    pub fn fault(&mut self) {
        self.guard.fault();
    }

    /// Returns `true` if any fault was recorded since the guard was armed.
    pub fn fired(&self) -> bool {
        self.guard.count != 0
    }
}

impl Drop for GuardScope<'_> {
    fn drop(&mut self) {
        self.guard.mode = GuardMode::Off;
    }
}

// -----------------------------------------------------------------------------------------------
// Start records
// -----------------------------------------------------------------------------------------------

/// Why the proxy loop was (re-)entered.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum StartReason {
    /// Cold boot.
    Boot,
    /// Exception taken at the current exception level.
    Exception,
    /// Exception taken from a lower exception level.
    ExceptionLower,
    /// A guest access hit a host-serviced MMIO hook.
    HvHook,
}

impl StartReason {
    /// Returns the wire encoding of the reason.
    #[inline]
    pub fn bits(self) -> u32 {
        match self {
            Self::Boot => 0,
            Self::Exception => 1,
            Self::ExceptionLower => 2,
            Self::HvHook => 3,
        }
    }
}

/// Hook subsystem identifiers carried in start records.
pub const HV_HOOK_VM: u32 = 1;

/// Record embedded in the BOOT reply when the proxy loop is re-entered from an exception or a
/// hook, telling the host why the guest stopped.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct ExcStart {
    /// Why the loop was entered.
    pub reason: StartReason,
    /// Subsystem-specific code (e.g. [`HV_HOOK_VM`]).
    pub code: u32,
    /// Opaque handle the host uses to reach the payload (for VM hooks, the hook data record).
    pub info: u64,
}

impl ExcStart {
    /// Serializes the record into the head of a reply payload.
    pub fn write_to(&self, payload: &mut [u8]) {
        payload[0..4].copy_from_slice(&self.reason.bits().to_le_bytes());
        payload[4..8].copy_from_slice(&self.code.to_le_bytes());
        payload[8..16].copy_from_slice(&self.info.to_le_bytes());
    }
}

// -----------------------------------------------------------------------------------------------
// Proxied MMIO hooks
// -----------------------------------------------------------------------------------------------

/// Width field of trace and hook flags.
pub const MMIO_EVT_WIDTH: u64 = genmask(1, 0);
/// Set when the traced or hooked access is a write.
pub const MMIO_EVT_WRITE: u64 = bit(2);

/// Access description handed to the host when a guest access hits a proxied MMIO hook.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct VmProxyHookData {
    /// Access width in the low bits, write flag at [`MMIO_EVT_WRITE`].
    pub flags: u32,
    /// The identifier the hook was installed with.
    pub id: u32,
    /// Faulting IPA.
    pub addr: u64,
    /// Value written by the guest, or the value to load once the host has serviced a read.
    pub data: u64,
}

impl VmProxyHookData {
    /// Builds the record for an access of the given width and direction.
    pub fn new(id: u32, addr: u64, data: u64, width: AccessSize, write: bool) -> Self {
        let mut flags = field_prep(MMIO_EVT_WIDTH, width.bits()) as u32;
        if write {
            flags |= MMIO_EVT_WRITE as u32;
        }
        Self {
            flags,
            id,
            addr,
            data,
        }
    }
}

/// Dispatcher that suspends the guest and services an exception or proxied hook through the
/// host, blocking until the host completes it.
///
/// The production implementation saves the register frame, enters the proxy request loop with a
/// re-entry start record and resumes the guest when the host releases it; that wiring lives with
/// the exception vectors, outside this crate.
pub trait ExcProxy {
    /// Forwards a proxied MMIO access to the host. For reads, `hook.data` holds the loaded
    /// value once the call returns.
    fn hv_exc_proxy(
        &mut self,
        regs: &mut Regs,
        reason: StartReason,
        subsys: u32,
        hook: &mut VmProxyHookData,
    ) -> Result<()>;
}
