//! The hypervisor core singleton: composes the stage-2 tables, the UART proxy and the consumed
//! CPU / memory / I/O capabilities, and implements the data-abort emulation path.

use log::{debug, error};

use crate::config::Config;
use crate::cpu::*;
use crate::decode::*;
use crate::error::*;
use crate::exceptions::*;
use crate::memory::*;
use crate::proxy::*;
use crate::utils::*;

/// The hypervisor core.
///
/// There is one instance per machine, owned by the boot code and passed by reference into the
/// exception vectors. It owns all mutable state (translation tables, proxy framing buffers, the
/// exception guard) together with the capability implementations it drives: the privileged CPU
/// interface, guest physical memory and the I/O device pool.
///
/// Guest execution and core code strictly alternate on the single CPU, so no locking is
/// involved: the guest is suspended for the whole duration of a data-abort emulation or proxy
/// loop iteration.
pub struct HvCore<C: Cpu, M: GuestMem, IO: IoDevPool> {
    /// Core configuration.
    pub config: Config,
    /// Stage-2 translation tables.
    pub pt: PageTables,
    /// UART proxy framing state.
    pub proxy: UartProxy,
    /// Exception guard consulted by the low-level vectors during guest-memory transfers.
    pub guard: ExcGuard,
    /// Privileged CPU operations.
    pub cpu: C,
    /// Guest physical memory.
    pub mem: M,
    /// I/O device pool.
    pub io: IO,
}

impl<C: Cpu, M: GuestMem, IO: IoDevPool> HvCore<C, M, IO> {
    /// Creates the core around the given capability implementations.
    pub fn new(config: Config, cpu: C, mem: M, io: IO) -> Result<Self> {
        Ok(Self {
            pt: PageTables::new()?,
            proxy: UartProxy::new(&config)?,
            guard: ExcGuard::new(),
            config,
            cpu,
            mem,
            io,
        })
    }

    /// Resets the stage-2 translation state and programs the translation registers.
    pub fn init(&mut self) {
        self.pt.init(&mut self.cpu);
    }

    /// Enters the proxy request loop. See [`UartProxy::run`].
    pub fn proxy_run(&mut self, rpc: &mut impl ProxyRpc, start: Option<&ExcStart>) -> Result<i32> {
        self.proxy
            .run(&mut self.io, &mut self.mem, &mut self.guard, rpc, start)
    }

    /// Pushes an asynchronous event on the bound device. See [`UartProxy::send_event`].
    pub fn send_event(&mut self, event_type: EventType, data: &[u8]) -> Result<()> {
        self.proxy.send_event(&mut self.io, event_type, data)
    }

    /// Handles a stage-2 data abort taken from the guest.
    ///
    /// Translates the faulting address through the guest's stage-1 tables, walks the stage-2
    /// tables for the software descriptor covering the IPA, decodes the faulting load/store and
    /// performs the access it describes: a redirected read/write, an in-hypervisor hook, or a
    /// host-serviced proxy hook dispatched through `px`. MMIO trace events are emitted before
    /// the guest can observe the access's side effects. On success the guest PC is advanced past
    /// the faulting instruction; on any error it is left untouched so the caller can escalate.
    pub fn handle_dabort(&mut self, regs: &mut Regs, px: &mut impl ExcProxy) -> Result<()> {
        let esr = self.cpu.mrs(SysReg::EsrEl2);
        let is_write = esr & ESR_ISS_DABORT_WNR != 0;

        let far = self.cpu.mrs(SysReg::FarEl2);
        let ipa = translate(&mut self.cpu, far, true, is_write);
        debug!("handle_dabort(): stage 1 {:#x} -> {:#x}", far, ipa);

        if ipa == 0 {
            error!("stage 1 translation failed at VA {:#x}", far);
            return Err(ExceptionError::Stage1TranslationFault(far))?;
        }
        if ipa >= bit(VADDR_BITS) {
            error!("handle_dabort(): IPA out of bounds: {:#x} -> {:#x}", far, ipa);
            return Err(ExceptionError::IpaOutOfBounds(ipa))?;
        }

        let pte = self.pt.walk(ipa);
        if pte.raw() == 0 {
            error!("unmapped IPA {:#x}", ipa);
            return Err(ExceptionError::UnmappedIpa(ipa))?;
        }
        if pte.is_hw() {
            // Hardware-visible mappings never trap; getting here means the tables and the TLBs
            // disagree about this IPA.
            error!("data abort on mapped page ({:#x} -> {:#x})", far, pte.raw());
            return Err(ExceptionError::AbortOnHwMapping(far))?;
        }
        debug_assert!(pte.is_sw());

        let target = pte.target_l4();
        let paddr = target | (far & mask(VADDR_L4_OFFSET_BITS));

        let elr = self.cpu.mrs(SysReg::ElrEl2);
        let elr_pa = translate(&mut self.cpu, elr, false, false);
        if elr_pa == 0 {
            error!("failed to fetch instruction for data abort at {:#x}", elr);
            return Err(ExceptionError::InstructionFetchFault(elr))?;
        }
        let insn = self.mem.read32(elr_pa)?;

        if is_write {
            let (mut val, width) = emulate_store(regs, insn)?;

            if pte.get_trace_write() {
                let evt = MmioTraceEvent::new(elr, ipa, val, width, true);
                self.proxy
                    .send_event(&mut self.io, EventType::MmioTrace, &evt.to_bytes())?;
                if pte.get_sync_trace() {
                    self.io.flush(self.proxy.current_iodev());
                }
            }

            match pte.spte_type() {
                SpteType::Map | SpteType::ProxyHookR => {
                    // Read-side proxy hooks pass writes through to the IPA itself.
                    let paddr = if pte.spte_type() == SpteType::ProxyHookR {
                        ipa
                    } else {
                        paddr
                    };
                    debug!(
                        "SPTE_MAP[W] @{:#x} {:#x} -> {:#x} (w={}): {:#x}",
                        elr_pa,
                        far,
                        paddr,
                        width.bytes(),
                        val
                    );
                    write_width(&mut self.mem, paddr, val, width)?;
                }
                SpteType::Hook => {
                    let hook = self
                        .pt
                        .hook(target)
                        .ok_or(ExceptionError::UnknownHook(target))?;
                    hook(ipa, &mut val, true, width)?;
                }
                SpteType::ProxyHookRw | SpteType::ProxyHookW => {
                    let id = field_get(PTE_TARGET_MASK_L4, pte.raw()) as u32;
                    let mut hook = VmProxyHookData::new(id, ipa, val, width, true);
                    px.hv_exc_proxy(regs, StartReason::HvHook, HV_HOOK_VM, &mut hook)?;
                }
                _ => {
                    error!("invalid SPTE {:#018x} for IPA {:#x}", pte.raw(), ipa);
                    return Err(ExceptionError::InvalidSpte(pte.raw(), ipa))?;
                }
            }
        } else {
            let width = emulate_load(regs, insn, None)?;
            let mut val = 0;

            match pte.spte_type() {
                SpteType::Map | SpteType::ProxyHookW => {
                    // Write-side proxy hooks pass reads through to the IPA itself.
                    let paddr = if pte.spte_type() == SpteType::ProxyHookW {
                        ipa
                    } else {
                        paddr
                    };
                    val = read_width(&mut self.mem, paddr, width)?;
                    debug!(
                        "SPTE_MAP[R] @{:#x} {:#x} -> {:#x} (w={}): {:#x}",
                        elr_pa,
                        far,
                        paddr,
                        width.bytes(),
                        val
                    );
                }
                SpteType::Hook => {
                    let hook = self
                        .pt
                        .hook(target)
                        .ok_or(ExceptionError::UnknownHook(target))?;
                    hook(ipa, &mut val, false, width)?;
                }
                SpteType::ProxyHookRw | SpteType::ProxyHookR => {
                    let id = field_get(PTE_TARGET_MASK_L4, pte.raw()) as u32;
                    let mut hook = VmProxyHookData::new(id, ipa, 0, width, false);
                    px.hv_exc_proxy(regs, StartReason::HvHook, HV_HOOK_VM, &mut hook)?;
                    val = hook.data;
                }
                _ => {
                    error!("invalid SPTE {:#018x} for IPA {:#x}", pte.raw(), ipa);
                    return Err(ExceptionError::InvalidSpte(pte.raw(), ipa))?;
                }
            }

            if pte.get_trace_read() {
                let evt = MmioTraceEvent::new(elr, ipa, val, width, false);
                self.proxy
                    .send_event(&mut self.io, EventType::MmioTrace, &evt.to_bytes())?;
                if pte.get_sync_trace() {
                    self.io.flush(self.proxy.current_iodev());
                }
            }

            emulate_load(regs, insn, Some(val))?;
        }

        self.cpu.msr(SysReg::ElrEl2, elr + 4);
        Ok(())
    }
}
