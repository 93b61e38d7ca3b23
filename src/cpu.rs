//! Privileged CPU interface: system register access, the `AT` address-translation family and the
//! stage-1 translation helper built on top of them.

use log::debug;

use crate::utils::*;

/// Saved general-purpose register frame of the interrupted guest (`x0`-`x30` plus one spare
/// slot so register number 31 can be decoded before it is special-cased as `xzr`/`sp`).
pub type Regs = [u64; 32];

// -----------------------------------------------------------------------------------------------
// System registers
// -----------------------------------------------------------------------------------------------

/// System registers read or written by the hypervisor core.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum SysReg {
    /// Virtualization Translation Control Register.
    VtcrEl2,
    /// Virtualization Translation Table Base Register.
    VttbrEl2,
    /// Physical Address Register, receives `AT` results.
    ParEl1,
    /// Guest's System Control Register (EL1, accessed via the EL2 alias).
    SctlrEl12,
    /// Saved Program Status Register.
    SpsrEl2,
    /// Exception Link Register.
    ElrEl2,
    /// Exception Syndrome Register.
    EsrEl2,
    /// Fault Address Register.
    FarEl2,
}

/// `AT` address-translation instructions the core can issue. The result is deposited in
/// `PAR_EL1`, as on hardware.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum AtOp {
    /// Stage 1, EL0, read.
    S1E0R,
    /// Stage 1, EL0, write.
    S1E0W,
    /// Stage 1, EL1, read.
    S1E1R,
    /// Stage 1, EL1, write.
    S1E1W,
    /// Stage 1+2, EL0, read.
    S12E0R,
    /// Stage 1+2, EL0, write.
    S12E0W,
    /// Stage 1+2, EL1, read.
    S12E1R,
    /// Stage 1+2, EL1, write.
    S12E1W,
}

/// Privileged CPU operations consumed by the hypervisor core.
///
/// On real hardware this is a thin veneer over `mrs`/`msr` and the `at` instruction; in tests it
/// is a mock with a scripted translation regime.
pub trait Cpu {
    /// Reads a system register.
    fn mrs(&mut self, reg: SysReg) -> u64;

    /// Writes a system register.
    fn msr(&mut self, reg: SysReg, val: u64);

    /// Issues an address-translation instruction. The outcome is read back from `PAR_EL1`.
    fn at(&mut self, op: AtOp, addr: u64);
}

// -----------------------------------------------------------------------------------------------
// Register fields
// -----------------------------------------------------------------------------------------------

/// `SCTLR_EL1.M`: stage-1 MMU enable.
pub const SCTLR_M: u64 = bit(0);

/// `SPSR_EL2.M`: saved execution state mode field.
pub const SPSR_M: u64 = genmask(4, 0);

/// `PAR_EL1.F`: translation aborted.
pub const PAR_F: u64 = bit(0);

/// `PAR_EL1.PA`: output physical address.
pub const PAR_PA: u64 = genmask(51, 12);

/// `ESR_EL2` ISS bit: data abort caused by a write.
pub const ESR_ISS_DABORT_WNR: u64 = bit(6);

/// `VTCR_EL2.PS`: physical address size.
pub const VTCR_PS: u64 = genmask(18, 16);
/// `VTCR_EL2.TG0`: stage-2 granule size.
pub const VTCR_TG0: u64 = genmask(15, 14);
/// `VTCR_EL2.SH0`: table-walk shareability.
pub const VTCR_SH0: u64 = genmask(13, 12);
/// `VTCR_EL2.ORGN0`: table-walk outer cacheability.
pub const VTCR_ORGN0: u64 = genmask(11, 10);
/// `VTCR_EL2.IRGN0`: table-walk inner cacheability.
pub const VTCR_IRGN0: u64 = genmask(9, 8);
/// `VTCR_EL2.SL0`: translation starting level.
pub const VTCR_SL0: u64 = genmask(7, 6);
/// `VTCR_EL2.T0SZ`: translation region size.
pub const VTCR_T0SZ: u64 = genmask(5, 0);

// -----------------------------------------------------------------------------------------------
// Stage-1 translation
// -----------------------------------------------------------------------------------------------

/// Translates a guest virtual address using the guest's own stage-1 tables.
///
/// The exception level and access type select the appropriate `AT` variant, matching what the
/// faulting instruction would have done itself. `s1` restricts the walk to stage 1 only;
/// otherwise stages 1+2 are combined. `PAR_EL1` is saved and restored around the operation
/// because the guest owns its contents.
///
/// Returns the translated physical address, or 0 on a translation fault. When the guest's MMU is
/// off, addresses are returned unchanged.
pub fn translate(cpu: &mut impl Cpu, addr: u64, s1: bool, w: bool) -> u64 {
    if cpu.mrs(SysReg::SctlrEl12) & SCTLR_M == 0 {
        return addr; // MMU off
    }

    let el = field_get(SPSR_M, cpu.mrs(SysReg::SpsrEl2)) >> 2;
    let save = cpu.mrs(SysReg::ParEl1);

    let op = match (s1, el == 0, w) {
        (true, true, true) => AtOp::S1E0W,
        (true, true, false) => AtOp::S1E0R,
        (true, false, true) => AtOp::S1E1W,
        (true, false, false) => AtOp::S1E1R,
        (false, true, true) => AtOp::S12E0W,
        (false, true, false) => AtOp::S12E0R,
        (false, false, true) => AtOp::S12E1W,
        (false, false, false) => AtOp::S12E1R,
    };
    cpu.at(op, addr);

    let par = cpu.mrs(SysReg::ParEl1);
    cpu.msr(SysReg::ParEl1, save);

    if par & PAR_F != 0 {
        debug!("translate({:#x}, {}, {}): fault {:#x}", addr, s1, w, par);
        0
    } else {
        (par & PAR_PA) | (addr & 0xfff)
    }
}
