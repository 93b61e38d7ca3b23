//! Stage-2 guest memory management: translation-table encoding, the software-only sub-page
//! level, map/unmap/split algorithms and the guest physical memory interface.
//!
//! # Translation layout
//!
//! Stage-2 translation uses 16 KiB pages and a 64 GiB (36-bit) guest physical address space,
//! which results in the following address split:
//!
//! ```text
//! [L2 index]  [L3 index] [page offset]
//!  11 bits     11 bits    14 bits
//! ```
//!
//! 32 MiB L2 block mappings look like this:
//!
//! ```text
//! [L2 index]  [block offset]
//!  11 bits     25 bits
//! ```
//!
//! Sub-page granularity for software MMIO hooks behaves as one more table level used only by
//! software:
//!
//! ```text
//! [L2 index]  [L3 index] [L4 index]  [word offset]
//!  11 bits     11 bits    12 bits     2 bits
//! ```
//!
//! L4 sub-page tables are therefore twice the size of a page.
//!
//! Invalid descriptors (`VALID == 0`) carry the software entry kinds; otherwise the table format
//! is the regular ARMv8 stage-2 one, so the hardware walker can consume the L2 and L3 levels
//! directly. The `TYPE` bit means table at L2, but both table and page at L3; software entries
//! push the distinction down to L4.

use bitfield::bitfield;
use log::{debug, warn};

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;

use crate::cpu::*;
use crate::decode::AccessSize;
use crate::error::*;
use crate::utils::*;

// -----------------------------------------------------------------------------------------------
// Constants
// -----------------------------------------------------------------------------------------------

/// Stage-2 page size.
pub const PAGE_SIZE: usize = 0x4000;

/// Guest physical address width in bits.
pub const VADDR_BITS: u64 = 36;

/// Index bits resolved by an L2 lookup.
pub const VADDR_L2_INDEX_BITS: u64 = 11;
/// Index bits resolved by an L3 lookup.
pub const VADDR_L3_INDEX_BITS: u64 = 11;
/// Index bits resolved by an L4 lookup.
pub const VADDR_L4_INDEX_BITS: u64 = 12;

/// Address bits covered by one L2 entry (32 MiB).
pub const VADDR_L2_OFFSET_BITS: u64 = 25;
/// Address bits covered by one L3 entry (16 KiB).
pub const VADDR_L3_OFFSET_BITS: u64 = 14;
/// Address bits covered by one L4 entry (one 32-bit word).
pub const VADDR_L4_OFFSET_BITS: u64 = 2;

/// Number of descriptors in the root L2 table.
pub const ENTRIES_PER_L2_TABLE: usize = 1 << VADDR_L2_INDEX_BITS;
/// Number of descriptors in an L3 table.
pub const ENTRIES_PER_L3_TABLE: usize = 1 << VADDR_L3_INDEX_BITS;
/// Number of descriptors in an L4 table.
pub const ENTRIES_PER_L4_TABLE: usize = 1 << VADDR_L4_INDEX_BITS;

/// Offset bits of an address within a 32 MiB block, above the 16 KiB page offset.
pub const VADDR_L2_ALIGN_MASK: u64 = genmask(VADDR_L2_OFFSET_BITS - 1, VADDR_L3_OFFSET_BITS);
/// Offset bits of an address within a 16 KiB page, above the word offset.
pub const VADDR_L3_ALIGN_MASK: u64 = genmask(VADDR_L3_OFFSET_BITS - 1, VADDR_L4_OFFSET_BITS);

/// Descriptor valid bit.
pub const PTE_VALID: u64 = bit(0);
/// Descriptor type bit (block vs. table/page).
pub const PTE_TYPE: u64 = bit(1);
/// `TYPE` value for block descriptors.
pub const PTE_BLOCK: u64 = 0;
/// `TYPE` value for table descriptors.
pub const PTE_TABLE: u64 = 1;
/// `TYPE` value for page descriptors.
pub const PTE_PAGE: u64 = 1;

/// ARMv8 stage-2 lower attributes field.
pub const PTE_LOWER_ATTRIBUTES: u64 = genmask(13, 2);

/// Output address of a page-granule descriptor.
pub const PTE_TARGET_MASK: u64 = genmask(49, VADDR_L3_OFFSET_BITS);
/// Output address of a word-granule (L4) descriptor.
pub const PTE_TARGET_MASK_L4: u64 = genmask(49, VADDR_L4_OFFSET_BITS);

/// Software entry kind field, meaningful only when `VALID == 0`.
pub const SPTE_TYPE: u64 = genmask(52, 50);
/// Flush the I/O device after queuing a trace event.
pub const SPTE_SYNC_TRACE: u64 = bit(61);
/// Emit an MMIO trace event on writes.
pub const SPTE_TRACE_WRITE: u64 = bit(62);
/// Emit an MMIO trace event on reads.
pub const SPTE_TRACE_READ: u64 = bit(63);

const PTE_ACCESS: u64 = bit(10);
const PTE_SH_NS: u64 = 0b11 << 8;
const PTE_S2AP_RW: u64 = 0b11 << 6;
const PTE_MEMATTR_UNCHANGED: u64 = 0b1111 << 2;

/// Lower attributes installed on hardware mappings: access flag set, Inner Shareable,
/// read/write stage-2 permissions, guest memory attributes preserved.
pub const PTE_ATTRIBUTES: u64 = PTE_ACCESS | PTE_SH_NS | PTE_S2AP_RW | PTE_MEMATTR_UNCHANGED;

// -----------------------------------------------------------------------------------------------
// Descriptors
// -----------------------------------------------------------------------------------------------

bitfield! {
    /// A stage-2 translation-table descriptor.
    ///
    /// Valid descriptors follow the ARMv8 stage-2 format and are consumed by the hardware
    /// walker. Invalid but non-zero descriptors are software entries owned by the hypervisor;
    /// the guest faults on access and the data-abort handler interprets the kind stored in
    /// `SPTE_TYPE`.
    #[derive(Copy, Clone, Eq, Hash, PartialEq)]
    pub struct Pte(u64);
    impl Debug;
    pub get_valid, set_valid: 0;
    pub get_type, set_type: 1;
    pub get_lower_attrs, set_lower_attrs: 13, 2;
    pub get_spte_raw, set_spte_raw: 52, 50;
    pub get_sync_trace, set_sync_trace: 61;
    pub get_trace_write, set_trace_write: 62;
    pub get_trace_read, set_trace_read: 63;
}

impl Pte {
    /// Returns `true` for a non-zero, hardware-visible descriptor.
    #[inline]
    pub fn is_hw(&self) -> bool {
        self.0 != 0 && self.get_valid()
    }

    /// Returns `true` for a non-zero software descriptor.
    #[inline]
    pub fn is_sw(&self) -> bool {
        self.0 != 0 && !self.get_valid()
    }

    /// Returns `true` for an L2 descriptor pointing to an L3 table.
    #[inline]
    pub fn is_table_l2(&self) -> bool {
        self.0 != 0 && self.get_type()
    }

    /// Returns `true` for an L2 hardware block descriptor.
    #[inline]
    pub fn is_hw_block_l2(&self) -> bool {
        self.is_hw() && !self.get_type()
    }

    /// Returns `true` for a software redirect block (any level).
    #[inline]
    pub fn is_sw_block(&self) -> bool {
        self.is_sw() && !self.get_type() && self.spte_type() == SpteType::Map
    }

    /// Returns `true` for an L3 descriptor pointing to a software L4 table.
    #[inline]
    pub fn is_table_l3(&self) -> bool {
        self.is_sw() && self.get_type()
    }

    /// Returns `true` for an L3 hardware page descriptor.
    #[inline]
    pub fn is_hw_page_l3(&self) -> bool {
        self.is_hw() && self.get_type()
    }

    /// Returns the software entry kind.
    #[inline]
    pub fn spte_type(&self) -> SpteType {
        SpteType::from(self.get_spte_raw())
    }

    /// Returns the page-granule output address bits.
    #[inline]
    pub fn target(&self) -> u64 {
        self.0 & PTE_TARGET_MASK
    }

    /// Returns the word-granule output address bits.
    #[inline]
    pub fn target_l4(&self) -> u64 {
        self.0 & PTE_TARGET_MASK_L4
    }

    /// Returns the raw descriptor word.
    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The software entry kinds stored in `SPTE_TYPE`.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum SpteType {
    /// Redirect the access to the physical address held in the target field.
    Map,
    /// Invoke the in-hypervisor callback registered under the target token.
    Hook,
    /// Reads go through the proxy; writes fall through to the IPA.
    ProxyHookR,
    /// Writes go through the proxy; reads fall through to the IPA.
    ProxyHookW,
    /// Both directions go through the proxy.
    ProxyHookRw,
    /// Unknown software entry kind.
    Unknown(u64),
}

impl From<u64> for SpteType {
    fn from(val: u64) -> Self {
        match val {
            0 => Self::Map,
            1 => Self::Hook,
            2 => Self::ProxyHookR,
            3 => Self::ProxyHookW,
            4 => Self::ProxyHookRw,
            u => Self::Unknown(u),
        }
    }
}

impl SpteType {
    /// Returns the field encoding of the kind.
    #[inline]
    pub fn bits(self) -> u64 {
        match self {
            Self::Map => 0,
            Self::Hook => 1,
            Self::ProxyHookR => 2,
            Self::ProxyHookW => 3,
            Self::ProxyHookRw => 4,
            Self::Unknown(u) => u,
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Table storage
// -----------------------------------------------------------------------------------------------

/// An aligned allocation holding one level's worth of raw descriptors.
///
/// This is the memory the hardware walker actually reads, so descriptors are stored as plain
/// `u64` words at a page-aligned base address that fits in a parent descriptor's target field.
#[derive(Debug)]
struct TableMem {
    ptr: NonNull<u64>,
    entries: usize,
    layout: Layout,
}

impl TableMem {
    /// Allocates a zeroed descriptor table with `entries` slots, aligned to `align`.
    fn new(entries: usize, align: usize) -> Result<Self> {
        let layout = Layout::from_size_align(entries * std::mem::size_of::<u64>(), align)?;
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr as *mut u64).ok_or(MemoryError::OutOfMemory)?;
        Ok(Self {
            ptr,
            entries,
            layout,
        })
    }

    /// Returns the table's base address, as stored in parent descriptors.
    #[inline]
    fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Reads the descriptor at `idx`.
    #[inline]
    fn get(&self, idx: usize) -> u64 {
        assert!(idx < self.entries);
        // SAFETY: the allocation holds `entries` descriptors and `idx` is in bounds.
        unsafe { std::ptr::read(self.ptr.as_ptr().add(idx)) }
    }

    /// Writes the descriptor at `idx`.
    #[inline]
    fn set(&mut self, idx: usize, desc: u64) {
        assert!(idx < self.entries);
        // SAFETY: same bounds as `get`, and the table is exclusively owned.
        unsafe { std::ptr::write(self.ptr.as_ptr().add(idx), desc) }
    }
}

impl Drop for TableMem {
    fn drop(&mut self) {
        // SAFETY: `ptr` was returned by `alloc_zeroed` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr() as *mut u8, self.layout) }
    }
}

/// An L3 table together with the software L4 tables hanging off its entries.
///
/// The map of L4 tables mirrors the raw table-pointer descriptors; an entry exists in one if and
/// only if it exists in the other.
#[derive(Debug)]
struct L3Table {
    mem: TableMem,
    l4s: HashMap<usize, TableMem>,
}

// -----------------------------------------------------------------------------------------------
// MMIO hooks
// -----------------------------------------------------------------------------------------------

/// Signature of an in-hypervisor MMIO hook.
///
/// Called with the faulting IPA, the access value (in for writes, out for reads), the direction
/// and the access width. An error fails the enclosing data abort.
pub type MmioHookFn = fn(addr: u64, val: &mut u64, write: bool, width: AccessSize) -> Result<()>;

// -----------------------------------------------------------------------------------------------
// Stage-2 page tables
// -----------------------------------------------------------------------------------------------

/// Owns the stage-2 translation tables: the root L2 array programmed into the translation base
/// register, the on-demand L3 tables, and the software-only L4 sub-page tables.
///
/// The root array lives for the lifetime of this structure and is never freed; only its entries
/// are overwritten. Each L2 table entry exclusively owns the L3 table it points to, and each L3
/// software-table entry exclusively owns its L4 table. Overwriting a table entry drops the
/// downstream tables.
///
/// Ownership is tracked in per-level maps keyed by the parent descriptor index, mirrored into
/// the raw descriptor words the hardware walker reads. Keeping the two views in sync is the
/// central invariant of this module.
#[derive(Debug)]
pub struct PageTables {
    /// The root L2 descriptor array.
    root: TableMem,
    /// Live L3 tables, keyed by L2 index.
    l3s: HashMap<usize, L3Table>,
    /// In-hypervisor MMIO callbacks, keyed by the token stored in their descriptors' target
    /// field.
    hooks: HashMap<u64, MmioHookFn>,
    /// Source of fresh hook tokens.
    next_hook_token: u64,
}

impl PageTables {
    /// Allocates the root table. The hardware registers are not touched until [`Self::init`].
    pub fn new() -> Result<Self> {
        Ok(Self {
            root: TableMem::new(ENTRIES_PER_L2_TABLE, PAGE_SIZE)?,
            l3s: HashMap::new(),
            hooks: HashMap::new(),
            next_hook_token: 0,
        })
    }

    /// Resets the translation state and programs the stage-2 translation registers for a 16 KiB
    /// granule, a 36-bit IPA space and a walk starting at level 2.
    ///
    /// Idempotent; any previously installed mapping or hook is dropped.
    pub fn init(&mut self, cpu: &mut impl Cpu) {
        for idx in 0..ENTRIES_PER_L2_TABLE {
            self.root.set(idx, 0);
        }
        self.l3s.clear();
        self.hooks.clear();
        self.next_hook_token = 0;

        cpu.msr(
            SysReg::VtcrEl2,
            field_prep(VTCR_PS, 1)          // 64GB PA size
                | field_prep(VTCR_TG0, 2)   // 16KB page size
                | field_prep(VTCR_SH0, 3)   // PTWs Inner Shareable
                | field_prep(VTCR_ORGN0, 1) // PTWs Cacheable
                | field_prep(VTCR_IRGN0, 1) // PTWs Cacheable
                | field_prep(VTCR_SL0, 1)   // Start at level 2
                | field_prep(VTCR_T0SZ, 28), // 64GB translation region
        );
        cpu.msr(SysReg::VttbrEl2, self.root.addr());
    }

    /// Installs mappings covering the IPA range `[from, from + size)`.
    ///
    /// `to` is the full descriptor encoding for the first granule; each successive granule
    /// receives `to + incr * granule`, so `incr == 1` produces a linear redirect and `incr == 0`
    /// a constant target (hooks). The range is split into up to five segments, each covered at
    /// the coarsest level its alignment permits: a sub-page head, a page-granule head, a 32 MiB
    /// body, a page-granule tail and a sub-page tail.
    ///
    /// `from` and `size` must be word-aligned; hardware targets must additionally be
    /// page-aligned since the synthetic L4 level is invisible to the hardware walker. All
    /// arguments are validated before any table is touched.
    pub fn map(&mut self, from: u64, to: u64, size: u64, incr: u64) -> Result<()> {
        let hw = Pte(to).is_hw();

        if from & mask(VADDR_L4_OFFSET_BITS) != 0 {
            return Err(MemoryError::UnalignedAddress(from))?;
        }
        if size & mask(VADDR_L4_OFFSET_BITS) != 0 {
            return Err(MemoryError::UnalignedSize(size))?;
        }
        if hw
            && (from & mask(VADDR_L3_OFFSET_BITS) != 0 || size & mask(VADDR_L3_OFFSET_BITS) != 0)
        {
            warn!(
                "cannot use sub-page granules with HW mappings ({:#x} -> {:#x})",
                from, to
            );
            return Err(MemoryError::SubPageHwMapping(from))?;
        }

        let (mut from, mut to, mut size) = (from, to, size);

        // Sub-page mappings up to the next page boundary.
        let mut chunk = size.min(align_up(from, mask(VADDR_L3_OFFSET_BITS)) - from);
        if chunk != 0 {
            self.map_l4(from, to, chunk, incr)?;
            from += chunk;
            to = to.wrapping_add(incr * chunk);
            size -= chunk;
        }

        // Page mappings up to the next 32 MiB boundary.
        chunk = align_down(
            size.min(align_up(from, mask(VADDR_L2_OFFSET_BITS)) - from),
            mask(VADDR_L3_OFFSET_BITS),
        );
        if chunk != 0 {
            self.map_l3(from, to, chunk, incr)?;
            from += chunk;
            to = to.wrapping_add(incr * chunk);
            size -= chunk;
        }

        // The 32 MiB body. Hardware block targets must themselves be 32 MiB-aligned; when they
        // are not, the body falls through to page mappings below.
        chunk = align_down(size, mask(VADDR_L2_OFFSET_BITS));
        if chunk != 0 && (!hw || to & VADDR_L2_ALIGN_MASK == 0) {
            self.map_l2(from, to, chunk, incr);
            from += chunk;
            to = to.wrapping_add(incr * chunk);
            size -= chunk;
        }

        // Page mappings down to the sub-page remainder.
        chunk = align_down(size, mask(VADDR_L3_OFFSET_BITS));
        if chunk != 0 {
            self.map_l3(from, to, chunk, incr)?;
            from += chunk;
            to = to.wrapping_add(incr * chunk);
            size -= chunk;
        }

        // Sub-page tail.
        if size != 0 {
            self.map_l4(from, to, size, incr)?;
        }

        Ok(())
    }

    /// Removes all mappings covering `[from, from + size)`, dropping any sub-table that gets
    /// overwritten along the way.
    pub fn unmap(&mut self, from: u64, size: u64) -> Result<()> {
        self.map(from, 0, size, 0)
    }

    /// Installs hardware mappings redirecting `[from, from + size)` to `to` linearly.
    pub fn map_hw(&mut self, from: u64, to: u64, size: u64) -> Result<()> {
        self.map(from, to | PTE_ATTRIBUTES | PTE_VALID, size, 1)
    }

    /// Installs software redirect mappings from `[from, from + size)` to `to` linearly.
    ///
    /// Trace flags (`SPTE_TRACE_READ`/`SPTE_TRACE_WRITE`/`SPTE_SYNC_TRACE`) may be OR-ed into
    /// `to` and are replicated into every derived descriptor.
    pub fn map_sw(&mut self, from: u64, to: u64, size: u64) -> Result<()> {
        self.map(from, to | field_prep(SPTE_TYPE, SpteType::Map.bits()), size, 1)
    }

    /// Installs an in-hypervisor hook over `[from, from + size)` at the finest necessary
    /// granule. The callback is registered under a fresh token stored in the descriptors'
    /// target field.
    pub fn map_hook(&mut self, from: u64, hook: MmioHookFn, size: u64) -> Result<()> {
        let token = self.register_hook(hook);
        self.map(
            from,
            token | field_prep(SPTE_TYPE, SpteType::Hook.bits()),
            size,
            0,
        )
    }

    /// Installs a host-serviced proxy hook over `[from, from + size)`. `id` is an opaque
    /// host-chosen identifier carried in the descriptors' target field.
    pub fn map_proxy_hook(&mut self, from: u64, id: u32, size: u64) -> Result<()> {
        self.map(
            from,
            field_prep(PTE_TARGET_MASK_L4, id as u64)
                | field_prep(SPTE_TYPE, SpteType::ProxyHookRw.bits()),
            size,
            0,
        )
    }

    /// Returns the final descriptor covering `addr`.
    ///
    /// For block and page descriptors the level-appropriate low address bits are OR-ed into the
    /// target field so the caller obtains the translated output address directly; hardware page
    /// descriptors additionally have their lower attributes cleared first. L4 descriptors
    /// describe a single word and are returned verbatim. A zero descriptor means the address is
    /// unmapped.
    pub fn walk(&self, addr: u64) -> Pte {
        debug!("walk({:#x})", addr);

        let idx = (addr >> VADDR_L2_OFFSET_BITS) as usize;
        let mut l2d = Pte(self.root.get(idx));

        if !l2d.is_table_l2() {
            if l2d.is_sw_block() || l2d.is_hw_block_l2() {
                l2d.0 |= addr & (VADDR_L2_ALIGN_MASK | VADDR_L3_ALIGN_MASK);
            }
            return l2d;
        }

        // The object map mirrors the raw table descriptors, so the entry exists.
        let l3 = self.l3s.get(&idx).unwrap();
        let idx = ((addr >> VADDR_L3_OFFSET_BITS) & mask(VADDR_L3_INDEX_BITS)) as usize;
        let mut l3d = Pte(l3.mem.get(idx));

        if !l3d.is_table_l3() {
            if l3d.is_sw_block() {
                l3d.0 |= addr & VADDR_L3_ALIGN_MASK;
            }
            if l3d.is_hw_page_l3() {
                l3d.0 &= !PTE_LOWER_ATTRIBUTES;
                l3d.0 |= addr & VADDR_L3_ALIGN_MASK;
            }
            return l3d;
        }

        let l4 = l3.l4s.get(&idx).unwrap();
        let idx = ((addr >> VADDR_L4_OFFSET_BITS) & mask(VADDR_L4_INDEX_BITS)) as usize;
        Pte(l4.get(idx))
    }

    /// Returns the callback registered under `token`, if any.
    pub fn hook(&self, token: u64) -> Option<MmioHookFn> {
        self.hooks.get(&token).copied()
    }

    /// Returns the number of live L3 and L4 tables. Mostly useful to check for leaks in tests
    /// and diagnostics.
    pub fn allocated_tables(&self) -> (usize, usize) {
        let l4s: usize = self.l3s.values().map(|l3| l3.l4s.len()).sum();
        (self.l3s.len(), l4s)
    }

    /// Registers `hook` under a fresh word-aligned, nonzero token.
    fn register_hook(&mut self, hook: MmioHookFn) -> u64 {
        self.next_hook_token += 1;
        let token = self.next_hook_token << VADDR_L4_OFFSET_BITS;
        self.hooks.insert(token, hook);
        token
    }

    /// Installs 32 MiB block descriptors. Overwriting a table descriptor drops the L3 table and
    /// everything below it.
    fn map_l2(&mut self, mut from: u64, mut to: u64, mut size: u64, incr: u64) {
        debug_assert_eq!(from & mask(VADDR_L2_OFFSET_BITS), 0);
        debug_assert!(
            Pte(to).is_sw() || to & PTE_TARGET_MASK & mask(VADDR_L2_OFFSET_BITS) == 0
        );
        debug_assert_eq!(size & mask(VADDR_L2_OFFSET_BITS), 0);

        while size != 0 {
            let idx = (from >> VADDR_L2_OFFSET_BITS) as usize;

            if Pte(self.root.get(idx)).is_table_l2() {
                self.l3s.remove(&idx);
            }

            self.root.set(idx, to);
            from += bit(VADDR_L2_OFFSET_BITS);
            to = to.wrapping_add(incr * bit(VADDR_L2_OFFSET_BITS));
            size -= bit(VADDR_L2_OFFSET_BITS);
        }
    }

    /// Returns the L3 table covering `from`, creating it if needed.
    ///
    /// When the L2 slot holds a block descriptor, the new table is initialized by splitting it:
    /// every child starts from the block's descriptor with the type adjusted from block to page
    /// for hardware entries, and the target strides by one page per child for hardware and
    /// software redirect blocks (constant-target kinds keep a stride of zero).
    fn get_l3(&mut self, from: u64) -> Result<&mut L3Table> {
        let l2idx = (from >> VADDR_L2_OFFSET_BITS) as usize;
        let l2d = Pte(self.root.get(l2idx));

        if l2d.is_table_l2() {
            // The object map mirrors the raw table descriptors, so the entry exists.
            return Ok(self.l3s.get_mut(&l2idx).unwrap());
        }

        let mut mem = TableMem::new(ENTRIES_PER_L3_TABLE, PAGE_SIZE)?;
        if l2d.0 != 0 {
            let mut incr = 0;
            let mut l3d = l2d.0;
            if l2d.is_hw() {
                l3d &= !PTE_TYPE;
                l3d |= field_prep(PTE_TYPE, PTE_PAGE);
                incr = bit(VADDR_L3_OFFSET_BITS);
            } else if l2d.is_sw() && l2d.spte_type() == SpteType::Map {
                incr = bit(VADDR_L3_OFFSET_BITS);
            }
            for idx in 0..ENTRIES_PER_L3_TABLE {
                mem.set(idx, l3d);
                l3d = l3d.wrapping_add(incr);
            }
        }

        self.root
            .set(l2idx, mem.addr() | field_prep(PTE_TYPE, PTE_TABLE) | PTE_VALID);
        self.l3s.insert(
            l2idx,
            L3Table {
                mem,
                l4s: HashMap::new(),
            },
        );
        Ok(self.l3s.get_mut(&l2idx).unwrap())
    }

    /// Installs page-granule descriptors. Overwriting a software-table descriptor drops the L4
    /// table below it.
    fn map_l3(&mut self, mut from: u64, mut to: u64, mut size: u64, incr: u64) -> Result<()> {
        debug_assert_eq!(from & mask(VADDR_L3_OFFSET_BITS), 0);
        debug_assert!(
            Pte(to).is_sw() || to & PTE_TARGET_MASK & mask(VADDR_L3_OFFSET_BITS) == 0
        );
        debug_assert_eq!(size & mask(VADDR_L3_OFFSET_BITS), 0);

        if Pte(to).is_hw() {
            to |= field_prep(PTE_TYPE, PTE_PAGE);
        } else {
            to |= field_prep(PTE_TYPE, PTE_BLOCK);
        }

        while size != 0 {
            let idx = ((from >> VADDR_L3_OFFSET_BITS) & mask(VADDR_L3_INDEX_BITS)) as usize;
            let l3 = self.get_l3(from)?;

            if Pte(l3.mem.get(idx)).is_table_l3() {
                l3.l4s.remove(&idx);
            }

            l3.mem.set(idx, to);
            from += bit(VADDR_L3_OFFSET_BITS);
            to = to.wrapping_add(incr * bit(VADDR_L3_OFFSET_BITS));
            size -= bit(VADDR_L3_OFFSET_BITS);
        }
        Ok(())
    }

    /// Returns the L4 table covering `from`, creating it if needed.
    ///
    /// A hardware page descriptor in the L3 slot is first lowered to a software redirect
    /// preserving its target, because the hardware walker must never reach the synthetic level.
    /// The new table's children replicate the descriptor with a one-word stride for redirects
    /// and a constant target otherwise.
    fn get_l4(&mut self, from: u64) -> Result<&mut TableMem> {
        let l3 = self.get_l3(from)?;
        let l3idx = ((from >> VADDR_L3_OFFSET_BITS) & mask(VADDR_L3_INDEX_BITS)) as usize;
        let mut l3d = Pte(l3.mem.get(l3idx));

        if l3d.is_table_l3() {
            // The object map mirrors the raw table descriptors, so the entry exists.
            return Ok(l3.l4s.get_mut(&l3idx).unwrap());
        }

        if l3d.is_hw() {
            debug_assert!(l3d.get_type());
            l3d.0 &= PTE_TARGET_MASK;
        }

        let mut mem = TableMem::new(ENTRIES_PER_L4_TABLE, PAGE_SIZE)?;
        if l3d.0 != 0 {
            let mut l4d = (l3d.0 & !PTE_TYPE) | field_prep(PTE_TYPE, PTE_PAGE);
            let incr = if Pte(l4d).spte_type() == SpteType::Map {
                bit(VADDR_L4_OFFSET_BITS)
            } else {
                0
            };
            for idx in 0..ENTRIES_PER_L4_TABLE {
                mem.set(idx, l4d);
                l4d = l4d.wrapping_add(incr);
            }
        }

        l3.mem
            .set(l3idx, mem.addr() | field_prep(PTE_TYPE, PTE_TABLE));
        l3.l4s.insert(l3idx, mem);
        Ok(l3.l4s.get_mut(&l3idx).unwrap())
    }

    /// Installs word-granule descriptors. Hardware entries are forbidden at this level.
    fn map_l4(&mut self, mut from: u64, mut to: u64, mut size: u64, incr: u64) -> Result<()> {
        debug_assert_eq!(from & mask(VADDR_L4_OFFSET_BITS), 0);
        debug_assert_eq!(size & mask(VADDR_L4_OFFSET_BITS), 0);
        debug_assert!(!Pte(to).is_hw());

        if Pte(to).is_sw() {
            to |= field_prep(PTE_TYPE, PTE_PAGE);
        }

        while size != 0 {
            let idx = ((from >> VADDR_L4_OFFSET_BITS) & mask(VADDR_L4_INDEX_BITS)) as usize;
            let l4 = self.get_l4(from)?;

            l4.set(idx, to);
            from += bit(VADDR_L4_OFFSET_BITS);
            to = to.wrapping_add(incr * bit(VADDR_L4_OFFSET_BITS));
            size -= bit(VADDR_L4_OFFSET_BITS);
        }
        Ok(())
    }
}

impl fmt::Display for PageTables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\nL2 @{:#x}", self.root.addr())?;
        let mut l3s: Vec<_> = self.l3s.iter().collect();
        l3s.sort_by_key(|(idx, _)| **idx);
        for (idx, l3) in l3s {
            writeln!(f, "+-- L3 #{} @{:#x}", idx, l3.mem.addr())?;
            let mut l4s: Vec<_> = l3.l4s.iter().collect();
            l4s.sort_by_key(|(idx, _)| **idx);
            for (l4idx, l4) in l4s {
                writeln!(f, "|   +-- L4 #{} @{:#x}", l4idx, l4.addr())?;
            }
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------------------------
// Guest physical memory
// -----------------------------------------------------------------------------------------------

/// Width-specific and bulk access to guest physical memory.
///
/// On the real machine these are plain loads and stores; a bus or page fault surfaces as
/// [`MemoryError::BusFault`], which the proxy's exception guard converts into an in-band
/// transfer error.
pub trait GuestMem {
    /// Reads one byte.
    fn read8(&mut self, addr: u64) -> Result<u8>;
    /// Reads a 16-bit value.
    fn read16(&mut self, addr: u64) -> Result<u16>;
    /// Reads a 32-bit value.
    fn read32(&mut self, addr: u64) -> Result<u32>;
    /// Reads a 64-bit value.
    fn read64(&mut self, addr: u64) -> Result<u64>;
    /// Writes one byte.
    fn write8(&mut self, addr: u64, val: u8) -> Result<()>;
    /// Writes a 16-bit value.
    fn write16(&mut self, addr: u64, val: u16) -> Result<()>;
    /// Writes a 32-bit value.
    fn write32(&mut self, addr: u64, val: u32) -> Result<()>;
    /// Writes a 64-bit value.
    fn write64(&mut self, addr: u64, val: u64) -> Result<()>;
    /// Reads `buf.len()` bytes starting at `addr`.
    fn read_bytes(&mut self, addr: u64, buf: &mut [u8]) -> Result<()>;
    /// Writes `buf` starting at `addr`.
    fn write_bytes(&mut self, addr: u64, buf: &[u8]) -> Result<()>;
}

/// Performs a read of the given width, widening the result to 64 bits.
pub fn read_width(mem: &mut impl GuestMem, addr: u64, width: AccessSize) -> Result<u64> {
    Ok(match width {
        AccessSize::Byte => mem.read8(addr)? as u64,
        AccessSize::Halfword => mem.read16(addr)? as u64,
        AccessSize::Word => mem.read32(addr)? as u64,
        AccessSize::Doubleword => mem.read64(addr)?,
    })
}

/// Performs a write of the given width, truncating `val` as needed.
pub fn write_width(mem: &mut impl GuestMem, addr: u64, val: u64, width: AccessSize) -> Result<()> {
    match width {
        AccessSize::Byte => mem.write8(addr, val as u8),
        AccessSize::Halfword => mem.write16(addr, val as u16),
        AccessSize::Word => mem.write32(addr, val as u32),
        AccessSize::Doubleword => mem.write64(addr, val),
    }
}
