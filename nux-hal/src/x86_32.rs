//! x86-32 PAE paging backend: 3-level PDPT/PD/PT tables (§4.2, §6).
//!
//! The PDPT (level 0) has only 4 entries in real PAE hardware — the top
//! two VA bits select it — but every level below is a standard 512-entry,
//! 64-bit-PTE table identical in wire format to [`crate::x86_64`]'s. This
//! backend reuses that wire format rather than redefining it; only
//! [`HalPaging::index_at`]'s level-0 shift/width and the missing third
//! page-table level differ from long mode.

use nux_core::addr::{Pfn, VirtAddr};
use nux_core::pte::{Pte, PteFlags, L1P};
use nux_mm::HalPaging;

use crate::dmap::frame_to_virt;

const ENTRIES: usize = 512;
/// Real PAE hardware only has 4 PDPT entries; the generic engine's
/// `ENTRIES_PER_TABLE` (used for levels `1..LEVELS-1`, never level 0)
/// keeps its 512 default, so this only matters to this module's own
/// bounds-checking.
const PDPT_ENTRIES: usize = 4;

bitflags::bitflags! {
    struct Raw: u64 {
        const PRESENT  = 1 << 0;
        const WRITE    = 1 << 1;
        const USER     = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
        const GLOBAL   = 1 << 8;
        const AVL0     = 1 << 9;
        const AVL1     = 1 << 10;
        const AVL2     = 1 << 11;
        const NX       = 1 << 63;
    }
}

const PFN_MASK: u64 = 0x000F_FFFF_FFFF_F000;

fn box_pte(pte: Pte) -> u64 {
    if !pte.flags.contains(PteFlags::P) {
        return 0;
    }
    let mut raw = Raw::PRESENT;
    raw.set(Raw::WRITE, pte.flags.contains(PteFlags::W));
    raw.set(Raw::USER, pte.flags.contains(PteFlags::U));
    raw.set(Raw::GLOBAL, pte.flags.contains(PteFlags::GLOBAL));
    raw.set(Raw::AVL0, pte.flags.contains(PteFlags::AVL0));
    raw.set(Raw::AVL1, pte.flags.contains(PteFlags::AVL1));
    raw.set(Raw::AVL2, pte.flags.contains(PteFlags::AVL2));
    let mut bits = raw.bits() | (pte.pfn.as_u64() << 12);
    if !pte.flags.contains(PteFlags::X) {
        bits |= Raw::NX.bits();
    }
    bits
}

fn unbox_pte(bits: u64) -> Pte {
    let raw = Raw::from_bits_truncate(bits);
    if !raw.contains(Raw::PRESENT) {
        return Pte::ABSENT;
    }
    let mut flags = PteFlags::P;
    flags.set(PteFlags::W, raw.contains(Raw::WRITE));
    flags.set(PteFlags::U, raw.contains(Raw::USER));
    flags.set(PteFlags::GLOBAL, raw.contains(Raw::GLOBAL));
    flags.set(PteFlags::AVL0, raw.contains(Raw::AVL0));
    flags.set(PteFlags::AVL1, raw.contains(Raw::AVL1));
    flags.set(PteFlags::AVL2, raw.contains(Raw::AVL2));
    flags.set(PteFlags::X, bits & Raw::NX.bits() == 0);
    Pte { pfn: Pfn::new((bits & PFN_MASK) >> 12), flags }
}

unsafe fn table_ptr(pfn: Pfn) -> *mut [u64; ENTRIES] {
    frame_to_virt(pfn).as_mut_ptr()
}

/// `HalPaging` for 3-level (PDPT/PD/PT) x86-32 PAE paging. No 1 GiB
/// pages — PAE's top level has only 4 entries, leaving no room for a
/// third promotable size above 2 MiB.
pub struct X86_32PaePaging;

impl HalPaging for X86_32PaePaging {
    const LEVELS: usize = 3;

    fn supports_1gib() -> bool {
        false
    }

    fn is_user_va(va: VirtAddr) -> bool {
        va.as_u64() < 0xC000_0000
    }

    fn index_at(level: usize, va: VirtAddr) -> usize {
        if level == 0 {
            ((va.as_u64() >> 30) & 0x3) as usize
        } else {
            let shift = 12 + 9 * (Self::LEVELS - 1 - level);
            ((va.as_u64() >> shift) & 0x1FF) as usize
        }
    }

    fn alloc_table() -> Option<Pfn> {
        let pfn = nux_mm::pmm::alloc(false);
        if pfn.is_invalid() {
            return None;
        }
        // SAFETY: freshly allocated, exclusively owned, direct-mapped frame.
        unsafe { *table_ptr(pfn) = [0u64; ENTRIES] };
        Some(pfn)
    }

    fn free_table(pfn: Pfn) {
        nux_mm::pmm::free(pfn);
    }

    fn read_slot(table_pfn: Pfn, index: usize) -> Pte {
        // SAFETY: table_pfn was produced by alloc_table and stays resident
        // in the direct map for as long as it is a live table.
        let bits = unsafe { (*table_ptr(table_pfn))[index] };
        unbox_pte(bits)
    }

    fn write_slot(table_pfn: Pfn, index: usize, pte: Pte) -> Pte {
        let old = Self::read_slot(table_pfn, index);
        let bits = box_pte(pte);
        // SAFETY: see read_slot.
        unsafe { (*table_ptr(table_pfn))[index] = bits };
        old
    }

    fn pack_l1p(table_pfn: Pfn, index: usize) -> L1P {
        L1P::new((table_pfn.as_u64() << 16) | index as u64)
    }

    fn unpack_l1p(l1p: L1P) -> (Pfn, usize) {
        (Pfn::new(l1p.raw() >> 16), (l1p.raw() & 0xFFFF) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_zero_index_never_exceeds_pdpt_width() {
        for raw_va in [0u64, 0x3FFF_FFFF, 0x4000_0000, 0xFFFF_FFFF] {
            let idx = X86_32PaePaging::index_at(0, VirtAddr::new(raw_va));
            assert!(idx < PDPT_ENTRIES);
        }
    }

    #[test]
    fn user_kernel_split_is_at_3gib() {
        assert!(X86_32PaePaging::is_user_va(VirtAddr::new(0xBFFF_FFFF)));
        assert!(!X86_32PaePaging::is_user_va(VirtAddr::new(0xC000_0000)));
    }

    #[test]
    fn no_1gib_support_on_pae() {
        assert!(!X86_32PaePaging::supports_1gib());
    }

    #[test]
    fn box_unbox_round_trips() {
        let pte = Pte { pfn: Pfn::new(7), flags: PteFlags::P | PteFlags::W };
        assert_eq!(unbox_pte(box_pte(pte)), pte);
    }
}
