//! x86-64 paging backend: 4-level PML4/PDPT/PD/PT long-mode tables
//! (§4.2, §6), plus a leaf PTE box/unbox shared by the 2MiB/1GiB
//! large-page levels (the wire format is identical at every level; only
//! the `PS` bit, which [`HalPaging`] never asks this module to track
//! directly, changes — the page-table engine picks the leaf level via
//! [`HalPaging::level_for_page_size`] and this module just writes
//! whatever level it is told to).

use nux_core::addr::{Pfn, VirtAddr};
use nux_core::pte::{Pte, PteFlags, L1P};
use nux_mm::HalPaging;

use crate::dmap::frame_to_virt;

const ENTRIES: usize = 512;

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

/// `HalPaging` for 4-level (PML4/PDPT/PD/PT) x86-64 long-mode paging,
/// with the canonical user/kernel half-split at the address-space
/// midpoint (bit 47).
pub struct X86_64Paging;

impl HalPaging for X86_64Paging {
    const LEVELS: usize = 4;

    fn supports_1gib() -> bool {
        true
    }

    fn is_user_va(va: VirtAddr) -> bool {
        va.as_u64() < 0x0000_8000_0000_0000
    }

    fn index_at(level: usize, va: VirtAddr) -> usize {
        let shift = 12 + 9 * (Self::LEVELS - 1 - level);
        ((va.as_u64() >> shift) & 0x1FF) as usize
    }

    fn alloc_table() -> Option<Pfn> {
        let pfn = nux_mm::pmm::alloc(false);
        if pfn.is_invalid() {
            return None;
        }
        // SAFETY: a frame the PMM just handed out is exclusively owned by
        // this call and lives in the direct map.
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
