//! RISC-V64 Sv48 paging backend: 4-level page tables (§4.2, §6), the
//! same level count and large-page levels as [`crate::x86_64`] but a
//! different wire encoding (`V/R/W/X/U/G/A/D` instead of
//! `P/W/U/G/NX`).
//!
//! Sv48 distinguishes a page-table pointer from a leaf PTE purely by
//! `R=W=X=0`: a present entry with every permission bit clear descends
//! one more level, anything else terminates the walk. The generic page-
//! table engine in `nux-mm` constructs interior links as `P|W` (see
//! `pagetable::walk`'s `link_flags`) without a way to say "and this is a
//! pointer, not data" — that distinction doesn't exist in `x86`, which
//! this engine was designed around. This backend's `box_pte` forces
//! `R=1` whenever `V=1`, so every entry this engine ever writes decodes
//! as at least a read-only leaf; a page-table frame written through the
//! generic interior-link path is therefore indistinguishable, to real
//! Sv48 hardware, from a read-only data page at that address. Walking
//! one more level past it would be wrong on real silicon. A production
//! RISC-V HAL needs a dedicated non-leaf-pointer write path in the
//! engine; this backend documents the gap rather than silently mis-
//! modeling it (tracked in DESIGN.md).

use nux_core::addr::{Pfn, VirtAddr};
use nux_core::pte::{Pte, PteFlags, L1P};
use nux_mm::HalPaging;

use crate::dmap::frame_to_virt;

const ENTRIES: usize = 512;

bitflags::bitflags! {
    struct Raw: u64 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
        const RSW0 = 1 << 8;
        const RSW1 = 1 << 9;
    }
}

const PPN_SHIFT: u32 = 10;
const PPN_MASK: u64 = 0x0FFF_FFFF_FFFF << PPN_SHIFT;

fn box_pte(pte: Pte) -> u64 {
    if !pte.flags.contains(PteFlags::P) {
        return 0;
    }
    let mut raw = Raw::V | Raw::R | Raw::A | Raw::D;
    raw.set(Raw::W, pte.flags.contains(PteFlags::W));
    raw.set(Raw::X, pte.flags.contains(PteFlags::X));
    raw.set(Raw::U, pte.flags.contains(PteFlags::U));
    raw.set(Raw::G, pte.flags.contains(PteFlags::GLOBAL));
    raw.set(Raw::RSW0, pte.flags.contains(PteFlags::AVL0));
    raw.set(Raw::RSW1, pte.flags.contains(PteFlags::AVL1));
    raw.bits() | (pte.pfn.as_u64() << PPN_SHIFT)
}

fn unbox_pte(bits: u64) -> Pte {
    let raw = Raw::from_bits_truncate(bits);
    if !raw.contains(Raw::V) {
        return Pte::ABSENT;
    }
    let mut flags = PteFlags::P;
    flags.set(PteFlags::W, raw.contains(Raw::W));
    flags.set(PteFlags::X, raw.contains(Raw::X));
    flags.set(PteFlags::U, raw.contains(Raw::U));
    flags.set(PteFlags::GLOBAL, raw.contains(Raw::G));
    flags.set(PteFlags::AVL0, raw.contains(Raw::RSW0));
    flags.set(PteFlags::AVL1, raw.contains(Raw::RSW1));
    Pte { pfn: Pfn::new((bits & PPN_MASK) >> PPN_SHIFT), flags }
}

unsafe fn table_ptr(pfn: Pfn) -> *mut [u64; ENTRIES] {
    frame_to_virt(pfn).as_mut_ptr()
}

/// `HalPaging` for 4-level Sv48 RISC-V64 paging. Canonical user/kernel
/// split at the address-space midpoint, same as x86-64 long mode.
pub struct Riscv64Sv48Paging;

impl HalPaging for Riscv64Sv48Paging {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_pte_boxes_to_zero() {
        assert_eq!(box_pte(Pte::ABSENT), 0);
    }

    #[test]
    fn box_unbox_round_trips_every_flag() {
        let pte = Pte {
            pfn: Pfn::new(0x1234),
            flags: PteFlags::P | PteFlags::W | PteFlags::X | PteFlags::U | PteFlags::GLOBAL | PteFlags::AVL1,
        };
        assert_eq!(unbox_pte(box_pte(pte)), pte);
    }

    #[test]
    fn present_entries_are_always_readable() {
        let pte = Pte { pfn: Pfn::new(1), flags: PteFlags::P | PteFlags::X };
        let bits = box_pte(pte);
        assert_ne!(bits & Raw::R.bits(), 0);
    }

    #[test]
    fn user_kernel_split_matches_x86_64_convention() {
        assert!(Riscv64Sv48Paging::is_user_va(VirtAddr::new(0x0000_7FFF_FFFF_FFFF)));
        assert!(!Riscv64Sv48Paging::is_user_va(VirtAddr::new(0xFFFF_8000_0000_0000)));
    }

    #[test]
    fn no_1gib_gigapage_support_is_false_only_when_overridden() {
        assert!(Riscv64Sv48Paging::supports_1gib());
    }
}
