//! The page-table engine (§4.2).
//!
//! One instantiation per paging mode, selected by which [`HalPaging`]
//! implementor the enclosing crate builds against. Generic over the HAL
//! so this module — including large-page promotion and the round-trip
//! and flag-merge properties it must satisfy — is host-testable against
//! a software model, exactly like the teacher's `kernel/mm` crate is
//! `cargo test`-able without a kernel target.

use nux_core::addr::{PhysAddr, Pfn, VirtAddr};
use nux_core::error::NuxError;
use nux_core::paging::{largest_aligned_step, Size1GiB, Size2MiB, Size4KiB, PageSize};
use nux_core::pte::{Pte, PteFlags, L1P};
use nux_core::tlb::{tlbop, TlbOp};

/// The shape of one paging mode's tables, as the engine needs to see it.
///
/// Implemented once by each `nux-hal` architecture backend (boxing to and
/// from the real wire PTE encoding happens inside these methods) and once
/// by a software model for host tests.
pub trait HalPaging: Sized {
    /// Levels from the root (level 0) down to and including the native
    /// 4 KiB leaf level (`LEVELS - 1`). 4 for x86-64 (PML4/PDPT/PD/PT)
    /// and RISC-V Sv48 (4 levels), 3 for x86-32 PAE (PDPT/PD/PT).
    const LEVELS: usize;

    /// Entries per non-root table. 512 on every paging mode this kernel
    /// targets today (9-bit indices at every level below the root, on
    /// both x86-64/PAE and RISC-V Sv48); override if a future mode
    /// differs.
    const ENTRIES_PER_TABLE: usize = 512;

    /// Whether this build/CPU can install a 1 GiB leaf. Always `false`
    /// when `LEVELS < 3`, since there is no level left to host one.
    fn supports_1gib() -> bool;

    /// Whether `va` falls in the half of the address space this paging
    /// mode treats as user space (used to decide whether a freshly
    /// allocated interior link also needs `U` set).
    fn is_user_va(va: VirtAddr) -> bool;

    /// Index into the table at `level` that `va` would use.
    fn index_at(level: usize, va: VirtAddr) -> usize;

    /// Allocates and zero-fills a fresh, empty table frame.
    fn alloc_table() -> Option<Pfn>;

    /// Frees a table frame known to hold no present entries.
    fn free_table(pfn: Pfn);

    /// Reads the entry at `index` of the table at `table_pfn`.
    fn read_slot(table_pfn: Pfn, index: usize) -> Pte;

    /// Writes the entry, returning the previous contents.
    fn write_slot(table_pfn: Pfn, index: usize, pte: Pte) -> Pte;

    /// Packs `(table_pfn, index)` into an opaque leaf handle.
    fn pack_l1p(table_pfn: Pfn, index: usize) -> L1P;

    /// Reverses [`HalPaging::pack_l1p`].
    fn unpack_l1p(l1p: L1P) -> (Pfn, usize);

    /// The table level a leaf of `size` bytes is installed at. Default
    /// impl assumes the three standard sizes this engine promotes
    /// between (§4.2); override only if a mode's level numbering differs.
    fn level_for_page_size(size: u64) -> usize {
        if size == Size1GiB::SIZE {
            Self::LEVELS - 3
        } else if size == Size2MiB::SIZE {
            Self::LEVELS - 2
        } else {
            debug_assert_eq!(size, Size4KiB::SIZE);
            Self::LEVELS - 1
        }
    }
}

fn pte_pair(pte: Pte) -> Option<(u64, PteFlags)> {
    pte.present().then_some((pte.pfn.as_u64(), pte.flags))
}

fn link_flags<H: HalPaging>(va: VirtAddr) -> PteFlags {
    let mut f = PteFlags::P | PteFlags::W;
    if H::is_user_va(va) {
        f |= PteFlags::U;
    }
    f
}

/// Descends to the 4 KiB leaf slot servicing `va`. If `alloc` is true,
/// missing interior levels are allocated and linked with `P|W` (`U` too,
/// for a user-space `va`). Returns [`L1P::INVALID`] on allocator
/// exhaustion or, with `alloc = false`, on a missing interior entry.
pub fn walk<H: HalPaging>(root: Pfn, va: VirtAddr, alloc: bool) -> L1P {
    let mut table = root;
    for level in 0..H::LEVELS - 1 {
        let idx = H::index_at(level, va);
        let entry = H::read_slot(table, idx);
        if entry.present() {
            table = entry.pfn;
        } else if alloc {
            let Some(child) = H::alloc_table() else {
                return L1P::INVALID;
            };
            H::write_slot(table, idx, Pte { pfn: child, flags: link_flags::<H>(va) });
            table = child;
        } else {
            return L1P::INVALID;
        }
    }
    H::pack_l1p(table, H::index_at(H::LEVELS - 1, va))
}

/// Reads the leaf slot `l1p` points at. [`L1P::INVALID`] reads as absent.
#[must_use]
pub fn get<H: HalPaging>(l1p: L1P) -> Pte {
    if l1p.is_invalid() {
        return Pte::ABSENT;
    }
    let (table, idx) = H::unpack_l1p(l1p);
    H::read_slot(table, idx)
}

/// Writes `pte` into the leaf slot `l1p` points at, returning the
/// previous contents so the caller can classify the required
/// [`TlbOp`] via [`nux_core::tlb::tlbop`].
pub fn set<H: HalPaging>(l1p: L1P, pte: Pte) -> Pte {
    debug_assert!(!l1p.is_invalid());
    let (table, idx) = H::unpack_l1p(l1p);
    H::write_slot(table, idx, pte)
}

/// The direct-map fast path (§4.2): maps `[va, va+size)` to `[pa,
/// pa+size)` opportunistically using the largest aligned page size at
/// each step, to avoid exhausting page-table RAM mapping the whole of
/// physical memory at 4 KiB. Returns the combined [`TlbOp`] across every
/// leaf touched.
pub fn map_range<H: HalPaging>(
    root: Pfn,
    va: VirtAddr,
    pa: PhysAddr,
    size: u64,
    flags: PteFlags,
) -> Result<TlbOp, NuxError> {
    let mut off = 0u64;
    let mut combined = TlbOp::None;
    while off < size {
        let cur_va = va.as_u64() + off;
        let cur_pa = pa.as_u64() + off;
        let remaining = size - off;
        let step = largest_aligned_step(cur_va, cur_pa, remaining, H::supports_1gib());
        let leaf_level = H::level_for_page_size(step);

        let mut table = root;
        for level in 0..leaf_level {
            let idx = H::index_at(level, VirtAddr::new(cur_va));
            let entry = H::read_slot(table, idx);
            if entry.present() {
                table = entry.pfn;
            } else {
                let child = H::alloc_table().ok_or(NuxError::OomFrame)?;
                H::write_slot(table, idx, Pte { pfn: child, flags: link_flags::<H>(VirtAddr::new(cur_va)) });
                table = child;
            }
        }

        let idx = H::index_at(leaf_level, VirtAddr::new(cur_va));
        let old = H::read_slot(table, idx);
        let new_pte = Pte { pfn: PhysAddr::new(cur_pa).pfn(), flags };
        H::write_slot(table, idx, new_pte);

        combined = combined.combine(tlbop(
            old.present(),
            pte_pair(old),
            new_pte.present(),
            pte_pair(new_pte),
        ));
        off += step;
    }
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    const ENTRIES: usize = 512;

    thread_local! {
        static TABLES: RefCell<HashMap<u64, [Pte; ENTRIES]>> = RefCell::new(HashMap::new());
        static NEXT_FRAME: RefCell<u64> = const { RefCell::new(1) };
    }

    fn reset() {
        TABLES.with(|t| t.borrow_mut().clear());
        NEXT_FRAME.with(|n| *n.borrow_mut() = 1);
    }

    fn alloc_root() -> Pfn {
        let pfn = NEXT_FRAME.with(|n| {
            let mut n = n.borrow_mut();
            let v = *n;
            *n += 1;
            v
        });
        TABLES.with(|t| t.borrow_mut().insert(pfn, [Pte::ABSENT; ENTRIES]));
        Pfn::new(pfn)
    }

    /// Software model of a 4-level 64-bit paging mode (like x86-64),
    /// with 9 index bits per level and the canonical user/kernel split
    /// at the address-space midpoint.
    struct SoftHal;

    impl HalPaging for SoftHal {
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
            Some(alloc_root())
        }

        fn free_table(pfn: Pfn) {
            TABLES.with(|t| {
                t.borrow_mut().remove(&pfn.as_u64());
            });
        }

        fn read_slot(table_pfn: Pfn, index: usize) -> Pte {
            TABLES.with(|t| t.borrow()[&table_pfn.as_u64()][index])
        }

        fn write_slot(table_pfn: Pfn, index: usize, pte: Pte) -> Pte {
            TABLES.with(|t| {
                let mut tables = t.borrow_mut();
                let table = tables.get_mut(&table_pfn.as_u64()).unwrap();
                let old = table[index];
                table[index] = pte;
                old
            })
        }

        fn pack_l1p(table_pfn: Pfn, index: usize) -> L1P {
            L1P::new((table_pfn.as_u64() << 16) | index as u64)
        }

        fn unpack_l1p(l1p: L1P) -> (Pfn, usize) {
            (Pfn::new(l1p.raw() >> 16), (l1p.raw() & 0xFFFF) as usize)
        }
    }

    #[test]
    fn walk_and_roundtrip_a_single_page() {
        reset();
        let root = alloc_root();
        let va = VirtAddr::new(0x0000_1234_5000);
        let l1p = walk::<SoftHal>(root, va, true);
        assert!(!l1p.is_invalid());

        let pte = Pte { pfn: Pfn::new(0x77), flags: PteFlags::P | PteFlags::W | PteFlags::AVL0 };
        set::<SoftHal>(l1p, pte);

        let l1p_ro = walk::<SoftHal>(root, va, false);
        assert_eq!(get::<SoftHal>(l1p_ro), pte);
    }

    #[test]
    fn walk_without_alloc_on_missing_entry_is_invalid() {
        reset();
        let root = alloc_root();
        let l1p = walk::<SoftHal>(root, VirtAddr::new(0x1000), false);
        assert!(l1p.is_invalid());
    }

    #[test]
    fn map_range_promotes_to_1gib_when_aligned() {
        reset();
        let root = alloc_root();
        let op = map_range::<SoftHal>(
            root,
            VirtAddr::new(0),
            PhysAddr::new(0),
            Size1GiB::SIZE,
            PteFlags::P | PteFlags::W,
        )
        .unwrap();
        assert_eq!(op, TlbOp::None); // old was absent

        let leaf_level = SoftHal::level_for_page_size(Size1GiB::SIZE);
        assert_eq!(leaf_level, 1);
        let l1p = {
            let mut table = root;
            for level in 0..leaf_level {
                let idx = SoftHal::index_at(level, VirtAddr::new(0));
                table = SoftHal::read_slot(table, idx).pfn;
            }
            SoftHal::pack_l1p(table, SoftHal::index_at(leaf_level, VirtAddr::new(0)))
        };
        assert!(get::<SoftHal>(l1p).present());
    }

    #[test]
    fn map_range_falls_back_to_4kib_for_small_misaligned_region() {
        reset();
        let root = alloc_root();
        map_range::<SoftHal>(root, VirtAddr::new(0), PhysAddr::new(0), Size4KiB::SIZE, PteFlags::P).unwrap();
        let l1p = walk::<SoftHal>(root, VirtAddr::new(0), false);
        assert!(get::<SoftHal>(l1p).present());
    }

    #[test]
    fn map_range_reports_flush_on_overwrite_with_different_pfn() {
        reset();
        let root = alloc_root();
        map_range::<SoftHal>(root, VirtAddr::new(0), PhysAddr::new(0), Size4KiB::SIZE, PteFlags::P | PteFlags::W).unwrap();
        let op = map_range::<SoftHal>(
            root,
            VirtAddr::new(0),
            PhysAddr::new(Size4KiB::SIZE),
            Size4KiB::SIZE,
            PteFlags::P | PteFlags::W,
        )
        .unwrap();
        assert_eq!(op, TlbOp::Flush);
    }
}
