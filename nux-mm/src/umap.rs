//! UMAP: the per-address-space user mapping (§4.10).
//!
//! A UMAP does not own a conventional root table. Instead it is a small,
//! fixed-fanout array of top-level PTEs (`N` of them — 8 × 512 GiB slots
//! on x86-64, 3 × 1 GiB on x86 PAE) that *shadow* a slice of whichever
//! root table is actually live on a given CPU. [`Umap::load`] copies the
//! shadow into a CPU's live root; the cost of a context switch is bounded
//! by `N`, not by the size of a full top-level table, which is the whole
//! point of the design (§3, §4.10).
//!
//! Everything below the shadow (L3 down to the 4 KiB leaf) is ordinary
//! [`HalPaging`]-backed table frames, walked the same way
//! [`crate::pagetable::walk`] does — just rooted in `shadow[i]` instead of
//! `H::read_slot(root, i)`.

use nux_core::addr::{Pfn, VirtAddr};
use nux_core::error::NuxError;
use nux_core::pte::{Pte, PteFlags, L1P};
use nux_core::tlb::{tlbop, TlbOp};

use crate::pagetable::HalPaging;

/// A leaf page-table entry, named for the glossary term (§ Glossary,
/// "L1E"): the contents [`Umap::iterate`] hands back alongside its
/// [`L1P`] handle.
pub type L1E = Pte;

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

/// Up to 256 CPUs' worth of "has this UMAP loaded" bits (matches
/// [`nux_core::cpu_local::MAX_CPUS`]).
pub type CpuMask = [u64; 4];

fn cpumask_set(mask: &mut CpuMask, cpu: usize) {
    mask[cpu / 64] |= 1 << (cpu % 64);
}

fn cpumask_clear(mask: &mut CpuMask, cpu: usize) {
    mask[cpu / 64] &= !(1 << (cpu % 64));
}

/// Delivers the accumulated TLB operation to every CPU in a UMAP's
/// `cpumask`, as [`Umap::umap_commit`]'s last step. Implemented by the
/// `nux` crate's per-CPU TLB-shootdown orchestration (§4.9); kept as an
/// injected trait here so UMAP bookkeeping stays host-testable without a
/// real shootdown path in the loop.
pub trait TlbShootdownOps {
    /// Issues `op` to every CPU set in `cpu_mask`.
    fn shootdown(&self, cpu_mask: CpuMask, op: TlbOp);
}

/// A compact user address space: `N` top-level shadow slots plus
/// whatever lower-level table frames they lead to.
pub struct Umap<H: HalPaging, const N: usize> {
    shadow: [Pte; N],
    cpumask: CpuMask,
    /// Accumulated via `max` over `{None=0, Flush=1, FlushAll=2}`, since
    /// `FlushAll` dominates `Flush` dominates `None` — equivalent to an
    /// OR over the two flush levels without needing bit tricks on
    /// [`TlbOp`] itself.
    pending: u8,
    _hal: core::marker::PhantomData<H>,
}

fn tlbop_rank(op: TlbOp) -> u8 {
    match op {
        TlbOp::None => 0,
        TlbOp::Flush => 1,
        TlbOp::FlushAll => 2,
    }
}

fn rank_to_tlbop(rank: u8) -> TlbOp {
    match rank {
        0 => TlbOp::None,
        1 => TlbOp::Flush,
        _ => TlbOp::FlushAll,
    }
}

impl<H: HalPaging, const N: usize> Umap<H, N> {
    /// An empty UMAP: no top-level slot populated, no CPU holding it.
    #[must_use]
    pub const fn new() -> Self {
        Self { shadow: [Pte::ABSENT; N], cpumask: [0; 4], pending: 0, _hal: core::marker::PhantomData }
    }

    fn top_index(va: VirtAddr) -> usize {
        H::index_at(0, va)
    }

    fn accumulate(&mut self, op: TlbOp) {
        let rank = tlbop_rank(op);
        if rank > self.pending {
            self.pending = rank;
        }
    }

    /// Descends to the 4 KiB leaf slot for `va`, allocating missing
    /// interior levels (including the top-level shadow slot itself) when
    /// `alloc` is set. Returns [`L1P::INVALID`] on allocator exhaustion,
    /// a missing entry with `alloc = false`, or `va` outside the `N`
    /// top-level slots this UMAP covers.
    pub fn walk(&mut self, va: VirtAddr, alloc: bool) -> L1P {
        let top = Self::top_index(va);
        if top >= N {
            return L1P::INVALID;
        }

        let mut table = if self.shadow[top].present() {
            self.shadow[top].pfn
        } else if alloc {
            let Some(child) = H::alloc_table() else {
                return L1P::INVALID;
            };
            self.shadow[top] = Pte { pfn: child, flags: link_flags::<H>(va) };
            child
        } else {
            return L1P::INVALID;
        };

        for level in 1..H::LEVELS - 1 {
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

    /// Writes `pfn`/`prot` at `va`'s leaf, OR-accumulating the resulting
    /// [`TlbOp`] (§4.10: "`map` ... OR-accumulates `tlbop`").
    pub fn map(&mut self, va: VirtAddr, pfn: Pfn, prot: PteFlags) -> Result<(), NuxError> {
        let l1p = self.walk(va, true);
        if l1p.is_invalid() {
            return Err(NuxError::OomFrame);
        }
        let (table, idx) = H::unpack_l1p(l1p);
        let new = Pte { pfn, flags: prot };
        let old = H::write_slot(table, idx, new);
        let op = tlbop(old.present(), pte_pair(old), new.present(), pte_pair(new));
        self.accumulate(op);
        Ok(())
    }

    /// Copies the shadow top-level slots into `cpu_root`'s matching
    /// entries, records `cpu` in the CPU mask, and returns the combined
    /// [`TlbOp`] of the swap (the caller applies it locally; other CPUs
    /// that still have this UMAP loaded are handled by
    /// [`Umap::umap_commit`]).
    pub fn load(&mut self, cpu: usize, cpu_root: Pfn) -> TlbOp {
        let mut combined = TlbOp::None;
        for i in 0..N {
            let old = H::read_slot(cpu_root, i);
            let new = self.shadow[i];
            if pte_pair(old) == pte_pair(new) && old.present() == new.present() {
                continue;
            }
            H::write_slot(cpu_root, i, new);
            combined = combined.combine(tlbop(old.present(), pte_pair(old), new.present(), pte_pair(new)));
        }
        cpumask_set(&mut self.cpumask, cpu);
        combined
    }

    /// Drops `cpu` from the mask of CPUs holding this UMAP loaded — e.g.
    /// when that CPU switches to a different address space.
    pub fn unload(&mut self, cpu: usize) {
        cpumask_clear(&mut self.cpumask, cpu);
    }

    /// Applies the accumulated [`TlbOp`] to every CPU in the mask via
    /// `ops`, then clears the pending operation. A no-op if nothing is
    /// pending.
    pub fn umap_commit(&mut self, ops: &dyn TlbShootdownOps) {
        let op = rank_to_tlbop(self.pending);
        if op != TlbOp::None {
            ops.shootdown(self.cpumask, op);
        }
        self.pending = 0;
    }

    /// Walks the UMAP in ascending virtual-address order starting at
    /// `from` (inclusive), skipping empty sub-trees at every level, and
    /// returns the next present leaf as `(address, L1P, L1E)`. Repeated
    /// calls with `from` one page past the previous result enumerate
    /// every mapping in order.
    #[must_use]
    pub fn iterate(&self, from: VirtAddr) -> Option<(VirtAddr, L1P, L1E)> {
        self.scan(0, None, 0, from)
    }

    fn entry_shift(level: usize) -> u32 {
        12 + 9 * (H::LEVELS as u32 - 1 - level as u32)
    }

    fn scan(&self, level: usize, table: Option<Pfn>, base_va: u64, floor: VirtAddr) -> Option<(VirtAddr, L1P, L1E)> {
        let shift = Self::entry_shift(level);
        let table_width = if level == 0 { N } else { H::ENTRIES_PER_TABLE };
        let floor_idx = ((floor.as_u64() >> shift) as usize) & (H::ENTRIES_PER_TABLE - 1);
        let start = floor_idx.min(table_width.saturating_sub(1));

        for idx in start..table_width {
            let entry = if level == 0 { self.shadow[idx] } else { H::read_slot(table.unwrap(), idx) };
            if !entry.present() {
                continue;
            }
            let entry_va = base_va | ((idx as u64) << shift);
            if level == H::LEVELS - 1 {
                return Some((VirtAddr::new(entry_va), H::pack_l1p(table.unwrap(), idx), entry));
            }
            let child_floor = if idx == start { floor } else { VirtAddr::new(0) };
            if let Some(found) = self.scan(level + 1, Some(entry.pfn), entry_va, child_floor) {
                return Some(found);
            }
        }
        None
    }

    /// Tears down every L3/L2/L1 table frame this UMAP references.
    /// Asserts no leaf is still present at teardown time — the caller
    /// must have unmapped (and freed) every data page first; a present
    /// leaf here means a frame would otherwise leak silently.
    pub fn free(mut self) {
        for i in 0..N {
            let top = self.shadow[i];
            if top.present() {
                Self::free_subtree(1, top.pfn);
                H::free_table(top.pfn);
            }
            self.shadow[i] = Pte::ABSENT;
        }
    }

    fn free_subtree(level: usize, table_pfn: Pfn) {
        if level == H::LEVELS - 1 {
            for idx in 0..H::ENTRIES_PER_TABLE {
                let e = H::read_slot(table_pfn, idx);
                assert!(!e.present(), "umap free: leaf-in-interior violation, a data page is still mapped");
            }
            return;
        }
        for idx in 0..H::ENTRIES_PER_TABLE {
            let e = H::read_slot(table_pfn, idx);
            if e.present() {
                Self::free_subtree(level + 1, e.pfn);
                H::free_table(e.pfn);
            }
        }
    }
}

impl<H: HalPaging, const N: usize> Default for Umap<H, N> {
    fn default() -> Self {
        Self::new()
    }
}
