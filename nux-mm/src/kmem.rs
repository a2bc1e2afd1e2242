//! KMAP (§4.6) and the KMEM heap (§4.7).
//!
//! Two layers stacked on the engine in [`crate::pagetable`]: [`Kmap`] is a
//! thin current-root wrapper that turns a `(va, pfn, flags)` triple into a
//! leaf write plus the TLB-generation bookkeeping lazy shootdown needs;
//! [`KmemArena`] is the two-ended `brk` heap built on top of it, the same
//! shape as the teacher's low/high `VmmRegion` pair over a `Zone`.
//!
//! `KmemArena` only talks to its backing store through the narrow
//! [`KmemBacking`] trait rather than `Kmap` directly, so the brk arithmetic
//! — the part §8 actually wants exercised — is host-testable without a
//! `HalPaging` implementor or a frame source in the loop at all.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};

use nux_core::addr::{Pfn, VirtAddr, PAGE_SIZE};
use nux_core::error::NuxError;
use nux_core::pte::{Pte, PteFlags};
use nux_core::tlb::{tlbop, TlbOp};

use crate::pagetable::{self, HalPaging};
use crate::pmm::FrameAllocHooks;
use crate::zone::{Zone, MIN_BLOCK_SIZE};

fn pte_pair(pte: Pte) -> Option<(u64, PteFlags)> {
    pte.present().then_some((pte.pfn.as_u64(), pte.flags))
}

/// The wrap-friendly generation counter behind lazy TLB shootdown (§3,
/// `tlbgen_t`). A 6-bit wrap count plus a generation count; comparing two
/// counters from different wraps is meaningless, so it is treated as
/// stale and conservatively demands a flush rather than risk missing one.
const TG_WSHIFT: u32 = 6;

/// Tests whether `observed` is behind `current`, wrap-aware. Returns
/// `true` (conservatively demanding a flush) whenever the two counters
/// disagree on wrap, since ordering can't be trusted across a wrap.
#[must_use]
pub fn tlbgen_is_stale(observed: u64, current: u64) -> bool {
    let wrap_mask = (1u64 << TG_WSHIFT) - 1;
    if observed & wrap_mask != current & wrap_mask {
        return true;
    }
    observed < current
}

/// A thin wrapper over the current address space's root table: the
/// per-va mapping primitives the rest of the kernel calls through, plus
/// the generation counters lazy shootdown reads.
pub struct Kmap<H: HalPaging, A: FrameAllocHooks> {
    root: Pfn,
    frames: A,
    /// Bumped on any leaf write that only needs a local (`TlbOp::Flush`)
    /// invalidation.
    tlbgen_local: AtomicU64,
    /// Bumped on any leaf write that needs a cross-CPU (`TlbOp::FlushAll`)
    /// invalidation — freeing a page table, or changing a global mapping.
    tlbgen_global: AtomicU64,
    _hal: PhantomData<H>,
}

impl<H: HalPaging, A: FrameAllocHooks> Kmap<H, A> {
    /// Wraps an already-built root table.
    pub fn new(root: Pfn, frames: A) -> Self {
        Self { root, frames, tlbgen_local: AtomicU64::new(0), tlbgen_global: AtomicU64::new(0), _hal: PhantomData }
    }

    /// The current values of the local and global generation counters,
    /// for a caller about to go to sleep on a pending shootdown.
    #[must_use]
    pub fn tlbgen(&self) -> (u64, u64) {
        (self.tlbgen_local.load(Ordering::Acquire), self.tlbgen_global.load(Ordering::Acquire))
    }

    /// Writes a leaf PTE for `va`, allocating any missing interior table
    /// levels, and records the required [`TlbOp`] into the matching
    /// generation counter.
    pub fn kmap_map(&mut self, va: VirtAddr, pfn: Pfn, flags: PteFlags) -> Result<TlbOp, NuxError> {
        let l1p = pagetable::walk::<H>(self.root, va, true);
        if l1p.is_invalid() {
            return Err(NuxError::OomFrame);
        }
        let new = Pte { pfn, flags };
        let old = pagetable::set::<H>(l1p, new);
        let op = tlbop(old.present(), pte_pair(old), new.present(), pte_pair(new));
        match op {
            TlbOp::FlushAll => {
                self.tlbgen_global.fetch_add(1, Ordering::AcqRel);
            }
            TlbOp::Flush => {
                self.tlbgen_local.fetch_add(1, Ordering::AcqRel);
            }
            TlbOp::None => {}
        }
        Ok(op)
    }

    /// Present-bit-driven allocate-or-free of the backing frame for `va`
    /// to match `prot`: allocates and maps a frame if `prot` wants it
    /// present and none is mapped, or unmaps and frees the current one if
    /// `prot` wants it absent and one is mapped. A no-op if the current
    /// state already matches.
    pub fn kmap_ensure(&mut self, va: VirtAddr, prot: PteFlags) -> Result<TlbOp, NuxError> {
        let l1p = pagetable::walk::<H>(self.root, va, true);
        if l1p.is_invalid() {
            return Err(NuxError::OomFrame);
        }
        let current = pagetable::get::<H>(l1p);
        let want_present = prot.contains(PteFlags::P);

        if want_present && !current.present() {
            let pfn = self.frames.alloc(true);
            if pfn.is_invalid() {
                return Err(NuxError::OomFrame);
            }
            return self.kmap_map(va, pfn, prot);
        }
        if !want_present && current.present() {
            let freed = current.pfn;
            let op = self.kmap_map(va, Pfn::new(0), PteFlags::empty())?;
            self.frames.free(freed);
            return Ok(op);
        }
        Ok(TlbOp::None)
    }

    /// Membarrier-style synchronisation point a caller issues after a
    /// batch of [`Kmap::kmap_map`]/[`Kmap::kmap_ensure`] calls it needs
    /// every CPU to observe before proceeding. A no-op on a single-CPU
    /// host unit test; the real cross-CPU fence lives in `nux`'s
    /// TLB-shootdown orchestration, which watches these counters.
    pub fn kmap_commit(&self) {
        core::sync::atomic::fence(Ordering::SeqCst);
    }

    /// Pure query: is `va` currently backed by a present leaf? Never
    /// allocates an interior table to find out.
    #[must_use]
    pub fn kmap_mapped(&self, va: VirtAddr) -> bool {
        let l1p = pagetable::walk::<H>(self.root, va, false);
        pagetable::get::<H>(l1p).present()
    }

    /// Pure query: is every page in `[va, va+size)` currently mapped?
    #[must_use]
    pub fn kmap_mapped_range(&self, va: VirtAddr, size: u64) -> bool {
        let mut off = 0;
        while off < size {
            if !self.kmap_mapped(VirtAddr::new(va.as_u64() + off)) {
                return false;
            }
            off += PAGE_SIZE;
        }
        true
    }
}

/// The narrow interface [`KmemArena`] needs from whatever actually backs
/// its VA range with frames. Implemented for [`Kmap`] below; a test
/// harness can implement it directly to exercise brk arithmetic with no
/// paging or frame allocator in the loop at all.
pub trait KmemBacking {
    /// Ensures `[va, va+size)` — already page-aligned — is backed by
    /// present, writable frames.
    fn ensure_mapped(&mut self, va: VirtAddr, size: u64) -> Result<(), NuxError>;
    /// Unmaps and frees the frames backing `[va, va+size)`.
    fn unmap(&mut self, va: VirtAddr, size: u64);
}

impl<H: HalPaging, A: FrameAllocHooks> KmemBacking for Kmap<H, A> {
    fn ensure_mapped(&mut self, va: VirtAddr, size: u64) -> Result<(), NuxError> {
        let mut off = 0;
        while off < size {
            self.kmap_ensure(VirtAddr::new(va.as_u64() + off), PteFlags::P | PteFlags::W)?;
            off += PAGE_SIZE;
        }
        Ok(())
    }

    fn unmap(&mut self, va: VirtAddr, size: u64) {
        let mut off = 0;
        while off < size {
            let _ = self.kmap_ensure(VirtAddr::new(va.as_u64() + off), PteFlags::empty());
            off += PAGE_SIZE;
        }
    }
}

fn page_round_up(size: u64) -> u64 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Which end of a [`KmemArena`] an allocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The low end, which grows upward.
    Lo,
    /// The high end, which grows downward.
    Hi,
}

/// The two-ended `brk` heap (§4.7): `low_base <= brk[Lo] <= brk[Hi] <=
/// high_base`, a [`Zone`] coalescing allocator fronting each break, and
/// demand-mapped backing that grows with the brk and is reclaimed by
/// [`KmemArena::trim`].
pub struct KmemArena<B: KmemBacking> {
    backing: B,
    low_base: VirtAddr,
    high_base: VirtAddr,
    brk_lo: VirtAddr,
    brk_hi: VirtAddr,
    /// High-water mark: the furthest `brk_lo` has ever grown.
    maxbrk_lo: VirtAddr,
    /// High-water mark: the furthest (lowest) `brk_hi` has ever grown.
    maxbrk_hi: VirtAddr,
    allocated_lo: bool,
    allocated_hi: bool,
    zone_lo: Zone,
    zone_hi: Zone,
}

impl<B: KmemBacking> KmemArena<B> {
    /// Builds an arena over `[low_base, high_base)` with both breaks at
    /// their respective ends and nothing yet allocated. Permits
    /// `low_base == high_base` (a zero-size arena) only here, before any
    /// allocation — per §3/§9, the invariant tightens to strict
    /// inequality the moment either side allocates.
    pub fn new(backing: B, low_base: VirtAddr, high_base: VirtAddr) -> Self {
        assert!(low_base.as_u64() <= high_base.as_u64());
        Self {
            backing,
            low_base,
            high_base,
            brk_lo: low_base,
            brk_hi: high_base,
            maxbrk_lo: low_base,
            maxbrk_hi: high_base,
            allocated_lo: false,
            allocated_hi: false,
            zone_lo: Zone::new(1),
            zone_hi: Zone::new(2),
        }
    }

    fn zone(&mut self, side: Side) -> &mut Zone {
        match side {
            Side::Lo => &mut self.zone_lo,
            Side::Hi => &mut self.zone_hi,
        }
    }

    /// Grows the requested side's brk by `amount` (page-rounded),
    /// demand-mapping the newly exposed range and handing it to that
    /// side's zone as a fresh free span (coalesced with any adjoining
    /// free tail already at the boundary). Fails with
    /// [`NuxError::OomVa`] if growth would make the breaks collide.
    fn grow(&mut self, side: Side, amount: u64) -> Result<(), NuxError> {
        let amount = page_round_up(amount.max(MIN_BLOCK_SIZE));
        match side {
            Side::Lo => {
                let old_top = self.brk_lo;
                let new_top = VirtAddr::new(old_top.as_u64() + amount);
                if new_top.as_u64() >= self.brk_hi.as_u64() {
                    return Err(NuxError::OomVa);
                }
                if new_top.as_u64() > self.maxbrk_lo.as_u64() {
                    self.backing.ensure_mapped(self.maxbrk_lo, new_top.as_u64() - self.maxbrk_lo.as_u64())?;
                    self.maxbrk_lo = new_top;
                }
                self.brk_lo = new_top;
                self.zone_lo.free(old_top, amount);
            }
            Side::Hi => {
                let old_bottom = self.brk_hi;
                let new_bottom = VirtAddr::new(old_bottom.as_u64() - amount);
                if new_bottom.as_u64() <= self.brk_lo.as_u64() {
                    return Err(NuxError::OomVa);
                }
                if new_bottom.as_u64() < self.maxbrk_hi.as_u64() {
                    self.backing.ensure_mapped(new_bottom, self.maxbrk_hi.as_u64() - new_bottom.as_u64())?;
                    self.maxbrk_hi = new_bottom;
                }
                self.brk_hi = new_bottom;
                self.zone_hi.free(new_bottom, amount);
            }
        }
        Ok(())
    }

    /// Allocates `size` bytes from the requested side: a zone hit first,
    /// falling back to growing that side's brk on a miss.
    pub fn alloc(&mut self, side: Side, size: u64) -> Result<VirtAddr, NuxError> {
        if let Some((addr, _)) = self.zone(side).alloc(size) {
            self.mark_allocated(side);
            return Ok(addr);
        }
        self.grow(side, size)?;
        let (addr, _) = self.zone(side).alloc(size).ok_or(NuxError::OomVa)?;
        self.mark_allocated(side);
        Ok(addr)
    }

    fn mark_allocated(&mut self, side: Side) {
        match side {
            Side::Lo => self.allocated_lo = true,
            Side::Hi => self.allocated_hi = true,
        }
    }

    /// Returns a previous [`KmemArena::alloc`] allocation to its side's
    /// zone, coalescing with neighbours.
    pub fn free(&mut self, side: Side, addr: VirtAddr, size: u64) {
        self.zone(side).free(addr, size);
    }

    /// Shrinks both breaks by reclaiming any free span whose tail (low
    /// side) or head (high side) touches the brk, looping to absorb a
    /// chain of coalesced free blocks, then unmaps the pages between the
    /// new, smaller brk and that side's high-water mark.
    pub fn trim(&mut self) {
        let mut new_lo = self.brk_lo;
        while let Some(size) = self.zone_lo.take_tail_before(new_lo) {
            new_lo = VirtAddr::new(new_lo.as_u64() - size);
        }
        self.brk_lo = new_lo;
        if self.maxbrk_lo.as_u64() > self.brk_lo.as_u64() {
            self.backing.unmap(self.brk_lo, self.maxbrk_lo.as_u64() - self.brk_lo.as_u64());
            self.maxbrk_lo = self.brk_lo;
        }

        let mut new_hi = self.brk_hi;
        while let Some(size) = self.zone_hi.take_head_after(new_hi) {
            new_hi = VirtAddr::new(new_hi.as_u64() + size);
        }
        self.brk_hi = new_hi;
        if self.maxbrk_hi.as_u64() < self.brk_hi.as_u64() {
            self.backing.unmap(self.maxbrk_hi, self.brk_hi.as_u64() - self.maxbrk_hi.as_u64());
            self.maxbrk_hi = self.brk_hi;
        }
    }

    /// The current low and high breaks, mostly for tests and assertions.
    #[must_use]
    pub fn brks(&self) -> (VirtAddr, VirtAddr) {
        (self.brk_lo, self.brk_hi)
    }

    /// The arena's fixed bounds.
    #[must_use]
    pub fn bounds(&self) -> (VirtAddr, VirtAddr) {
        (self.low_base, self.high_base)
    }
}
