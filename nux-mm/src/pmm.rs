//! Physical frame allocator (§4.3).
//!
//! One global S-tree over `maxrampfn` bits: bit set means "frame free".
//! The loader hands the kernel a pre-populated tree (every free RAM frame
//! set, everything else — MMIO, busy, the loader's own structures —
//! clear); `Pmm::new` accepts that layout directly rather than
//! rediscovering it.
//!
//! Matches the teacher's `pmm.rs` global-singleton shape: a `static`
//! holding `Option<Pmm>` behind a lock, reached only through a scoped
//! `with`/`with_mut` closure so no `'static` reference to the allocator
//! escapes its lock.

use nux_core::addr::{Pfn, PFN_INVALID};
use nux_core::stree::STree;
use nux_core::sync::rwlock::RwLock;
use nux_core::sync::SpinLock;

/// A hookable replacement for the default S-tree allocator (§4.3,
/// §9 "Function pointers for allocator hooks"): lets a test harness or a
/// quota layer intercept `alloc`/`free` without the allocator core
/// depending on a heap-allocated trait-object wrapper like `ArcSwap`.
pub trait FrameAllocHooks: Send + Sync {
    /// Allocates one frame, `low` preferring the lowest available PFN.
    fn alloc(&self, low: bool) -> Pfn;
    /// Returns a frame to the pool.
    fn free(&self, pfn: Pfn);
}

enum Hook {
    Default,
    Hooked(&'static dyn FrameAllocHooks),
}

/// The S-tree-backed physical frame allocator.
pub struct Pmm<'a> {
    tree: STree<'a>,
    maxrampfn: u64,
}

impl<'a> Pmm<'a> {
    /// Returns the number of `u64` words a tree over `maxrampfn` frames needs.
    #[must_use]
    pub fn required_words(maxrampfn: u64) -> usize {
        STree::required_words(maxrampfn as usize)
    }

    /// Builds a PMM over `storage`, already populated by the caller (the
    /// loader, or a test) with one bit per frame below `maxrampfn`: set
    /// means free.
    pub fn new(maxrampfn: u64, storage: &'a mut [u64]) -> Self {
        let bits = maxrampfn as usize;
        assert!(storage.len() >= STree::required_words(bits));
        // `STree::new` zeroes storage, so build directly over it and let
        // the caller populate bits afterwards via `mark_free`.
        Self { tree: STree::new(bits, storage), maxrampfn }
    }

    /// Marks `pfn` as free without going through the hook layer — used
    /// by the loader hand-off to seed the initial free set.
    pub fn mark_free(&mut self, pfn: Pfn) {
        assert!(pfn.as_u64() < self.maxrampfn);
        self.tree.setbit(pfn.as_u64() as usize);
    }

    /// Allocates a single frame. `low` prefers the lowest free PFN (used
    /// for DMA-constrained allocations); otherwise the highest is
    /// returned, tending to leave low memory free longer.
    /// Returns [`PFN_INVALID`] on exhaustion.
    #[must_use]
    pub fn alloc(&mut self, low: bool) -> Pfn {
        let found = if low { self.tree.find_lowest() } else { self.tree.find_highest() };
        match found {
            Some(idx) => {
                self.tree.clrbit(idx);
                Pfn::new(idx as u64)
            }
            None => PFN_INVALID,
        }
    }

    /// Returns `pfn` to the free pool.
    pub fn free(&mut self, pfn: Pfn) {
        assert!(pfn.as_u64() < self.maxrampfn, "free of out-of-range PFN");
        self.tree.setbit(pfn.as_u64() as usize);
    }
}

static HOOK: RwLock<Hook> = RwLock::new(Hook::Default);

/// Installs `hooks` as the allocator used by [`alloc`]/[`free`], atomically
/// with respect to any in-flight allocation via the guarding [`RwLock`].
pub fn install_hooks(hooks: &'static dyn FrameAllocHooks) {
    *HOOK.write() = Hook::Hooked(hooks);
}

/// Reverts to the default S-tree allocator installed by [`init`].
pub fn uninstall_hooks() {
    *HOOK.write() = Hook::Default;
}

static PMM: SpinLock<Option<Pmm<'static>>> = SpinLock::new(None);

/// Installs the global PMM singleton. Must be called exactly once, before
/// any call to [`alloc`]/[`free`].
pub fn init(maxrampfn: u64, storage: &'static mut [u64]) {
    *PMM.lock() = Some(Pmm::new(maxrampfn, storage));
}

/// Allocates a frame through the installed hooks, or the default global
/// PMM singleton if none are installed.
#[must_use]
pub fn alloc(low: bool) -> Pfn {
    match &*HOOK.read() {
        Hook::Hooked(h) => h.alloc(low),
        Hook::Default => PMM.lock().as_mut().expect("pmm not initialized").alloc(low),
    }
}

/// Frees a frame through the installed hooks, or the default global PMM
/// singleton if none are installed.
pub fn free(pfn: Pfn) {
    match &*HOOK.read() {
        Hook::Hooked(h) => h.free(pfn),
        Hook::Default => PMM.lock().as_mut().expect("pmm not initialized").free(pfn),
    }
}
