//! Direct-map window the paging backends use to reach page-table frames
//! (§4.2). APXH's `PHYSMAP` extension program header establishes this
//! window before the kernel runs (§4.1); every `HalPaging` backend in
//! this crate assumes it covers every frame it will ever hand out as a
//! page table, and the general-purpose [`nux_mm::pfncache`] is not
//! involved — table frames are touched far too often, on far too hot a
//! path, to pay a cache lookup per PTE.

use core::sync::atomic::{AtomicU64, Ordering};

use nux_core::addr::{Pfn, VirtAddr};

static DMAP_BASE: AtomicU64 = AtomicU64::new(0);

/// Records the direct-map base VA. Called once, during early boot,
/// before the first page-table walk.
pub fn init(base: VirtAddr) {
    DMAP_BASE.store(base.as_u64(), Ordering::Release);
}

/// Translates a physical frame to its direct-map virtual address.
#[must_use]
pub fn frame_to_virt(pfn: Pfn) -> VirtAddr {
    let base = DMAP_BASE.load(Ordering::Acquire);
    debug_assert_ne!(base, 0, "nux_hal::dmap::init was never called");
    VirtAddr::new(base + pfn.to_phys().as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_to_virt_offsets_from_the_installed_base() {
        init(VirtAddr::new(0xFFFF_8000_0000_0000));
        let va = frame_to_virt(Pfn::new(3));
        assert_eq!(va.as_u64(), 0xFFFF_8000_0000_0000 + 3 * 4096);
    }
}
