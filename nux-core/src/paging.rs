//! Generic page-size machinery shared by the page-table engine and the
//! direct-map fast path's large-page promotion (§4.2).

use core::fmt;
use core::marker::PhantomData;

use crate::addr::{PhysAddr, VirtAddr};

/// A compile-time page size marker.
pub trait PageSize: Copy + Clone + PartialEq + Eq + PartialOrd + Ord + core::hash::Hash {
    /// Size of this page in bytes.
    const SIZE: u64;
    /// Human-readable name, for logging.
    const DEBUG_NAME: &'static str;
}

/// 4 KiB page — the only size every architecture in scope supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Size4KiB;
impl PageSize for Size4KiB {
    const SIZE: u64 = 4 * 1024;
    const DEBUG_NAME: &'static str = "4KiB";
}

/// 2 MiB large page (x86 PDE-level, RISC-V Sv39/48 megapage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Size2MiB;
impl PageSize for Size2MiB {
    const SIZE: u64 = 2 * 1024 * 1024;
    const DEBUG_NAME: &'static str = "2MiB";
}

/// 1 GiB huge page (x86-64 PDPE-level, RISC-V Sv48 gigapage). Not every
/// architecture/CPU supports this size; capability is a HAL query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Size1GiB;
impl PageSize for Size1GiB {
    const SIZE: u64 = 1024 * 1024 * 1024;
    const DEBUG_NAME: &'static str = "1GiB";
}

/// A virtual page of a given size, aligned down to that size's boundary.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Page<S: PageSize> {
    start: VirtAddr,
    _size: PhantomData<S>,
}

impl<S: PageSize> Page<S> {
    /// Returns the page containing `addr`, truncating to this size's alignment.
    #[must_use]
    pub const fn containing_address(addr: VirtAddr) -> Self {
        Self {
            start: VirtAddr::new(addr.as_u64() & !(S::SIZE - 1)),
            _size: PhantomData,
        }
    }

    /// Returns the base address of this page.
    #[must_use]
    pub const fn start_address(self) -> VirtAddr {
        self.start
    }
}

impl<S: PageSize> fmt::Debug for Page<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page<{}>({})", S::DEBUG_NAME, self.start)
    }
}

/// A physical frame of a given size, aligned down to that size's boundary.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame<S: PageSize> {
    start: PhysAddr,
    _size: PhantomData<S>,
}

impl<S: PageSize> PhysFrame<S> {
    /// Returns the frame containing `addr`, truncating to this size's alignment.
    #[must_use]
    pub const fn containing_address(addr: PhysAddr) -> Self {
        Self {
            start: PhysAddr::new(addr.as_u64() & !(S::SIZE - 1)),
            _size: PhantomData,
        }
    }

    /// Returns the base address of this frame.
    #[must_use]
    pub const fn start_address(self) -> PhysAddr {
        self.start
    }
}

impl<S: PageSize> fmt::Debug for PhysFrame<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysFrame<{}>({})", S::DEBUG_NAME, self.start)
    }
}

/// Picks the largest page size that can back a `map_range` step at `va`/`pa`
/// with `remaining` bytes left to map, per §4.2's large-page promotion rule:
/// 1 GiB when both ends are 1 GiB-aligned, at least 1 GiB remains, and the
/// CPU supports it; else 2 MiB under the same alignment rule; else 4 KiB.
#[must_use]
pub fn largest_aligned_step(va: u64, pa: u64, remaining: u64, allow_1gib: bool) -> u64 {
    let aligned_1g = va % Size1GiB::SIZE == 0 && pa % Size1GiB::SIZE == 0;
    let aligned_2m = va % Size2MiB::SIZE == 0 && pa % Size2MiB::SIZE == 0;

    if allow_1gib && aligned_1g && remaining >= Size1GiB::SIZE {
        Size1GiB::SIZE
    } else if aligned_2m && remaining >= Size2MiB::SIZE {
        Size2MiB::SIZE
    } else {
        Size4KiB::SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_containing_address_truncates() {
        let p = Page::<Size4KiB>::containing_address(VirtAddr::new(0x1234));
        assert_eq!(p.start_address().as_u64(), 0x1000);
    }

    #[test]
    fn largest_step_picks_1gib_when_aligned_and_allowed() {
        let step = largest_aligned_step(0, 0, Size1GiB::SIZE, true);
        assert_eq!(step, Size1GiB::SIZE);
    }

    #[test]
    fn largest_step_falls_back_without_1gib_capability() {
        let step = largest_aligned_step(0, 0, Size1GiB::SIZE, false);
        assert_eq!(step, Size2MiB::SIZE);
    }

    #[test]
    fn largest_step_falls_back_to_4kib_when_misaligned() {
        let step = largest_aligned_step(Size4KiB::SIZE, 0, Size1GiB::SIZE, true);
        assert_eq!(step, Size4KiB::SIZE);
    }

    #[test]
    fn largest_step_respects_remaining_bound() {
        let step = largest_aligned_step(0, 0, Size2MiB::SIZE - 1, true);
        assert_eq!(step, Size4KiB::SIZE);
    }
}
