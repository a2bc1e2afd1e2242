//! APXH extension program-header types (§4.1, §6).
//!
//! These occupy the `0xAF10_0000..=0xAF10_FFFF` range of the ELF
//! `p_type` namespace, reserved for vendor/OS extensions by the ELF
//! spec's `PT_LOOS..PT_HIOS` window. Standard `PT_LOAD` lives outside
//! this range and is handled separately by [`crate::segment`].

/// Boot-info record: allocate, zero, and remember (VA, size) for a
/// structure the loader fills in last, just before the jump to the
/// kernel entry.
pub const PHT_APXH_INFO: u32 = 0xAF10_0000;
/// Reserve the VA range; back it with nothing.
pub const PHT_APXH_EMPTY: u32 = 0xAF10_0001;
/// Map physical address `0..size` at this VA as write-back: the
/// permanent direct map.
pub const PHT_APXH_PHYSMAP: u32 = 0xAF10_0002;
/// Populate a byte-per-PFN map, seeded from the firmware memory map.
pub const PHT_APXH_PFNMAP: u32 = 0xAF10_0003;
/// Populate a searchable bitmap (S-tree) covering all RAM frames.
pub const PHT_APXH_STREE: u32 = 0xAF10_0004;
/// Populate leaf page-table pages covering this VA range, leaving the
/// leaves themselves absent.
pub const PHT_APXH_PTALLOC: u32 = 0xAF10_0005;
/// Map a firmware-provided linear framebuffer, write-combining.
pub const PHT_APXH_FRAMEBUF: u32 = 0xAF10_0006;
/// Populate a packed array of memory regions.
pub const PHT_APXH_REGIONS: u32 = 0xAF10_0007;
/// Populate top-level page-table entries only, for later per-thread
/// user mappings to hang off of.
pub const PHT_APXH_TOPPTALLOC: u32 = 0xAF10_0008;
/// Install the page-table self-map at this VA.
pub const PHT_APXH_LINEAR: u32 = 0xAF10_FFFF;

/// One recognized extension segment type, classified from a raw
/// `p_type` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExtensionKind {
    /// [`PHT_APXH_INFO`].
    Info,
    /// [`PHT_APXH_EMPTY`].
    Empty,
    /// [`PHT_APXH_PHYSMAP`].
    PhysMap,
    /// [`PHT_APXH_PFNMAP`].
    PfnMap,
    /// [`PHT_APXH_STREE`].
    SearchTree,
    /// [`PHT_APXH_PTALLOC`].
    PtAlloc,
    /// [`PHT_APXH_FRAMEBUF`].
    FrameBuffer,
    /// [`PHT_APXH_REGIONS`].
    Regions,
    /// [`PHT_APXH_TOPPTALLOC`].
    TopPtAlloc,
    /// [`PHT_APXH_LINEAR`].
    Linear,
}

impl ExtensionKind {
    /// Classifies a raw `p_type`, or returns `None` for `PT_LOAD` and
    /// any other type this loader does not recognize.
    #[must_use]
    pub fn classify(p_type: u32) -> Option<Self> {
        Some(match p_type {
            PHT_APXH_INFO => Self::Info,
            PHT_APXH_EMPTY => Self::Empty,
            PHT_APXH_PHYSMAP => Self::PhysMap,
            PHT_APXH_PFNMAP => Self::PfnMap,
            PHT_APXH_STREE => Self::SearchTree,
            PHT_APXH_PTALLOC => Self::PtAlloc,
            PHT_APXH_FRAMEBUF => Self::FrameBuffer,
            PHT_APXH_REGIONS => Self::Regions,
            PHT_APXH_TOPPTALLOC => Self::TopPtAlloc,
            PHT_APXH_LINEAR => Self::Linear,
            _ => return None,
        })
    }
}
