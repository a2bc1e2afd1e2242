//! Firmware memory-map ingestion (§3, §4.1, §8 scenario 4).
//!
//! APXH receives the firmware-described memory map as an already-decoded
//! slice of runs (collecting it — an E820 call, a UEFI `GetMemoryMap`, a
//! devicetree `/memory` node walk — is arch/firmware glue the loader
//! binary's `src/main.rs` owns per target; see §1's "architecture-specific
//! instruction emission, specified only through the HAL contract" carved
//! out the same way for the CPU side). This module turns that slice into
//! the normalized, non-overlapping [`RegionEntry`] runs the `REGIONS`,
//! `PFNMAP` and `STREE` extension segments are populated from.

use nux_core::bootinfo::{RegionEntry, REGION_BUSY, REGION_MMIO, REGION_RAM, REGION_UNKNOWN};
use planck_noalloc::vec::ArrayVec;

/// Maximum number of coalesced typed runs this loader can carry through
/// to the `REGIONS` extension segment. The reference loader sizes its
/// equivalent array to the firmware's own region count bound; a few
/// dozen runs comfortably covers any real E820/UEFI/devicetree map plus
/// the handful of synthetic splits the pinned-range override and the
/// final busy-backfill introduce.
pub const MAX_REGIONS: usize = 128;

/// One firmware-reported memory run, already classified into this
/// loader's four-way region model (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareRegion {
    /// First PFN of the run.
    pub pfn: u64,
    /// Length of the run, in frames.
    pub len: u64,
    /// The run's type.
    pub kind: FirmwareRegionKind,
}

/// Firmware-reported region classification, collapsed to this loader's
/// region model. Firmware interfaces report richer taxonomies (E820's
/// ACPI-reclaimable/NVS, UEFI's many `EfiMemoryType` values); the loader
/// only ever needs to know "usable as general RAM" vs. "never
/// allocatable", so every firmware-specific kind maps to one of these
/// two plus `Unknown` for anything the `src/main.rs` glue didn't
/// recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareRegionKind {
    /// Usable general-purpose RAM.
    Ram,
    /// Never allocatable: MMIO, reserved, ACPI NVS, firmware-owned.
    Mmio,
    /// Present in the map but of a kind the loader didn't classify.
    Unknown,
}

impl FirmwareRegion {
    fn region_type(self) -> u8 {
        match self.kind {
            FirmwareRegionKind::Ram => REGION_RAM,
            FirmwareRegionKind::Mmio => REGION_MMIO,
            FirmwareRegionKind::Unknown => REGION_UNKNOWN,
        }
    }

    /// One past the last PFN this run covers.
    #[must_use]
    pub fn end_pfn(self) -> u64 {
        self.pfn + self.len
    }
}

/// A physical range forced to a fixed classification regardless of what
/// firmware reported (§3: "pinned regions... are forced to MMIO"; §8
/// scenario 4's `[0xA0..0x100] = MMIO` on x86).
#[derive(Debug, Clone, Copy)]
pub struct PinnedRange {
    /// First PFN of the pinned range.
    pub pfn: u64,
    /// Length of the pinned range, in frames.
    pub len: u64,
}

/// The x86 legacy VGA/BIOS hole, permanently `MMIO` (§3, §8 scenario 4).
pub const X86_LEGACY_HOLE: PinnedRange = PinnedRange { pfn: 0xA0, len: 0x100 - 0xA0 };

/// Applies every pinned range unconditionally on top of the firmware
/// map, splitting any firmware run the pin partially overlaps, then
/// returns the coalesced, sorted, non-overlapping result (§3 invariant).
///
/// # Panics
///
/// Panics if more than [`MAX_REGIONS`] distinct runs would result —
/// this loader has no dynamic allocation to fall back to.
#[must_use]
pub fn normalize(
    firmware: &[FirmwareRegion],
    pinned: &[PinnedRange],
) -> ArrayVec<FirmwareRegion, MAX_REGIONS> {
    let mut out: ArrayVec<FirmwareRegion, MAX_REGIONS> = ArrayVec::new();
    for &region in firmware {
        out.push(region);
    }
    sort_by_pfn(&mut out);

    for &pin in pinned {
        apply_pin(&mut out, pin);
    }
    sort_by_pfn(&mut out);
    coalesce(&mut out)
}

fn sort_by_pfn(regions: &mut ArrayVec<FirmwareRegion, MAX_REGIONS>) {
    // Insertion sort: region counts here are firmware-map-sized (tens,
    // not thousands), and this runs exactly once per boot.
    for i in 1..regions.len() {
        let mut j = i;
        while j > 0 && regions[j - 1].pfn > regions[j].pfn {
            let tmp = regions[j - 1];
            regions[j - 1] = regions[j];
            regions[j] = tmp;
            j -= 1;
        }
    }
}

fn apply_pin(regions: &mut ArrayVec<FirmwareRegion, MAX_REGIONS>, pin: PinnedRange) {
    let pin_end = pin.pfn + pin.len;
    let mut replaced: ArrayVec<FirmwareRegion, MAX_REGIONS> = ArrayVec::new();
    for &r in regions.iter() {
        let r_end = r.end_pfn();
        if r_end <= pin.pfn || r.pfn >= pin_end {
            replaced.push(r);
            continue;
        }
        if r.pfn < pin.pfn {
            replaced.push(FirmwareRegion { pfn: r.pfn, len: pin.pfn - r.pfn, kind: r.kind });
        }
        let overlap_start = r.pfn.max(pin.pfn);
        let overlap_end = r_end.min(pin_end);
        replaced.push(FirmwareRegion {
            pfn: overlap_start,
            len: overlap_end - overlap_start,
            kind: FirmwareRegionKind::Mmio,
        });
        if r_end > pin_end {
            replaced.push(FirmwareRegion { pfn: pin_end, len: r_end - pin_end, kind: r.kind });
        }
    }
    // The pin itself may cover a gap no firmware run described at all;
    // ensure it is represented even then.
    if !replaced.iter().any(|r| r.pfn <= pin.pfn && r.end_pfn() >= pin_end) {
        replaced.push(FirmwareRegion { pfn: pin.pfn, len: pin.len, kind: FirmwareRegionKind::Mmio });
    }
    *regions = replaced;
}

fn coalesce(regions: &mut ArrayVec<FirmwareRegion, MAX_REGIONS>) -> ArrayVec<FirmwareRegion, MAX_REGIONS> {
    let mut out: ArrayVec<FirmwareRegion, MAX_REGIONS> = ArrayVec::new();
    for &r in regions.iter() {
        if r.len == 0 {
            continue;
        }
        if !out.is_empty() {
            let last_idx = out.len() - 1;
            let last = out[last_idx];
            if last.kind == r.kind && last.end_pfn() == r.pfn {
                out[last_idx].len += r.len;
                continue;
            }
        }
        out.push(r);
    }
    out
}

/// Highest PFN any `Ram` run's upper bound reaches (§3's `maxrampfn`).
#[must_use]
pub fn max_ram_pfn(regions: &[FirmwareRegion]) -> u64 {
    regions.iter().filter(|r| r.kind == FirmwareRegionKind::Ram).map(FirmwareRegion::end_pfn).max().unwrap_or(0)
}

/// One past the highest PFN any run (of any kind) reaches (§3's `maxpfn`).
#[must_use]
pub fn max_pfn(regions: &[FirmwareRegion]) -> u64 {
    regions.iter().map(FirmwareRegion::end_pfn).max().unwrap_or(0)
}

/// Fills `pfnmap[pfn]` with this run's region-type byte for every PFN it
/// covers, up to `pfnmap.len()`. Frames the map never describes default
/// to whatever `pfnmap` was initialized to (`REGION_UNKNOWN`, by
/// convention — the loader zero-fills the `PFNMAP` segment before
/// calling this, and `REGION_UNKNOWN == 0`).
pub fn fill_pfnmap(regions: &[FirmwareRegion], pfnmap: &mut [u8]) {
    for r in regions {
        let end = r.end_pfn().min(pfnmap.len() as u64);
        if r.pfn >= end {
            continue;
        }
        for pfn in r.pfn..end {
            pfnmap[pfn as usize] = r.region_type();
        }
    }
}

/// Marks `[pfn, pfn+count)` as [`REGION_BUSY`] in `pfnmap` — the
/// finalization-stage back-fill (§4.1) for frames the loader itself
/// consumed out of its boot arena.
pub fn mark_pfnmap_busy(pfnmap: &mut [u8], pfn: u64, count: u64) {
    let end = (pfn + count).min(pfnmap.len() as u64);
    for p in pfn..end {
        pfnmap[p as usize] = REGION_BUSY;
    }
}

/// Writes one [`RegionEntry`] per coalesced run into `out`, returning the
/// number written. Mirrors [`fill_pfnmap`]'s source data but at the
/// `REGIONS` segment's coarser, run-length-encoded granularity.
pub fn fill_regions(regions: &[FirmwareRegion], out: &mut [RegionEntry]) -> usize {
    let n = regions.len().min(out.len());
    for (slot, r) in out.iter_mut().zip(regions.iter()).take(n) {
        *slot = RegionEntry::new(r.region_type(), r.pfn, r.len);
    }
    n
}

/// Sets one S-tree bit per free `Ram` frame below `bits.len() /
/// PAGE_SHIFT`'s implied bit count, i.e. the kernel's initial free-frame
/// map (§4.3: "bit set means free", matching [`nux_mm::pmm::Pmm`]'s
/// convention).
pub fn populate_stree_free_bits(regions: &[FirmwareRegion], tree: &mut nux_core::stree::STree<'_>) {
    let cap = tree.len() as u64;
    for r in regions {
        if r.kind != FirmwareRegionKind::Ram {
            continue;
        }
        let end = r.end_pfn().min(cap);
        for pfn in r.pfn..end {
            tree.setbit(pfn as usize);
        }
    }
}
