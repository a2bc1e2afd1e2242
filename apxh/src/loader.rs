//! The extension-segment dispatch loop (§4.1): turns an ELF payload's
//! program headers into the kernel's initial page tables.
//!
//! This is the part of APXH that is pure state machine — no firmware
//! calls, no real hardware access — so it is generic over [`LoaderMem`]
//! exactly like [`nux_mm::pagetable`] is generic over `HalPaging`, and is
//! `cargo test`-able against an in-process software model (see the `tests`
//! module below). The `apxh` binary's `src/main.rs` supplies the real
//! per-arch `LoaderMem` impl, backed by [`crate::arena::BootArena`] and
//! identity-mapped physical access.

use nux_core::addr::{Pfn, VirtAddr, PAGE_SIZE};
use nux_core::bootinfo::{
    BootInfo, FramebufferDescriptor, PlatformDescriptor, RegionEntry, StreeHeader, BOOTINFO_MAGIC,
};
use nux_core::pte::{Pte, PteFlags};
use nux_core::stree::STree;
use nux_elf::extension::ExtensionKind;
use nux_elf::header::ProgramHeader;
use nux_elf::segment::ElfFile;
use planck_noalloc::vec::ArrayVec;

use crate::arena::FrameSource;
use crate::memmap::{self, FirmwareRegion, FirmwareRegionKind};

/// Maximum number of distinct `INFO`/`PFNMAP`/`STREE`/`REGIONS`/`FRAMEBUF`
/// segments this loader remembers across the single dispatch pass, for
/// finalization (§4.1). One of each is the expected case; the array is
/// generous rather than exact since a second, unused record of a kind
/// costs nothing but a few bytes of loader stack.
const MAX_TRACKED_SEGMENTS: usize = 8;

/// Upper bound, in `u64` words, on the S-tree this loader can build
/// directly on its own stack while populating the `STREE` segment (§4.1).
/// `STree::required_words` grows as roughly `bits / 63`, so this covers
/// orders up to the point a tree needs more than 32 KiB of scratch —
/// generous for the small-to-medium RAM configurations this exercise
/// targets; a production loader sizing for multi-terabyte hosts would
/// carve this scratch out of boot-arena frames instead of the stack.
const MAX_BOOT_STREE_WORDS: usize = 4096;

/// What the loader needs from its host to read the firmware-described
/// memory and write page-table and payload bytes into physical memory
/// during construction (§4.1, §4.2).
///
/// This is a narrower surface than [`nux_mm::pagetable::HalPaging`]: the
/// loader never re-reads an existing leaf to merge flags (every leaf it
/// writes is either fresh or an outright overwrite it is allowed to make
/// unconditionally), and — critically — it is a trait of `&mut self`
/// methods rather than associated functions, because APXH has no global
/// PMM to reach for the way `nux-hal`'s real `HalPaging` impls do
/// (§4.3 doesn't exist until the kernel itself takes over). A real
/// implementation closes over a [`crate::arena::BootArena`]; the test
/// model below closes over a `HashMap`.
pub trait LoaderMem: FrameSource {
    /// Levels from the root (level 0) to the native leaf level
    /// (`LEVELS - 1`) inclusive. Mirrors `HalPaging::LEVELS`.
    const LEVELS: usize;

    /// Whether this build/CPU can install a 1 GiB leaf.
    fn supports_1gib(&self) -> bool;

    /// Whether `va` falls in this paging mode's user half.
    fn is_user_va(&self, va: VirtAddr) -> bool;

    /// Table index `va` uses at `level`.
    fn index_at(&self, level: usize, va: VirtAddr) -> usize;

    /// Reads the entry at `index` of the table at `table_pfn`.
    fn read_slot(&mut self, table_pfn: Pfn, index: usize) -> Pte;

    /// Writes the entry, returning the previous contents.
    fn write_slot(&mut self, table_pfn: Pfn, index: usize, pte: Pte) -> Pte;
}

fn link_flags<M: LoaderMem>(mem: &M, va: VirtAddr) -> PteFlags {
    let mut f = PteFlags::P | PteFlags::W;
    if mem.is_user_va(va) {
        f |= PteFlags::U;
    }
    f
}

/// Descends from `root` towards `va`'s leaf, allocating and linking any
/// missing interior table, stopping after `depth` levels have been
/// resolved (`depth == M::LEVELS - 1` walks to the leaf table and returns
/// its frame; a smaller `depth` is how `PTALLOC`/`TOPPTALLOC` stop short
/// of installing a leaf, per §4.1's table).
///
/// Returns `None` on allocator exhaustion.
fn ensure_table<M: LoaderMem>(mem: &mut M, root: Pfn, va: VirtAddr, depth: usize) -> Option<Pfn> {
    let mut table = root;
    for level in 0..depth {
        let idx = mem.index_at(level, va);
        let entry = mem.read_slot(table, idx);
        if entry.present() {
            table = entry.pfn;
        } else {
            let child = mem.alloc_frame()?;
            mem.frame_bytes_mut(child).fill(0);
            let flags = link_flags(mem, va);
            mem.write_slot(table, idx, Pte { pfn: child, flags });
            table = child;
        }
    }
    Some(table)
}

/// Writes one native-size leaf, descending through (and allocating, if
/// needed) every interior level first. Used by every segment kind that
/// installs individual present leaves at native page granularity (`LOAD`,
/// `INFO`, `PFNMAP`, `STREE`, `REGIONS`, `FRAMEBUF`).
fn map_leaf<M: LoaderMem>(mem: &mut M, root: Pfn, va: VirtAddr, pfn: Pfn, flags: PteFlags) -> Option<()> {
    let table = ensure_table(mem, root, va, M::LEVELS - 1)?;
    let idx = mem.index_at(M::LEVELS - 1, va);
    mem.write_slot(table, idx, Pte { pfn, flags });
    Some(())
}

fn level_for_page_size<M: LoaderMem>(size: u64) -> usize {
    use nux_core::paging::{PageSize, Size1GiB, Size2MiB, Size4KiB};
    if size == Size1GiB::SIZE {
        M::LEVELS - 3
    } else if size == Size2MiB::SIZE {
        M::LEVELS - 2
    } else {
        debug_assert_eq!(size, Size4KiB::SIZE);
        M::LEVELS - 1
    }
}

/// Opportunistic large-page direct map (§4.2's `map_range`, re-expressed
/// over [`LoaderMem`] instead of `HalPaging`): the loader's `PHYSMAP`
/// segment is the one construction step that can cover hundreds of
/// gigabytes, so it must promote to 2 MiB/1 GiB leaves exactly like the
/// kernel's own `map_range` or it would exhaust the boot arena mapping all
/// of physical memory at 4 KiB.
fn map_physmap<M: LoaderMem>(mem: &mut M, root: Pfn, va: VirtAddr, size: u64, flags: PteFlags) -> Option<()> {
    let mut off = 0u64;
    while off < size {
        let cur_va = VirtAddr::new(va.as_u64() + off);
        let cur_pa = off; // PHYSMAP identity-maps PA 0.. at `va`.
        let remaining = size - off;
        let step =
            nux_core::paging::largest_aligned_step(cur_va.as_u64(), cur_pa, remaining, mem.supports_1gib());
        let leaf_level = level_for_page_size::<M>(step);
        let table = ensure_table(mem, root, cur_va, leaf_level)?;
        let idx = mem.index_at(leaf_level, cur_va);
        mem.write_slot(table, idx, Pte { pfn: Pfn::new(cur_pa >> nux_core::addr::PAGE_SHIFT), flags });
        off += step;
    }
    Some(())
}

/// `PTALLOC`/`TOPPTALLOC`: ensures every interior table down to `depth`
/// exists for each native page covered by `[va, va+size)`, writing no
/// leaves. One call per leaf-table-sized chunk of the range, since that's
/// the coarsest granularity at which two different VAs are guaranteed to
/// share (or not share) an interior table.
fn ensure_ranges_tabled<M: LoaderMem>(mem: &mut M, root: Pfn, va: VirtAddr, size: u64, depth: usize) -> Option<()> {
    // The table `ensure_table(.., depth)` returns is shared by every VA
    // whose indices agree through level `depth - 1`, i.e. a span of
    // `PAGE_SIZE * 512^(LEVELS - depth)` bytes — one step per span is
    // enough to touch every such table without revisiting one twice.
    let chunk = 1u64 << (nux_core::addr::PAGE_SHIFT as u64 + 9 * (M::LEVELS - depth) as u64);
    let mut off = 0u64;
    while off < size {
        ensure_table(mem, root, VirtAddr::new(va.as_u64() + off), depth)?;
        off += chunk;
    }
    Some(())
}

/// Allocates and zeroes `ceil(size / PAGE_SIZE)` frames, maps each at
/// `va + n*PAGE_SIZE` with `flags`, and returns the first frame's PFN
/// (the loader's regions are always allocated ascending by
/// [`crate::arena::BootArena::alloc`], so the whole run is contiguous —
/// finalization locates a record's backing bytes from just this one PFN).
fn alloc_and_map_zeroed<M: LoaderMem>(
    mem: &mut M,
    root: Pfn,
    va: VirtAddr,
    size: u64,
    flags: PteFlags,
) -> Option<Pfn> {
    let pages = size.div_ceil(PAGE_SIZE);
    let mut first = None;
    for i in 0..pages {
        let pfn = mem.alloc_frame()?;
        if first.is_none() {
            first = Some(pfn);
        }
        mem.frame_bytes_mut(pfn).fill(0);
        map_leaf(mem, root, VirtAddr::new(va.as_u64() + i * PAGE_SIZE), pfn, flags)?;
    }
    first
}

fn flags_from_elf(elf_flags: u32, user: bool) -> PteFlags {
    const PF_X: u32 = 1;
    const PF_W: u32 = 2;
    let mut f = PteFlags::P;
    if elf_flags & PF_W != 0 {
        f |= PteFlags::W;
    }
    if elf_flags & PF_X != 0 {
        f |= PteFlags::X;
    }
    if user {
        f |= PteFlags::U;
    }
    f
}

/// Writes one ELF `PT_LOAD` segment: copies `fsize` file bytes, zero-fills
/// the rest up to `memsz`, mapped one native leaf at a time with the
/// segment's own RWX flags (§4.1's `LOAD` row, §8 scenario 1).
fn load_segment<M: LoaderMem>(
    mem: &mut M,
    root: Pfn,
    vaddr: u64,
    data: &[u8],
    memsz: u64,
    elf_flags: u32,
    user: bool,
) -> Result<(), LoaderError> {
    let flags = flags_from_elf(elf_flags, user);
    let pages = memsz.div_ceil(PAGE_SIZE);
    for i in 0..pages {
        let page_off = i * PAGE_SIZE;
        let va = VirtAddr::new(vaddr + page_off);
        let pfn = mem.alloc_frame().ok_or(LoaderError::OutOfFrames)?;
        let bytes = mem.frame_bytes_mut(pfn);
        bytes.fill(0);
        let file_start = page_off.min(data.len() as u64) as usize;
        let file_end = (page_off + PAGE_SIZE).min(data.len() as u64) as usize;
        if file_end > file_start {
            bytes[..file_end - file_start].copy_from_slice(&data[file_start..file_end]);
        }
        map_leaf(mem, root, va, pfn, flags).ok_or(LoaderError::OutOfFrames)?;
    }
    Ok(())
}

/// Why [`build_address_space`] could not finish construction (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderError {
    /// The boot arena (or test model) ran out of frames.
    OutOfFrames,
    /// More distinct tracked segments were present than
    /// [`MAX_TRACKED_SEGMENTS`] can hold.
    TooManySegments,
    /// The normalized firmware memory map has more runs, or `maxrampfn`
    /// implies a bigger S-tree, than the corresponding segment's backing
    /// (or this loader's fixed scratch budget) can hold.
    SegmentTooSmall,
}

/// Everything [`build_address_space`] needs that isn't reachable purely
/// through the ELF images and [`LoaderMem`] (§4.1, §6).
pub struct BuildInput<'a> {
    /// The kernel ELF image.
    pub kernel: ElfFile<'a>,
    /// The optional userspace stub ELF image.
    pub user: Option<ElfFile<'a>>,
    /// The normalized, pin-applied, non-overlapping firmware memory map
    /// (the output of [`memmap::normalize`]).
    pub regions: &'a [FirmwareRegion],
    /// How this boot's firmware was discovered.
    pub platform: PlatformDescriptor,
    /// The framebuffer this boot found, if any.
    pub framebuffer: FramebufferDescriptor,
}

/// What the kernel needs back from construction to make the jump (§4.1's
/// trampoline hand-off).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOutput {
    /// The root frame of the freshly built page table.
    pub root: Pfn,
    /// The kernel's ELF entry point (still a *virtual* address — the
    /// trampoline jumps here only after switching to `root`).
    pub entry: VirtAddr,
    /// The userspace stub's entry point, or `VirtAddr::new(0)` if this
    /// boot carries no user payload (§3 `uctxt`/`BootInfo::uentry`).
    pub uentry: VirtAddr,
}

#[derive(Clone, Copy)]
struct TrackedSegment {
    kind: ExtensionKind,
    first_pfn: Pfn,
    size: u64,
}

/// Runs the full construction order of §4.1 against `input`, using `mem`
/// for every frame allocation and page-table write, and returns the root
/// frame plus the kernel/user entry points the trampoline needs.
///
/// # Errors
///
/// Returns [`LoaderError`] on allocator exhaustion or an oversized
/// `REGIONS`/`STREE` segment — both fatal per §7, left for the caller
/// (`src/main.rs`) to turn into a print-and-halt.
pub fn build_address_space<M: LoaderMem>(input: &BuildInput<'_>, mem: &mut M) -> Result<BuildOutput, LoaderError> {
    let root = mem.alloc_frame().ok_or(LoaderError::OutOfFrames)?;
    mem.frame_bytes_mut(root).fill(0);

    let mut tracked: ArrayVec<TrackedSegment, MAX_TRACKED_SEGMENTS> = ArrayVec::new();
    let maxrampfn = memmap::max_ram_pfn(input.regions);
    let maxpfn = memmap::max_pfn(input.regions);

    // Single pass, kernel then (if present) user image, program headers
    // in file order — §4.1: "the INFO region's population... happens
    // inline as its program header is processed, in file order, alongside
    // every other header".
    process_image(&mut tracked, root, input.kernel, false, input.regions, maxpfn, mem)?;
    if let Some(user) = input.user {
        process_image(&mut tracked, root, user, true, input.regions, maxpfn, mem)?;
    }

    finalize(&tracked, input, maxrampfn, maxpfn, mem)?;

    Ok(BuildOutput {
        root,
        entry: VirtAddr::new(input.kernel.entry_point()),
        uentry: input.user.map_or(VirtAddr::new(0), |u| VirtAddr::new(u.entry_point())),
    })
}

fn process_image<M: LoaderMem>(
    tracked: &mut ArrayVec<TrackedSegment, MAX_TRACKED_SEGMENTS>,
    root: Pfn,
    elf: ElfFile<'_>,
    user: bool,
    regions: &[FirmwareRegion],
    maxpfn: u64,
    mem: &mut M,
) -> Result<(), LoaderError> {
    for seg in elf.load_segments() {
        load_segment(mem, root, seg.vaddr, seg.data, seg.memsz, seg.flags, user)?;
    }
    for (kind, ph) in elf.extension_segments() {
        process_extension(tracked, root, kind, &ph, regions, maxpfn, mem)?;
    }
    Ok(())
}

fn process_extension<M: LoaderMem>(
    tracked: &mut ArrayVec<TrackedSegment, MAX_TRACKED_SEGMENTS>,
    root: Pfn,
    kind: ExtensionKind,
    ph: &ProgramHeader,
    regions: &[FirmwareRegion],
    maxpfn: u64,
    mem: &mut M,
) -> Result<(), LoaderError> {
    let va = VirtAddr::new(ph.vaddr);
    let kernel_rw = PteFlags::P | PteFlags::W;

    match kind {
        ExtensionKind::Empty => {
            // "Reserve the VA range, allocate nothing" (§4.1): no page
            // table or frame side effect at all.
        }
        ExtensionKind::Info => {
            let first = alloc_and_map_zeroed(mem, root, va, ph.memsz, kernel_rw).ok_or(LoaderError::OutOfFrames)?;
            track(tracked, kind, first, ph.memsz)?;
        }
        ExtensionKind::PhysMap => {
            map_physmap(mem, root, va, ph.memsz, kernel_rw).ok_or(LoaderError::OutOfFrames)?;
        }
        ExtensionKind::Linear => {
            let idx = mem.index_at(0, va);
            mem.write_slot(root, idx, Pte { pfn: root, flags: kernel_rw });
        }
        ExtensionKind::PtAlloc => {
            ensure_ranges_tabled(mem, root, va, ph.memsz, M::LEVELS - 1).ok_or(LoaderError::OutOfFrames)?;
        }
        ExtensionKind::TopPtAlloc => {
            ensure_ranges_tabled(mem, root, va, ph.memsz, 1).ok_or(LoaderError::OutOfFrames)?;
        }
        ExtensionKind::PfnMap => {
            if ph.memsz < maxpfn {
                return Err(LoaderError::SegmentTooSmall);
            }
            let first = alloc_and_map_zeroed(mem, root, va, ph.memsz, kernel_rw).ok_or(LoaderError::OutOfFrames)?;
            fill_pfnmap_backing(mem, first, ph.memsz, regions);
            track(tracked, kind, first, ph.memsz)?;
        }
        ExtensionKind::SearchTree => {
            let first = alloc_and_map_zeroed(mem, root, va, ph.memsz, kernel_rw).ok_or(LoaderError::OutOfFrames)?;
            track(tracked, kind, first, ph.memsz)?;
            // Content fill happens once the segment's header size has
            // been checked against this loader's fixed scratch budget.
        }
        ExtensionKind::Regions => {
            let first = alloc_and_map_zeroed(mem, root, va, ph.memsz, kernel_rw).ok_or(LoaderError::OutOfFrames)?;
            track(tracked, kind, first, ph.memsz)?;
        }
        ExtensionKind::FrameBuffer => {
            let first = alloc_and_map_zeroed(mem, root, va, ph.memsz, kernel_rw).ok_or(LoaderError::OutOfFrames)?;
            track(tracked, kind, first, ph.memsz)?;
        }
    }
    Ok(())
}

fn track(
    tracked: &mut ArrayVec<TrackedSegment, MAX_TRACKED_SEGMENTS>,
    kind: ExtensionKind,
    first_pfn: Pfn,
    size: u64,
) -> Result<(), LoaderError> {
    if tracked.is_full() {
        return Err(LoaderError::TooManySegments);
    }
    tracked.push(TrackedSegment { kind, first_pfn, size });
    Ok(())
}

fn order_for(maxrampfn: u64) -> u8 {
    let mut order = 0u8;
    while (1u64 << order) < maxrampfn.max(1) {
        order += 1;
    }
    order
}

fn write_bytes_at<M: LoaderMem>(mem: &mut M, first_pfn: Pfn, byte_off: u64, bytes: &[u8]) {
    let page = byte_off / PAGE_SIZE;
    let in_page = (byte_off % PAGE_SIZE) as usize;
    debug_assert!(in_page + bytes.len() <= PAGE_SIZE as usize, "write crosses a page boundary");
    let pfn = Pfn::new(first_pfn.as_u64() + page);
    mem.frame_bytes_mut(pfn)[in_page..in_page + bytes.len()].copy_from_slice(bytes);
}

fn read_bytes_at<M: LoaderMem>(mem: &mut M, first_pfn: Pfn, byte_off: u64, out: &mut [u8]) {
    let page = byte_off / PAGE_SIZE;
    let in_page = (byte_off % PAGE_SIZE) as usize;
    debug_assert!(in_page + out.len() <= PAGE_SIZE as usize, "read crosses a page boundary");
    let pfn = Pfn::new(first_pfn.as_u64() + page);
    out.copy_from_slice(&mem.frame_bytes_mut(pfn)[in_page..in_page + out.len()]);
}

fn struct_bytes<T: Copy>(value: &T) -> [u8; 64] {
    // Every wire struct this module serializes (`BootInfo`, `StreeHeader`,
    // `RegionEntry`) is well under 64 bytes; callers slice to the real
    // size via `core::mem::size_of::<T>()`.
    let mut out = [0u8; 64];
    let size = core::mem::size_of::<T>();
    debug_assert!(size <= out.len());
    // SAFETY: `T: Copy` and every caller passes one of this module's
    // `#[repr(C)]` wire structs (`nux_core::bootinfo`) — reading it as
    // bytes is exactly what the wire format is for.
    unsafe {
        core::ptr::copy_nonoverlapping((value as *const T).cast::<u8>(), out.as_mut_ptr(), size);
    }
    out
}

fn region_byte(kind: FirmwareRegionKind) -> u8 {
    match kind {
        FirmwareRegionKind::Ram => nux_core::bootinfo::REGION_RAM,
        FirmwareRegionKind::Mmio => nux_core::bootinfo::REGION_MMIO,
        FirmwareRegionKind::Unknown => nux_core::bootinfo::REGION_UNKNOWN,
    }
}

/// Fills one page's worth of `pfnmap` bytes, where `window[i]` corresponds
/// to absolute PFN `base_pfn + i` — the per-page counterpart to
/// [`memmap::fill_pfnmap`], needed here because the segment's backing is
/// only reachable one frame at a time through [`FrameSource::frame_bytes_mut`].
fn fill_pfnmap_window(regions: &[FirmwareRegion], window: &mut [u8], base_pfn: u64) {
    let window_end = base_pfn + window.len() as u64;
    for r in regions {
        let seg_start = r.pfn.max(base_pfn);
        let seg_end = r.end_pfn().min(window_end);
        if seg_start >= seg_end {
            continue;
        }
        let byte = region_byte(r.kind);
        for pfn in seg_start..seg_end {
            window[(pfn - base_pfn) as usize] = byte;
        }
    }
}

fn fill_pfnmap_backing<M: LoaderMem>(mem: &mut M, first_pfn: Pfn, size: u64, regions: &[FirmwareRegion]) {
    let pages = size.div_ceil(PAGE_SIZE);
    for i in 0..pages {
        let pfn = Pfn::new(first_pfn.as_u64() + i);
        let start = i * PAGE_SIZE;
        let end = ((i + 1) * PAGE_SIZE).min(size);
        let len = (end - start) as usize;
        fill_pfnmap_window(regions, &mut mem.frame_bytes_mut(pfn)[..len], start);
    }
}

/// Marks `used_pfn` as `BUSY` inside the `pfnmap` segment's own backing,
/// if it falls within the map.
///
/// Takes a raw pointer rather than `&mut M` because the only caller,
/// [`finalize`], drives this from inside the closure handed to
/// [`FrameSource::for_each_used_frame`] — a `&self` method whose borrow
/// is still live at the call site.
///
/// # Safety
///
/// `mem` must point to a valid, uniquely-owned `M` for the duration of
/// the call. `for_each_used_frame`'s own implementation only reads its
/// bitmap bookkeeping; it never touches the bytes this function writes,
/// so the reborrow this introduces cannot alias that call's `&self`.
unsafe fn mark_pfnmap_busy_raw<M: LoaderMem>(mem: *mut M, pfnmap_first_pfn: Pfn, maxpfn: u64, used_pfn: Pfn) {
    let off = used_pfn.as_u64();
    if off < maxpfn {
        // SAFETY: see function-level safety comment.
        write_bytes_at(unsafe { &mut *mem }, pfnmap_first_pfn, off, &[nux_core::bootinfo::REGION_BUSY]);
    }
}

fn build_stree<M: LoaderMem>(
    mem: &mut M,
    first_pfn: Pfn,
    order: u8,
    regions: &[FirmwareRegion],
) -> Result<(), LoaderError> {
    let bits = 1usize << order;
    let words = STree::required_words(bits);
    if words > MAX_BOOT_STREE_WORDS {
        return Err(LoaderError::SegmentTooSmall);
    }
    let header = StreeHeader::new(order, core::mem::size_of::<StreeHeader>() as u16);
    write_bytes_at(mem, first_pfn, 0, &struct_bytes(&header)[..core::mem::size_of::<StreeHeader>()]);

    let mut storage = [0u64; MAX_BOOT_STREE_WORDS];
    {
        let mut tree = STree::new(bits, &mut storage[..words]);
        memmap::populate_stree_free_bits(regions, &mut tree);
    }
    let header_size = core::mem::size_of::<StreeHeader>() as u64;
    for (i, word) in storage[..words].iter().enumerate() {
        write_bytes_at(mem, first_pfn, header_size + (i as u64) * 8, &word.to_le_bytes());
    }
    Ok(())
}

/// Reloads the `STREE` segment's words into `storage`, clears one bit per
/// loader-consumed RAM frame, and writes the result back — the §4.1
/// finalization step undoing exactly the bits the boot arena itself used.
fn clear_stree_for_used_frames<M: LoaderMem>(
    mem: &mut M,
    first_pfn: Pfn,
    order: u8,
    maxrampfn: u64,
) -> Result<(), LoaderError> {
    let bits = 1usize << order;
    let words = STree::required_words(bits);
    if words > MAX_BOOT_STREE_WORDS {
        return Err(LoaderError::SegmentTooSmall);
    }
    let header_size = core::mem::size_of::<StreeHeader>() as u64;
    let mut storage = [0u64; MAX_BOOT_STREE_WORDS];
    for (i, word) in storage[..words].iter_mut().enumerate() {
        let mut buf = [0u8; 8];
        read_bytes_at(mem, first_pfn, header_size + (i as u64) * 8, &mut buf);
        *word = u64::from_le_bytes(buf);
    }
    {
        let mut tree = STree::new(bits, &mut storage[..words]);
        mem.for_each_used_frame(&mut |used_pfn| {
            let off = used_pfn.as_u64();
            if off < maxrampfn && tree.testbit(off as usize) {
                tree.clrbit(off as usize);
            }
        });
    }
    for (i, word) in storage[..words].iter().enumerate() {
        write_bytes_at(mem, first_pfn, header_size + (i as u64) * 8, &word.to_le_bytes());
    }
    Ok(())
}

fn finalize<M: LoaderMem>(
    tracked: &[TrackedSegment],
    input: &BuildInput<'_>,
    maxrampfn: u64,
    maxpfn: u64,
    mem: &mut M,
) -> Result<(), LoaderError> {
    let info = tracked.iter().find(|t| t.kind == ExtensionKind::Info).copied();
    let pfnmap = tracked.iter().find(|t| t.kind == ExtensionKind::PfnMap).copied();
    let stree = tracked.iter().find(|t| t.kind == ExtensionKind::SearchTree).copied();
    let regions_seg = tracked.iter().find(|t| t.kind == ExtensionKind::Regions).copied();

    if let Some(stree) = stree {
        let order = order_for(maxrampfn);
        build_stree(mem, stree.first_pfn, order, input.regions)?;
    }

    // 1. INFO is filled with final content.
    if let Some(info) = info {
        let bi = BootInfo {
            magic: BOOTINFO_MAGIC,
            maxrampfn,
            maxpfn,
            numregions: input.regions.len() as u64,
            uentry: input.user.map_or(0, ElfFile::entry_point),
            framebuffer: input.framebuffer,
            platform: input.platform,
        };
        write_bytes_at(mem, info.first_pfn, 0, &struct_bytes(&bi)[..core::mem::size_of::<BootInfo>()]);
    }

    // 2. PFNMAP is back-filled with BUSY for every frame APXH itself
    //    consumed (§4.1): the loader's own frame source already knows
    //    exactly which PFNs those are.
    if let Some(pfnmap) = pfnmap {
        let mem_ptr: *mut M = mem;
        // SAFETY: see `mark_pfnmap_busy_raw`.
        unsafe {
            (*mem_ptr).for_each_used_frame(&mut |used_pfn| {
                mark_pfnmap_busy_raw(mem_ptr, pfnmap.first_pfn, maxpfn, used_pfn);
            });
        }
    }

    // 3. STREE has those same pages cleared.
    if let Some(stree) = stree {
        let order = order_for(maxrampfn);
        clear_stree_for_used_frames(mem, stree.first_pfn, order, maxrampfn)?;
    }

    // 4. REGIONS is filled, now that busy backfill has happened.
    if let Some(regions_seg) = regions_seg {
        let mut out = [RegionEntry::new(0, 0, 0); memmap::MAX_REGIONS];
        let n = memmap::fill_regions(input.regions, &mut out);
        let entry_size = core::mem::size_of::<RegionEntry>() as u64;
        if (n as u64) * entry_size > regions_seg.size {
            return Err(LoaderError::SegmentTooSmall);
        }
        for (i, entry) in out[..n].iter().enumerate() {
            write_bytes_at(mem, regions_seg.first_pfn, i as u64 * entry_size, &struct_bytes(entry)[..entry_size as usize]);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nux_core::bootinfo::{PLATFORM_UNKNOWN, REGION_BUSY, REGION_RAM};
    use std::collections::HashMap;

    /// Software model of a 4-level 64-bit paging mode, mirroring
    /// `nux_mm::pagetable`'s own test `SoftHal` but instance-based (per
    /// [`LoaderMem`]'s contract) and backing `FrameSource` with a plain
    /// `HashMap`-based frame pool instead of a real boot arena.
    struct TestMem {
        tables: HashMap<u64, [Pte; 512]>,
        pages: HashMap<u64, [u8; 4096]>,
        next_pfn: u64,
        used: Vec<Pfn>,
    }

    impl TestMem {
        fn new() -> Self {
            Self { tables: HashMap::new(), pages: HashMap::new(), next_pfn: 1, used: Vec::new() }
        }
    }

    impl FrameSource for TestMem {
        fn alloc_frame(&mut self) -> Option<Pfn> {
            let pfn = Pfn::new(self.next_pfn);
            self.next_pfn += 1;
            self.tables.insert(pfn.as_u64(), [Pte::ABSENT; 512]);
            self.pages.insert(pfn.as_u64(), [0u8; 4096]);
            self.used.push(pfn);
            Some(pfn)
        }

        fn frame_bytes_mut(&mut self, pfn: Pfn) -> &mut [u8; 4096] {
            self.pages.get_mut(&pfn.as_u64()).expect("frame never allocated")
        }

        fn for_each_used_frame(&self, visit: &mut dyn FnMut(Pfn)) {
            for &pfn in &self.used {
                visit(pfn);
            }
        }
    }

    impl LoaderMem for TestMem {
        const LEVELS: usize = 4;

        fn supports_1gib(&self) -> bool {
            true
        }

        fn is_user_va(&self, va: VirtAddr) -> bool {
            va.as_u64() < 0x0000_8000_0000_0000
        }

        fn index_at(&self, level: usize, va: VirtAddr) -> usize {
            let shift = 12 + 9 * (Self::LEVELS - 1 - level);
            ((va.as_u64() >> shift) & 0x1FF) as usize
        }

        fn read_slot(&mut self, table_pfn: Pfn, index: usize) -> Pte {
            self.tables[&table_pfn.as_u64()][index]
        }

        fn write_slot(&mut self, table_pfn: Pfn, index: usize, pte: Pte) -> Pte {
            let table = self.tables.get_mut(&table_pfn.as_u64()).unwrap();
            let old = table[index];
            table[index] = pte;
            old
        }
    }

    fn translate(mem: &mut TestMem, root: Pfn, va: u64) -> Option<(Pfn, u64)> {
        let mut table = root;
        for level in 0..TestMem::LEVELS - 1 {
            let idx = mem.index_at(level, VirtAddr::new(va));
            let entry = mem.read_slot(table, idx);
            if !entry.present() {
                return None;
            }
            table = entry.pfn;
        }
        let idx = mem.index_at(TestMem::LEVELS - 1, VirtAddr::new(va));
        let entry = mem.read_slot(table, idx);
        entry.present().then_some((entry.pfn, va & 0xFFF))
    }

    fn minimal_elf64(entry: u64) -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        buf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        buf[4] = 2;
        buf[5] = 1;
        buf[16..18].copy_from_slice(&2u16.to_le_bytes());
        buf[18..20].copy_from_slice(&62u16.to_le_bytes());
        buf[24..32].copy_from_slice(&entry.to_le_bytes());
        buf[32..40].copy_from_slice(&64u64.to_le_bytes());
        buf[54..56].copy_from_slice(&56u16.to_le_bytes());
        buf
    }

    fn append_phdr(buf: &mut Vec<u8>, p_type: u32, flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64) {
        buf.extend_from_slice(&p_type.to_le_bytes());
        buf.extend_from_slice(&flags.to_le_bytes());
        buf.extend_from_slice(&offset.to_le_bytes());
        buf.extend_from_slice(&vaddr.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes()); // paddr
        buf.extend_from_slice(&filesz.to_le_bytes());
        buf.extend_from_slice(&memsz.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes()); // align
    }

    fn bump_phnum(buf: &mut [u8], n: u16) {
        buf[56..58].copy_from_slice(&n.to_le_bytes());
    }

    fn ram(pfn: u64, len: u64) -> FirmwareRegion {
        FirmwareRegion { pfn, len, kind: FirmwareRegionKind::Ram }
    }

    /// §8 end-to-end scenario 1: one LOAD segment plus one PHYSMAP.
    #[test]
    fn scenario_1_load_and_physmap_translate_correctly() {
        let mut buf = minimal_elf64(0x40_0000);
        let load_data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let load_off = buf.len() + 56 * 2;
        append_phdr(&mut buf, nux_elf::PT_LOAD, 7, load_off as u64, 0x40_0000, 8, 4096);
        append_phdr(
            &mut buf,
            nux_elf::extension::PHT_APXH_PHYSMAP,
            0,
            0,
            0xFFFF_8000_0000_0000,
            0,
            1 << 30,
        );
        bump_phnum(&mut buf, 2);
        buf.extend_from_slice(&load_data);

        let elf = ElfFile::parse(&buf).unwrap();
        let mut mem = TestMem::new();
        let input = BuildInput {
            kernel: elf,
            user: None,
            regions: &[ram(0, 1 << 18)],
            platform: PlatformDescriptor { kind: PLATFORM_UNKNOWN, ptr: 0 },
            framebuffer: FramebufferDescriptor::INVALID,
        };
        let output = build_address_space(&input, &mut mem).unwrap();

        let (pfn, off) = translate(&mut mem, output.root, 0x40_0000).unwrap();
        assert_eq!(off, 0);
        let bytes = mem.frame_bytes_mut(pfn);
        assert_eq!(&bytes[..8], &load_data);
        assert_eq!(&bytes[8..16], &[0u8; 8]);

        let (pfn, off) = translate(&mut mem, output.root, 0xFFFF_8000_0000_0000 + 0x1234).unwrap();
        assert_eq!(off, 0x1234);
        // PHYSMAP at offset 0 identity-maps PA 0, so the 1 GiB leaf's PFN
        // is 0 regardless of what the loader itself has consumed.
        assert_eq!(pfn, Pfn::new(0));
    }

    #[test]
    fn physmap_promotes_to_a_single_1gib_leaf() {
        let mut buf = minimal_elf64(0x1000);
        append_phdr(&mut buf, nux_elf::extension::PHT_APXH_PHYSMAP, 0, 0, 0xFFFF_8000_0000_0000, 0, 1 << 30);
        bump_phnum(&mut buf, 1);

        let elf = ElfFile::parse(&buf).unwrap();
        let mut mem = TestMem::new();
        let input = BuildInput {
            kernel: elf,
            user: None,
            regions: &[ram(0, 1 << 18)],
            platform: PlatformDescriptor { kind: PLATFORM_UNKNOWN, ptr: 0 },
            framebuffer: FramebufferDescriptor::INVALID,
        };
        let output = build_address_space(&input, &mut mem).unwrap();

        // Level-1 (PDPT) entry must itself be the present leaf: walking
        // only two levels (PML4 -> PDPT) should already land on a
        // present entry whose pfn is the physical frame 0.
        let idx0 = mem.index_at(0, VirtAddr::new(0xFFFF_8000_0000_0000));
        let pdpt = mem.read_slot(output.root, idx0);
        assert!(pdpt.present());
        let idx1 = mem.index_at(1, VirtAddr::new(0xFFFF_8000_0000_0000));
        let leaf = mem.read_slot(pdpt.pfn, idx1);
        assert!(leaf.present());
        assert_eq!(leaf.pfn, Pfn::new(0));
    }

    /// §8 end-to-end scenario 4: region classification incl. pinned MMIO.
    #[test]
    fn scenario_4_pfnmap_reflects_regions_and_busy_backfill() {
        let mut buf = minimal_elf64(0x1000);
        let info_off_phdr = buf.len();
        append_phdr(&mut buf, nux_elf::extension::PHT_APXH_INFO, 0, 0, 0x1000_0000, 0, 4096);
        let _ = info_off_phdr;
        append_phdr(&mut buf, nux_elf::extension::PHT_APXH_PFNMAP, 0, 0, 0x2000_0000, 0, 4096);
        bump_phnum(&mut buf, 2);

        let elf = ElfFile::parse(&buf).unwrap();
        let mut mem = TestMem::new();
        let regions = memmap::normalize(
            &[ram(0, 100), FirmwareRegion { pfn: 100, len: 1, kind: FirmwareRegionKind::Mmio }, ram(101, 899)],
            &[memmap::X86_LEGACY_HOLE],
        );
        let input = BuildInput {
            kernel: elf,
            user: None,
            regions: &regions,
            platform: PlatformDescriptor { kind: PLATFORM_UNKNOWN, ptr: 0 },
            framebuffer: FramebufferDescriptor::INVALID,
        };
        let output = build_address_space(&input, &mut mem).unwrap();

        let (pfn, _) = translate(&mut mem, output.root, 0x2000_0000).unwrap();
        let bytes = mem.frame_bytes_mut(pfn);
        assert_eq!(bytes[0], REGION_RAM);
        assert_eq!(bytes[100], nux_core::bootinfo::REGION_MMIO);
        // Frame 1 (this loader's own root table) must show up as BUSY
        // since it is a frame APXH itself consumed.
        assert_eq!(bytes[1], REGION_BUSY);
    }

    #[test]
    fn info_segment_is_filled_with_bit_exact_boot_magic() {
        let mut buf = minimal_elf64(0x1000);
        append_phdr(&mut buf, nux_elf::extension::PHT_APXH_INFO, 0, 0, 0x1000_0000, 0, 4096);
        bump_phnum(&mut buf, 1);

        let elf = ElfFile::parse(&buf).unwrap();
        let mut mem = TestMem::new();
        let input = BuildInput {
            kernel: elf,
            user: None,
            regions: &[ram(0, 16)],
            platform: PlatformDescriptor { kind: PLATFORM_UNKNOWN, ptr: 0 },
            framebuffer: FramebufferDescriptor::INVALID,
        };
        let output = build_address_space(&input, &mut mem).unwrap();
        let (pfn, _) = translate(&mut mem, output.root, 0x1000_0000).unwrap();
        let bytes = mem.frame_bytes_mut(pfn);
        let magic = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        assert_eq!(magic, BOOTINFO_MAGIC);
    }

    #[test]
    fn empty_segment_leaves_no_page_table_entry() {
        let mut buf = minimal_elf64(0x1000);
        append_phdr(&mut buf, nux_elf::extension::PHT_APXH_EMPTY, 0, 0, 0x3000_0000, 0, 4096);
        bump_phnum(&mut buf, 1);

        let elf = ElfFile::parse(&buf).unwrap();
        let mut mem = TestMem::new();
        let input = BuildInput {
            kernel: elf,
            user: None,
            regions: &[ram(0, 16)],
            platform: PlatformDescriptor { kind: PLATFORM_UNKNOWN, ptr: 0 },
            framebuffer: FramebufferDescriptor::INVALID,
        };
        let output = build_address_space(&input, &mut mem).unwrap();
        assert!(translate(&mut mem, output.root, 0x3000_0000).is_none());
    }

    #[test]
    fn linear_self_map_points_the_top_level_slot_back_at_the_root() {
        let mut buf = minimal_elf64(0x1000);
        append_phdr(&mut buf, nux_elf::extension::PHT_APXH_LINEAR, 0, 0, 0xFFFF_FF00_0000_0000, 0, 0);
        bump_phnum(&mut buf, 1);

        let elf = ElfFile::parse(&buf).unwrap();
        let mut mem = TestMem::new();
        let input = BuildInput {
            kernel: elf,
            user: None,
            regions: &[ram(0, 16)],
            platform: PlatformDescriptor { kind: PLATFORM_UNKNOWN, ptr: 0 },
            framebuffer: FramebufferDescriptor::INVALID,
        };
        let output = build_address_space(&input, &mut mem).unwrap();
        let idx = mem.index_at(0, VirtAddr::new(0xFFFF_FF00_0000_0000));
        let pte = mem.read_slot(output.root, idx);
        assert_eq!(pte.pfn, output.root);
    }

    #[test]
    fn user_payload_segments_get_the_user_flag() {
        let kernel_buf = minimal_elf64(0x1000);
        let mut user_buf = minimal_elf64(0x40_0000);
        let data = [0xAAu8; 4];
        let off = user_buf.len() + 56;
        append_phdr(&mut user_buf, nux_elf::PT_LOAD, 6, off as u64, 0x40_0000, 4, 4096);
        bump_phnum(&mut user_buf, 1);
        user_buf.extend_from_slice(&data);

        let kernel = ElfFile::parse(&kernel_buf).unwrap();
        let user = ElfFile::parse(&user_buf).unwrap();
        let mut mem = TestMem::new();
        let input = BuildInput {
            kernel,
            user: Some(user),
            regions: &[ram(0, 16)],
            platform: PlatformDescriptor { kind: PLATFORM_UNKNOWN, ptr: 0 },
            framebuffer: FramebufferDescriptor::INVALID,
        };
        let output = build_address_space(&input, &mut mem).unwrap();
        assert_eq!(output.uentry, VirtAddr::new(0x40_0000));

        let idx = mem.index_at(3, VirtAddr::new(0x40_0000));
        let mut table = output.root;
        for level in 0..3 {
            table = mem.read_slot(table, mem.index_at(level, VirtAddr::new(0x40_0000))).pfn;
        }
        let leaf = mem.read_slot(table, idx);
        assert!(leaf.flags.contains(PteFlags::U));
        assert!(leaf.flags.contains(PteFlags::W));
        assert!(!leaf.flags.contains(PteFlags::X));
    }

    #[test]
    fn ptalloc_leaves_the_leaf_absent_but_interior_tables_present() {
        let mut buf = minimal_elf64(0x1000);
        append_phdr(&mut buf, nux_elf::extension::PHT_APXH_PTALLOC, 0, 0, 0x5000_0000, 0, 4096);
        bump_phnum(&mut buf, 1);

        let elf = ElfFile::parse(&buf).unwrap();
        let mut mem = TestMem::new();
        let input = BuildInput {
            kernel: elf,
            user: None,
            regions: &[ram(0, 16)],
            platform: PlatformDescriptor { kind: PLATFORM_UNKNOWN, ptr: 0 },
            framebuffer: FramebufferDescriptor::INVALID,
        };
        let output = build_address_space(&input, &mut mem).unwrap();
        assert!(translate(&mut mem, output.root, 0x5000_0000).is_none());

        // But the interior (level 2, the PT's own parent) must already
        // be linked, per PTALLOC's contract.
        let mut table = output.root;
        for level in 0..3 {
            let entry = mem.read_slot(table, mem.index_at(level, VirtAddr::new(0x5000_0000)));
            assert!(entry.present(), "level {level} should already be linked");
            table = entry.pfn;
        }
    }

    #[test]
    fn too_small_pfnmap_segment_is_rejected() {
        let mut buf = minimal_elf64(0x1000);
        append_phdr(&mut buf, nux_elf::extension::PHT_APXH_PFNMAP, 0, 0, 0x2000_0000, 0, 8);
        bump_phnum(&mut buf, 1);

        let elf = ElfFile::parse(&buf).unwrap();
        let mut mem = TestMem::new();
        let input = BuildInput {
            kernel: elf,
            user: None,
            regions: &[ram(0, 1_000_000)],
            platform: PlatformDescriptor { kind: PLATFORM_UNKNOWN, ptr: 0 },
            framebuffer: FramebufferDescriptor::INVALID,
        };
        assert_eq!(build_address_space(&input, &mut mem), Err(LoaderError::SegmentTooSmall));
    }
}
