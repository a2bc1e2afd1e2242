//! The `apxh` binary (§1 L0, §4.1): the thin per-arch glue that wires
//! real firmware input and a real [`LoaderMem`] backend into the
//! otherwise hardware-free [`apxh`] library.
//!
//! Target is x86-64, multiboot2 (GRUB or any conformant loader); RISC-V
//! SBI and EFI entry are a separate `src/main.rs` build per target, not
//! modeled in this exercise (§9 "Architecture polymorphism"). `_start`
//! assumes long mode is already active and the low 1 GiB is
//! identity-mapped, the state every multiboot2 bootstrap reaches before
//! touching any higher-level code — the real-mode/protected-mode
//! assembly that gets a CPU there is out of scope the same way concrete
//! instruction emission is carved out of `nux-hal`'s HAL contract (§2);
//! this file begins at the first instruction that can run as ordinary
//! `extern "C"` Rust.

#![no_std]
#![no_main]

mod multiboot;

use core::arch::asm;
use core::panic::PanicInfo;

use apxh::arena::{BootArena, FrameSource};
use apxh::loader::{build_address_space, BuildInput, LoaderMem};
use apxh::memmap::{self, FirmwareRegion, MAX_REGIONS, X86_LEGACY_HOLE};
use apxh::payload::{self, Payload};
use apxh::trampoline::{HalTrampoline, HandOff, X86_64Trampoline};
use nux_core::addr::{Pfn, VirtAddr, PAGE_SIZE};
use nux_core::bootinfo::{PlatformDescriptor, PLATFORM_ACPI, PLATFORM_UNKNOWN};
use nux_core::pte::{Pte, PteFlags};
use nux_elf::extension::ExtensionKind;
use nux_elf::segment::ElfFile;
use planck_noalloc::vec::ArrayVec;

/// Multiboot2's magic value, preserved across whatever transitional
/// stub handed control to `_start` in long mode (§4.1's firmware
/// carve-out).
const MULTIBOOT2_MAGIC: u32 = 0x36d7_6289;

/// Size of the loader's private boot arena (§4.1), matching the
/// reference loader's own 512 MiB window.
const BOOT_ARENA_FRAMES: usize = (512 << 20) / PAGE_SIZE as usize;

/// Backing words for [`BootArena`]'s S-tree over [`BOOT_ARENA_FRAMES`]
/// frames: `STree::required_words(131072)` works out to 2048 + 32 + 1,
/// rounded up generously the same way `loader`'s own
/// `MAX_BOOT_STREE_WORDS` scratch buffer is.
const ARENA_STREE_WORDS: usize = 2560;

/// Upper bound on how far past the loader image's end this build will
/// scan for the appended `ar50` container. The real bound is "until a
/// record's magic stops matching" (`nux_elf::ar50::records` already
/// stops there); this just keeps the initial slice inside mapped,
/// readable memory before that scan begins.
const MAX_PAYLOAD_CONTAINER_BYTES: usize = 64 << 20;

static mut ARENA_STORAGE: [u64; ARENA_STREE_WORDS] = [0; ARENA_STREE_WORDS];

unsafe extern "C" {
    /// Linker-provided symbol marking the end of the loader's own
    /// image; the appended `ar50` payload container starts here (§4.1,
    /// matching [`apxh::payload`]'s doc comment).
    static __apxh_end: u8;
}

#[panic_handler]
fn panic(_info: &PanicInfo<'_>) -> ! {
    halt_forever()
}

fn halt_forever() -> ! {
    loop {
        // SAFETY: `hlt` with interrupts already disabled (no IDT is
        // installed this early) just parks the CPU.
        unsafe { asm!("cli", "hlt") };
    }
}

/// Whether this CPU can install a 1 GiB PDPT leaf: CPUID leaf
/// `0x8000_0001`, EDX bit 26 (`page1gb`).
fn cpu_supports_1gib_pages() -> bool {
    let edx: u32;
    // SAFETY: CPUID is always available once in long mode; this reads
    // architectural feature bits, no side effects beyond clobbered
    // registers the calling convention already accounts for.
    unsafe {
        asm!(
            "cpuid",
            inout("eax") 0x8000_0001u32 => _,
            out("ebx") _,
            out("ecx") _,
            out("edx") edx,
        );
    }
    edx & (1 << 26) != 0
}

/// Packs an abstract [`Pte`] into x86-64's wire format. Duplicated from
/// `nux-hal`'s private `x86_64::box_pte` (same ISA-defined layout):
/// that copy is reachable only through `HalPaging`'s associated
/// functions, which reach for the global PMM (`nux_mm::pmm::alloc`) —
/// unusable before the kernel's own address space exists (§4.1).
fn box_pte(pte: Pte) -> u64 {
    if !pte.flags.contains(PteFlags::P) {
        return 0;
    }
    const PRESENT: u64 = 1 << 0;
    const WRITE: u64 = 1 << 1;
    const USER: u64 = 1 << 2;
    const GLOBAL: u64 = 1 << 8;
    const AVL0: u64 = 1 << 9;
    const AVL1: u64 = 1 << 10;
    const AVL2: u64 = 1 << 11;
    const NX: u64 = 1 << 63;
    let mut bits = PRESENT;
    if pte.flags.contains(PteFlags::W) {
        bits |= WRITE;
    }
    if pte.flags.contains(PteFlags::U) {
        bits |= USER;
    }
    if pte.flags.contains(PteFlags::GLOBAL) {
        bits |= GLOBAL;
    }
    if pte.flags.contains(PteFlags::AVL0) {
        bits |= AVL0;
    }
    if pte.flags.contains(PteFlags::AVL1) {
        bits |= AVL1;
    }
    if pte.flags.contains(PteFlags::AVL2) {
        bits |= AVL2;
    }
    bits |= pte.pfn.as_u64() << 12;
    if !pte.flags.contains(PteFlags::X) {
        bits |= NX;
    }
    bits
}

/// Unboxes x86-64's wire format back into an abstract [`Pte`]. See
/// [`box_pte`].
fn unbox_pte(bits: u64) -> Pte {
    const PRESENT: u64 = 1 << 0;
    const WRITE: u64 = 1 << 1;
    const USER: u64 = 1 << 2;
    const GLOBAL: u64 = 1 << 8;
    const AVL0: u64 = 1 << 9;
    const AVL1: u64 = 1 << 10;
    const AVL2: u64 = 1 << 11;
    const NX: u64 = 1 << 63;
    const PFN_MASK: u64 = 0x000F_FFFF_FFFF_F000;
    if bits & PRESENT == 0 {
        return Pte::ABSENT;
    }
    let mut flags = PteFlags::P;
    flags.set(PteFlags::W, bits & WRITE != 0);
    flags.set(PteFlags::U, bits & USER != 0);
    flags.set(PteFlags::GLOBAL, bits & GLOBAL != 0);
    flags.set(PteFlags::AVL0, bits & AVL0 != 0);
    flags.set(PteFlags::AVL1, bits & AVL1 != 0);
    flags.set(PteFlags::AVL2, bits & AVL2 != 0);
    flags.set(PteFlags::X, bits & NX == 0);
    Pte { pfn: Pfn::new((bits & PFN_MASK) >> 12), flags }
}

fn table_ptr(pfn: Pfn) -> *mut [u64; 512] {
    pfn.to_phys().as_u64() as *mut [u64; 512]
}

/// The real [`LoaderMem`]: a [`BootArena`] for allocation, plus
/// identity-mapped physical access for both page-table slots and
/// payload bytes (§4.1: "the loader runs under the firmware's own
/// identity map").
struct RealMem<'a> {
    arena: BootArena<'a>,
}

impl FrameSource for RealMem<'_> {
    fn alloc_frame(&mut self) -> Option<Pfn> {
        self.arena.alloc()
    }

    fn frame_bytes_mut(&mut self, pfn: Pfn) -> &mut [u8; PAGE_SIZE as usize] {
        // SAFETY: every `pfn` reaching this call was handed out by
        // `self.arena`, which draws from a window of ordinary RAM this
        // image owns exclusively for the duration of construction, and
        // that window is identity-mapped by firmware.
        unsafe { &mut *(pfn.to_phys().as_u64() as *mut [u8; PAGE_SIZE as usize]) }
    }

    fn for_each_used_frame(&self, visit: &mut dyn FnMut(Pfn)) {
        for pfn in self.arena.used_frames() {
            visit(pfn);
        }
    }
}

impl LoaderMem for RealMem<'_> {
    const LEVELS: usize = 4;

    fn supports_1gib(&self) -> bool {
        cpu_supports_1gib_pages()
    }

    fn is_user_va(&self, va: VirtAddr) -> bool {
        va.as_u64() < 0x0000_8000_0000_0000
    }

    fn index_at(&self, level: usize, va: VirtAddr) -> usize {
        let shift = 12 + 9 * (Self::LEVELS - 1 - level);
        ((va.as_u64() >> shift) & 0x1FF) as usize
    }

    fn read_slot(&mut self, table_pfn: Pfn, index: usize) -> Pte {
        // SAFETY: `table_pfn` is always a frame this loader allocated
        // and linked itself, identity-mapped like every other frame in
        // the boot arena's window.
        let bits = unsafe { (*table_ptr(table_pfn))[index] };
        unbox_pte(bits)
    }

    fn write_slot(&mut self, table_pfn: Pfn, index: usize, pte: Pte) -> Pte {
        let old = self.read_slot(table_pfn, index);
        // SAFETY: see read_slot.
        unsafe { (*table_ptr(table_pfn))[index] = box_pte(pte) };
        old
    }
}

/// Collects and normalizes the firmware memory map from the multiboot2
/// tag stream at `info`, applying the x86 legacy VGA/BIOS hole pin
/// (§3, §8 scenario 4).
///
/// # Safety
///
/// `info` must be a valid multiboot2 information pointer.
unsafe fn collect_regions(info: *const u8) -> ArrayVec<FirmwareRegion, MAX_REGIONS> {
    // SAFETY: caller's precondition.
    let firmware = unsafe { multiboot::memory_map(info) };
    memmap::normalize(&firmware, &[X86_LEGACY_HOLE])
}

/// Returns the appended `ar50` payload container as a byte slice
/// starting at the loader image's linker-provided end symbol.
///
/// # Safety
///
/// The linked image must actually carry an `objappend`-style container
/// after `__apxh_end`, and at least `MAX_PAYLOAD_CONTAINER_BYTES` of
/// readable memory must follow it (the container itself is almost
/// always much shorter; `ar50::records` stops at the first magic
/// mismatch regardless of how much of this slice is genuine payload).
unsafe fn payload_container() -> &'static [u8] {
    let start = &raw const __apxh_end as *const u8;
    // SAFETY: caller's precondition.
    unsafe { core::slice::from_raw_parts(start, MAX_PAYLOAD_CONTAINER_BYTES) }
}

/// Finds the kernel's `INFO` extension segment's virtual address, so
/// the trampoline hand-off can point the kernel back at its own
/// finalized boot-info record without re-walking its ELF headers at
/// runtime (§4.1, `trampoline::HandOff::info`).
fn find_info_vaddr(kernel: &ElfFile<'_>) -> Option<VirtAddr> {
    kernel.extension_segments().find(|(kind, _)| *kind == ExtensionKind::Info).map(|(_, ph)| VirtAddr::new(ph.vaddr))
}

#[unsafe(no_mangle)]
pub extern "C" fn _start(magic: u32, info: *const u8) -> ! {
    if magic != MULTIBOOT2_MAGIC {
        halt_forever();
    }

    // SAFETY: `info` is the multiboot2 information pointer handed to
    // `_start` by a conformant loader, identity-mapped and readable for
    // its declared `total_size`.
    let regions = unsafe { collect_regions(info) };
    let framebuffer = unsafe { multiboot::framebuffer(info) };
    let platform = match unsafe { multiboot::acpi_rsdp(info) } {
        Some(rsdp) => PlatformDescriptor { kind: PLATFORM_ACPI, ptr: rsdp },
        None => PlatformDescriptor { kind: PLATFORM_UNKNOWN, ptr: 0 },
    };

    // SAFETY: see `payload_container`'s doc comment.
    let container = unsafe { payload_container() };
    let Payload { kernel, user } = match payload::locate(container) {
        Ok(payload) => payload,
        Err(_) => halt_forever(),
    };

    let Some(info_va) = find_info_vaddr(&kernel) else {
        halt_forever();
    };

    // The arena sits directly above the loader's own image; `__apxh_end`
    // is identity-mapped, so its physical address doubles as the
    // arena's base PFN.
    let arena_base_pfn = ((&raw const __apxh_end as *const u8 as u64) >> nux_core::addr::PAGE_SHIFT) + 1;
    let arena_base = Pfn::new(arena_base_pfn);
    // SAFETY: `ARENA_STORAGE` is touched only here, once, before any
    // concurrent access could exist (no other CPU or interrupt handler
    // is running yet).
    let storage = unsafe { &mut *core::ptr::addr_of_mut!(ARENA_STORAGE) };
    let mut mem = RealMem { arena: BootArena::new(arena_base, BOOT_ARENA_FRAMES, storage) };

    let input = BuildInput { kernel, user, regions: &regions, platform, framebuffer };
    let output = match build_address_space(&input, &mut mem) {
        Ok(output) => output,
        Err(_) => halt_forever(),
    };

    let handoff = HandOff { root: output.root, entry: output.entry, uentry: output.uentry, info: info_va };
    // SAFETY: `build_address_space` has just built `handoff.root` to
    // contain an identical mapping of this trampoline's own code page
    // via the kernel's `PHT_APXH_PHYSMAP`/`PHT_APXH_LINEAR` segments
    // (§4.1), and `handoff.entry` is the kernel's own ELF entry point,
    // mapped by its own `PT_LOAD` segments.
    unsafe { X86_64Trampoline::switch_and_jump(handoff) }
}
