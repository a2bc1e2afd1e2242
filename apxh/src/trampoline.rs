//! Hand-off from the loader's transitional address space to the kernel
//! entry point (§4.1).
//!
//! [`loader::build_address_space`](crate::loader::build_address_space)
//! only ever *builds* a page table; it never switches to it. Once
//! [`crate::loader::finalize`] has run its four-step sequence (INFO
//! filled, PFNMAP back-filled `BUSY`, STREE cleared, REGIONS filled),
//! `src/main.rs` hands the resulting [`HandOff`] to a [`HalTrampoline`]
//! impl, which is the only place in this crate that may switch the
//! translation root. The trampoline itself — the code executing the
//! switch — sits on a page identically mapped in both the transitional
//! and target address spaces, since the instruction pointer is not
//! otherwise valid the instant the root changes.
//!
//! Concrete instruction emission is out of scope for this workspace's
//! HAL contract (`nux-hal`'s `cpu` module carries the same caveat); the
//! register-layout arithmetic below is kept as plain, host-testable
//! functions, and only the final asm block is arch-gated and
//! untestable off real hardware.

use nux_core::addr::{Pfn, VirtAddr};

/// Everything [`HalTrampoline::switch_and_jump`] needs to complete the
/// hand-off: the new translation root, the kernel's entry point, the
/// optional userspace stub's entry point, and the virtual address of
/// the finalized boot-info record. The kernel entry point receives
/// `entry`'s containing image's own notion of `info`/`uentry` through
/// well-defined argument registers rather than by re-deriving them, so
/// it never has to walk its own ELF headers again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandOff {
    /// PFN of the top-level page table (PML4 / Sv48 root) to switch to.
    pub root: Pfn,
    /// The kernel's entry point, already mapped in `root`.
    pub entry: VirtAddr,
    /// The userspace stub's entry point, or `VirtAddr` zero if this boot
    /// carries no user payload (§3, §4.1).
    pub uentry: VirtAddr,
    /// Virtual address of the finalized `BootInfo` record.
    pub info: VirtAddr,
}

/// Per-arch translation-root switch and jump to the kernel entry.
///
/// Only `nux-hal`'s `cpu` module and this trait's concrete impls may
/// contain `#[cfg(target_arch = ...)]` and inline assembly (§2).
pub trait HalTrampoline {
    /// Switches this CPU's translation root to `handoff.root` and jumps
    /// to `handoff.entry` with `handoff.info` and `handoff.uentry`
    /// delivered through this arch's argument registers. Never returns.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the code executing this call is
    /// mapped at the same virtual address in both the currently-active
    /// address space and `handoff.root`, and that `handoff.entry` is a
    /// valid, ready-to-run kernel entry point in `handoff.root`.
    unsafe fn switch_and_jump(handoff: HandOff) -> !;
}

/// Packs `root` into the value x86-64's `cr3` expects: a page-aligned
/// physical address with every control bit (PCID, `cr3.NOFLUSH`) clear,
/// since the loader never assigns PCIDs.
#[must_use]
fn x86_64_cr3(root: Pfn) -> u64 {
    root.as_u64() << 12
}

/// Packs `root` into the value RISC-V64's `satp` expects for Sv48: mode
/// field `9` in the top 4 bits, the root's PFN in the low 44.
#[must_use]
fn riscv64_satp(root: Pfn) -> u64 {
    const SV48_MODE: u64 = 9;
    (SV48_MODE << 60) | root.as_u64()
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub use x86_64_trampoline::X86_64Trampoline;
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod x86_64_trampoline {
    use super::{x86_64_cr3, HalTrampoline, HandOff};
    use core::arch::asm;

    /// [`HalTrampoline`] for x86-64: loads `cr3`, then jumps to the
    /// kernel entry with `rdi = info`, `rsi = uentry`.
    pub struct X86_64Trampoline;

    impl HalTrampoline for X86_64Trampoline {
        unsafe fn switch_and_jump(handoff: HandOff) -> ! {
            // SAFETY: the caller guarantees this code is identically
            // mapped in handoff.root, so the instruction stream stays
            // valid across the cr3 write, and handoff.entry is a valid
            // kernel entry point ready to run in that address space.
            unsafe {
                asm!(
                    "mov cr3, {root}",
                    "jmp {entry}",
                    root = in(reg) x86_64_cr3(handoff.root),
                    entry = in(reg) handoff.entry.as_u64(),
                    in("rdi") handoff.info.as_u64(),
                    in("rsi") handoff.uentry.as_u64(),
                    options(noreturn)
                );
            }
        }
    }
}

#[cfg(all(target_os = "none", target_arch = "riscv64"))]
pub use riscv64_trampoline::Riscv64Trampoline;
#[cfg(all(target_os = "none", target_arch = "riscv64"))]
mod riscv64_trampoline {
    use super::{riscv64_satp, HalTrampoline, HandOff};
    use core::arch::asm;

    /// [`HalTrampoline`] for RISC-V64 Sv48: loads `satp`, fences the
    /// TLB, then jumps to the kernel entry with `a0 = info`, `a1 =
    /// uentry`.
    pub struct Riscv64Trampoline;

    impl HalTrampoline for Riscv64Trampoline {
        unsafe fn switch_and_jump(handoff: HandOff) -> ! {
            // SAFETY: see X86_64Trampoline::switch_and_jump; sfence.vma
            // after the satp write is required because Sv48 does not
            // guarantee the new root's entries are visible otherwise.
            unsafe {
                asm!(
                    "csrw satp, {root}",
                    "sfence.vma",
                    "jr {entry}",
                    root = in(reg) riscv64_satp(handoff.root),
                    entry = in(reg) handoff.entry.as_u64(),
                    in("a0") handoff.info.as_u64(),
                    in("a1") handoff.uentry.as_u64(),
                    options(noreturn)
                );
            }
        }
    }
}

/// Host (`cfg(test)` / non-kernel) stand-in. Can't honor `-> !` without
/// actually diverging, so it is not a [`HalTrampoline`] impl — it just
/// records the most recent hand-off for assertions, matching how
/// `nux-hal::cpu::HostCpu` stands in for arch backends in host tests.
#[cfg(not(all(target_os = "none", any(target_arch = "x86_64", target_arch = "riscv64"))))]
pub struct HostTrampoline;

#[cfg(not(all(target_os = "none", any(target_arch = "x86_64", target_arch = "riscv64"))))]
impl HostTrampoline {
    /// Records `handoff` without switching anything. Test-only
    /// substitute for [`HalTrampoline::switch_and_jump`].
    pub fn record(handoff: HandOff) -> HandOff {
        handoff
    }
}
