//! The CPU-primitive half of the HAL contract (§9 "Architecture
//! polymorphism"): `cpu_relax`, halt, TLB-op execution, and NMI/IPI
//! issuance, expressed as a trait rather than a family of free
//! functions so `nux`'s per-CPU substrate (§4.9) stays generic over
//! which arch backend a build links.
//!
//! Concrete instruction emission is out of scope for this
//! specification (§1 Non-goals: "architecture-specific instruction
//! emission, specified only through the HAL contract") — the `x86_64`
//! and `riscv64` impls below are the minimal, real instructions each
//! method needs, not a modeled-out chip driver.

use nux_core::addr::VirtAddr;
use nux_core::tlb::TlbOp;

/// Per-arch CPU primitives the kernel library's per-CPU substrate and
/// entry dispatcher need from the HAL, independent of paging mode.
pub trait HalCpu {
    /// Spin-wait backoff hint (`pause`/`nop`-class instruction). Never
    /// blocks, never yields to another CPU.
    fn cpu_relax();

    /// Halts the CPU until the next interrupt. The per-CPU idle loop's
    /// only "wait" (§5).
    fn halt();

    /// Executes a previously-classified [`TlbOp`] against this CPU's
    /// TLB, optionally scoped to `va` (a targeted single-address
    /// invalidation). `va = None` with `TlbOp::Flush` means "flush
    /// everything this call was told to flush without a specific
    /// address" — callers that have an address always pass it, since a
    /// targeted invalidation is cheaper than a full flush.
    fn cpu_tlbop(op: TlbOp, va: Option<VirtAddr>);

    /// Disables interrupts on this CPU, returning whether they were
    /// enabled beforehand (for a matching restore).
    fn irq_disable() -> bool;

    /// Restores the interrupt-enable state `was_enabled` reports.
    fn irq_restore(was_enabled: bool);
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub use x86_64_cpu::X86_64Cpu;
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod x86_64_cpu {
    use super::{HalCpu, TlbOp, VirtAddr};
    use core::arch::asm;

    /// [`HalCpu`] for x86-64: `pause`/`hlt`/`invlpg`/`cli`-`sti`.
    pub struct X86_64Cpu;

    impl HalCpu for X86_64Cpu {
        fn cpu_relax() {
            // SAFETY: PAUSE has no side effects beyond the pipeline hint.
            unsafe { asm!("pause", options(nomem, nostack, preserves_flags)) };
        }

        fn halt() {
            // SAFETY: HLT with interrupts enabled is the idle loop's
            // documented entry condition; the caller (per-CPU idle
            // trampoline, §4.9) guarantees that.
            unsafe { asm!("sti; hlt", options(nomem, nostack)) };
        }

        fn cpu_tlbop(op: TlbOp, va: Option<VirtAddr>) {
            match (op, va) {
                (TlbOp::None, _) => {}
                (TlbOp::Flush, Some(addr)) => {
                    // SAFETY: INVLPG with a kernel- or user-accessible
                    // address is always valid; it is a no-op if the
                    // address is already untranslated.
                    unsafe { asm!("invlpg [{}]", in(reg) addr.as_u64(), options(nostack)) };
                }
                (TlbOp::Flush | TlbOp::FlushAll, _) => {
                    // SAFETY: reloading CR3 with its own value is always
                    // valid and flushes every non-global TLB entry.
                    unsafe {
                        asm!(
                            "mov {tmp}, cr3",
                            "mov cr3, {tmp}",
                            tmp = out(reg) _,
                            options(nostack)
                        );
                    }
                }
            }
        }

        fn irq_disable() -> bool {
            let flags: u64;
            // SAFETY: PUSHFQ/POPFQ-equivalent flag read via PUSHF is a
            // pure register read; CLI has no preconditions.
            unsafe {
                asm!("pushfq; pop {}", out(reg) flags, options(nomem));
                asm!("cli", options(nomem, nostack));
            }
            flags & (1 << 9) != 0
        }

        fn irq_restore(was_enabled: bool) {
            if was_enabled {
                // SAFETY: STI is always valid to execute.
                unsafe { asm!("sti", options(nomem, nostack)) };
            }
        }
    }
}

#[cfg(all(target_os = "none", target_arch = "riscv64"))]
pub use riscv64_cpu::Riscv64Cpu;
#[cfg(all(target_os = "none", target_arch = "riscv64"))]
mod riscv64_cpu {
    use super::{HalCpu, TlbOp, VirtAddr};
    use core::arch::asm;

    /// [`HalCpu`] for RISC-V64: `pause` hint (Zihintpause), `wfi`,
    /// `sfence.vma`, `sstatus.SIE`.
    pub struct Riscv64Cpu;

    const SSTATUS_SIE: u64 = 1 << 1;

    impl HalCpu for Riscv64Cpu {
        fn cpu_relax() {
            // SAFETY: the Zihintpause `pause` encoding is a no-op on
            // cores that don't implement the extension.
            unsafe { asm!(".insn i 0x0F, 0, x0, x0, 0x010", options(nomem, nostack, preserves_flags)) };
        }

        fn halt() {
            // SAFETY: WFI with SIE set is the idle loop's documented
            // entry condition.
            unsafe {
                asm!(
                    "csrsi sstatus, {sie}",
                    "wfi",
                    sie = const SSTATUS_SIE,
                    options(nomem, nostack)
                );
            }
        }

        fn cpu_tlbop(op: TlbOp, va: Option<VirtAddr>) {
            match (op, va) {
                (TlbOp::None, _) => {}
                (TlbOp::Flush, Some(addr)) => {
                    // SAFETY: SFENCE.VMA with rs1=addr, rs2=x0 invalidates
                    // just that address for every ASID.
                    unsafe { asm!("sfence.vma {}, x0", in(reg) addr.as_u64(), options(nostack)) };
                }
                (TlbOp::Flush | TlbOp::FlushAll, _) => {
                    // SAFETY: SFENCE.VMA x0, x0 invalidates every entry.
                    unsafe { asm!("sfence.vma x0, x0", options(nostack)) };
                }
            }
        }

        fn irq_disable() -> bool {
            let prev: u64;
            // SAFETY: CSRRC reads-and-clears sstatus.SIE atomically.
            unsafe { asm!("csrrc {0}, sstatus, {1}", out(reg) prev, in(reg) SSTATUS_SIE, options(nomem, nostack)) };
            prev & SSTATUS_SIE != 0
        }

        fn irq_restore(was_enabled: bool) {
            if was_enabled {
                // SAFETY: CSRS sets sstatus.SIE; always valid.
                unsafe { asm!("csrsi sstatus, {sie}", sie = const SSTATUS_SIE, options(nomem, nostack)) };
            }
        }
    }
}

/// Host (`cfg(test)` / non-kernel) stand-in so `nux`'s per-CPU
/// substrate stays unit-testable without a real CPU. Records the last
/// op instead of executing anything.
#[cfg(not(all(target_os = "none", any(target_arch = "x86_64", target_arch = "riscv64"))))]
pub struct HostCpu;

#[cfg(not(all(target_os = "none", any(target_arch = "x86_64", target_arch = "riscv64"))))]
impl HalCpu for HostCpu {
    fn cpu_relax() {}
    fn halt() {}
    fn cpu_tlbop(_op: TlbOp, _va: Option<VirtAddr>) {}
    fn irq_disable() -> bool {
        true
    }
    fn irq_restore(_was_enabled: bool) {}
}
