//! Platform Layer (PLT) contract (§4.13): the single trait `nux`'s
//! per-CPU substrate and entry dispatcher call through for anything
//! that varies by firmware rather than by CPU architecture — console
//! output, IRQ routing, CPU bring-up, NMI/IPI issuance, and the system
//! timer.
//!
//! Two implementations are in scope, selected at build time (a feature
//! per platform, never a runtime branch): [`acpi`]-discovered x86 and
//! [`fdt`]-discovered (SBI-driven) RISC-V. Both hand-parse their
//! firmware tables — the teacher's own ACPI/FDT crates lean on an
//! internal derive-macro crate for this that isn't a real published
//! dependency, so this crate reads the bytes itself, the same way
//! `nux_elf` reads ELF headers.
#![cfg_attr(not(test), no_std)]

pub mod acpi;
pub mod fdt;
pub mod platform_riscv;
pub mod platform_x86;

pub use platform_riscv::SbiFdtPlatform;
pub use platform_x86::AcpiPlatform;

/// Failure modes shared by every firmware-table parser in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformError {
    /// A magic/signature field didn't match what was expected.
    BadSignature,
    /// A checksum or length field failed validation.
    BadChecksum,
    /// The input ended before a length field said it would.
    Truncated,
    /// The firmware describes something this discovery layer doesn't
    /// decode (an interrupt-controller variant, an unknown cell count).
    Unsupported,
}

impl core::fmt::Display for PlatformError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Self::BadSignature => "bad signature",
            Self::BadChecksum => "bad checksum",
            Self::Truncated => "truncated table",
            Self::Unsupported => "unsupported table variant",
        };
        f.write_str(msg)
    }
}

/// How a platform IRQ line signals: matches the boot-time platform
/// descriptor's encoding (§6) of edge- vs level-triggered sources, with
/// polarity split out for level-triggered lines (active-low vs
/// active-high), since an I/O-APIC redirection entry and a PLIC/CLINT
/// source both need it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqType {
    /// Edge-triggered: one assertion, one delivery.
    Edge,
    /// Level-triggered, active low.
    LevelLow,
    /// Level-triggered, active high.
    LevelHigh,
}

/// One CPU as firmware enumerates it: a stable logical index (the one
/// `nux`'s per-CPU arrays are indexed by) paired with the
/// firmware-native physical identifier (APIC ID or hart ID) bring-up
/// and IPI/NMI targeting need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuDescriptor {
    /// Index into `nux`'s per-CPU tables.
    pub logical_id: u32,
    /// APIC ID (x86) or hart ID (RISC-V).
    pub phys_id: u64,
}

/// The boot-time platform-descriptor tag (§6): which discovery path
/// produced this `Platform`, carried through from the boot-info record
/// so a build can sanity-check it picked the implementation firmware
/// actually offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum PlatformKind {
    /// No platform descriptor was supplied.
    Unknown = 0,
    /// ACPI (RSDP pointer).
    Acpi = 1,
    /// Devicetree blob pointer.
    Dtb = 2,
}

/// The firmware-dependent half of CPU/IRQ/timer control (§4.13). Every
/// method here is something ACPI+APIC and SBI+FDT both provide but
/// implement completely differently; `nux`'s arch-independent code
/// calls through this trait instead of branching on `target_arch`
/// itself.
pub trait Platform {
    /// Writes one byte to whatever this platform's boot-time debug
    /// console is (a UART, an SBI console call, a port-mapped debug
    /// port). Best-effort: callers must not depend on the byte having
    /// been displayed anywhere.
    fn plt_hw_putc(&self, byte: u8);

    /// How platform IRQ `irq` signals.
    fn plt_irq_type(&self, irq: u32) -> IrqType;

    /// Unmasks `irq` at the platform's interrupt controller.
    fn plt_irq_enable(&self, irq: u32);

    /// Masks `irq` at the platform's interrupt controller.
    fn plt_irq_disable(&self, irq: u32);

    /// One past the highest platform IRQ number this platform exposes.
    fn plt_irq_max(&self) -> u32;

    /// Calls `f` once per CPU firmware enumerated, in an unspecified
    /// order. Safe to call before any secondary CPU has entered the
    /// kernel.
    fn plt_pcpu_iterate(&self, f: &mut dyn FnMut(CpuDescriptor));

    /// Marks `cpu` as having entered the kernel (bookkeeping only, no
    /// side effect on hardware).
    fn plt_pcpu_enter(&self, cpu: CpuDescriptor);

    /// Starts `cpu` executing at physical address `start_pa`. Returns
    /// once the start request has been issued, not once the CPU has
    /// actually begun running.
    fn plt_pcpu_start(&self, cpu: CpuDescriptor, start_pa: u64);

    /// Sends a non-maskable interrupt to one CPU (the TLB-shootdown
    /// primitive, §4.9).
    fn plt_pcpu_nmi(&self, cpu: CpuDescriptor);

    /// Sends a non-maskable interrupt to every CPU but the caller.
    fn plt_pcpu_nmiall(&self);

    /// Sends a regular (maskable) inter-processor interrupt to one CPU.
    fn plt_pcpu_ipi(&self, cpu: CpuDescriptor);

    /// Sends a regular inter-processor interrupt to every CPU but the
    /// caller.
    fn plt_pcpu_ipiall(&self);

    /// Reads the platform's free-running timer counter.
    fn plt_tmr_ctr(&self) -> u64;

    /// Sets the platform's free-running timer counter.
    fn plt_tmr_setctr(&self, value: u64);

    /// The timer's tick period, in counter units per second.
    fn plt_tmr_period(&self) -> u64;

    /// Arms a one-shot alarm at absolute counter value `deadline`.
    fn plt_tmr_setalm(&self, deadline: u64);

    /// Disarms the pending alarm, if any.
    fn plt_tmr_clralm(&self);

    /// Acknowledges a delivered timer interrupt at the interrupt
    /// controller.
    fn plt_eoi_timer(&self);

    /// Acknowledges a delivered platform IRQ at the interrupt
    /// controller.
    fn plt_eoi_irq(&self, irq: u32);

    /// Acknowledges a delivered inter-processor interrupt.
    fn plt_eoi_ipi(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingPlatform {
        enabled: core::cell::RefCell<Vec<u32>>,
    }

    impl Platform for RecordingPlatform {
        fn plt_hw_putc(&self, _byte: u8) {}
        fn plt_irq_type(&self, _irq: u32) -> IrqType {
            IrqType::Edge
        }
        fn plt_irq_enable(&self, irq: u32) {
            self.enabled.borrow_mut().push(irq);
        }
        fn plt_irq_disable(&self, irq: u32) {
            self.enabled.borrow_mut().retain(|&x| x != irq);
        }
        fn plt_irq_max(&self) -> u32 {
            16
        }
        fn plt_pcpu_iterate(&self, f: &mut dyn FnMut(CpuDescriptor)) {
            f(CpuDescriptor { logical_id: 0, phys_id: 0 });
        }
        fn plt_pcpu_enter(&self, _cpu: CpuDescriptor) {}
        fn plt_pcpu_start(&self, _cpu: CpuDescriptor, _start_pa: u64) {}
        fn plt_pcpu_nmi(&self, _cpu: CpuDescriptor) {}
        fn plt_pcpu_nmiall(&self) {}
        fn plt_pcpu_ipi(&self, _cpu: CpuDescriptor) {}
        fn plt_pcpu_ipiall(&self) {}
        fn plt_tmr_ctr(&self) -> u64 {
            0
        }
        fn plt_tmr_setctr(&self, _value: u64) {}
        fn plt_tmr_period(&self) -> u64 {
            1_000_000_000
        }
        fn plt_tmr_setalm(&self, _deadline: u64) {}
        fn plt_tmr_clralm(&self) {}
        fn plt_eoi_timer(&self) {}
        fn plt_eoi_irq(&self, _irq: u32) {}
        fn plt_eoi_ipi(&self) {}
    }

    #[test]
    fn irq_enable_disable_round_trips_through_the_trait() {
        let plt = RecordingPlatform { enabled: core::cell::RefCell::new(Vec::new()) };
        plt.plt_irq_enable(5);
        assert_eq!(*plt.enabled.borrow(), vec![5]);
        plt.plt_irq_disable(5);
        assert!(plt.enabled.borrow().is_empty());
    }

    #[test]
    fn pcpu_iterate_visits_every_descriptor() {
        let plt = RecordingPlatform { enabled: core::cell::RefCell::new(Vec::new()) };
        let mut seen = Vec::new();
        plt.plt_pcpu_iterate(&mut |cpu| seen.push(cpu));
        assert_eq!(seen, vec![CpuDescriptor { logical_id: 0, phys_id: 0 }]);
    }
}
