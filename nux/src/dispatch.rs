//! The entry dispatcher (§4.11): the single place every trap, page
//! fault, exception, NMI, and IRQ funnels through before control returns
//! to the HAL's assembly stub.
//!
//! [`uctxt::route`] is pure classification; this module is what actually
//! drives a kernel's handler callbacks off that classification, wired to
//! a live [`PerCpuSubstrate`]. It owns exactly two side effects the
//! routing table itself can't express: draining a pending (real or
//! RISC-V-emulated) NMI unconditionally on every entry (§4.9), and
//! stashing a recovered user-copy fault into the per-CPU record so
//! [`crate::usercopy`]'s retry loop can observe it once the arch-specific
//! trampoline has long-jumped back (§4.12, §9). That jump itself is not
//! this crate's concern — see [`crate::usercopy`]'s module doc.

use nux_hal::cpu::HalCpu;
use nux_plt::Platform;

use crate::percpu::{FaultInfo, PerCpuSubstrate};
use crate::uctxt::{route, DispatchAction, EntryReason, Uctxt};

/// The kernel-side handlers the dispatcher upcalls into. Implemented by
/// whatever owns process/thread state; this crate only needs the
/// contract.
pub trait EntryCallbacks {
    /// Handles a user syscall, returning the `Uctxt` to resume.
    fn on_syscall(&self, uctxt: Uctxt) -> Uctxt;
    /// Handles a page fault at `va` with architecture-specific `info`.
    fn on_page_fault(&self, uctxt: Uctxt, va: u64, info: u64) -> Uctxt;
    /// Handles any other synchronous exception.
    fn on_exception(&self, uctxt: Uctxt, vector: u32) -> Uctxt;
    /// Handles a platform IRQ, IPI, or timer tick.
    fn on_irq(&self, uctxt: Uctxt, vector: u32) -> Uctxt;
    /// Nothing recoverable; never returns.
    fn on_panic(&self, uctxt: Uctxt, reason: EntryReason) -> !;
}

/// Runs one trap through the full §4.11 pipeline: drains any pending
/// emulated NMI first (regardless of `reason`, per §4.9), classifies
/// `(reason, uctxt)` against this CPU's `usrpgfault` state, and either
/// upcalls into `callbacks`, services the NMI locally, or stashes a
/// recovered user-copy fault for [`crate::usercopy`] to observe.
///
/// Returns the `Uctxt` the HAL stub should resume into. For
/// [`DispatchAction::RecoverUserCopy`] the returned value is `uctxt`
/// unchanged — by definition there is no frame to resume here; the
/// arch-specific trampoline is expected to have already diverted
/// execution into the user-copy primitive's jmpbuf before this function
/// is ever called again, using the fault this call just stashed.
pub fn dispatch<P: Platform, H: HalCpu, C: EntryCallbacks>(
    substrate: &PerCpuSubstrate<P, H>,
    reason: EntryReason,
    uctxt: Uctxt,
    callbacks: &C,
    is_user_va: impl Fn(u64) -> bool,
) -> Uctxt {
    substrate.drain_pending_nmi();

    let user_copy_in_flight = substrate.this_cpu().usrpgfault_armed();
    let action = route(reason, uctxt, user_copy_in_flight, &is_user_va);

    match action {
        DispatchAction::Syscall => callbacks.on_syscall(uctxt),
        DispatchAction::PageFault { va, info } => callbacks.on_page_fault(uctxt, va, info),
        DispatchAction::RecoverUserCopy { va, info } => {
            substrate.this_cpu().stash_fault(FaultInfo { va, info });
            uctxt
        }
        DispatchAction::Exception { vector } => callbacks.on_exception(uctxt, vector),
        DispatchAction::DrainTlbOp => {
            substrate.service_nmi();
            uctxt
        }
        DispatchAction::Irq { vector } => callbacks.on_irq(uctxt, vector),
        DispatchAction::Panic => callbacks.on_panic(uctxt, reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::{Cell, RefCell};

    use nux_core::tlb::TlbOp;
    use nux_plt::{CpuDescriptor, IrqType};

    struct NoopPlatform;
    impl Platform for NoopPlatform {
        fn plt_hw_putc(&self, _byte: u8) {}
        fn plt_irq_type(&self, _irq: u32) -> IrqType {
            IrqType::Edge
        }
        fn plt_irq_enable(&self, _irq: u32) {}
        fn plt_irq_disable(&self, _irq: u32) {}
        fn plt_irq_max(&self) -> u32 {
            0
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
            1
        }
        fn plt_tmr_setalm(&self, _deadline: u64) {}
        fn plt_tmr_clralm(&self) {}
        fn plt_eoi_timer(&self) {}
        fn plt_eoi_irq(&self, _irq: u32) {}
        fn plt_eoi_ipi(&self) {}
    }

    struct NoopCpu;
    impl HalCpu for NoopCpu {
        fn cpu_relax() {}
        fn halt() {}
        fn cpu_tlbop(_op: TlbOp, _va: Option<nux_core::VirtAddr>) {}
        fn irq_disable() -> bool {
            true
        }
        fn irq_restore(_was_enabled: bool) {}
    }

    #[derive(Default)]
    struct RecordingCallbacks {
        syscalls: Cell<u32>,
        page_faults: RefCell<Option<(u64, u64)>>,
        exceptions: Cell<Option<u32>>,
        irqs: Cell<Option<u32>>,
        panicked: Cell<bool>,
    }

    impl EntryCallbacks for RecordingCallbacks {
        fn on_syscall(&self, uctxt: Uctxt) -> Uctxt {
            self.syscalls.set(self.syscalls.get() + 1);
            uctxt
        }
        fn on_page_fault(&self, uctxt: Uctxt, va: u64, info: u64) -> Uctxt {
            *self.page_faults.borrow_mut() = Some((va, info));
            uctxt
        }
        fn on_exception(&self, uctxt: Uctxt, vector: u32) -> Uctxt {
            self.exceptions.set(Some(vector));
            uctxt
        }
        fn on_irq(&self, uctxt: Uctxt, vector: u32) -> Uctxt {
            self.irqs.set(Some(vector));
            uctxt
        }
        fn on_panic(&self, _uctxt: Uctxt, _reason: EntryReason) -> ! {
            self.panicked.set(true);
            panic!("dispatch reached on_panic in test");
        }
    }

    fn is_user_va(va: u64) -> bool {
        va < 0x0000_8000_0000_0000
    }

    fn substrate() -> PerCpuSubstrate<NoopPlatform, NoopCpu> {
        let s = PerCpuSubstrate::new(NoopPlatform);
        s.bring_up_all(0, 0);
        s
    }

    #[test]
    fn syscall_from_user_upcalls_on_syscall() {
        let s = substrate();
        let cb = RecordingCallbacks::default();
        let out = dispatch(&s, EntryReason::Syscall, Uctxt::User(0x1000), &cb, is_user_va);
        assert_eq!(out, Uctxt::User(0x1000));
        assert_eq!(cb.syscalls.get(), 1);
    }

    #[test]
    fn page_fault_from_user_upcalls_with_va_and_info() {
        let s = substrate();
        let cb = RecordingCallbacks::default();
        dispatch(&s, EntryReason::PageFault { va: 0x3000, info: 5 }, Uctxt::User(0x1000), &cb, is_user_va);
        assert_eq!(*cb.page_faults.borrow(), Some((0x3000, 5)));
    }

    #[test]
    fn invalid_page_fault_with_copy_armed_stashes_fault_without_upcalling() {
        let s = substrate();
        let cb = RecordingCallbacks::default();
        s.this_cpu().arm_usrpgfault();
        let out = dispatch(&s, EntryReason::PageFault { va: 0x4000, info: 9 }, Uctxt::Invalid, &cb, is_user_va);
        assert_eq!(out, Uctxt::Invalid);
        assert!(cb.page_faults.borrow().is_none());
        assert_eq!(s.this_cpu().stashed_fault(), FaultInfo { va: 0x4000, info: 9 });
    }

    #[test]
    fn nmi_drains_locally_without_any_upcall() {
        let s = substrate();
        let cb = RecordingCallbacks::default();
        s.this_cpu().accumulate_tlbop(TlbOp::Flush);
        dispatch(&s, EntryReason::Nmi, Uctxt::Idle, &cb, is_user_va);
        assert_eq!(s.this_cpu().take_tlbop(), TlbOp::None);
        assert!(cb.exceptions.get().is_none() && cb.irqs.get().is_none());
    }

    #[test]
    fn irq_upcalls_from_idle_uctxt() {
        let s = substrate();
        let cb = RecordingCallbacks::default();
        let out = dispatch(&s, EntryReason::Irq { vector: 33 }, Uctxt::Idle, &cb, is_user_va);
        assert_eq!(out, Uctxt::Idle);
        assert_eq!(cb.irqs.get(), Some(33));
    }

    #[test]
    fn pending_emulated_nmi_drains_even_on_an_unrelated_irq_entry() {
        let s = substrate();
        let cb = RecordingCallbacks::default();
        s.this_cpu().accumulate_tlbop(TlbOp::FlushAll);
        s.this_cpu().raise_nmi();
        dispatch(&s, EntryReason::Irq { vector: 40 }, Uctxt::User(0x1000), &cb, is_user_va);
        assert_eq!(s.this_cpu().take_tlbop(), TlbOp::None);
    }

    #[test]
    #[should_panic(expected = "dispatch reached on_panic in test")]
    fn syscall_from_invalid_uctxt_panics() {
        let s = substrate();
        let cb = RecordingCallbacks::default();
        dispatch(&s, EntryReason::Syscall, Uctxt::Invalid, &cb, is_user_va);
    }
}
