//! The user-context tagged pointer (§3, §4.11): what the entry
//! dispatcher resumes into, or the sentinel it uses when there is
//! nothing user-side to resume.

/// A saved user trap frame, or one of two sentinels distinguishing *why*
/// there isn't one.
///
/// `Uctxt` wraps a raw frame pointer rather than an enum over a generic
/// frame type because the entry dispatcher (§4.11) needs to pass it
/// across the HAL boundary unchanged — the concrete frame layout is
/// arch-specific and opaque to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Uctxt {
    /// The CPU was in its idle loop when the trap landed: there is no
    /// kernel stack frame to return to, only the idle trampoline.
    Idle,
    /// The trap landed in non-idle kernel execution. Never returnable —
    /// any routing decision that reaches here for a reason other than
    /// NMI or a recoverable page fault is a kernel bug.
    Invalid,
    /// A live user frame at this address.
    User(usize),
}

impl Uctxt {
    /// Whether this is [`Uctxt::User`].
    #[must_use]
    pub const fn is_user(self) -> bool {
        matches!(self, Self::User(_))
    }

    /// Whether this is [`Uctxt::Idle`].
    #[must_use]
    pub const fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Whether this is [`Uctxt::Invalid`].
    #[must_use]
    pub const fn is_invalid(self) -> bool {
        matches!(self, Self::Invalid)
    }

    /// The frame address, if this is [`Uctxt::User`].
    #[must_use]
    pub const fn frame_addr(self) -> Option<usize> {
        match self {
            Self::User(addr) => Some(addr),
            Self::Idle | Self::Invalid => None,
        }
    }
}

/// Why the dispatcher was entered (§4.11's routing table rows).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryReason {
    /// A user syscall instruction.
    Syscall,
    /// A page fault, carrying the faulting address and architecture-
    /// specific fault info (access type, present/permission bit).
    PageFault { va: u64, info: u64 },
    /// Any other synchronous exception (divide-by-zero, invalid opcode,
    /// general protection fault, ...).
    Exception { vector: u32 },
    /// A non-maskable interrupt (real on x86, emulated on RISC-V, §4.9).
    Nmi,
    /// A platform IRQ, inter-processor interrupt, or timer tick.
    Irq { vector: u32 },
}

/// What the dispatcher does with one `(reason, uctxt)` pair, per the
/// routing table in §4.11.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAction {
    /// Upcall into the kernel's syscall handler.
    Syscall,
    /// Upcall into the kernel's page-fault handler with `(va, info)`.
    PageFault { va: u64, info: u64 },
    /// Long-jump into the in-flight user-copy's recovery handler — the
    /// `INVALID`-context page-fault case when a copy armed
    /// `usrpgfault` (§4.12).
    RecoverUserCopy { va: u64, info: u64 },
    /// Upcall into the kernel's generic exception handler.
    Exception { vector: u32 },
    /// Drain the pending TLB operation and return without upcalling
    /// (NMI never reaches kernel code, §4.9).
    DrainTlbOp,
    /// Upcall into the kernel's IRQ handler.
    Irq { vector: u32 },
    /// Nothing recoverable: call `hal_panic` and halt (§7's
    /// `Invalid-uctxt` error kind).
    Panic,
}

/// Classifies one dispatcher entry, implementing §4.11's routing table
/// exactly: three `uctxt` states (`User`/`Invalid`/`Idle`) crossed with
/// five reasons.
///
/// `user_copy_in_flight` is the per-CPU `usrpgfault` flag (§4.12):
/// whether a page fault while `uctxt` is `Invalid` should be treated as
/// a recoverable user-copy fault (`va` inside the user window) rather
/// than a kernel bug.
#[must_use]
pub fn route(reason: EntryReason, uctxt: Uctxt, user_copy_in_flight: bool, is_user_va: impl Fn(u64) -> bool) -> DispatchAction {
    match (reason, uctxt) {
        (EntryReason::Syscall, Uctxt::User(_)) => DispatchAction::Syscall,
        (EntryReason::Syscall, Uctxt::Invalid | Uctxt::Idle) => DispatchAction::Panic,

        (EntryReason::PageFault { va, info }, Uctxt::User(_)) => DispatchAction::PageFault { va, info },
        (EntryReason::PageFault { va, info }, Uctxt::Invalid) if user_copy_in_flight && is_user_va(va) => {
            DispatchAction::RecoverUserCopy { va, info }
        }
        (EntryReason::PageFault { .. }, Uctxt::Invalid | Uctxt::Idle) => DispatchAction::Panic,

        (EntryReason::Exception { vector }, Uctxt::User(_)) => DispatchAction::Exception { vector },
        (EntryReason::Exception { .. }, Uctxt::Invalid | Uctxt::Idle) => DispatchAction::Panic,

        (EntryReason::Nmi, _) => DispatchAction::DrainTlbOp,

        (EntryReason::Irq { vector }, Uctxt::User(_) | Uctxt::Invalid | Uctxt::Idle) => {
            DispatchAction::Irq { vector }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_user_va(va: u64) -> bool {
        va < 0x0000_8000_0000_0000
    }

    #[test]
    fn syscall_from_user_dispatches() {
        assert_eq!(route(EntryReason::Syscall, Uctxt::User(0x1000), false, is_user_va), DispatchAction::Syscall);
    }

    #[test]
    fn syscall_from_invalid_or_idle_panics() {
        assert_eq!(route(EntryReason::Syscall, Uctxt::Invalid, false, is_user_va), DispatchAction::Panic);
        assert_eq!(route(EntryReason::Syscall, Uctxt::Idle, false, is_user_va), DispatchAction::Panic);
    }

    #[test]
    fn page_fault_from_user_dispatches_with_fault_info() {
        let action = route(EntryReason::PageFault { va: 0x2000, info: 7 }, Uctxt::User(0x1000), false, is_user_va);
        assert_eq!(action, DispatchAction::PageFault { va: 0x2000, info: 7 });
    }

    #[test]
    fn page_fault_from_invalid_recovers_when_copy_in_flight_and_va_is_user() {
        let action = route(EntryReason::PageFault { va: 0x2000, info: 7 }, Uctxt::Invalid, true, is_user_va);
        assert_eq!(action, DispatchAction::RecoverUserCopy { va: 0x2000, info: 7 });
    }

    #[test]
    fn page_fault_from_invalid_panics_when_no_copy_in_flight() {
        let action = route(EntryReason::PageFault { va: 0x2000, info: 7 }, Uctxt::Invalid, false, is_user_va);
        assert_eq!(action, DispatchAction::Panic);
    }

    #[test]
    fn page_fault_from_invalid_panics_when_va_is_kernel_even_with_copy_in_flight() {
        let action = route(EntryReason::PageFault { va: 0xFFFF_8000_0000_0000, info: 7 }, Uctxt::Invalid, true, is_user_va);
        assert_eq!(action, DispatchAction::Panic);
    }

    #[test]
    fn nmi_always_drains_regardless_of_uctxt() {
        assert_eq!(route(EntryReason::Nmi, Uctxt::User(0x1000), false, is_user_va), DispatchAction::DrainTlbOp);
        assert_eq!(route(EntryReason::Nmi, Uctxt::Invalid, false, is_user_va), DispatchAction::DrainTlbOp);
        assert_eq!(route(EntryReason::Nmi, Uctxt::Idle, false, is_user_va), DispatchAction::DrainTlbOp);
    }

    #[test]
    fn irq_dispatches_from_every_uctxt_state() {
        let r = EntryReason::Irq { vector: 32 };
        assert_eq!(route(r, Uctxt::User(0x1000), false, is_user_va), DispatchAction::Irq { vector: 32 });
        assert_eq!(route(r, Uctxt::Invalid, false, is_user_va), DispatchAction::Irq { vector: 32 });
        assert_eq!(route(r, Uctxt::Idle, false, is_user_va), DispatchAction::Irq { vector: 32 });
    }
}
