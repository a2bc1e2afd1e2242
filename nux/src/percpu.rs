//! The per-CPU substrate (§3 CPU record, §4.9): NMI-driven TLB
//! shootdown and the RISC-V NMI-emulation pending-bit pair, built on
//! [`nux_core::cpu_local::CpuLocal`] and the [`nux_hal::cpu::HalCpu`]/
//! [`nux_plt::Platform`] traits rather than any one architecture's
//! registers.
//!
//! Secondary-CPU bring-up (the platform-specific trampoline that maps
//! its own code page 1:1 and restores the PTE on completion) is a
//! boot-time, single-shot operation driven straight from `Platform`'s
//! `plt_pcpu_iterate`/`plt_pcpu_start`; it has no steady-state data
//! structure of its own and so isn't modeled as a type here, only as
//! the `bring_up_all` free function below.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use nux_core::cpu_local::CpuLocal;
use nux_core::tlb::TlbOp;
use nux_hal::cpu::HalCpu;
use nux_mm::umap::{CpuMask, TlbShootdownOps};
use nux_plt::{CpuDescriptor, Platform};

const fn tlbop_rank(op: TlbOp) -> u8 {
    match op {
        TlbOp::None => 0,
        TlbOp::Flush => 1,
        TlbOp::FlushAll => 2,
    }
}

const fn rank_to_tlbop(rank: u8) -> TlbOp {
    match rank {
        0 => TlbOp::None,
        1 => TlbOp::Flush,
        _ => TlbOp::FlushAll,
    }
}

/// NMI-emulation pending bit (§4.9): a shootdown is owed to this CPU.
const NMIOP_NMI: u8 = 1 << 0;
/// NMI-emulation pending bit: a regular IPI is owed to this CPU. Stays
/// pending across the idle-halt boundary — "on entering idle, pending
/// IPIs short-circuit the wait-for-interrupt" (§4.9).
const NMIOP_IPI: u8 = 1 << 1;

/// Opaque per-CPU idle-resume state (§3's "idle-jmpbuf"): the saved
/// register set an arch-specific idle trampoline needs to resume after
/// `halt()` returns. Concrete instruction emission for save/restore
/// belongs to the HAL (§9, "architecture polymorphism"); this struct
/// only reserves the storage every `CpuRecord` carries one of.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleJmpBuf([u64; 8]);

/// One fault captured by the page-fault handler while a user-memory
/// copy had `usrpgfault` armed (§4.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    /// The faulting virtual address.
    pub va: u64,
    /// Architecture-specific fault info (access type, present bit, ...).
    pub info: u64,
}

/// Per-CPU state (§3's "CPU record"): identity, the NMI-driven
/// TLB-shootdown accumulator, the RISC-V NMI-emulation pending pair,
/// and the user-copy fault-capture scratch (§4.12).
///
/// Every field here is either atomic or `Cell`-equivalent because
/// [`CpuLocal`] hands out a shared `&CpuRecord` to whichever CPU reads
/// its own slot, and `tlbop`/`nmiop` are additionally written from
/// *other* CPUs during shootdown — §5 requires atomic OR/AND with
/// acquire/release ordering for exactly these fields.
pub struct CpuRecord {
    logical_id: AtomicU32,
    phys_id: AtomicU64,
    tlbop: AtomicU8,
    nmiop: AtomicU8,
    usrpgfault: AtomicBool,
    usrpgaddr: AtomicU64,
    usrpginfo: AtomicU64,
    idle_jmpbuf: IdleJmpBuf,
}

impl CpuRecord {
    /// A fresh, unassigned record (logical/physical id `0`, nothing
    /// pending).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            logical_id: AtomicU32::new(0),
            phys_id: AtomicU64::new(0),
            tlbop: AtomicU8::new(0),
            nmiop: AtomicU8::new(0),
            usrpgfault: AtomicBool::new(false),
            usrpgaddr: AtomicU64::new(0),
            usrpginfo: AtomicU64::new(0),
            idle_jmpbuf: IdleJmpBuf([0; 8]),
        }
    }

    /// Assigns this slot's identity during single-threaded bring-up.
    pub fn assign(&self, cpu: CpuDescriptor) {
        self.logical_id.store(cpu.logical_id, Ordering::Relaxed);
        self.phys_id.store(cpu.phys_id, Ordering::Relaxed);
    }

    /// This CPU's physical identifier (APIC ID / hart ID).
    #[must_use]
    pub fn phys_id(&self) -> u64 {
        self.phys_id.load(Ordering::Relaxed)
    }

    /// This CPU's logical identifier.
    #[must_use]
    pub fn logical_id(&self) -> u32 {
        self.logical_id.load(Ordering::Relaxed)
    }

    /// OR-accumulates `op` into the pending TLB operation (the more
    /// expensive of the existing and new op wins, matching
    /// [`TlbOp::combine`]).
    pub fn accumulate_tlbop(&self, op: TlbOp) {
        self.tlbop.fetch_max(tlbop_rank(op), Ordering::AcqRel);
    }

    /// Reads-and-zeros the pending TLB operation (the NMI handler's
    /// first step, §4.9).
    pub fn take_tlbop(&self) -> TlbOp {
        rank_to_tlbop(self.tlbop.swap(0, Ordering::AcqRel))
    }

    /// Marks a real or emulated NMI pending (§4.9's RISC-V emulation
    /// pending-bit pair).
    pub fn raise_nmi(&self) {
        self.nmiop.fetch_or(NMIOP_NMI, Ordering::AcqRel);
    }

    /// Marks a regular IPI pending.
    pub fn raise_ipi(&self) {
        self.nmiop.fetch_or(NMIOP_IPI, Ordering::AcqRel);
    }

    /// Drains the pending-NMI bit, returning whether one was pending.
    /// Called unconditionally at the top of every kernel entry (§4.9:
    /// "the dispatcher first drains any pending NMI ... before routing
    /// to user handlers") — a no-op on platforms with real NMI delivery,
    /// since those never set this bit in the first place.
    pub fn take_pending_nmi(&self) -> bool {
        self.nmiop.fetch_and(!NMIOP_NMI, Ordering::AcqRel) & NMIOP_NMI != 0
    }

    /// Drains the pending-IPI bit, returning whether one was pending.
    /// Checked by the idle loop before halting: a pending IPI
    /// short-circuits the wait-for-interrupt (§4.9).
    pub fn take_pending_ipi(&self) -> bool {
        self.nmiop.fetch_and(!NMIOP_IPI, Ordering::AcqRel) & NMIOP_IPI != 0
    }

    /// Arms the "expected user fault" envelope (§4.12). Returns the
    /// previous value so a nested copy (there shouldn't be one, but
    /// defense in depth costs nothing here) can restore it.
    pub fn arm_usrpgfault(&self) -> bool {
        self.usrpgfault.swap(true, Ordering::AcqRel)
    }

    /// Disarms the envelope, restoring `was_armed`.
    pub fn disarm_usrpgfault(&self, was_armed: bool) {
        self.usrpgfault.store(was_armed, Ordering::Release);
    }

    /// Whether a user-copy fault is currently expected on this CPU.
    #[must_use]
    pub fn usrpgfault_armed(&self) -> bool {
        self.usrpgfault.load(Ordering::Acquire)
    }

    /// Stashes a captured fault (the page-fault handler's job when
    /// [`Self::usrpgfault_armed`] is true, §4.12).
    pub fn stash_fault(&self, fault: FaultInfo) {
        self.usrpgaddr.store(fault.va, Ordering::Release);
        self.usrpginfo.store(fault.info, Ordering::Release);
    }

    /// Reads back the most recently stashed fault.
    #[must_use]
    pub fn stashed_fault(&self) -> FaultInfo {
        FaultInfo { va: self.usrpgaddr.load(Ordering::Acquire), info: self.usrpginfo.load(Ordering::Acquire) }
    }

    /// Read-only access to the idle-resume scratch, for the HAL's idle
    /// trampoline.
    #[must_use]
    pub fn idle_jmpbuf(&self) -> &IdleJmpBuf {
        &self.idle_jmpbuf
    }
}

impl Default for CpuRecord {
    fn default() -> Self {
        Self::new()
    }
}

fn cpumask_bit_set(mask: CpuMask, id: u32) -> bool {
    mask[id as usize / 64] & (1 << (id as usize % 64)) != 0
}

/// Tracks which CPUs have a shootdown outstanding (§4.9's `tlbmap`):
/// the initiator sets a CPU's bit before sending its NMI/IPI and the
/// NMI handler clears its own bit once it has applied the op.
struct TlbMap([AtomicU64; 4]);

impl TlbMap {
    const fn new() -> Self {
        Self([AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)])
    }

    fn set(&self, id: u32) {
        self.0[id as usize / 64].fetch_or(1 << (id as usize % 64), Ordering::AcqRel);
    }

    fn clear(&self, id: u32) {
        self.0[id as usize / 64].fetch_and(!(1 << (id as usize % 64)), Ordering::AcqRel);
    }

    fn snapshot(&self) -> CpuMask {
        [
            self.0[0].load(Ordering::Acquire),
            self.0[1].load(Ordering::Acquire),
            self.0[2].load(Ordering::Acquire),
            self.0[3].load(Ordering::Acquire),
        ]
    }

    fn any_set(&self, targets: CpuMask) -> bool {
        let snap = self.snapshot();
        (0..4).any(|w| snap[w] & targets[w] != 0)
    }
}

/// The live per-CPU substrate: one [`CpuRecord`] per logical CPU plus
/// the shootdown-in-flight bitmap, parameterized over the linked
/// [`Platform`] (NMI/IPI issuance) and [`HalCpu`] (local TLB-op
/// execution).
pub struct PerCpuSubstrate<P, H> {
    records: CpuLocal<CpuRecord>,
    tlbmap: TlbMap,
    platform: P,
    _hal: core::marker::PhantomData<H>,
}

impl<P: Platform, H: HalCpu> PerCpuSubstrate<P, H> {
    /// Builds a substrate over `platform`, with every CPU slot
    /// unassigned. [`Self::bring_up_all`] assigns logical ids by
    /// enumeration order.
    #[must_use]
    pub const fn new(platform: P) -> Self {
        Self {
            records: CpuLocal::new([const { CpuRecord::new() }; nux_core::cpu_local::MAX_CPUS]),
            tlbmap: TlbMap::new(),
            platform,
            _hal: core::marker::PhantomData,
        }
    }

    /// Assigns every platform-enumerated CPU a logical id and records
    /// its physical id, then calls [`Platform::plt_pcpu_start`] for
    /// every CPU but the one calling this (already running). Per §4.9,
    /// one CPU at a time — the platform layer's own trampoline
    /// synchronization (mapping its code page 1:1, then restoring it)
    /// guarantees that ordering; this loop only sequences the calls.
    pub fn bring_up_all(&self, self_phys_id: u64, trampoline_pa: u64) {
        self.platform.plt_pcpu_iterate(&mut |cpu| {
            self.records.get_for(cpu.logical_id).assign(cpu);
            if cpu.phys_id != self_phys_id {
                self.platform.plt_pcpu_start(cpu, trampoline_pa);
            }
        });
    }

    /// This CPU's record.
    #[must_use]
    pub fn this_cpu(&self) -> &CpuRecord {
        self.records.get()
    }

    /// The record for a specific logical CPU.
    #[must_use]
    pub fn cpu(&self, logical_id: u32) -> &CpuRecord {
        self.records.get_for(logical_id)
    }

    /// Services a (real or emulated) NMI on this CPU: drains and
    /// applies the pending TLB op, then clears this CPU's `tlbmap` bit.
    /// Never takes a lock (§5: "NMI handler ... never takes locks").
    pub fn service_nmi(&self) {
        let me = self.this_cpu();
        let op = me.take_tlbop();
        if op != TlbOp::None {
            H::cpu_tlbop(op, None);
        }
        self.tlbmap.clear(me.logical_id());
    }

    /// Requests `op` on every CPU in `targets` (§4.9): for the calling
    /// CPU, applies it immediately; for every other, accumulates it
    /// into that CPU's `tlbop`, marks `tlbmap`, and sends a real or
    /// emulated NMI. If `synchronous`, spins until every targeted
    /// remote CPU has cleared its `tlbmap` bit.
    pub fn shootdown(&self, targets: CpuMask, op: TlbOp, synchronous: bool) {
        let me = self.this_cpu().logical_id();
        let mut remote_targets = targets;
        if cpumask_bit_set(targets, me) {
            H::cpu_tlbop(op, None);
            remote_targets[me as usize / 64] &= !(1 << (me as usize % 64));
        }

        for id in 0..u32::try_from(nux_core::cpu_local::MAX_CPUS).unwrap_or(u32::MAX) {
            if !cpumask_bit_set(remote_targets, id) {
                continue;
            }
            let record = self.cpu(id);
            record.accumulate_tlbop(op);
            self.tlbmap.set(id);
            let cpu = CpuDescriptor { logical_id: id, phys_id: record.phys_id() };
            self.platform.plt_pcpu_nmi(cpu);
        }

        if synchronous {
            while self.tlbmap.any_set(remote_targets) {
                H::cpu_relax();
            }
        }
    }

    /// Whether a pending IPI should short-circuit the idle wait (§4.9).
    #[must_use]
    pub fn take_pending_ipi(&self) -> bool {
        self.this_cpu().take_pending_ipi()
    }

    /// Drains this CPU's pending-NMI bit, servicing a shootdown if one
    /// was pending. Call unconditionally at the top of entry dispatch.
    pub fn drain_pending_nmi(&self) {
        if self.this_cpu().take_pending_nmi() {
            self.service_nmi();
        }
    }
}

/// Adapts a [`PerCpuSubstrate`] to [`nux_mm::umap::TlbShootdownOps`] so
/// `Umap::umap_commit` can drive the real shootdown path (§4.10).
pub struct UmapShootdown<'a, P, H>(pub &'a PerCpuSubstrate<P, H>);

impl<P: Platform, H: HalCpu> TlbShootdownOps for UmapShootdown<'_, P, H> {
    fn shootdown(&self, cpu_mask: CpuMask, op: TlbOp) {
        self.0.shootdown(cpu_mask, op, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;

    struct RecordingPlatform {
        nmi_sent: RefCell<Vec<CpuDescriptor>>,
    }

    impl Platform for RecordingPlatform {
        fn plt_hw_putc(&self, _byte: u8) {}
        fn plt_irq_type(&self, _irq: u32) -> nux_plt::IrqType {
            nux_plt::IrqType::Edge
        }
        fn plt_irq_enable(&self, _irq: u32) {}
        fn plt_irq_disable(&self, _irq: u32) {}
        fn plt_irq_max(&self) -> u32 {
            0
        }
        fn plt_pcpu_iterate(&self, f: &mut dyn FnMut(CpuDescriptor)) {
            f(CpuDescriptor { logical_id: 0, phys_id: 10 });
            f(CpuDescriptor { logical_id: 1, phys_id: 20 });
        }
        fn plt_pcpu_enter(&self, _cpu: CpuDescriptor) {}
        fn plt_pcpu_start(&self, _cpu: CpuDescriptor, _start_pa: u64) {}
        fn plt_pcpu_nmi(&self, cpu: CpuDescriptor) {
            self.nmi_sent.borrow_mut().push(cpu);
        }
        fn plt_pcpu_nmiall(&self) {}
        fn plt_pcpu_ipi(&self, _cpu: CpuDescriptor) {}
        fn plt_pcpu_ipiall(&self) {}
        fn plt_tmr_ctr(&self) -> u64 {
            0
        }
        fn plt_tmr_setctr(&self, _value: u64) {}
        fn plt_tmr_period(&self) -> u64 {
            0
        }
        fn plt_tmr_setalm(&self, _deadline: u64) {}
        fn plt_tmr_clralm(&self) {}
        fn plt_eoi_timer(&self) {}
        fn plt_eoi_irq(&self, _irq: u32) {}
        fn plt_eoi_ipi(&self) {}
    }

    struct CountingCpu;
    static LOCAL_TLBOPS: AtomicU32 = AtomicU32::new(0);

    impl HalCpu for CountingCpu {
        fn cpu_relax() {}
        fn halt() {}
        fn cpu_tlbop(_op: TlbOp, _va: Option<nux_core::addr::VirtAddr>) {
            LOCAL_TLBOPS.fetch_add(1, Ordering::Relaxed);
        }
        fn irq_disable() -> bool {
            true
        }
        fn irq_restore(_was_enabled: bool) {}
    }

    fn mask_of(ids: &[u32]) -> CpuMask {
        let mut m = [0u64; 4];
        for &id in ids {
            m[id as usize / 64] |= 1 << (id as usize % 64);
        }
        m
    }

    #[test]
    fn bring_up_assigns_every_enumerated_cpu() {
        let substrate: PerCpuSubstrate<RecordingPlatform, CountingCpu> =
            PerCpuSubstrate::new(RecordingPlatform { nmi_sent: RefCell::new(Vec::new()) });
        substrate.bring_up_all(10, 0x1000);
        assert_eq!(substrate.cpu(0).phys_id(), 10);
        assert_eq!(substrate.cpu(1).phys_id(), 20);
    }

    #[test]
    fn shootdown_applies_locally_and_nmis_remote_targets() {
        let substrate: PerCpuSubstrate<RecordingPlatform, CountingCpu> =
            PerCpuSubstrate::new(RecordingPlatform { nmi_sent: RefCell::new(Vec::new()) });
        substrate.bring_up_all(10, 0x1000);

        let before = LOCAL_TLBOPS.load(Ordering::Relaxed);
        substrate.shootdown(mask_of(&[0, 1]), TlbOp::Flush, false);
        assert_eq!(LOCAL_TLBOPS.load(Ordering::Relaxed), before + 1);
        assert_eq!(substrate.cpu(1).take_tlbop(), TlbOp::Flush);
    }

    #[test]
    fn service_nmi_drains_and_clears_tlbmap() {
        let substrate: PerCpuSubstrate<RecordingPlatform, CountingCpu> =
            PerCpuSubstrate::new(RecordingPlatform { nmi_sent: RefCell::new(Vec::new()) });
        substrate.bring_up_all(10, 0x1000);
        substrate.cpu(0).accumulate_tlbop(TlbOp::FlushAll);
        substrate.tlbmap.set(0);
        substrate.service_nmi();
        assert_eq!(substrate.cpu(0).take_tlbop(), TlbOp::None);
        assert!(!substrate.tlbmap.any_set(mask_of(&[0])));
    }

    #[test]
    fn nmi_emulation_pending_bits_are_independent() {
        let record = CpuRecord::new();
        record.raise_nmi();
        record.raise_ipi();
        assert!(record.take_pending_nmi());
        assert!(!record.take_pending_nmi());
        assert!(record.take_pending_ipi());
        assert!(!record.take_pending_ipi());
    }

    #[test]
    fn usrpgfault_envelope_arms_and_disarms() {
        let record = CpuRecord::new();
        assert!(!record.usrpgfault_armed());
        let was = record.arm_usrpgfault();
        assert!(!was);
        assert!(record.usrpgfault_armed());
        record.stash_fault(FaultInfo { va: 0x4000, info: 1 });
        assert_eq!(record.stashed_fault(), FaultInfo { va: 0x4000, info: 1 });
        record.disarm_usrpgfault(was);
        assert!(!record.usrpgfault_armed());
    }
}
