//! Lock-ordering assertion, gated behind `cfg(nux_lockdep)` (§5).
//!
//! Full lockdep-style cycle detection is out of proportion for what this
//! substrate needs: §5 only asks for a fixed, small, *named* acquisition
//! order (PFN-cache, frame-allocator S-tree, KVA S-tree, per-zone KMEM,
//! per-CPU state, UMAP). This tracks, per CPU, the stack of currently
//! held lock levels and panics the moment a lower level is acquired while
//! a higher one is already held.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::cpu_local::current_cpu_id;

/// Maximum distinct lock classes this build can register.
const MAX_CLASSES: usize = 64;
/// Maximum simultaneously held locks on one CPU.
const MAX_HELD: usize = 16;
/// Maximum CPUs tracked (mirrors [`crate::cpu_local::MAX_CPUS`]).
const MAX_CPUS: usize = crate::cpu_local::MAX_CPUS;

/// Named acquisition levels from §5, lowest acquired first.
pub mod level {
    pub const PFN_CACHE: usize = 0;
    pub const FRAME_ALLOC: usize = 1;
    pub const KVA: usize = 2;
    pub const KMEM_ZONE: usize = 3;
    pub const PERCPU: usize = 4;
    pub const UMAP: usize = 5;
    /// Locks with no declared ordering are exempt from inversion checks.
    pub const UNORDERED: usize = usize::MAX;
}

/// The kind of lock, for diagnostic messages.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// A non-IRQ spinning lock.
    SpinLock,
    /// An interrupt-safe spinning lock.
    IrqSpinLock,
    /// A spinning reader-writer lock.
    RwLock,
}

/// A registered lock class: an opaque index into the class table.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LockClassId(usize);

impl LockClassId {
    /// Sentinel meaning "not registered" (used by lock-acquire fast paths
    /// that skip lockdep, e.g. [`super::spinlock::SpinLock::lock_unchecked`]).
    pub const NONE: Self = Self(usize::MAX);
}

struct ClassSlot {
    addr: AtomicUsize,
    level: AtomicUsize,
}

static CLASSES: [ClassSlot; MAX_CLASSES] = {
    const INIT: ClassSlot = ClassSlot { addr: AtomicUsize::new(0), level: AtomicUsize::new(level::UNORDERED) };
    [INIT; MAX_CLASSES]
};

static NEXT_CLASS: AtomicUsize = AtomicUsize::new(0);

/// Per-CPU stack of held lock levels (flat array, `MAX_CPUS * MAX_HELD`).
static HELD_LEVELS: [AtomicUsize; MAX_CPUS * MAX_HELD] = {
    const INIT: AtomicUsize = AtomicUsize::new(level::UNORDERED);
    [INIT; MAX_CPUS * MAX_HELD]
};
static HELD_DEPTH: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];

fn level_for_name(name: &'static str) -> usize {
    match name {
        "pfncache" => level::PFN_CACHE,
        "frame_alloc" | "pmm" => level::FRAME_ALLOC,
        "kva" => level::KVA,
        "kmem_zone" => level::KMEM_ZONE,
        "percpu" => level::PERCPU,
        "umap" => level::UMAP,
        _ => level::UNORDERED,
    }
}

/// Finds or creates the class for a lock at `addr` (its `self` pointer,
/// cast to `usize` — stable for the lock's lifetime) with the given name.
pub fn get_or_register(addr: usize, name: &'static str, _kind: LockKind) -> LockClassId {
    for (i, slot) in CLASSES.iter().enumerate() {
        if slot.addr.load(Ordering::Acquire) == addr {
            return LockClassId(i);
        }
    }
    let idx = NEXT_CLASS.fetch_add(1, Ordering::Relaxed);
    if idx >= MAX_CLASSES {
        return LockClassId::NONE;
    }
    CLASSES[idx].addr.store(addr, Ordering::Release);
    CLASSES[idx].level.store(level_for_name(name), Ordering::Release);
    LockClassId(idx)
}

/// Records that `class` was just acquired on the current CPU, panicking if
/// a lock of a lower declared level is already held.
pub fn lock_acquired(class: LockClassId) {
    if class == LockClassId::NONE {
        return;
    }
    let level = CLASSES[class.0].level.load(Ordering::Acquire);
    if level == level::UNORDERED {
        return;
    }
    let cpu = current_cpu_id() as usize % MAX_CPUS;
    let depth = HELD_DEPTH[cpu].load(Ordering::Relaxed);
    if depth > 0 {
        let top = HELD_LEVELS[cpu * MAX_HELD + depth - 1].load(Ordering::Relaxed);
        assert!(
            top == level::UNORDERED || level >= top,
            "lock order inversion: acquiring level {level} while holding level {top}"
        );
    }
    if depth < MAX_HELD {
        HELD_LEVELS[cpu * MAX_HELD + depth].store(level, Ordering::Relaxed);
        HELD_DEPTH[cpu].store(depth + 1, Ordering::Relaxed);
    }
}

/// Records that `class` was just released on the current CPU.
pub fn lock_released(class: LockClassId) {
    if class == LockClassId::NONE {
        return;
    }
    let cpu = current_cpu_id() as usize % MAX_CPUS;
    let depth = HELD_DEPTH[cpu].load(Ordering::Relaxed);
    if depth > 0 {
        HELD_DEPTH[cpu].store(depth - 1, Ordering::Relaxed);
    }
}
