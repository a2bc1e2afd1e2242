//! Spin-based synchronization primitives.
//!
//! NUX has no blocking/suspension points (§5): every shared resource is
//! protected by a spinlock, optionally one that also disables interrupts
//! for locks taken from contexts where a same-CPU interrupt could
//! re-enter the critical section.

pub mod irq_spinlock;
#[cfg(nux_lockdep)]
pub mod lockdep;
pub mod rwlock;
pub mod spinlock;

pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
