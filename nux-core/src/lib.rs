//! Core types and synchronization primitives for the NUX kernel library.
//!
//! Everything in this crate is hardware-independent and host-testable:
//! address newtypes, the searchable bitmap (S-tree), page-table-entry flags
//! and the TLB-op classifier, spinlocks, per-CPU storage shape, and the
//! error/logging facades shared by every layer above it.
#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), allow(internal_features))]
#![feature(negative_impls)]

pub mod addr;
pub mod bootinfo;
pub mod cpu_local;
pub mod error;
pub mod id;
pub mod log;
pub mod paging;
pub mod pte;
pub mod safety;
pub mod stree;
pub mod sync;
pub mod tlb;

pub use addr::{PhysAddr, VirtAddr};
pub use error::NuxError;
pub use tlb::TlbOp;
