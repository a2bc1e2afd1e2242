//! The NUX kernel library: the architecture- and firmware-independent
//! core a kernel links against, built on `nux-core`'s primitives,
//! `nux-mm`'s address-space data structures, and the `nux-hal`/`nux-plt`
//! traits for everything that genuinely has to vary.
//!
//! This crate contributes the pieces that only make sense once those
//! layers are tied together: per-CPU state and NMI-driven TLB
//! shootdown ([`percpu`]), the entry dispatcher's trap classification
//! and upcall wiring ([`uctxt`], [`dispatch`]), safe user-memory access
//! ([`usercopy`]), build-time platform backend selection ([`platform`]),
//! and the compile-time configuration surface ([`config`]).
#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod dispatch;
pub mod percpu;
pub mod platform;
pub mod uctxt;
pub mod usercopy;

pub use dispatch::{dispatch, EntryCallbacks};
pub use nux_mm::umap::CpuMask;
pub use percpu::{FaultInfo, PerCpuSubstrate, UmapShootdown};
pub use platform::SelectedPlatform;
pub use uctxt::{route, DispatchAction, EntryReason, Uctxt};
