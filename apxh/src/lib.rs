//! APXH: the ELF-driven boot loader (§2 L0, §4.1).
//!
//! Consumes a firmware-described memory map and one or two `ar50`-framed
//! ELF payloads (the kernel, and optionally a userspace stub), builds the
//! initial page table the kernel will run with by dispatching on each
//! ELF program header's type — standard `PT_LOAD` segments and the
//! `PHT_APXH_*` extension headers nux-elf already classifies — and hands
//! off through a per-arch trampoline.
//!
//! Everything that can be expressed without touching real hardware lives
//! here as a library, generic over [`loader::LoaderMem`] the same way
//! `nux-mm`'s page-table engine is generic over `HalPaging`: the
//! construction-order state machine in [`loader`] is `cargo test`-able
//! against a software memory model. The `apxh` binary target
//! (`src/main.rs`) is the thin per-arch glue that wires real firmware
//! input and a real `LoaderMem` backend into it.
#![cfg_attr(not(test), no_std)]

pub mod arena;
pub mod loader;
pub mod memmap;
pub mod payload;
pub mod trampoline;

pub use arena::{BootArena, FrameSource};
pub use loader::{build_address_space, BuildInput, BuildOutput, LoaderMem};
pub use memmap::{FirmwareRegion, FirmwareRegionKind};
