//! ELF32/64 header parsing and `ar50` payload reading for the APXH boot
//! loader.
//!
//! Parses ELF headers, standard `PT_LOAD` segments, and APXH's
//! extension program headers from raw byte slices using safe field
//! extraction (`from_le_bytes`). No unsafe code, no allocations.
//!
//! # Usage
//!
//! ```
//! use nux_elf::ElfFile;
//!
//! fn load_kernel(data: &[u8]) {
//!     let elf = ElfFile::parse(data).expect("valid ELF");
//!     let entry = elf.entry_point();
//!     for seg in elf.load_segments() {
//!         // Map seg.data at seg.vaddr, zero-fill to seg.memsz.
//!     }
//!     for (kind, ph) in elf.extension_segments() {
//!         // Build the region kind describes at ph.vaddr..+ph.memsz.
//!     }
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

pub mod ar50;
pub mod extension;
pub mod header;
pub mod segment;
mod util;

pub use ar50::{rad50_decode, rad50_encode, records, PayloadRecord, PAYLOAD_MAGIC, RAD50_MAX_LEN};
pub use extension::{
    ExtensionKind, PHT_APXH_EMPTY, PHT_APXH_FRAMEBUF, PHT_APXH_INFO, PHT_APXH_LINEAR,
    PHT_APXH_PFNMAP, PHT_APXH_PHYSMAP, PHT_APXH_PTALLOC, PHT_APXH_REGIONS, PHT_APXH_STREE,
    PHT_APXH_TOPPTALLOC,
};
pub use header::{ElfClass, ElfError, ElfHeader, ProgramHeader, EM_386, EM_RISCV, EM_X86_64, PT_LOAD};
pub use segment::{ElfFile, LoadSegment};
