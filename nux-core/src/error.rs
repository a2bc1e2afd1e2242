//! The error boundary (§7).
//!
//! Hot-path allocator and page-table-engine primitives return in-band
//! sentinels (`PFN_INVALID`, `VADDR_INVALID`, `L1P::INVALID`, `false`) and
//! never this type — a `Result` on every S-tree bit flip would cost real
//! cycles on paths taken on every page fault. Everything above that
//! boundary (the dispatcher, KMEM, the platform layer, APXH) returns
//! `Result<T, NuxError>` like ordinary Rust.

use core::fmt;

/// Kernel-wide error type for anything above the hot-path sentinel boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NuxError {
    /// The physical frame allocator has no free frames left.
    OomFrame,
    /// A virtual-address space allocator (KVA, UMAP) is exhausted.
    OomVa,
    /// The address being operated on has no mapping.
    Unmapped,
    /// A `uctxt` tagged pointer did not decode to a valid tag.
    InvalidUctxt,
    /// A user-memory access faulted and was recovered via the
    /// `usrpgfault` envelope.
    UserFault,
    /// An ELF image failed header or program-header validation.
    MalformedElf,
    /// An S-tree header failed validation (bad magic, size mismatch,
    /// level-count mismatch).
    MalformedStree,
    /// A wire structure's magic field didn't match what was expected.
    WrongMagic,
}

impl fmt::Display for NuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OomFrame => "out of physical frames",
            Self::OomVa => "out of virtual address space",
            Self::Unmapped => "address not mapped",
            Self::InvalidUctxt => "invalid uctxt tag",
            Self::UserFault => "user memory access faulted",
            Self::MalformedElf => "malformed ELF image",
            Self::MalformedStree => "malformed S-tree header",
            Self::WrongMagic => "wrong magic value",
        };
        f.write_str(msg)
    }
}
