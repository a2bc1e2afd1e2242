//! Architecture-independent page-table-entry contents (§3, §6).
//!
//! The wire encoding of a PTE is arch-specific (box/unbox is a HAL job);
//! this module defines the *abstract* `{pfn, flags}` pair every HAL boxes
//! into and unboxes out of, plus the merge rule used when two allocations
//! cover the same page.

use core::fmt;

use crate::addr::Pfn;

bitflags::bitflags! {
    /// Kernel-visible PTE flag bits (§6): `P=1, W=2, X=4, U=8, GLOBAL=0x10`,
    /// plus three software-available bits reserved for the kernel's own use.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        /// Present.
        const P      = 0x01;
        /// Writable.
        const W      = 0x02;
        /// Executable.
        const X      = 0x04;
        /// User-accessible.
        const U      = 0x08;
        /// Global (not flushed on address-space switch).
        const GLOBAL = 0x10;
        /// Software-available bit 0.
        const AVL0   = 0x20;
        /// Software-available bit 1.
        const AVL1   = 0x40;
        /// Software-available bit 2.
        const AVL2   = 0x80;
    }
}

impl PteFlags {
    /// Software-available bits, preserved verbatim by [`flags_merge`] and
    /// by the page-table round-trip property (§8).
    pub const AVL_MASK: Self = Self::AVL0.union(Self::AVL1).union(Self::AVL2);
}

/// The abstract contents of a present or absent PTE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    /// Frame this entry points at. Meaningless when `!flags.contains(P)`.
    pub pfn: Pfn,
    /// Flag bits.
    pub flags: PteFlags,
}

impl Pte {
    /// The absent/zero PTE.
    pub const ABSENT: Self = Self {
        pfn: Pfn::new(0),
        flags: PteFlags::empty(),
    };

    /// Whether the `P` bit is set.
    #[must_use]
    pub const fn present(self) -> bool {
        self.flags.contains(PteFlags::P)
    }
}

impl fmt::Display for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {:?}}}", self.pfn, self.flags)
    }
}

/// An opaque handle to one leaf slot inside a page table (§3).
///
/// Good enough to `get`/`set` that one slot; carries no ownership of the
/// table frame it lives in. [`L1P::INVALID`] marks "no such slot" (e.g.
/// `walk` without `alloc` hit a missing interior level).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct L1P(u64);

impl L1P {
    /// Sentinel meaning "no such leaf slot".
    pub const INVALID: Self = Self(u64::MAX);

    /// Wraps a raw, arch-defined encoding of a leaf-slot handle.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw encoding, for the HAL that produced it.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns whether this is [`L1P::INVALID`].
    #[must_use]
    pub const fn is_invalid(self) -> bool {
        self.0 == Self::INVALID.0
    }
}

/// Error from [`flags_merge`]: the two PTEs describing the same page
/// disagree on something that cannot be safely combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeError {
    /// Neither side is present; merging is meaningless.
    NeitherPresent,
    /// One side is user-accessible and the other is not — kernel/user
    /// mixing on the same page is always a bug (§4.2).
    UserMismatch,
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeitherPresent => write!(f, "flags_merge: neither side present"),
            Self::UserMismatch => write!(f, "flags_merge: U bit mismatch (kernel/user mixing)"),
        }
    }
}

/// Combines two flag sets covering the same page (§4.2, §8).
///
/// - `P` must be set in both, else [`MergeError::NeitherPresent`] (the
///   original asserts; here we surface it so callers can decide).
/// - `W` is OR'd (either allocation wanting write access wins).
/// - `X` is OR'd (RISC-V has no separate NX bit; this rewrite always
///   tracks the permissive `X` bit and lets the x86 HAL invert it to NX
///   when boxing).
/// - `U` must be equal in both sides, else [`MergeError::UserMismatch`].
/// - `GLOBAL` and the `AVL` bits are OR'd: a merge should never *lose*
///   information either side recorded.
///
/// Associative: `flags_merge(flags_merge(a, b), c) == flags_merge(a, flags_merge(b, c))`
/// for any three flag sets with agreeing `U` bits (§8).
pub fn flags_merge(a: PteFlags, b: PteFlags) -> Result<PteFlags, MergeError> {
    if !(a.contains(PteFlags::P) && b.contains(PteFlags::P)) {
        return Err(MergeError::NeitherPresent);
    }
    if a.contains(PteFlags::U) != b.contains(PteFlags::U) {
        return Err(MergeError::UserMismatch);
    }

    let mut merged = PteFlags::P | (a & PteFlags::U);
    merged |= (a | b) & (PteFlags::W | PteFlags::X | PteFlags::GLOBAL | PteFlags::AVL_MASK);
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pte_flags(bits: u8) -> PteFlags {
        PteFlags::from_bits_truncate(bits)
    }

    #[test]
    fn merge_ors_writable() {
        let a = pte_flags(PteFlags::P.bits());
        let b = pte_flags(PteFlags::P.bits() | PteFlags::W.bits());
        let merged = flags_merge(a, b).unwrap();
        assert!(merged.contains(PteFlags::W));
    }

    #[test]
    fn merge_rejects_user_mismatch() {
        let a = PteFlags::P;
        let b = PteFlags::P | PteFlags::U;
        assert_eq!(flags_merge(a, b), Err(MergeError::UserMismatch));
    }

    #[test]
    fn merge_rejects_neither_present() {
        assert_eq!(
            flags_merge(PteFlags::empty(), PteFlags::empty()),
            Err(MergeError::NeitherPresent)
        );
    }

    #[test]
    fn merge_is_associative() {
        let combos = [
            PteFlags::P,
            PteFlags::P | PteFlags::W,
            PteFlags::P | PteFlags::X,
            PteFlags::P | PteFlags::GLOBAL,
            PteFlags::P | PteFlags::AVL0,
        ];
        for &a in &combos {
            for &b in &combos {
                for &c in &combos {
                    let lhs = flags_merge(flags_merge(a, b).unwrap(), c).unwrap();
                    let rhs = flags_merge(a, flags_merge(b, c).unwrap()).unwrap();
                    assert_eq!(lhs, rhs, "a={a:?} b={b:?} c={c:?}");
                }
            }
        }
    }

    #[test]
    fn merge_preserves_avl_bits() {
        let a = PteFlags::P | PteFlags::AVL0;
        let b = PteFlags::P | PteFlags::AVL1;
        let merged = flags_merge(a, b).unwrap();
        assert!(merged.contains(PteFlags::AVL0));
        assert!(merged.contains(PteFlags::AVL1));
        assert!(!merged.contains(PteFlags::AVL2));
    }

    #[test]
    fn l1p_invalid_roundtrip() {
        assert!(L1P::INVALID.is_invalid());
        assert!(!L1P::new(0).is_invalid());
    }
}
