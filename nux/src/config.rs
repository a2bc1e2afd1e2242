//! Configuration bridge: a single source of truth for compile-time
//! tunables, expressed as Cargo features plus a `const` module rather
//! than a runtime config file (§7) — there is nothing to parse, so
//! there is nothing that can fail to parse.

/// Maximum number of CPUs the per-CPU substrate (§4.9) sizes its tables
/// for. Matches [`nux_core::cpu_local::MAX_CPUS`]; kept as a separate
/// constant here (rather than re-exported) so a future build that wants
/// a smaller bound for an embedded target can shrink this independent
/// of the host-test-only default in `nux-core`.
pub const MAX_CPUS: usize = nux_core::cpu_local::MAX_CPUS;

/// Number of top-level shadow PTE slots a [`nux_mm::umap::Umap`]
/// carries. Eight 512 GiB slots on x86-64 long mode; three 1 GiB slots
/// on x86 PAE (§4.10). RISC-V Sv48 shares the x86-64 value since both
/// are 4-level, 9-bit-per-level page tables.
#[cfg(feature = "paging-pae")]
pub const UMAP_SLOTS: usize = 3;

/// See [`UMAP_SLOTS`] (PAE variant).
#[cfg(not(feature = "paging-pae"))]
pub const UMAP_SLOTS: usize = 8;

/// Whether this build links the ACPI (x86) or SBI+FDT (RISC-V) platform
/// discovery implementation — a build-time choice (§4.13), never a
/// runtime branch. Exactly one of the `plt-acpi`/`plt-sbi-fdt` features
/// must be enabled; which one is asserted at the selection site in
/// [`crate::platform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformBackend {
    /// ACPI-discovered x86.
    Acpi,
    /// SBI+FDT-discovered RISC-V.
    SbiFdt,
}
