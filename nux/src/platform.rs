//! Build-time platform backend selection (§4.13): picks which
//! [`nux_plt::Platform`] implementation this build links, as a type
//! alias rather than a runtime branch, and asserts exactly one of the
//! `plt-acpi`/`plt-sbi-fdt` features is enabled so that invariant is
//! checked at compile time instead of being a silent default.
//!
//! Building the concrete [`SelectedPlatform`] value — parsing the MADT
//! or the devicetree blob the boot-info record points at — is firmware
//! discovery, not backend selection, and belongs to whatever assembles
//! the kernel's boot sequence from the hand-off record (§6), not here.

#[cfg(all(feature = "plt-acpi", feature = "plt-sbi-fdt"))]
compile_error!("exactly one of the `plt-acpi`/`plt-sbi-fdt` features must be enabled, not both");

#[cfg(not(any(feature = "plt-acpi", feature = "plt-sbi-fdt")))]
compile_error!("exactly one of the `plt-acpi`/`plt-sbi-fdt` features must be enabled");

/// The `Platform` implementation this build links.
#[cfg(feature = "plt-acpi")]
pub type SelectedPlatform = nux_plt::AcpiPlatform;

/// The `Platform` implementation this build links.
#[cfg(feature = "plt-sbi-fdt")]
pub type SelectedPlatform = nux_plt::SbiFdtPlatform;

/// Which backend [`SelectedPlatform`] resolves to, for code that wants
/// to log or assert it rather than match on the type itself.
#[cfg(feature = "plt-acpi")]
pub const BACKEND: crate::config::PlatformBackend = crate::config::PlatformBackend::Acpi;

/// See the `plt-acpi` variant above.
#[cfg(feature = "plt-sbi-fdt")]
pub const BACKEND: crate::config::PlatformBackend = crate::config::PlatformBackend::SbiFdt;
