//! Locating the kernel and user ELF images inside the appended `ar50`
//! container (§4.1, §6).
//!
//! The loader's own image ends with a linker-provided symbol; every
//! byte after it is an [`nux_elf::ar50`] record stream. This module
//! scans that stream once and hands [`loader`](crate::loader) the two
//! images it cares about by name, already parsed as [`ElfFile`]s.

use nux_elf::{ar50, ElfError, ElfFile};

/// The record name the kernel image is appended under.
pub const KERNEL_RECORD_NAME: &str = "kernel";
/// The record name the optional userspace stub is appended under.
pub const USER_RECORD_NAME: &str = "user";

/// The images this loader found in the appended payload container. A
/// boot with no user payload (§3, §4.1: "or zero, if this boot carries
/// no user payload") leaves `user` as `None`.
pub struct Payload<'a> {
    /// The kernel ELF image.
    pub kernel: ElfFile<'a>,
    /// The optional userspace stub ELF image.
    pub user: Option<ElfFile<'a>>,
}

/// Why [`locate`] could not produce a usable [`Payload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadError {
    /// No record named [`KERNEL_RECORD_NAME`] was found in the
    /// container.
    MissingKernel,
    /// A record was found under a recognized name but failed to parse
    /// as a valid ELF image.
    Malformed(ElfError),
}

impl From<ElfError> for PayloadError {
    fn from(e: ElfError) -> Self {
        Self::Malformed(e)
    }
}

/// Scans `container` (the bytes starting at the loader image's
/// linker-provided end symbol) for the kernel record and, if present,
/// the user record, parsing each as an ELF image.
///
/// # Errors
///
/// Returns [`PayloadError::MissingKernel`] if no `"kernel"` record is
/// found, or [`PayloadError::Malformed`] if a found record fails ELF
/// validation.
pub fn locate(container: &[u8]) -> Result<Payload<'_>, PayloadError> {
    let mut kernel = None;
    let mut user = None;
    for record in ar50::records(container) {
        if record.name_is(KERNEL_RECORD_NAME) {
            kernel = Some(ElfFile::parse(record.data)?);
        } else if record.name_is(USER_RECORD_NAME) {
            user = Some(ElfFile::parse(record.data)?);
        }
    }
    let kernel = kernel.ok_or(PayloadError::MissingKernel)?;
    Ok(Payload { kernel, user })
}
