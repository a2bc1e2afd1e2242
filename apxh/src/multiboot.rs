//! Multiboot2 information parsing (§3, §4.1).
//!
//! x86's firmware-description mechanism: GRUB (or any multiboot2-
//! compliant loader) hands `_start` a physical pointer to a tag stream
//! — memory map, framebuffer, old/new ACPI RSDP — immediately after the
//! fixed 8-byte `{total_size, reserved}` header. Every tag is 8-byte
//! aligned and padded; a `type == 0` tag ends the stream. This is the
//! loader's only source of the firmware memory map (§3's `maxrampfn`
//! and region classification all derive from it), so it is in scope the
//! same way `nux_elf`'s extension-header parsing is: read-only,
//! dispatch-only, the producing side (GRUB) is someone else's problem.

use crate::memmap::{FirmwareRegion, FirmwareRegionKind, MAX_REGIONS};
use nux_core::addr::PAGE_SHIFT;
use nux_core::bootinfo::{FramebufferDescriptor, FRAMEBUFFER_RGB};
use planck_noalloc::vec::ArrayVec;

const TAG_END: u32 = 0;
const TAG_MEMORY_MAP: u32 = 6;
const TAG_FRAMEBUFFER: u32 = 8;
const TAG_ACPI_OLD: u32 = 14;
const TAG_ACPI_NEW: u32 = 15;

const MB_MEMORY_AVAILABLE: u32 = 1;

#[repr(C)]
struct TagHeader {
    kind: u32,
    size: u32,
}

/// Walks the multiboot2 tag stream starting at `info`, calling `visit`
/// with each tag's type and a pointer to its payload (immediately after
/// the 8-byte tag header).
///
/// # Safety
///
/// `info` must point to a valid multiboot2 information structure as
/// handed to `_start` by the boot loader, mapped and readable for at
/// least `total_size` bytes.
unsafe fn for_each_tag(info: *const u8, mut visit: impl FnMut(u32, *const u8, u32)) {
    // SAFETY: caller guarantees `info` is a valid multiboot2 block; the
    // first 8 bytes are always `{total_size, reserved}`.
    let total_size = unsafe { (info.cast::<u32>()).read_unaligned() };
    let mut cursor = info.wrapping_add(8);
    let end = info.wrapping_add(total_size as usize);
    while cursor < end {
        // SAFETY: still within `[info, info + total_size)` by the loop
        // guard, and every tag is at least 8 bytes (the header itself).
        let header = unsafe { (cursor.cast::<TagHeader>()).read_unaligned() };
        if header.kind == TAG_END {
            break;
        }
        visit(header.kind, cursor.wrapping_add(8), header.size - 8);
        let padded = (header.size as usize + 7) & !7;
        cursor = cursor.wrapping_add(padded);
    }
}

#[repr(C)]
struct MmapEntry {
    base_addr: u64,
    length: u64,
    kind: u32,
    reserved: u32,
}

/// Collects the multiboot2 memory-map tag into the loader's own
/// [`FirmwareRegion`] model. Returns an empty vector if `info` carries
/// no memory-map tag (a malformed or non-multiboot2 boot — `main.rs`
/// treats that as fatal, same as the reference loader's
/// `assert (info->flags & MULTIBOOT_INFO_MEM_MAP)`).
///
/// # Safety
///
/// Same precondition as [`for_each_tag`].
pub unsafe fn memory_map(info: *const u8) -> ArrayVec<FirmwareRegion, MAX_REGIONS> {
    let mut out = ArrayVec::new();
    // SAFETY: caller's precondition.
    unsafe {
        for_each_tag(info, |kind, data, size| {
            if kind != TAG_MEMORY_MAP {
                return;
            }
            // SAFETY: memory-map tag payload is `{entry_size, entry_version}`
            // followed by `entry_size`-sized entries; multiboot2 always
            // sets `entry_size == size_of::<MmapEntry>()`.
            let entry_size = (data.cast::<u32>()).read_unaligned();
            let entries_start = data.wrapping_add(8);
            let entry_count = (size - 8) / entry_size;
            for i in 0..entry_count {
                if out.is_full() {
                    break;
                }
                let entry_ptr = entries_start.wrapping_add((i * entry_size) as usize).cast::<MmapEntry>();
                let entry = entry_ptr.read_unaligned();
                let kind = if entry.kind == MB_MEMORY_AVAILABLE { FirmwareRegionKind::Ram } else { FirmwareRegionKind::Mmio };
                out.push(FirmwareRegion { pfn: entry.base_addr >> PAGE_SHIFT, len: entry.length >> PAGE_SHIFT, kind });
            }
        });
    }
    out
}

#[repr(C)]
struct FramebufferTag {
    addr: u64,
    pitch: u32,
    width: u32,
    height: u32,
    bpp: u8,
    fb_type: u8,
    reserved: u16,
}

const MB_FRAMEBUFFER_TYPE_RGB: u8 = 1;

/// Collects the multiboot2 framebuffer tag, if present and RGB
/// (indexed-color and EGA-text framebuffers are not a linear framebuffer
/// this loader's `FRAMEBUF` segment can map, matching the reference
/// loader's `parse_multiboot_framebuffer`'s EGA-text exclusion).
///
/// # Safety
///
/// Same precondition as [`for_each_tag`].
pub unsafe fn framebuffer(info: *const u8) -> FramebufferDescriptor {
    let mut desc = FramebufferDescriptor::INVALID;
    // SAFETY: caller's precondition.
    unsafe {
        for_each_tag(info, |kind, data, _size| {
            if kind != TAG_FRAMEBUFFER {
                return;
            }
            // SAFETY: framebuffer tag payload always starts with this
            // fixed-layout header, per the multiboot2 specification.
            let tag = data.cast::<FramebufferTag>().read_unaligned();
            if tag.fb_type != MB_FRAMEBUFFER_TYPE_RGB {
                return;
            }
            desc = FramebufferDescriptor {
                kind: FRAMEBUFFER_RGB,
                addr: tag.addr,
                size: u64::from(tag.pitch) * u64::from(tag.height),
                pitch: tag.pitch,
                width: tag.width,
                height: tag.height,
                bpp: u32::from(tag.bpp),
                r_mask: 0,
                g_mask: 0,
                b_mask: 0,
            };
        });
    }
    desc
}

/// Returns the physical address of the ACPI RSDP, old or new tag,
/// whichever is present (new preferred, matching every real firmware
/// discovery convention).
///
/// # Safety
///
/// Same precondition as [`for_each_tag`].
pub unsafe fn acpi_rsdp(info: *const u8) -> Option<u64> {
    let mut rsdp = None;
    // SAFETY: caller's precondition.
    unsafe {
        for_each_tag(info, |kind, data, _size| match kind {
            TAG_ACPI_NEW => rsdp = Some(data as u64),
            TAG_ACPI_OLD if rsdp.is_none() => rsdp = Some(data as u64),
            _ => {}
        });
    }
    rsdp
}
