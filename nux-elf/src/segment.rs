//! Program header iteration: [`ElfFile`] is the loader's entry point,
//! handing out both standard `PT_LOAD` segments and APXH extension
//! segments from the same table.

use crate::extension::ExtensionKind;
use crate::header::{ElfError, ElfHeader, ProgramHeader, PT_LOAD};

/// A parsed ELF file: a borrow of the raw bytes plus the already-parsed
/// and bounds-checked file header.
#[derive(Debug, Clone, Copy)]
pub struct ElfFile<'a> {
    data: &'a [u8],
    header: ElfHeader,
}

/// A loadable segment extracted from a `PT_LOAD` program header.
#[derive(Debug)]
pub struct LoadSegment<'a> {
    /// Virtual address where this segment should be mapped.
    pub vaddr: u64,
    /// File content of the segment; the remainder up to `memsz` is
    /// zero-filled.
    pub data: &'a [u8],
    /// Total size of the segment once mapped.
    pub memsz: u64,
    /// Segment permission flags (`PF_R = 4`, `PF_W = 2`, `PF_X = 1`).
    pub flags: u32,
}

impl<'a> ElfFile<'a> {
    /// Parses an ELF file from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ElfError`] if the header is invalid or the data is too
    /// short for the program header table it declares.
    pub fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        let header = ElfHeader::parse(data)?;
        Ok(Self { data, header })
    }

    /// Returns the virtual address of the entry point.
    #[must_use]
    pub fn entry_point(&self) -> u64 {
        self.header.e_entry
    }

    /// Returns the parsed file header.
    #[must_use]
    pub fn header(&self) -> &ElfHeader {
        &self.header
    }

    fn program_headers(&self) -> impl Iterator<Item = ProgramHeader> + 'a {
        let data = self.data;
        let class = self.header.class;
        let phoff = self.header.e_phoff as usize;
        let phentsize = self.header.e_phentsize as usize;
        let phnum = self.header.e_phnum as usize;
        (0..phnum).map(move |i| ProgramHeader::parse(data, phoff + i * phentsize, class))
    }

    /// Iterates over `PT_LOAD` segments in program-header order.
    pub fn load_segments(&self) -> impl Iterator<Item = LoadSegment<'a>> + 'a {
        let data = self.data;
        self.program_headers().filter(|ph| ph.p_type == PT_LOAD).map(move |ph| {
            let start = ph.offset as usize;
            let end = start + ph.filesz as usize;
            LoadSegment {
                vaddr: ph.vaddr,
                data: &data[start..end],
                memsz: ph.memsz,
                flags: ph.flags,
            }
        })
    }

    /// Iterates over recognized APXH extension program headers, paired
    /// with their classification. Unrecognized `p_type` values (including
    /// `PT_LOAD`, handled separately) are skipped.
    pub fn extension_segments(&self) -> impl Iterator<Item = (ExtensionKind, ProgramHeader)> + 'a {
        self.program_headers()
            .filter_map(|ph| ExtensionKind::classify(ph.p_type).map(|kind| (kind, ph)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{PHT_APXH_INFO, PHT_APXH_PHYSMAP};
    use crate::header::tests::{append_elf64_phdr, make_elf64_header};

    #[test]
    fn load_segments_carry_file_data_and_zero_fill_size() {
        let mut buf = make_elf64_header();
        let seg_off = buf.len() + 56; // one phdr precedes the segment bytes
        append_elf64_phdr(&mut buf, PT_LOAD, 5, seg_off as u64, 0x40_0000, 8, 4096);
        buf.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let elf = ElfFile::parse(&buf).unwrap();
        let segs: Vec<_> = elf.load_segments().collect();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].vaddr, 0x40_0000);
        assert_eq!(segs[0].memsz, 4096);
        assert_eq!(segs[0].data, &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn extension_segments_are_classified_and_load_is_excluded() {
        let mut buf = make_elf64_header();
        append_elf64_phdr(&mut buf, PT_LOAD, 5, 0, 0x40_0000, 0, 4096);
        append_elf64_phdr(&mut buf, PHT_APXH_INFO, 0, 0, 0xFFFF_8000_0000_0000, 0, 64);
        append_elf64_phdr(&mut buf, PHT_APXH_PHYSMAP, 0, 0, 0xFFFF_8000_4000_0000, 0, 1 << 30);

        let elf = ElfFile::parse(&buf).unwrap();
        let exts: Vec<_> = elf.extension_segments().collect();
        assert_eq!(exts.len(), 2);
        assert_eq!(exts[0].0, ExtensionKind::Info);
        assert_eq!(exts[1].0, ExtensionKind::PhysMap);
        assert_eq!(exts[1].1.memsz, 1 << 30);
    }
}
