//! ELF32/ELF64 file header parsing.
//!
//! Parses just enough of the ELF file header to hand the loader an
//! architecture-neutral, normalized view: every field is widened to `u64`
//! regardless of source class, so callers never branch on 32- vs 64-bit
//! after [`ElfHeader::parse`] returns.

use core::fmt;

use crate::util::{le_u16, le_u32, le_u64};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// `e_ident[EI_CLASS]`: 32-bit object.
const ELFCLASS32: u8 = 1;
/// `e_ident[EI_CLASS]`: 64-bit object.
const ELFCLASS64: u8 = 2;

/// `e_ident[EI_DATA]`: little-endian.
const ELFDATA2LSB: u8 = 1;

/// `e_type`: executable file.
const ET_EXEC: u16 = 2;
/// `e_type`: shared object / position-independent executable.
const ET_DYN: u16 = 3;

/// `e_machine`: Intel 80386.
pub const EM_386: u16 = 3;
/// `e_machine`: AMD x86-64.
pub const EM_X86_64: u16 = 62;
/// `e_machine`: RISC-V.
pub const EM_RISCV: u16 = 243;

/// Program header type: loadable segment.
pub const PT_LOAD: u32 = 1;

const ELF32_EHDR_SIZE: usize = 52;
const ELF64_EHDR_SIZE: usize = 64;
pub(crate) const ELF32_PHDR_SIZE: usize = 32;
pub(crate) const ELF64_PHDR_SIZE: usize = 56;

/// Whether a parsed header came from a 32- or 64-bit ELF object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfClass {
    /// `ELFCLASS32`.
    Elf32,
    /// `ELFCLASS64`.
    Elf64,
}

/// Errors that can occur when parsing an ELF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// The file does not start with the ELF magic bytes.
    BadMagic,
    /// `e_ident[EI_CLASS]` is neither `ELFCLASS32` nor `ELFCLASS64`.
    UnsupportedClass,
    /// The ELF file is not little-endian.
    UnsupportedEncoding,
    /// `e_type` is not `ET_EXEC` or `ET_DYN`.
    UnsupportedType,
    /// The input data is too short for the declared structure.
    Truncated,
    /// A header offset or size is out of bounds, or overflows.
    InvalidOffset,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "invalid ELF magic bytes"),
            Self::UnsupportedClass => write!(f, "unsupported ELF class"),
            Self::UnsupportedEncoding => {
                write!(f, "unsupported data encoding (expected little-endian)")
            }
            Self::UnsupportedType => write!(f, "unsupported ELF type (expected ET_EXEC or ET_DYN)"),
            Self::Truncated => write!(f, "input data truncated"),
            Self::InvalidOffset => write!(f, "invalid header offset or size"),
        }
    }
}

/// Parsed ELF file header, normalized to 64-bit fields regardless of the
/// source object's class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader {
    /// Source object class, needed to size program-header entries.
    pub class: ElfClass,
    /// `ET_EXEC` or `ET_DYN`.
    pub e_type: u16,
    /// Target machine architecture (`EM_386`, `EM_X86_64`, `EM_RISCV`, ...).
    pub e_machine: u16,
    /// Virtual address of the entry point.
    pub e_entry: u64,
    /// Offset of the program header table in the file.
    pub e_phoff: u64,
    /// Number of program header entries.
    pub e_phnum: u16,
    /// Size of each program header entry.
    pub e_phentsize: u16,
}

impl ElfHeader {
    /// Parses an ELF file header from raw bytes.
    ///
    /// Validates the magic, class, encoding and ELF type, and that the
    /// program header table fits within `data`. Does not check
    /// `e_machine` — the loader compares that against its own HAL target,
    /// since a single reader is shared across architectures.
    ///
    /// # Errors
    ///
    /// Returns [`ElfError`] if validation fails or the data is too short.
    pub fn parse(data: &[u8]) -> Result<Self, ElfError> {
        if data.len() < 20 {
            return Err(ElfError::Truncated);
        }
        if data[..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        let class = match data[4] {
            ELFCLASS32 => ElfClass::Elf32,
            ELFCLASS64 => ElfClass::Elf64,
            _ => return Err(ElfError::UnsupportedClass),
        };
        if data[5] != ELFDATA2LSB {
            return Err(ElfError::UnsupportedEncoding);
        }

        let ehdr_size = match class {
            ElfClass::Elf32 => ELF32_EHDR_SIZE,
            ElfClass::Elf64 => ELF64_EHDR_SIZE,
        };
        if data.len() < ehdr_size {
            return Err(ElfError::Truncated);
        }

        let e_type = le_u16(data, 16);
        if e_type != ET_EXEC && e_type != ET_DYN {
            return Err(ElfError::UnsupportedType);
        }
        let e_machine = le_u16(data, 18);

        let (e_entry, e_phoff, e_phentsize, e_phnum) = match class {
            ElfClass::Elf32 => (
                u64::from(le_u32(data, 24)),
                u64::from(le_u32(data, 28)),
                le_u16(data, 42),
                le_u16(data, 44),
            ),
            ElfClass::Elf64 => (
                le_u64(data, 24),
                le_u64(data, 32),
                le_u16(data, 54),
                le_u16(data, 56),
            ),
        };

        let phdr_size = match class {
            ElfClass::Elf32 => ELF32_PHDR_SIZE,
            ElfClass::Elf64 => ELF64_PHDR_SIZE,
        };
        if e_phnum > 0 && (e_phentsize as usize) < phdr_size {
            return Err(ElfError::InvalidOffset);
        }
        let ph_end = e_phoff
            .checked_add(u64::from(e_phnum) * u64::from(e_phentsize))
            .ok_or(ElfError::InvalidOffset)?;
        if ph_end > data.len() as u64 {
            return Err(ElfError::InvalidOffset);
        }

        Ok(Self {
            class,
            e_type,
            e_machine,
            e_entry,
            e_phoff,
            e_phnum,
            e_phentsize,
        })
    }
}

/// Parsed program header entry, normalized to 64-bit fields.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    /// Segment type (`PT_LOAD`, or one of the `PHT_APXH_*` extension
    /// types in [`crate::extension`]).
    pub p_type: u32,
    /// Segment permission flags (`PF_R = 4`, `PF_W = 2`, `PF_X = 1`).
    pub flags: u32,
    /// Offset of the segment data in the file.
    pub offset: u64,
    /// Virtual address the segment is to be mapped at.
    pub vaddr: u64,
    /// Size of the segment data in the file.
    pub filesz: u64,
    /// Size of the segment once mapped in memory (`>= filesz`; the
    /// remainder is zero-filled).
    pub memsz: u64,
}

impl ProgramHeader {
    /// Parses one program header entry at `file_offset`.
    ///
    /// The caller must ensure `file_offset + phdr_size(class) <=
    /// data.len()`, as already validated by [`ElfHeader::parse`] for every
    /// entry in the table it describes.
    pub(crate) fn parse(data: &[u8], file_offset: usize, class: ElfClass) -> Self {
        let b = &data[file_offset..];
        match class {
            ElfClass::Elf32 => Self {
                p_type: le_u32(b, 0),
                offset: u64::from(le_u32(b, 4)),
                vaddr: u64::from(le_u32(b, 8)),
                // p_paddr at 12..16 — skipped
                filesz: u64::from(le_u32(b, 16)),
                memsz: u64::from(le_u32(b, 20)),
                flags: le_u32(b, 24),
            },
            ElfClass::Elf64 => Self {
                p_type: le_u32(b, 0),
                flags: le_u32(b, 4),
                offset: le_u64(b, 8),
                vaddr: le_u64(b, 16),
                // p_paddr at 24..32 — skipped
                filesz: le_u64(b, 32),
                memsz: le_u64(b, 40),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn make_elf64_header() -> Vec<u8> {
        let mut buf = vec![0u8; ELF64_EHDR_SIZE];
        buf[0..4].copy_from_slice(&ELF_MAGIC);
        buf[4] = ELFCLASS64;
        buf[5] = ELFDATA2LSB;
        buf[6] = 1;
        buf[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        buf[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        buf[20..24].copy_from_slice(&1u32.to_le_bytes());
        buf[24..32].copy_from_slice(&0x0040_1000u64.to_le_bytes());
        buf[32..40].copy_from_slice(&(ELF64_EHDR_SIZE as u64).to_le_bytes());
        buf[52..54].copy_from_slice(&(ELF64_EHDR_SIZE as u16).to_le_bytes());
        buf[54..56].copy_from_slice(&(ELF64_PHDR_SIZE as u16).to_le_bytes());
        buf[56..58].copy_from_slice(&0u16.to_le_bytes());
        buf
    }

    pub(crate) fn append_elf64_phdr(
        buf: &mut Vec<u8>,
        p_type: u32,
        p_flags: u32,
        p_offset: u64,
        p_vaddr: u64,
        p_filesz: u64,
        p_memsz: u64,
    ) {
        let start = buf.len();
        buf.resize(start + ELF64_PHDR_SIZE, 0);
        let b = &mut buf[start..];
        b[0..4].copy_from_slice(&p_type.to_le_bytes());
        b[4..8].copy_from_slice(&p_flags.to_le_bytes());
        b[8..16].copy_from_slice(&p_offset.to_le_bytes());
        b[16..24].copy_from_slice(&p_vaddr.to_le_bytes());
        b[32..40].copy_from_slice(&p_filesz.to_le_bytes());
        b[40..48].copy_from_slice(&p_memsz.to_le_bytes());
        let phnum = le_u16(buf, 56) + 1;
        buf[56..58].copy_from_slice(&phnum.to_le_bytes());
    }

    #[test]
    fn parse_valid_header() {
        let buf = make_elf64_header();
        let hdr = ElfHeader::parse(&buf).expect("valid header");
        assert_eq!(hdr.class, ElfClass::Elf64);
        assert_eq!(hdr.e_type, ET_EXEC);
        assert_eq!(hdr.e_entry, 0x0040_1000);
        assert_eq!(hdr.e_phnum, 0);
    }

    #[test]
    fn reject_bad_magic() {
        let mut buf = make_elf64_header();
        buf[0] = 0x00;
        assert_eq!(ElfHeader::parse(&buf), Err(ElfError::BadMagic));
    }

    #[test]
    fn reject_big_endian() {
        let mut buf = make_elf64_header();
        buf[5] = 2;
        assert_eq!(ElfHeader::parse(&buf), Err(ElfError::UnsupportedEncoding));
    }

    #[test]
    fn reject_unsupported_class() {
        let mut buf = make_elf64_header();
        buf[4] = 7;
        assert_eq!(ElfHeader::parse(&buf), Err(ElfError::UnsupportedClass));
    }

    #[test]
    fn reject_unsupported_type() {
        let mut buf = make_elf64_header();
        buf[16..18].copy_from_slice(&1u16.to_le_bytes());
        assert_eq!(ElfHeader::parse(&buf), Err(ElfError::UnsupportedType));
    }

    #[test]
    fn reject_truncated_empty() {
        assert_eq!(ElfHeader::parse(&[]), Err(ElfError::Truncated));
    }

    #[test]
    fn reject_phdr_out_of_bounds() {
        let mut buf = make_elf64_header();
        buf[56..58].copy_from_slice(&1u16.to_le_bytes());
        assert_eq!(ElfHeader::parse(&buf), Err(ElfError::InvalidOffset));
    }

    #[test]
    fn accept_elf32_header() {
        let mut buf = vec![0u8; ELF32_EHDR_SIZE];
        buf[0..4].copy_from_slice(&ELF_MAGIC);
        buf[4] = ELFCLASS32;
        buf[5] = ELFDATA2LSB;
        buf[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        buf[18..20].copy_from_slice(&EM_386.to_le_bytes());
        buf[24..28].copy_from_slice(&0x0010_0000u32.to_le_bytes());
        buf[28..32].copy_from_slice(&(ELF32_EHDR_SIZE as u32).to_le_bytes());
        buf[42..44].copy_from_slice(&(ELF32_PHDR_SIZE as u16).to_le_bytes());
        buf[44..46].copy_from_slice(&0u16.to_le_bytes());
        let hdr = ElfHeader::parse(&buf).expect("valid ELF32 header");
        assert_eq!(hdr.class, ElfClass::Elf32);
        assert_eq!(hdr.e_entry, 0x0010_0000);
    }

    #[test]
    fn accept_header_with_phdr() {
        let mut buf = make_elf64_header();
        append_elf64_phdr(&mut buf, PT_LOAD, 5, 120, 0x40_0000, 0x100, 0x200);
        let hdr = ElfHeader::parse(&buf).expect("valid header with phdr");
        assert_eq!(hdr.e_phnum, 1);
        let ph = ProgramHeader::parse(&buf, hdr.e_phoff as usize, hdr.class);
        assert_eq!(ph.p_type, PT_LOAD);
        assert_eq!(ph.vaddr, 0x40_0000);
        assert_eq!(ph.memsz, 0x200);
    }
}
