//! ELF (Executable and Linkable Format) file operations
//!
//! A hand-rolled reader for the subset of ELF needed to build firmware
//! images: the identity block, the file header, program headers, section
//! headers and the section-name string table, for both the 32-bit and 64-bit
//! variants of the format. Parsed files are immutable; section payloads are
//! streamed from the source again at emission time.

use std::{
    fmt,
    io::{Read, Seek, SeekFrom},
    mem::size_of,
};

use bytemuck::{Pod, Zeroable};
use log::debug;

use crate::error::Error;

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

const CLASS_ELF32: u8 = 1;
const CLASS_ELF64: u8 = 2;
const LITTLE_ENDIAN: u8 = 1;

const SHT_NOBITS: u32 = 0x8;
const SHF_ALLOC: u64 = 0x2;
const RISCV_ATTRIBUTES_TYPE: u32 = 0x7000_0003;

/// The 16 identity bytes at the start of every ELF file.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct Identity {
    pub magic: [u8; 4],
    pub class: u8,
    pub endianness: u8,
    pub version: u8,
    pub os_abi: u8,
    pub abi_version: u8,
    pub padding: [u8; 7],
}

impl Identity {
    pub fn is_little_endian(&self) -> bool {
        self.endianness == LITTLE_ENDIAN
    }

    pub fn class_name(&self) -> &'static str {
        match self.class {
            CLASS_ELF32 => "ELF32",
            CLASS_ELF64 => "ELF64",
            _ => "Unknown",
        }
    }

    pub fn endianness_name(&self) -> &'static str {
        match self.endianness {
            1 => "little endian",
            2 => "big endian",
            _ => "Unknown",
        }
    }

    pub fn os_abi_name(&self) -> &'static str {
        const OS_ABI_TABLE: [&str; 18] = [
            "UNIX System V",
            "HP-UX",
            "NetBSD",
            "Linux",
            "GNU Hurd",
            "Solaris",
            "AIX",
            "IRIX",
            "FreeBSD",
            "Tru64 UNIX",
            "Novell Modesto",
            "OpenBSD",
            "OpenVMS",
            "NonStop Kernel",
            "AROS",
            "Fenix OS",
            "Capsicum",
            "Stratus VOS",
        ];

        OS_ABI_TABLE
            .get(self.os_abi as usize)
            .copied()
            .unwrap_or("Unknown")
    }
}

// On-disk layouts. The 32-bit and 64-bit variants differ in more than word
// width (the program header's flags field moves), so each class keeps its own
// raw struct and is normalised right after reading.

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawFileHeader32 {
    etype: u16,
    machine: u16,
    version: u32,
    entry: u32,
    phoff: u32,
    shoff: u32,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawFileHeader64 {
    etype: u16,
    machine: u16,
    version: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawProgramHeader32 {
    ptype: u32,
    offset: u32,
    vaddr: u32,
    paddr: u32,
    filesz: u32,
    memsz: u32,
    flags: u32,
    align: u32,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawProgramHeader64 {
    ptype: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawSectionHeader32 {
    name: u32,
    stype: u32,
    flags: u32,
    addr: u32,
    offset: u32,
    size: u32,
    link: u32,
    info: u32,
    addralign: u32,
    entsize: u32,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawSectionHeader64 {
    name: u32,
    stype: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    addralign: u64,
    entsize: u64,
}

/// Address width of a parsed ELF file, either `u32` (ELF32) or `u64` (ELF64).
pub trait Word: Copy + Eq + Ord + Into<u64> + fmt::Debug + fmt::LowerHex + private::Sealed {
    fn checked_add(self, rhs: Self) -> Option<Self>;
}

mod private {
    pub trait Sealed {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

impl Word for u32 {
    fn checked_add(self, rhs: Self) -> Option<Self> {
        u32::checked_add(self, rhs)
    }
}

impl Word for u64 {
    fn checked_add(self, rhs: Self) -> Option<Self> {
        u64::checked_add(self, rhs)
    }
}

/// File header fields shared by both classes, minus the identity block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader<W> {
    pub etype: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: W,
    pub phoff: W,
    pub shoff: W,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader<W> {
    pub ptype: u32,
    pub flags: u32,
    pub offset: W,
    pub vaddr: W,
    pub paddr: W,
    pub filesz: W,
    pub memsz: W,
    pub align: u64,
}

impl<W: Word> ProgramHeader<W> {
    /// Whether `addr` falls inside this header's `[vaddr, vaddr + memsz)`
    /// memory range.
    pub fn contains(&self, addr: W) -> bool {
        let vaddr: u64 = self.vaddr.into();
        vaddr <= addr.into() && addr.into() < vaddr + self.memsz.into()
    }

    pub fn type_name(&self) -> &'static str {
        const TYPE_TABLE: [&str; 8] = [
            "NULL", "LOAD", "DYNAMIC", "INTERP", "NOTE", "SHLIB", "PHDR", "TLS",
        ];

        TYPE_TABLE
            .get(self.ptype as usize)
            .copied()
            .unwrap_or("UNKNOWN")
    }

    pub fn flags_letters(&self) -> String {
        const FLAG_TABLE: [char; 3] = ['E', 'W', 'R'];

        let mut letters = String::new();
        for (bit, letter) in FLAG_TABLE.iter().enumerate() {
            if self.flags & (1 << bit) != 0 {
                letters.push(*letter);
            }
        }
        if self.flags & 0xF000_0000 != 0 {
            letters.push('x');
        }

        letters
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader<W> {
    pub name: u32,
    pub stype: u32,
    pub flags: u64,
    pub addr: W,
    pub offset: W,
    pub size: W,
    pub link: u32,
    pub info: u32,
    pub addralign: u64,
    pub entsize: u64,
}

impl<W: Word> SectionHeader<W> {
    /// SHF_ALLOC is set, so the section occupies memory at run time.
    pub fn is_loadable(&self) -> bool {
        self.flags & SHF_ALLOC != 0
    }

    /// The section has bytes in the file (non-empty and not SHT_NOBITS).
    pub fn has_content(&self) -> bool {
        self.size.into() != 0 && self.stype != SHT_NOBITS
    }

    pub fn type_name(&self) -> &'static str {
        const TYPE_TABLE: [&str; 20] = [
            "NULL",
            "PROGBITS",
            "SYMTAB",
            "STRTAB",
            "RELA",
            "HASH",
            "DYNAMIC",
            "NOTE",
            "NOBITS",
            "REL",
            "SHLIB",
            "DYNSYM",
            "",
            "",
            "INIT_ARRAY",
            "FINI_ARRAY",
            "PREINIT_ARRAY",
            "GROUP",
            "SYMTAB_SHNDX",
            "NUM",
        ];

        if let Some(name) = TYPE_TABLE.get(self.stype as usize).copied() {
            return name;
        }

        if self.stype == RISCV_ATTRIBUTES_TYPE {
            "RISCV_ATTRIBUTE"
        } else {
            "UNKNOWN"
        }
    }

    pub fn flags_letters(&self) -> String {
        const FLAG_TABLE: [char; 11] = ['W', 'A', 'X', 'x', 'M', 'S', 'I', 'L', 'O', 'G', 'T'];

        let mut letters = String::new();
        for (bit, letter) in FLAG_TABLE.iter().enumerate() {
            if self.flags & (1 << bit) != 0 {
                letters.push(*letter);
            }
        }
        if self.flags & 0x0FF0_0000 != 0 {
            letters.push('o');
        }
        if self.flags & 0xF000_0000 != 0 {
            letters.push('p');
        }
        if self.flags & 0x8000_0000 != 0 {
            letters.push('E');
        }

        letters
    }
}

/// A section header paired with its resolved name from the string table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedSection<W> {
    pub name: String,
    pub header: SectionHeader<W>,
}

/// The class-dependent part of a parsed ELF file.
#[derive(Debug, Clone)]
pub struct Content<W> {
    pub file_header: FileHeader<W>,
    pub program_headers: Vec<ProgramHeader<W>>,
    pub sections: Vec<NamedSection<W>>,
}

pub type Content32 = Content<u32>;
pub type Content64 = Content<u64>;

impl<W: Word> Content<W> {
    /// All sections that end up in a firmware image: allocated at run time
    /// and backed by bytes in the file.
    pub fn loadable_sections(&self) -> Vec<NamedSection<W>> {
        self.sections
            .iter()
            .filter(|section| section.header.is_loadable() && section.header.has_content())
            .cloned()
            .collect()
    }

    pub fn loadable_count(&self) -> usize {
        self.sections
            .iter()
            .filter(|section| section.header.is_loadable() && section.header.has_content())
            .count()
    }

    /// The first program header whose memory range contains the section's
    /// address.
    pub fn section_memory_type(
        &self,
        section: &SectionHeader<W>,
    ) -> Result<&ProgramHeader<W>, Error> {
        self.program_headers
            .iter()
            .find(|ph| ph.contains(section.addr))
            .ok_or(Error::NoContainingSegment {
                addr: section.addr.into(),
            })
    }

    fn memory_type_index(&self, section: &SectionHeader<W>) -> Option<usize> {
        self.program_headers
            .iter()
            .position(|ph| ph.contains(section.addr))
    }

    /// Reduce the loadable sections by coalescing address-adjacent pairs that
    /// live in the same program segment.
    ///
    /// Sections are sorted descending by address (descending size as the
    /// tie-break) and each one is compared against its lower-addressed
    /// neighbour; a section whose end touches the start of the previous one
    /// is absorbed into it. A copy of the highest section is appended as a
    /// sentinel so the last real pair is also examined.
    pub fn merge_adjacent_loadable(&self) -> Vec<NamedSection<W>> {
        let mut loadable = self.loadable_sections();
        if loadable.is_empty() {
            return loadable;
        }

        loadable.sort_by(|lhs, rhs| {
            rhs.header
                .addr
                .cmp(&lhs.header.addr)
                .then(rhs.header.size.cmp(&lhs.header.size))
        });
        loadable.push(loadable[0].clone());

        let mut merged = Vec::with_capacity(loadable.len());
        for i in 0..loadable.len() - 1 {
            let next = &loadable[i];
            let curr = &loadable[i + 1];

            let same_segment =
                self.memory_type_index(&curr.header) == self.memory_type_index(&next.header);
            let curr_addr: u64 = curr.header.addr.into();
            let adjacent = curr_addr.checked_add(curr.header.size.into())
                == Some(next.header.addr.into());
            let grown = curr.header.size.checked_add(next.header.size);

            match grown {
                Some(grown) if same_segment && adjacent => {
                    let absorbed = next.name.clone();
                    let curr = &mut loadable[i + 1];
                    curr.header.size = grown;
                    curr.name = format!("{}+{}", curr.name, absorbed);
                }
                _ => merged.push(loadable[i].clone()),
            }
        }

        merged
    }
}

#[derive(Debug, Clone)]
pub enum ElfContent {
    Elf32(Content32),
    Elf64(Content64),
}

/// A parsed ELF executable: identity plus the class-dependent content.
#[derive(Debug, Clone)]
pub struct ElfFile {
    pub identity: Identity,
    pub content: ElfContent,
}

impl ElfFile {
    /// Parse the headers of an ELF file from a seekable source.
    ///
    /// Section payloads are not read here; emission seeks back into the same
    /// source using the parsed offsets.
    pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<Self, Error> {
        let identity: Identity = read_pod(reader)?;
        if identity.magic != ELF_MAGIC {
            return Err(Error::InvalidElf("magic number mismatch".into()));
        }

        let content = match identity.class {
            CLASS_ELF32 => ElfContent::Elf32(parse_content32(reader)?),
            CLASS_ELF64 => ElfContent::Elf64(parse_content64(reader)?),
            other => return Err(Error::UnsupportedClass(other)),
        };

        Ok(ElfFile { identity, content })
    }

    /// Log a readelf-style summary of the parsed file at debug level.
    pub fn log_summary(&self) {
        match &self.content {
            ElfContent::Elf32(content) => log_content(&self.identity, content),
            ElfContent::Elf64(content) => log_content(&self.identity, content),
        }
    }
}

fn log_content<W: Word>(identity: &Identity, content: &Content<W>) {
    let header = &content.file_header;
    debug!("ELF Header:");
    debug!("  Class:                             {}", identity.class_name());
    debug!("  Data:                              {}", identity.endianness_name());
    debug!("  OS/ABI:                            {}", identity.os_abi_name());
    debug!("  Entry point address:               {:#x}", header.entry);
    debug!("  Start of program headers:          {:#x} (bytes in file)", header.phoff);
    debug!("  Section header string table index: {}", header.shstrndx);

    debug!("Section Headers:");
    debug!(
        " [Nr] {:<20} {:<15} {:<8} {:<8} {:<8} Flg",
        "Name", "Type", "Addr", "Off", "Size"
    );
    for (i, section) in content.sections.iter().enumerate() {
        let sh = &section.header;
        debug!(
            " [{:>2}] {:<20} {:<15} {:08x} {:08x} {:08x} {:>3}",
            i,
            section.name,
            sh.type_name(),
            sh.addr,
            sh.offset,
            sh.size,
            sh.flags_letters(),
        );
    }

    debug!("Program Headers:");
    debug!(
        " {:<8} {:<10} {:<10} {:<10} {:<8} {:<8} Flg Align",
        "Type", "Offset", "VirtAddr", "PhysAddr", "FileSiz", "MemSiz"
    );
    for ph in &content.program_headers {
        debug!(
            " {:<8} {:#010x} {:#010x} {:#010x} {:#08x} {:#08x} {:<3} {:#x}",
            ph.type_name(),
            ph.offset,
            ph.vaddr,
            ph.paddr,
            ph.filesz,
            ph.memsz,
            ph.flags_letters(),
            ph.align,
        );
    }
}

fn parse_content32<R: Read + Seek>(reader: &mut R) -> Result<Content32, Error> {
    let raw: RawFileHeader32 = read_pod(reader)?;
    let file_header = FileHeader {
        etype: raw.etype,
        machine: raw.machine,
        version: raw.version,
        entry: raw.entry,
        phoff: raw.phoff,
        shoff: raw.shoff,
        flags: raw.flags,
        ehsize: raw.ehsize,
        phentsize: raw.phentsize,
        phnum: raw.phnum,
        shentsize: raw.shentsize,
        shnum: raw.shnum,
        shstrndx: raw.shstrndx,
    };

    let program_headers = read_table(
        reader,
        file_header.phoff.into(),
        file_header.phnum,
        file_header.phentsize,
        |raw: RawProgramHeader32| ProgramHeader {
            ptype: raw.ptype,
            flags: raw.flags,
            offset: raw.offset,
            vaddr: raw.vaddr,
            paddr: raw.paddr,
            filesz: raw.filesz,
            memsz: raw.memsz,
            align: raw.align.into(),
        },
    )?;
    validate_memory_ranges(&program_headers)?;

    let headers = read_table(
        reader,
        file_header.shoff.into(),
        file_header.shnum,
        file_header.shentsize,
        |raw: RawSectionHeader32| SectionHeader {
            name: raw.name,
            stype: raw.stype,
            flags: raw.flags.into(),
            addr: raw.addr,
            offset: raw.offset,
            size: raw.size,
            link: raw.link,
            info: raw.info,
            addralign: raw.addralign.into(),
            entsize: raw.entsize.into(),
        },
    )?;
    let sections = resolve_names(reader, headers, file_header.shstrndx)?;

    Ok(Content {
        file_header,
        program_headers,
        sections,
    })
}

fn parse_content64<R: Read + Seek>(reader: &mut R) -> Result<Content64, Error> {
    let raw: RawFileHeader64 = read_pod(reader)?;
    let file_header = FileHeader {
        etype: raw.etype,
        machine: raw.machine,
        version: raw.version,
        entry: raw.entry,
        phoff: raw.phoff,
        shoff: raw.shoff,
        flags: raw.flags,
        ehsize: raw.ehsize,
        phentsize: raw.phentsize,
        phnum: raw.phnum,
        shentsize: raw.shentsize,
        shnum: raw.shnum,
        shstrndx: raw.shstrndx,
    };

    let program_headers = read_table(
        reader,
        file_header.phoff,
        file_header.phnum,
        file_header.phentsize,
        |raw: RawProgramHeader64| ProgramHeader {
            ptype: raw.ptype,
            flags: raw.flags,
            offset: raw.offset,
            vaddr: raw.vaddr,
            paddr: raw.paddr,
            filesz: raw.filesz,
            memsz: raw.memsz,
            align: raw.align,
        },
    )?;
    validate_memory_ranges(&program_headers)?;

    let headers = read_table(
        reader,
        file_header.shoff,
        file_header.shnum,
        file_header.shentsize,
        |raw: RawSectionHeader64| SectionHeader {
            name: raw.name,
            stype: raw.stype,
            flags: raw.flags,
            addr: raw.addr,
            offset: raw.offset,
            size: raw.size,
            link: raw.link,
            info: raw.info,
            addralign: raw.addralign,
            entsize: raw.entsize,
        },
    )?;
    let sections = resolve_names(reader, headers, file_header.shstrndx)?;

    Ok(Content {
        file_header,
        program_headers,
        sections,
    })
}

/// Read `count` fixed-size table entries starting at `offset`.
///
/// Entries larger than the native struct are tolerated; the extra bytes of
/// each entry are skipped.
fn read_table<R, T, U, F>(
    reader: &mut R,
    offset: u64,
    count: u16,
    entsize: u16,
    normalise: F,
) -> Result<Vec<U>, Error>
where
    R: Read + Seek,
    T: Pod,
    F: Fn(T) -> U,
{
    if count > 0 && (entsize as usize) < size_of::<T>() {
        return Err(Error::InvalidElf(format!(
            "table entries are {} bytes, expected at least {}",
            entsize,
            size_of::<T>()
        )));
    }

    let mut entries = Vec::with_capacity(count.into());
    for i in 0..u64::from(count) {
        reader.seek(SeekFrom::Start(offset + i * u64::from(entsize)))?;
        entries.push(normalise(read_pod(reader)?));
    }

    Ok(entries)
}

fn validate_memory_ranges<W: Word>(program_headers: &[ProgramHeader<W>]) -> Result<(), Error> {
    for ph in program_headers {
        if ph.vaddr.checked_add(ph.memsz).is_none() {
            return Err(Error::InvalidElf(format!(
                "program header memory range {:#x}+{:#x} overflows",
                ph.vaddr, ph.memsz
            )));
        }
    }

    Ok(())
}

fn resolve_names<R: Read + Seek, W: Word>(
    reader: &mut R,
    headers: Vec<SectionHeader<W>>,
    shstrndx: u16,
) -> Result<Vec<NamedSection<W>>, Error> {
    let table_offset: u64 = headers
        .get(shstrndx as usize)
        .ok_or_else(|| Error::InvalidElf("string-table section index out of range".into()))?
        .offset
        .into();

    headers
        .into_iter()
        .map(|header| {
            let name = read_name(reader, table_offset + u64::from(header.name))?;
            Ok(NamedSection { name, header })
        })
        .collect()
}

/// Read the NUL-terminated string at `offset`.
fn read_name<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<String, Error> {
    reader.seek(SeekFrom::Start(offset))?;

    let mut name = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        reader
            .read_exact(&mut byte)
            .map_err(Error::short_read)?;
        if byte[0] == 0 {
            break;
        }
        name.push(byte[0]);
    }

    Ok(String::from_utf8_lossy(&name).into_owned())
}

fn read_pod<T: Pod, R: Read>(reader: &mut R) -> Result<T, Error> {
    let mut buffer = vec![0u8; size_of::<T>()];
    reader
        .read_exact(&mut buffer)
        .map_err(Error::short_read)?;

    Ok(bytemuck::pod_read_unaligned(&buffer))
}

#[cfg(test)]
pub(crate) mod testutil {
    //! A synthetic RISC-V ELF32 executable mirroring the section layout of a
    //! small bare-metal application, for exercising the parser and the image
    //! builder without a binary fixture.

    use bytemuck::bytes_of;

    use super::{RawFileHeader32, RawProgramHeader32, RawSectionHeader32};

    pub const ENTRY: u32 = 0x4038_0080;
    pub const SHOFF: u32 = 82_980;
    pub const SHNUM: u16 = 23;
    pub const SHSTRNDX: u16 = 22;

    const NAME_BLOB_OFFSET: u32 = 0x4000;

    struct Sec {
        name: &'static str,
        stype: u32,
        flags: u32,
        addr: u32,
        offset: u32,
        size: u32,
    }

    fn sections() -> Vec<Sec> {
        let mut list = vec![
            Sec { name: "", stype: 0, flags: 0, addr: 0, offset: 0, size: 0 },
            Sec { name: ".vector_table", stype: 1, flags: 0x6, addr: 0x4038_0000, offset: 0x2000, size: 0x80 },
            Sec { name: ".text", stype: 1, flags: 0x6, addr: 0x4038_0080, offset: 0x2080, size: 0x1EC },
            Sec { name: ".rodata", stype: 1, flags: 0x2, addr: 0x3FF0_0000, offset: 0x1000, size: 0xB8 },
            Sec { name: ".init_array", stype: 14, flags: 0x3, addr: 0x4038_0270, offset: 0x2270, size: 0x4 },
            Sec { name: ".fini_array", stype: 15, flags: 0x3, addr: 0x4038_0274, offset: 0x2274, size: 0x10 },
            Sec { name: ".bss", stype: 8, flags: 0x3, addr: 0x4038_0290, offset: 0x2284, size: 0x100 },
        ];

        let aux = [
            ".comment",
            ".riscv.attributes",
            ".debug_info",
            ".debug_abbrev",
            ".debug_aranges",
            ".debug_line",
            ".debug_str",
            ".debug_frame",
            ".debug_loc",
            ".debug_ranges",
            ".debug_line_str",
            ".debug_rnglists",
            ".debug_macro",
        ];
        for (i, name) in aux.into_iter().enumerate() {
            list.push(Sec {
                name,
                stype: if name == ".riscv.attributes" { 0x7000_0003 } else { 1 },
                flags: 0,
                addr: 0,
                offset: 0x3000 + (i as u32) * 0x40,
                size: 0x10,
            });
        }

        list.push(Sec { name: ".symtab", stype: 2, flags: 0, addr: 0, offset: 0x3800, size: 0x200 });
        list.push(Sec { name: ".strtab", stype: 3, flags: 0, addr: 0, offset: 0x3A00, size: 0x100 });
        list.push(Sec { name: ".shstrtab", stype: 3, flags: 0, addr: 0, offset: NAME_BLOB_OFFSET, size: 0x100 });

        assert_eq!(list.len(), SHNUM as usize);
        list
    }

    fn patch(image: &mut Vec<u8>, offset: usize, bytes: &[u8]) {
        if image.len() < offset + bytes.len() {
            image.resize(offset + bytes.len(), 0);
        }
        image[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Build the fixture file: entry 0x40380080, 3 program headers, 23
    /// sections of which 5 are loadable with content.
    pub fn build_elf32() -> Vec<u8> {
        let mut image = Vec::new();

        patch(
            &mut image,
            0,
            &[0x7F, b'E', b'L', b'F', 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        );

        let file_header = RawFileHeader32 {
            etype: 2,
            machine: 0xF3,
            version: 1,
            entry: ENTRY,
            phoff: 52,
            shoff: SHOFF,
            flags: 0,
            ehsize: 52,
            phentsize: 32,
            phnum: 3,
            shentsize: 40,
            shnum: SHNUM,
            shstrndx: SHSTRNDX,
        };
        patch(&mut image, 16, bytes_of(&file_header));

        let program_headers = [
            RawProgramHeader32 {
                ptype: 1,
                offset: 0x1000,
                vaddr: 0x3FF0_0000,
                paddr: 0x3FF0_0000,
                filesz: 0xB8,
                memsz: 0xB8,
                flags: 0x4,
                align: 0x1000,
            },
            RawProgramHeader32 {
                ptype: 1,
                offset: 0x2000,
                vaddr: 0x4038_0000,
                paddr: 0x4038_0000,
                filesz: 0x284,
                memsz: 0x390,
                flags: 0x5,
                align: 0x1000,
            },
            RawProgramHeader32 {
                ptype: 0x7000_0003,
                offset: 0x3000,
                vaddr: 0,
                paddr: 0,
                filesz: 0x40,
                memsz: 0,
                flags: 0,
                align: 1,
            },
        ];
        for (i, ph) in program_headers.iter().enumerate() {
            patch(&mut image, 52 + i * 32, bytes_of(ph));
        }

        // Section payloads, deterministic per-section patterns.
        let sections = sections();
        for sec in &sections {
            if sec.flags & 0x2 != 0 && sec.stype != 8 && sec.size != 0 {
                let data: Vec<u8> = (0..sec.size)
                    .map(|i| (sec.addr.wrapping_add(i) % 251) as u8)
                    .collect();
                patch(&mut image, sec.offset as usize, &data);
            }
        }

        // Section-name string table.
        let mut blob = vec![0u8];
        let mut name_offsets = Vec::new();
        for sec in &sections {
            if sec.name.is_empty() {
                name_offsets.push(0);
            } else {
                name_offsets.push(blob.len() as u32);
                blob.extend_from_slice(sec.name.as_bytes());
                blob.push(0);
            }
        }
        patch(&mut image, NAME_BLOB_OFFSET as usize, &blob);

        for (i, sec) in sections.iter().enumerate() {
            let raw = RawSectionHeader32 {
                name: name_offsets[i],
                stype: sec.stype,
                flags: sec.flags,
                addr: sec.addr,
                offset: sec.offset,
                size: sec.size,
                link: 0,
                info: 0,
                addralign: 4,
                entsize: 0,
            };
            patch(&mut image, SHOFF as usize + i * 40, bytes_of(&raw));
        }

        image
    }

    /// The payload bytes the fixture stores for a section, matching
    /// [`build_elf32`]'s fill pattern.
    pub fn section_payload(addr: u32, size: u32) -> Vec<u8> {
        (0..size).map(|i| (addr.wrapping_add(i) % 251) as u8).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{testutil, ElfContent, ElfFile};
    use crate::error::Error;

    fn parse_fixture() -> ElfFile {
        let data = testutil::build_elf32();
        ElfFile::parse(&mut Cursor::new(data)).unwrap()
    }

    #[test]
    fn parses_identity_and_file_header() {
        let elf = parse_fixture();

        assert_eq!(elf.identity.class_name(), "ELF32");
        assert_eq!(elf.identity.endianness_name(), "little endian");
        assert_eq!(elf.identity.os_abi_name(), "UNIX System V");

        let ElfContent::Elf32(content) = &elf.content else {
            panic!("expected 32-bit content");
        };
        assert_eq!(content.file_header.entry, testutil::ENTRY);
        assert_eq!(content.file_header.phnum, 3);
        assert_eq!(content.file_header.phoff, 52);
        assert_eq!(content.file_header.shnum, testutil::SHNUM);
        assert_eq!(content.file_header.shoff, testutil::SHOFF);
        assert_eq!(content.file_header.shstrndx, testutil::SHSTRNDX);
    }

    #[test]
    fn finds_loadable_sections_with_content() {
        let elf = parse_fixture();
        let ElfContent::Elf32(content) = &elf.content else {
            panic!("expected 32-bit content");
        };

        assert_eq!(content.loadable_count(), 5);

        let loadable = content.loadable_sections();
        let find = |name: &str| {
            loadable
                .iter()
                .find(|s| s.name == name)
                .unwrap_or_else(|| panic!("missing section {name}"))
        };

        let vector = find(".vector_table");
        assert_eq!(vector.header.addr, 0x4038_0000);
        assert_eq!(vector.header.offset, 0x2000);
        assert_eq!(vector.header.size, 0x80);

        let text = find(".text");
        assert_eq!(text.header.addr, 0x4038_0080);
        assert_eq!(text.header.offset, 0x2080);
        assert_eq!(text.header.size, 0x1EC);

        let rodata = find(".rodata");
        assert_eq!(rodata.header.addr, 0x3FF0_0000);
        assert_eq!(rodata.header.offset, 0x1000);
        assert_eq!(rodata.header.size, 0xB8);

        let init = find(".init_array");
        assert_eq!(init.header.addr, 0x4038_0270);
        assert_eq!(init.header.size, 0x4);

        let fini = find(".fini_array");
        assert_eq!(fini.header.addr, 0x4038_0274);
        assert_eq!(fini.header.size, 0x10);

        // .bss is loadable but has no file content
        assert!(!loadable.iter().any(|s| s.name == ".bss"));
    }

    #[test]
    fn merges_adjacent_sections_within_a_segment() {
        let elf = parse_fixture();
        let ElfContent::Elf32(content) = &elf.content else {
            panic!("expected 32-bit content");
        };

        let merged = content.merge_adjacent_loadable();
        assert_eq!(merged.len(), 3);

        let find = |addr: u32| {
            merged
                .iter()
                .find(|s| s.header.addr == addr)
                .unwrap_or_else(|| panic!("missing merged segment at {addr:#x}"))
        };

        let text = find(0x4038_0000);
        assert_eq!(text.header.size, 0x80 + 0x1EC);
        assert_eq!(text.name, ".vector_table+.text");

        let arrays = find(0x4038_0270);
        assert_eq!(arrays.header.size, 0x4 + 0x10);
        assert_eq!(arrays.name, ".init_array+.fini_array");

        let rodata = find(0x3FF0_0000);
        assert_eq!(rodata.header.size, 0xB8);

        // No merged segment abuts another in the same program segment.
        for sec in &merged {
            let end = u64::from(sec.header.addr) + u64::from(sec.header.size);
            assert!(!merged.iter().any(|other| u64::from(other.header.addr) == end));
        }
    }

    #[test]
    fn section_memory_type_distinguishes_segments() {
        let elf = parse_fixture();
        let ElfContent::Elf32(content) = &elf.content else {
            panic!("expected 32-bit content");
        };

        let loadable = content.loadable_sections();
        let text = loadable.iter().find(|s| s.name == ".text").unwrap();
        let rodata = loadable.iter().find(|s| s.name == ".rodata").unwrap();

        let text_ph = content.section_memory_type(&text.header).unwrap();
        let rodata_ph = content.section_memory_type(&rodata.header).unwrap();
        assert_ne!(text_ph.vaddr, rodata_ph.vaddr);

        let mut orphan = text.header;
        orphan.addr = 0x6000_0000;
        assert!(matches!(
            content.section_memory_type(&orphan),
            Err(Error::NoContainingSegment { addr: 0x6000_0000 })
        ));
    }

    #[test]
    fn rejects_bad_magic_and_class() {
        let mut data = testutil::build_elf32();
        data[0] = 0x7E;
        assert!(matches!(
            ElfFile::parse(&mut Cursor::new(data)),
            Err(Error::InvalidElf(_))
        ));

        let mut data = testutil::build_elf32();
        data[4] = 3;
        assert!(matches!(
            ElfFile::parse(&mut Cursor::new(data)),
            Err(Error::UnsupportedClass(3))
        ));
    }

    #[test]
    fn short_file_is_reported() {
        let data = testutil::build_elf32();
        let truncated = data[..40].to_vec();
        assert!(matches!(
            ElfFile::parse(&mut Cursor::new(truncated)),
            Err(Error::ShortRead)
        ));
    }
}
