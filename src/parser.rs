//! Goblin-based image metadata extraction (ELF, PE, Mach-O).
//!
//! Backends that only know instructions can borrow the facts a file header
//! carries: architecture, width, preferred base, imports and exported names.

use std::collections::BTreeMap;
use std::fmt;

use goblin::mach::{constants::cputype, Mach, MachO};
use goblin::{elf, pe, Object};

use crate::{Address, Architecture, Bitness};

/// Loadable images are assumed to be mapped on this granularity.
pub(crate) const BASE_ALIGNMENT: Address = 0x10000;

/// Errors raised while reading image headers
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// Failed to parse binary format
    #[error("Failed to parse binary format: {0}")]
    Format(#[from] goblin::error::Error),

    /// Recognized container we do not read
    #[error("Unsupported file format: {0}")]
    Unsupported(&'static str),
}

/// Header facts about one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub architecture: Architecture,
    pub bitness: Bitness,
    /// Preferred load address
    pub base_addr: Address,
    pub entry_point: Option<Address>,
    /// Import entry points, `address -> "module!symbol"`
    pub api_map: BTreeMap<Address, String>,
    /// Named functions the image itself declares
    pub function_symbols: BTreeMap<Address, String>,
}

impl ImageInfo {
    pub fn new(architecture: Architecture, bitness: Bitness) -> Self {
        Self {
            architecture,
            bitness,
            base_addr: 0,
            entry_point: None,
            api_map: BTreeMap::new(),
            function_symbols: BTreeMap::new(),
        }
    }
}

fn width(is_64: bool) -> Bitness {
    if is_64 {
        Bitness::Bits64
    } else {
        Bitness::Bits32
    }
}

/// A parser that handles ELF, PE, and Mach-O via Goblin.
#[derive(Debug, Default)]
pub struct GoblinParser;

impl GoblinParser {
    /// Construct a new GoblinParser.
    pub fn new() -> Self {
        GoblinParser
    }

    /// Parse the headers of `data`.
    pub fn parse(&self, data: &[u8]) -> Result<ImageInfo, ParseError> {
        match Object::parse(data)? {
            Object::Elf(elf) => Ok(self.parse_elf(&elf)),
            Object::PE(pe) => Ok(self.parse_pe(&pe)),
            Object::Mach(Mach::Binary(macho)) => Ok(self.parse_macho(&macho)),
            Object::Mach(Mach::Fat(_)) => Err(ParseError::Unsupported("fat Mach-O")),
            _ => Err(ParseError::Unsupported("unknown container")),
        }
    }

    /// Parse an ELF image.
    fn parse_elf(&self, elf: &elf::Elf) -> ImageInfo {
        let architecture = match elf.header.e_machine {
            elf::header::EM_386 | elf::header::EM_X86_64 => Architecture::X86,
            elf::header::EM_ARM => Architecture::Arm,
            elf::header::EM_AARCH64 => Architecture::AArch64,
            elf::header::EM_MIPS => Architecture::Mips,
            elf::header::EM_RISCV => Architecture::RiscV,
            elf::header::EM_PPC | elf::header::EM_PPC64 => Architecture::Ppc,
            _ => Architecture::Unknown,
        };

        let mut info = ImageInfo::new(architecture, width(elf.is_64));
        info.entry_point = Some(elf.entry).filter(|&entry| entry != 0);
        info.base_addr = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == elf::program_header::PT_LOAD)
            .map(|ph| ph.p_vaddr)
            .min()
            .map_or(0, |lowest| lowest - lowest % BASE_ALIGNMENT);

        let tables = [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)];
        for (syms, strtab) in tables {
            for sym in syms.iter() {
                if sym.st_type() != elf::sym::STT_FUNC || sym.st_value == 0 {
                    continue;
                }
                if let Some(name) = strtab.get_at(sym.st_name).filter(|n| !n.is_empty()) {
                    info.function_symbols
                        .entry(sym.st_value)
                        .or_insert_with(|| name.to_string());
                }
            }
        }
        info
    }

    /// Parse a PE image.
    fn parse_pe(&self, pe: &pe::PE<'_>) -> ImageInfo {
        let architecture = match pe.header.coff_header.machine {
            pe::header::COFF_MACHINE_X86 | pe::header::COFF_MACHINE_X86_64 => Architecture::X86,
            pe::header::COFF_MACHINE_ARM => Architecture::Arm,
            pe::header::COFF_MACHINE_ARM64 => Architecture::AArch64,
            _ => Architecture::Unknown,
        };

        let image_base = pe.image_base as Address;
        let mut info = ImageInfo::new(architecture, width(pe.is_64));
        info.base_addr = image_base;
        info.entry_point = Some(image_base + pe.entry as Address);

        for import in &pe.imports {
            info.api_map.insert(
                image_base + import.rva as Address,
                format!("{}!{}", import.dll.to_lowercase(), import.name),
            );
        }
        for export in &pe.exports {
            if let Some(name) = export.name.filter(|n| !n.is_empty()) {
                info.function_symbols
                    .insert(image_base + export.rva as Address, name.to_string());
            }
        }
        info
    }

    /// Parse a Mach-O image.
    fn parse_macho(&self, macho: &MachO) -> ImageInfo {
        let architecture = match macho.header.cputype {
            cputype::CPU_TYPE_I386 | cputype::CPU_TYPE_X86_64 => Architecture::X86,
            cputype::CPU_TYPE_ARM => Architecture::Arm,
            cputype::CPU_TYPE_ARM64 => Architecture::AArch64,
            _ => Architecture::Unknown,
        };

        let mut info = ImageInfo::new(architecture, width(macho.is_64));
        info.entry_point = Some(macho.entry).filter(|&entry| entry != 0);
        // __PAGEZERO has no file contents and would pin the base to zero
        info.base_addr = (&macho.segments)
            .into_iter()
            .filter(|segment| segment.filesize > 0)
            .map(|segment| segment.vmaddr)
            .min()
            .map_or(0, |lowest| lowest - lowest % BASE_ALIGNMENT);
        info
    }
}

impl fmt::Display for GoblinParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GoblinParser")
    }
}
