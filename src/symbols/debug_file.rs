//! Debug-symbol provider for sidecar symbol files (ELF, PE/COFF, Mach-O).

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use object::{BinaryFormat, Object, ObjectSegment, ObjectSymbol, SymbolKind};

use super::demangle::demangle_or_original;
use super::SymbolProvider;
use crate::parser::BASE_ALIGNMENT;
use crate::Address;

/// Reasons a symbol file yields nothing
#[derive(Debug, thiserror::Error)]
pub enum SymbolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Unreadable symbol file: {0}")]
    Object(#[from] object::Error),
}

/// Reads function symbols from a symbol file with the `object` crate.
///
/// Symbol addresses are made relative to the file's own preferred base and
/// then relocated onto `base_addr`, so they live in the same address space as
/// the backend's view. The preferred base is the PE image base, or the lowest
/// file-backed segment aligned down the way `GoblinParser` aligns image bases.
/// Relocatable objects have no segments and a preferred base of zero.
#[derive(Debug, Clone)]
pub struct ObjectSymbolProvider {
    base_addr: Address,
    func_symbols: BTreeMap<Address, String>,
    demangle: bool,
}

impl Default for ObjectSymbolProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectSymbolProvider {
    pub fn new() -> Self {
        Self {
            base_addr: 0,
            func_symbols: BTreeMap::new(),
            demangle: true,
        }
    }

    pub fn with_demangling(mut self, demangle: bool) -> Self {
        self.demangle = demangle;
        self
    }

    pub fn base_addr(&self) -> Address {
        self.base_addr
    }

    fn load(&self, path: &Path) -> Result<BTreeMap<Address, String>, SymbolError> {
        let data = fs::read(path)?;
        let file = object::File::parse(&*data)?;
        let relative_base = preferred_base(&file);

        let mut symbols = BTreeMap::new();
        for symbol in file.symbols() {
            if symbol.kind() != SymbolKind::Text || !symbol.is_definition() {
                continue;
            }
            let Ok(name) = symbol.name() else { continue };
            if name.is_empty() {
                continue;
            }
            let Some(address) = symbol
                .address()
                .checked_sub(relative_base)
                .and_then(|offset| self.base_addr.checked_add(offset))
            else {
                continue;
            };
            let name = if self.demangle {
                demangle_or_original(name)
            } else {
                name.to_string()
            };
            symbols.entry(address).or_insert(name);
        }
        Ok(symbols)
    }
}

fn preferred_base(file: &object::File<'_>) -> Address {
    if file.format() == BinaryFormat::Pe {
        return file.relative_address_base();
    }
    // Mach-O __PAGEZERO has no file contents
    file.segments()
        .filter(|segment| segment.file_range().1 > 0)
        .map(|segment| segment.address())
        .min()
        .map_or(0, |lowest| lowest - lowest % BASE_ALIGNMENT)
}

impl SymbolProvider for ObjectSymbolProvider {
    fn update(&mut self, file_path: Option<&Path>, _binary: &[u8], base_addr: Address) {
        self.base_addr = base_addr;
        self.func_symbols.clear();
        let Some(path) = file_path else {
            return;
        };

        match self.load(path) {
            Ok(symbols) => {
                log::info!(
                    "loaded {} function symbols from {}",
                    symbols.len(),
                    path.display()
                );
                self.func_symbols = symbols;
            }
            Err(SymbolError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("no symbol file at {}", path.display());
            }
            Err(e) => {
                log::warn!("ignoring symbol file {}: {}", path.display(), e);
            }
        }
    }

    fn get_symbol(&self, address: Address) -> Option<&str> {
        self.func_symbols.get(&address).map(String::as_str)
    }

    fn function_symbols(&self) -> &BTreeMap<Address, String> {
        &self.func_symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use object::write::elf as elf_write;
    use object::write::{Object as ObjectWriter, Symbol, SymbolSection};
    use object::{elf, Endianness, SectionKind, SymbolFlags, SymbolScope};
    use tempfile::NamedTempFile;

    fn symbol_file(symbols: &[(&str, u64, SymbolKind)]) -> NamedTempFile {
        let mut obj = ObjectWriter::new(
            BinaryFormat::Elf,
            object::Architecture::X86_64,
            Endianness::Little,
        );
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &[0xcc; 0x100], 16);
        for &(name, value, kind) in symbols {
            obj.add_symbol(Symbol {
                name: name.as_bytes().to_vec(),
                value,
                size: 4,
                kind,
                scope: SymbolScope::Linkage,
                weak: false,
                section: SymbolSection::Section(text),
                flags: SymbolFlags::None,
            });
        }

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&obj.write().unwrap()).unwrap();
        file
    }

    /// Linked x86-64 executable: one PT_LOAD at `vaddr` and a function per
    /// `(name, offset into .text)`. Returns the file and the `.text` file offset.
    fn linked_executable(vaddr: u64, functions: &[(&str, u64)]) -> (NamedTempFile, u64) {
        let code = [0xc3u8; 0x40];
        let mut data = Vec::new();
        let mut writer = elf_write::Writer::new(Endianness::Little, true, &mut data);

        writer.reserve_file_header();
        let text_name = writer.add_section_name(b".text");
        let text_index = writer.reserve_section_index();
        writer.reserve_symtab_section_index();
        writer.reserve_strtab_section_index();
        writer.reserve_shstrtab_section_index();
        let names: Vec<_> = functions
            .iter()
            .map(|&(name, _)| {
                writer.reserve_symbol_index(Some(text_index));
                writer.add_string(name.as_bytes())
            })
            .collect();

        writer.reserve_program_headers(1);
        let text_offset = writer.reserve(code.len(), 16) as u64;
        writer.reserve_symtab();
        writer.reserve_strtab();
        writer.reserve_shstrtab();
        writer.reserve_section_headers();

        let text_addr = vaddr + text_offset;
        writer
            .write_file_header(&elf_write::FileHeader {
                os_abi: 0,
                abi_version: 0,
                e_type: elf::ET_EXEC,
                e_machine: elf::EM_X86_64,
                e_entry: text_addr,
                e_flags: 0,
            })
            .unwrap();
        writer.write_align_program_headers();
        writer.write_program_header(&elf_write::ProgramHeader {
            p_type: elf::PT_LOAD,
            p_flags: elf::PF_R | elf::PF_X,
            p_offset: 0,
            p_vaddr: vaddr,
            p_paddr: vaddr,
            p_filesz: text_offset + code.len() as u64,
            p_memsz: text_offset + code.len() as u64,
            p_align: 0x1000,
        });
        writer.write_align(16);
        writer.write(&code);
        writer.write_null_symbol();
        for (&name, &(_, offset)) in names.iter().zip(functions) {
            writer.write_symbol(&elf_write::Sym {
                name: Some(name),
                section: Some(text_index),
                st_info: (elf::STB_GLOBAL << 4) | elf::STT_FUNC,
                st_other: 0,
                st_shndx: 0,
                st_value: text_addr + offset,
                st_size: 1,
            });
        }
        writer.write_strtab();
        writer.write_shstrtab();
        writer.write_null_section_header();
        writer.write_section_header(&elf_write::SectionHeader {
            name: Some(text_name),
            sh_type: elf::SHT_PROGBITS,
            sh_flags: u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR),
            sh_addr: text_addr,
            sh_offset: text_offset,
            sh_size: code.len() as u64,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 16,
            sh_entsize: 0,
        });
        writer.write_symtab_section_header(1);
        writer.write_strtab_section_header();
        writer.write_shstrtab_section_header();

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        (file, text_offset)
    }

    #[test]
    fn test_linked_executable_keeps_its_addresses() {
        let (file, text_offset) = linked_executable(0x400000, &[("helper", 0x6), ("main", 0x15)]);
        let mut provider = ObjectSymbolProvider::new();

        provider.update(Some(file.path()), &[], 0x400000);

        assert_eq!(provider.get_symbol(0x400000 + text_offset + 0x6), Some("helper"));
        assert_eq!(provider.get_symbol(0x400000 + text_offset + 0x15), Some("main"));
        assert_eq!(provider.function_symbols().len(), 2);
    }

    #[test]
    fn test_linked_executable_is_rebased() {
        let (file, text_offset) = linked_executable(0x400000, &[("helper", 0x6)]);
        let mut provider = ObjectSymbolProvider::new();

        provider.update(Some(file.path()), &[], 0x7ff6_0000_0000);

        assert_eq!(
            provider.get_symbol(0x7ff6_0000_0000 + text_offset + 0x6),
            Some("helper")
        );
        assert_eq!(provider.function_symbols().len(), 1);
    }

    #[test]
    fn test_function_symbols_are_relocated() {
        let file = symbol_file(&[
            ("decompress_block", 0x20, SymbolKind::Text),
            ("crc_table", 0x80, SymbolKind::Data),
        ]);
        let mut provider = ObjectSymbolProvider::new();

        provider.update(Some(file.path()), &[], 0x400000);

        assert_eq!(provider.base_addr(), 0x400000);
        assert_eq!(provider.get_symbol(0x400020), Some("decompress_block"));
        assert_eq!(provider.get_symbol(0x400080), None);
        assert_eq!(provider.function_symbols().len(), 1);
    }

    #[test]
    fn test_names_are_demangled() {
        let file = symbol_file(&[("_Z3addii", 0x10, SymbolKind::Text)]);

        let mut provider = ObjectSymbolProvider::new();
        provider.update(Some(file.path()), &[], 0);
        assert_eq!(provider.get_symbol(0x10), Some("add(int, int)"));

        let mut raw = ObjectSymbolProvider::new().with_demangling(false);
        raw.update(Some(file.path()), &[], 0);
        assert_eq!(raw.get_symbol(0x10), Some("_Z3addii"));
    }

    #[test]
    fn test_rescan_is_idempotent() {
        let file = symbol_file(&[("entry", 0x0, SymbolKind::Text)]);
        let mut provider = ObjectSymbolProvider::new();

        provider.update(Some(file.path()), &[], 0x1000);
        provider.update(Some(file.path()), &[], 0x1000);

        assert_eq!(provider.function_symbols().len(), 1);
        assert_eq!(provider.get_symbol(0x1000), Some("entry"));
    }

    #[test]
    fn test_missing_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = ObjectSymbolProvider::new();

        provider.update(Some(&dir.path().join("absent.debug")), &[], 0x400000);

        assert!(provider.function_symbols().is_empty());
    }

    #[test]
    fn test_foreign_file_is_a_no_op() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"Microsoft C/C++ MSF 7.00\r\n\x1aDS\0\0\0").unwrap();
        let mut provider = ObjectSymbolProvider::new();

        provider.update(Some(file.path()), &[], 0);

        assert!(provider.function_symbols().is_empty());
    }

    #[test]
    fn test_no_path_clears_previous_scan() {
        let file = symbol_file(&[("entry", 0x0, SymbolKind::Text)]);
        let mut provider = ObjectSymbolProvider::new();
        provider.update(Some(file.path()), &[], 0);

        provider.update(None, &[], 0);

        assert!(provider.function_symbols().is_empty());
    }
}
