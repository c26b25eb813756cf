//! Read-modify-write adapter for ELF64 little-endian relocatable
//! objects.
//!
//! The whole file is slurped on open: every section header and its
//! payload becomes an owned in-memory buffer. Mutations (renamed
//! symbols, rebuilt string tables, new relocation sections) happen on
//! those buffers and reach disk only through `flush()`, which lays the
//! file out again from scratch. Dropping the object without flushing
//! silently discards pending changes.
//!
//! Only the operations livepatch generation needs are implemented; this
//! is not a general-purpose ELF library.

pub mod rela;
pub mod symtab;

pub use rela::Rela;
pub use symtab::{Symbol, SymbolTable};

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::error::ErrorKind;

// Special section indices
pub const SHN_UNDEF: u16 = 0;
/// Marks a symbol resolved by the kernel livepatch loader at patch-apply
/// time rather than at module load.
pub const SHN_LIVEPATCH: u16 = 0xff20;
pub const SHN_ABS: u16 = 0xfff1;

// Section types
pub const SHT_NULL: u32 = 0;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;
pub const SHT_NOBITS: u32 = 8;

// Section flags
pub const SHF_ALLOC: u64 = 0x2;
pub const SHF_INFO_LINK: u64 = 0x40;
/// Kernel-only marker for livepatch relocation sections.
pub const SHF_RELA_LIVEPATCH: u64 = 0x0010_0000;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
pub const SYM_SIZE: usize = 24;
pub const RELA_SIZE: usize = 24;

const EI_MAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

#[derive(Debug, Clone, Default)]
pub struct SectionHeader {
    pub name: u32,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub addralign: u64,
    pub entsize: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Section {
    pub header: SectionHeader,
    pub data: Vec<u8>,
}

pub struct ElfObject {
    path: PathBuf,
    pub(crate) ident: [u8; 16],
    pub(crate) e_type: u16,
    pub(crate) e_machine: u16,
    pub(crate) e_entry: u64,
    pub(crate) e_flags: u32,
    pub(crate) shstrndx: u16,
    has_program_headers: bool,
    pub(crate) sections: Vec<Section>,
}

fn read_u16(bytes: &[u8], offset: usize) -> Result<u16> {
    let end = offset + 2;
    let slice = bytes.get(offset..end).context("truncated ELF header")?;
    Ok(u16::from_le_bytes(slice.try_into().unwrap()))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    let end = offset + 4;
    let slice = bytes.get(offset..end).context("truncated ELF header")?;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

fn read_u64(bytes: &[u8], offset: usize) -> Result<u64> {
    let end = offset + 8;
    let slice = bytes.get(offset..end).context("truncated ELF header")?;
    Ok(u64::from_le_bytes(slice.try_into().unwrap()))
}

impl ElfObject {
    pub fn open(path: &Path) -> Result<ElfObject> {
        let bytes = std::fs::read(path)
            .context(ErrorKind::FileOpenFailed)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Self::parse(&bytes, path)
            .with_context(|| format!("failed to parse ELF object {}", path.display()))
    }

    fn parse(bytes: &[u8], path: &Path) -> Result<ElfObject> {
        if bytes.len() < EHDR_SIZE || bytes[0..4] != EI_MAG {
            bail!("not an ELF file");
        }
        if bytes[4] != ELFCLASS64 || bytes[5] != ELFDATA2LSB {
            bail!("only little-endian ELF64 objects are supported");
        }

        let mut ident = [0u8; 16];
        ident.copy_from_slice(&bytes[0..16]);

        let e_type = read_u16(bytes, 16)?;
        let e_machine = read_u16(bytes, 18)?;
        let e_entry = read_u64(bytes, 24)?;
        let e_phnum = read_u16(bytes, 56)?;
        let e_shoff = read_u64(bytes, 40)? as usize;
        let e_flags = read_u32(bytes, 48)?;
        let e_shnum = read_u16(bytes, 60)? as usize;
        let e_shstrndx = read_u16(bytes, 62)?;

        let mut sections = Vec::with_capacity(e_shnum);
        for i in 0..e_shnum {
            let at = e_shoff + i * SHDR_SIZE;
            let header = SectionHeader {
                name: read_u32(bytes, at)?,
                sh_type: read_u32(bytes, at + 4)?,
                flags: read_u64(bytes, at + 8)?,
                addr: read_u64(bytes, at + 16)?,
                size: read_u64(bytes, at + 32)?,
                link: read_u32(bytes, at + 40)?,
                info: read_u32(bytes, at + 44)?,
                addralign: read_u64(bytes, at + 48)?,
                entsize: read_u64(bytes, at + 56)?,
            };
            let offset = read_u64(bytes, at + 24)? as usize;
            let data = match header.sh_type {
                SHT_NULL | SHT_NOBITS => Vec::new(),
                _ => bytes
                    .get(offset..offset + header.size as usize)
                    .with_context(|| format!("section {i} data out of range"))?
                    .to_vec(),
            };
            sections.push(Section { header, data });
        }

        Ok(ElfObject {
            path: path.to_path_buf(),
            ident,
            e_type,
            e_machine,
            e_entry,
            e_flags,
            shstrndx: e_shstrndx,
            has_program_headers: e_phnum != 0,
            sections,
        })
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn section(&self, index: usize) -> Result<&Section> {
        self.sections
            .get(index)
            .with_context(|| format!("section index {index} out of range"))
    }

    /// Index of the section-header string table.
    pub fn shstrndx(&self) -> usize {
        self.shstrndx as usize
    }

    /// Reads a NUL-terminated string out of a string-table section.
    pub fn str_at(&self, strtab: usize, offset: u32) -> Result<&str> {
        let data = &self.section(strtab)?.data;
        let start = offset as usize;
        let tail = data
            .get(start..)
            .with_context(|| format!("string offset {offset} out of range"))?;
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .context("unterminated string in string table")?;
        std::str::from_utf8(&tail[..end]).context("non-UTF-8 string in string table")
    }

    pub fn section_name(&self, index: usize) -> Result<&str> {
        let name = self.section(index)?.header.name;
        self.str_at(self.shstrndx(), name)
    }

    pub fn find_section(&self, name: &str) -> Option<usize> {
        (0..self.sections.len()).find(|&i| self.section_name(i).map(|n| n == name).unwrap_or(false))
    }

    /// Replaces a section's payload in one shot; the header size follows.
    pub fn set_section_data(&mut self, index: usize, data: Vec<u8>) -> Result<()> {
        let section = self
            .sections
            .get_mut(index)
            .with_context(|| format!("section index {index} out of range"))?;
        section.header.size = data.len() as u64;
        section.data = data;
        Ok(())
    }

    /// Appends a new section and returns its index.
    pub fn add_section(&mut self, header: SectionHeader, data: Vec<u8>) -> usize {
        let mut header = header;
        header.size = data.len() as u64;
        self.sections.push(Section { header, data });
        self.sections.len() - 1
    }

    /// Extracts the kernel module name from the `.modinfo` section, which
    /// holds NUL-separated `key=value` pairs:
    ///
    /// ```text
    /// livepatch=Y\0license=GPL\0name=kernel_livepatch\0vermagic=...
    /// ```
    pub fn mod_name(&self) -> Result<String> {
        let index = self
            .find_section(".modinfo")
            .with_context(|| format!("{}: no .modinfo section", self.path.display()))?;
        let data = &self.section(index)?.data;
        data.split(|&b| b == 0)
            .filter_map(|entry| std::str::from_utf8(entry).ok())
            .find_map(|entry| entry.strip_prefix("name="))
            .map(str::to_string)
            .with_context(|| format!("{}: no name= tag in .modinfo", self.path.display()))
    }

    /// Writes every pending mutation back to the file. The layout is
    /// recomputed from scratch: section payloads first (respecting each
    /// section's alignment), then the section header table.
    pub fn flush(&self) -> Result<()> {
        if self.has_program_headers {
            bail!(
                "{}: refusing to rewrite an ELF with program headers",
                self.path.display()
            );
        }

        let count = self.sections.len();

        // Lay out section payloads after the ELF header.
        let mut offsets = vec![0u64; count];
        let mut cursor = EHDR_SIZE as u64;
        for (i, section) in self.sections.iter().enumerate().skip(1) {
            if section.header.sh_type == SHT_NOBITS {
                offsets[i] = cursor;
                continue;
            }
            let align = section.header.addralign.max(1);
            cursor = (cursor + align - 1) / align * align;
            offsets[i] = cursor;
            cursor += section.data.len() as u64;
        }
        let shoff = (cursor + 7) & !7;

        let mut out = Vec::with_capacity(shoff as usize + count * SHDR_SIZE);

        // ---- ELF header ----
        out.extend_from_slice(&self.ident);
        out.extend_from_slice(&self.e_type.to_le_bytes());
        out.extend_from_slice(&self.e_machine.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes()); // e_version
        out.extend_from_slice(&self.e_entry.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // e_phoff
        out.extend_from_slice(&shoff.to_le_bytes()); // e_shoff
        out.extend_from_slice(&self.e_flags.to_le_bytes());
        out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
        out.extend_from_slice(&0u16.to_le_bytes()); // e_phentsize
        out.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
        out.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes()); // e_shentsize
        out.extend_from_slice(&(count as u16).to_le_bytes()); // e_shnum
        out.extend_from_slice(&self.shstrndx.to_le_bytes());
        debug_assert_eq!(out.len(), EHDR_SIZE);

        // ---- Section payloads ----
        for (i, section) in self.sections.iter().enumerate().skip(1) {
            if section.header.sh_type == SHT_NOBITS {
                continue;
            }
            out.resize(offsets[i] as usize, 0);
            out.extend_from_slice(&section.data);
        }

        // ---- Section header table ----
        out.resize(shoff as usize, 0);
        for (i, section) in self.sections.iter().enumerate() {
            let h = &section.header;
            let size = match h.sh_type {
                SHT_NULL | SHT_NOBITS => h.size,
                _ => section.data.len() as u64,
            };
            out.extend_from_slice(&h.name.to_le_bytes());
            out.extend_from_slice(&h.sh_type.to_le_bytes());
            out.extend_from_slice(&h.flags.to_le_bytes());
            out.extend_from_slice(&h.addr.to_le_bytes());
            let offset = if i == 0 { 0u64 } else { offsets[i] };
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&h.link.to_le_bytes());
            out.extend_from_slice(&h.info.to_le_bytes());
            out.extend_from_slice(&h.addralign.to_le_bytes());
            out.extend_from_slice(&h.entsize.to_le_bytes());
        }
        debug_assert_eq!(out.len(), shoff as usize + count * SHDR_SIZE);

        std::fs::write(&self.path, out)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::ObjectBuilder;
    use super::*;

    const STT_FUNC: u8 = 2;
    const STB_GLOBAL: u8 = 1;

    fn sym(name: &str, shndx: u16) -> (String, u8, u16) {
        (name.to_string(), (STB_GLOBAL << 4) | STT_FUNC, shndx)
    }

    #[test]
    fn open_round_trips_sections_and_symbols() {
        let path = ObjectBuilder {
            symbols: vec![sym("foo", 1), sym("bar", SHN_UNDEF)],
            relas: vec![],
            extra: vec![],
        }
        .write("roundtrip");

        let obj = ElfObject::open(&path).unwrap();
        assert_eq!(obj.section_count(), 6);
        assert_eq!(obj.section_name(1).unwrap(), ".text");
        assert_eq!(obj.section_name(3).unwrap(), ".symtab");

        let table = obj.symbol_table().unwrap();
        assert_eq!(table.symbols.len(), 3);
        assert_eq!(obj.symbol_name(&table, &table.symbols[1]).unwrap(), "foo");
        assert_eq!(obj.symbol_name(&table, &table.symbols[2]).unwrap(), "bar");
        assert!(table.symbols[2].is_undefined());
        assert!(!table.symbols[1].is_undefined());

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn flush_persists_symbol_mutations() {
        let path = ObjectBuilder {
            symbols: vec![sym("target", SHN_UNDEF)],
            relas: vec![],
            extra: vec![],
        }
        .write("mutate");

        {
            let mut obj = ElfObject::open(&path).unwrap();
            let mut table = obj.symbol_table().unwrap();
            let mut buf = vec![0u8];
            let offset = buf.len() as u32;
            buf.extend_from_slice(b"renamed");
            buf.push(0);
            table.symbols[1].name = offset;
            table.symbols[1].shndx = SHN_LIVEPATCH;
            let strtab = table.strtab;
            obj.store_symbol_table(&table).unwrap();
            obj.set_section_data(strtab, buf).unwrap();
            obj.flush().unwrap();
        }

        let obj = ElfObject::open(&path).unwrap();
        let table = obj.symbol_table().unwrap();
        assert_eq!(obj.symbol_name(&table, &table.symbols[1]).unwrap(), "renamed");
        assert_eq!(table.symbols[1].shndx, SHN_LIVEPATCH);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn mod_name_reads_modinfo_tag() {
        let modinfo = b"livepatch=Y\0license=GPL\0name=test_klp\0vermagic=6.6.0\0".to_vec();
        let path = ObjectBuilder {
            symbols: vec![sym("f", 1)],
            relas: vec![],
            extra: vec![(
                ".modinfo".to_string(),
                SectionHeader {
                    sh_type: 1,
                    addralign: 1,
                    ..Default::default()
                },
                modinfo,
            )],
        }
        .write("modinfo");

        let obj = ElfObject::open(&path).unwrap();
        assert_eq!(obj.mod_name().unwrap(), "test_klp");

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_symtab_is_reported() {
        let path = std::env::temp_dir().join(format!(
            "klpgen-elf-{}-nosymtab.o",
            std::process::id()
        ));
        // Reuse the builder output, then strip the symtab type marker.
        let built = ObjectBuilder {
            symbols: vec![],
            relas: vec![],
            extra: vec![],
        }
        .write("nosymtab-src");
        std::fs::copy(&built, &path).unwrap();
        std::fs::remove_file(built).unwrap();

        let mut obj = ElfObject::open(&path).unwrap();
        obj.sections[3].header.sh_type = 1;
        let err = obj.symbol_table().unwrap_err();
        assert_eq!(crate::error::exit_code(&err), 10);

        std::fs::remove_file(path).unwrap();
    }
}
