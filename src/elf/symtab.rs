//! Symbol-table view over an `ElfObject`.
//!
//! Symbols are decoded into an owned table, mutated there, and written
//! back in one `store_symbol_table` call. Entry 0 is the mandatory null
//! symbol; pipeline code iterates with `.skip(1)`.

use anyhow::{Context, Result};

use crate::error::ErrorKind;

use super::{ElfObject, SHN_UNDEF, SHT_SYMTAB, SYM_SIZE};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Symbol {
    /// Offset of the name in the linked string table.
    pub name: u32,
    pub info: u8,
    pub other: u8,
    pub shndx: u16,
    pub value: u64,
    pub size: u64,
}

impl Symbol {
    pub fn parse(bytes: &[u8]) -> Symbol {
        debug_assert!(bytes.len() >= SYM_SIZE);
        Symbol {
            name: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            info: bytes[4],
            other: bytes[5],
            shndx: u16::from_le_bytes(bytes[6..8].try_into().unwrap()),
            value: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            size: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.name.to_le_bytes());
        out.push(self.info);
        out.push(self.other);
        out.extend_from_slice(&self.shndx.to_le_bytes());
        out.extend_from_slice(&self.value.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
    }

    pub fn sym_type(&self) -> u8 {
        self.info & 0xf
    }

    pub fn binding(&self) -> u8 {
        self.info >> 4
    }

    pub fn is_undefined(&self) -> bool {
        self.shndx == SHN_UNDEF
    }
}

#[derive(Debug)]
pub struct SymbolTable {
    /// Index of the `.symtab` section.
    pub section: usize,
    /// Index of the linked string-table section.
    pub strtab: usize,
    /// All entries, the null symbol included.
    pub symbols: Vec<Symbol>,
}

impl ElfObject {
    /// Locates and decodes the symbol table.
    pub fn symbol_table(&self) -> Result<SymbolTable> {
        let section = (0..self.sections.len())
            .find(|&i| self.sections[i].header.sh_type == SHT_SYMTAB)
            .ok_or_else(|| anyhow::Error::from(ErrorKind::NoSymtab))?;
        let header = &self.sections[section].header;
        let strtab = header.link as usize;
        let data = &self.sections[section].data;

        let count = data.len() / SYM_SIZE;
        let mut symbols = Vec::with_capacity(count);
        for i in 0..count {
            symbols.push(Symbol::parse(&data[i * SYM_SIZE..]));
        }

        Ok(SymbolTable {
            section,
            strtab,
            symbols,
        })
    }

    pub fn symbol_name(&self, table: &SymbolTable, symbol: &Symbol) -> Result<&str> {
        self.str_at(table.strtab, symbol.name)
            .context(ErrorKind::InvalidElfSymbol)
    }

    /// Encodes the table back into its section.
    pub fn store_symbol_table(&mut self, table: &SymbolTable) -> Result<()> {
        let mut data = Vec::with_capacity(table.symbols.len() * SYM_SIZE);
        for symbol in &table.symbols {
            symbol.encode(&mut data);
        }
        self.set_section_data(table.section, data)
    }
}
