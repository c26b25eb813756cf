//! Relocation-section view over an `ElfObject`.
//!
//! Only RELA sections whose *target* section carries `SHF_ALLOC` are
//! surfaced: the kernel module loader frees non-alloc sections before
//! livepatch relocations are applied, so they can never host one.

use anyhow::Result;

use crate::error::ErrorKind;

use super::{
    ElfObject, SectionHeader, RELA_SIZE, SHF_ALLOC, SHF_INFO_LINK, SHF_RELA_LIVEPATCH, SHT_RELA,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rela {
    pub offset: u64,
    /// Symbol index in the upper 32 bits, relocation type in the lower.
    pub info: u64,
    pub addend: i64,
}

impl Rela {
    pub fn parse(bytes: &[u8]) -> Rela {
        debug_assert!(bytes.len() >= RELA_SIZE);
        Rela {
            offset: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            info: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            addend: i64::from_le_bytes(bytes[16..24].try_into().unwrap()),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.info.to_le_bytes());
        out.extend_from_slice(&self.addend.to_le_bytes());
    }

    pub fn sym_index(&self) -> usize {
        (self.info >> 32) as usize
    }

    pub fn rela_type(&self) -> u32 {
        self.info as u32
    }
}

impl ElfObject {
    /// Indices of all RELA sections relocating an allocatable section.
    pub fn rela_sections(&self) -> Vec<usize> {
        (0..self.sections.len())
            .filter(|&i| {
                let header = &self.sections[i].header;
                if header.sh_type != SHT_RELA {
                    return false;
                }
                match self.sections.get(header.info as usize) {
                    Some(target) => target.header.flags & SHF_ALLOC != 0,
                    None => false,
                }
            })
            .collect()
    }

    pub fn read_relas(&self, index: usize) -> Result<Vec<Rela>> {
        let data = &self.section(index)?.data;
        let count = data.len() / RELA_SIZE;
        let mut relas = Vec::with_capacity(count);
        for i in 0..count {
            relas.push(Rela::parse(&data[i * RELA_SIZE..]));
        }
        Ok(relas)
    }

    /// Rebuilds, in place, the RELA section that relocates `target`.
    /// There is a 1-to-1 correspondence between a section and the RELA
    /// section relocating it:
    ///
    /// ```text
    /// [Nr] Name        Type      ... ES Flg Lk Inf
    /// [ 1] .text       PROGBITS  ... 00  AX  0   0
    /// [ 2] .rela.text  RELA      ... 18   I 18   1
    /// ```
    pub fn update_rela_section(&mut self, target: u32, relas: &[Rela]) -> Result<()> {
        let index = (0..self.sections.len())
            .find(|&i| {
                let header = &self.sections[i].header;
                header.sh_type == SHT_RELA && header.info == target
            })
            .ok_or(ErrorKind::RelaSectionNotFound)?;
        let mut data = Vec::with_capacity(relas.len() * RELA_SIZE);
        for rela in relas {
            rela.encode(&mut data);
        }
        self.set_section_data(index, data)
    }

    /// Creates a livepatch relocation section for `target`. `name` is an
    /// offset into the section-header string table, which the caller is
    /// responsible for extending.
    pub fn add_klp_rela_section(
        &mut self,
        name: u32,
        target: u32,
        symtab: u32,
        relas: &[Rela],
    ) -> usize {
        let mut data = Vec::with_capacity(relas.len() * RELA_SIZE);
        for rela in relas {
            rela.encode(&mut data);
        }
        self.add_section(
            SectionHeader {
                name,
                sh_type: SHT_RELA,
                flags: SHF_RELA_LIVEPATCH | SHF_INFO_LINK | SHF_ALLOC,
                addr: 0,
                size: 0, // set from the payload
                link: symtab,
                info: target,
                addralign: 8,
                entsize: RELA_SIZE as u64,
            },
            data,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::ObjectBuilder;
    use super::*;

    fn rela(sym: u64, offset: u64) -> Rela {
        Rela {
            offset,
            info: (sym << 32) | 2, // R_X86_64_PC32
            addend: -4,
        }
    }

    #[test]
    fn parse_and_encode_are_inverse() {
        let entry = rela(3, 0x40);
        let mut bytes = Vec::new();
        entry.encode(&mut bytes);
        assert_eq!(bytes.len(), RELA_SIZE);
        assert_eq!(Rela::parse(&bytes), entry);
        assert_eq!(entry.sym_index(), 3);
        assert_eq!(entry.rela_type(), 2);
    }

    #[test]
    fn rela_sections_require_alloc_target() {
        let path = ObjectBuilder {
            symbols: vec![("f".to_string(), 0x12, 1)],
            relas: vec![rela(1, 0)],
            extra: vec![
                (
                    ".debug_info".to_string(),
                    SectionHeader {
                        sh_type: 1,
                        addralign: 1,
                        ..Default::default()
                    },
                    vec![0; 8],
                ),
                (
                    ".rela.debug_info".to_string(),
                    SectionHeader {
                        sh_type: SHT_RELA,
                        link: 3,
                        info: 6, // .debug_info, not allocated
                        addralign: 8,
                        entsize: RELA_SIZE as u64,
                        ..Default::default()
                    },
                    {
                        let mut data = Vec::new();
                        rela(1, 8).encode(&mut data);
                        data
                    },
                ),
            ],
        }
        .write("alloc-filter");

        let obj = ElfObject::open(&path).unwrap();
        // Only .rela.text qualifies; .rela.debug_info's target is not
        // allocated.
        assert_eq!(obj.rela_sections(), vec![2]);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn update_rela_section_rewrites_entries() {
        let path = ObjectBuilder {
            symbols: vec![("f".to_string(), 0x12, 1)],
            relas: vec![rela(1, 0), rela(1, 8), rela(1, 16)],
            extra: vec![],
        }
        .write("update");

        let mut obj = ElfObject::open(&path).unwrap();
        let kept = vec![rela(1, 8)];
        obj.update_rela_section(1, &kept).unwrap();
        obj.flush().unwrap();

        let obj = ElfObject::open(&path).unwrap();
        assert_eq!(obj.read_relas(2).unwrap(), kept);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn update_rela_section_for_unknown_target_fails() {
        let path = ObjectBuilder {
            symbols: vec![("f".to_string(), 0x12, 1)],
            relas: vec![],
            extra: vec![],
        }
        .write("unknown-target");

        let mut obj = ElfObject::open(&path).unwrap();
        let err = obj.update_rela_section(42, &[]).unwrap_err();
        assert_eq!(crate::error::exit_code(&err), 12);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn add_klp_rela_section_round_trips() {
        let path = ObjectBuilder {
            symbols: vec![("f".to_string(), 0x12, 1)],
            relas: vec![],
            extra: vec![],
        }
        .write("add-klp");

        let mut obj = ElfObject::open(&path).unwrap();
        let entries = vec![rela(1, 0), rela(1, 8)];

        let shstrndx = obj.shstrndx();
        let mut names = obj.section(shstrndx).unwrap().data.clone();
        let name_offset = names.len() as u32;
        names.extend_from_slice(b".klp.rela.vmlinux.text");
        names.push(0);

        let index = obj.add_klp_rela_section(name_offset, 1, 3, &entries);
        obj.set_section_data(shstrndx, names).unwrap();
        obj.flush().unwrap();

        let obj = ElfObject::open(&path).unwrap();
        assert_eq!(obj.section_name(index).unwrap(), ".klp.rela.vmlinux.text");
        let header = &obj.section(index).unwrap().header;
        assert_eq!(header.sh_type, SHT_RELA);
        assert_eq!(header.flags, SHF_RELA_LIVEPATCH | SHF_INFO_LINK | SHF_ALLOC);
        assert_eq!(header.info, 1);
        assert_eq!(header.link, 3);
        assert_eq!(header.entsize, RELA_SIZE as u64);
        assert_eq!(obj.read_relas(index).unwrap(), entries);

        std::fs::remove_file(path).unwrap();
    }
}
