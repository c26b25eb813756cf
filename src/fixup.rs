//! Rewrites a livepatch object into the symbol and relocation layout
//! the kernel livepatch loader expects.
//!
//! Rename mode turns every externally-resolved reference into a
//! `.klp.sym.<object>.<name>,<pos>` symbol flagged with the livepatch
//! section index. Rela mode then pulls the relocations against those
//! symbols out of their sections and into dedicated
//! `.klp.rela.<object>.<section>` sections, which the kernel applies at
//! patch time instead of module-load time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::elf::{ElfObject, Rela, SHN_LIVEPATCH};
use crate::error::ErrorKind;
use crate::symbol_map::SymbolMap;
use crate::thin_archive::ThinArchive;
use crate::{
    source_object_file, KLP_LOCAL_SYM_PREFIX, KLP_RELA_PREFIX, KLP_SYM_PREFIX,
    LLPATCH_SYMBOL_PREFIX,
};

pub struct FixupOptions<'a> {
    pub patch_object: &'a Path,
    /// Patched kernel module; absent means the patch targets vmlinux.
    pub module: Option<&'a Path>,
    pub symbol_map: Option<&'a Path>,
    pub thin_archive: Option<&'a Path>,
    /// Create the livepatch relocation sections instead of renaming.
    pub create_rela: bool,
    pub quiet: bool,
}

pub fn run(opts: &FixupOptions) -> Result<()> {
    let mut object = ElfObject::open(opts.patch_object)?;
    if opts.create_rela {
        create_klp_rela(&mut object, opts.quiet)
    } else {
        rename_klp_symbols(&mut object, opts)
    }
}

/// Appends `name` (NUL-terminated) to the string buffer and returns the
/// offset it was stored at.
fn append_name(buffer: &mut Vec<u8>, name: &str) -> u32 {
    let offset = buffer.len() as u32;
    buffer.extend_from_slice(name.as_bytes());
    buffer.push(0);
    offset
}

/// Symbol position lookup; no archive means position 0, an archive that
/// does not know the symbol means the object cannot be disambiguated.
fn sympos(archive: Option<&ThinArchive>, symbol: &str, source: &str) -> Result<u32> {
    let archive = match archive {
        Some(archive) => archive,
        None => return Ok(0),
    };
    let filename = source_object_file(source);
    match archive.query(symbol, &filename) {
        Some(pos) => Ok(pos),
        None => {
            eprintln!("symbol: {symbol}, filename: {filename}");
            eprintln!("failed to find the symbol in the thin archive");
            bail!(ErrorKind::SymFindFailed);
        }
    }
}

fn rename_klp_symbols(object: &mut ElfObject, opts: &FixupOptions) -> Result<()> {
    // With a kernel module given, only symbols the module itself defines
    // become livepatch symbols; everything else resolves against some
    // other object's exports at load time.
    let mut module_symbols = HashSet::new();
    let mut object_name = "vmlinux".to_string();
    if let Some(path) = opts.module {
        let module = ElfObject::open(path)?;
        let table = module.symbol_table()?;
        for symbol in table.symbols.iter().skip(1) {
            if symbol.is_undefined() {
                continue;
            }
            module_symbols.insert(module.symbol_name(&table, symbol)?.to_string());
        }
        object_name = module.mod_name()?;
    }

    let archive = ThinArchive::load_optional(opts.thin_archive)?;
    let symbol_map = SymbolMap::load_optional(opts.symbol_map)?;

    let mut table = object.symbol_table()?;
    let old_names = table
        .symbols
        .iter()
        .skip(1)
        .map(|symbol| object.symbol_name(&table, symbol).map(str::to_string))
        .collect::<Result<Vec<_>>>()?;

    // The table's first entry is the null symbol; its empty name is the
    // leading NUL of the rebuilt buffer.
    let mut names = vec![0u8];
    for (symbol, name) in table.symbols.iter_mut().skip(1).zip(&old_names) {
        // __fentry__ is the ftrace hook; the kernel resolves it itself.
        if !symbol.is_undefined() || name.as_str() == "__fentry__" {
            symbol.name = append_name(&mut names, name);
            continue;
        }

        let mut klp_object = object_name.clone();
        let (real_name, source) = if let Some(map) = &symbol_map {
            match name.strip_prefix(LLPATCH_SYMBOL_PREFIX) {
                Some(alias) => {
                    let entry = map.query(alias)?;
                    klp_object = entry.mod_name.clone();
                    (entry.symbol.clone(), entry.path.clone())
                }
                None => {
                    // With a symbol map, only declared aliases become
                    // livepatch symbols.
                    symbol.name = append_name(&mut names, name);
                    continue;
                }
            }
        } else {
            let (real_name, source) = match name.strip_prefix(KLP_LOCAL_SYM_PREFIX) {
                Some(rest) => {
                    let (real, source) = rest.split_once(':').unwrap_or((rest, ""));
                    (real.to_string(), source.to_string())
                }
                None => (name.clone(), String::new()),
            };
            if object_name != "vmlinux" && !module_symbols.contains(&real_name) {
                // The module does not define it, so an EXPORTed symbol
                // from another object satisfies the reference.
                symbol.name = append_name(&mut names, &real_name);
                continue;
            }
            (real_name, source)
        };

        symbol.shndx = SHN_LIVEPATCH;
        let pos = sympos(archive.as_ref(), &real_name, &source)?;

        // .klp.sym.objname.symbol_name,sympos
        // ^       ^^     ^ ^         ^ ^
        // |_______||_____| |_________| |
        //    [A]     [B]       [C]    [D]
        //
        // [A]: prefix
        // [B]: vmlinux or the module defining the symbol
        // [C]: the symbol's real name
        // [D]: position among same-named symbols, 0 when unique
        let klp_name = format!("{KLP_SYM_PREFIX}{klp_object}.{real_name},{pos}");
        if !opts.quiet {
            println!("klp symbol: {real_name} -> {klp_name}");
        }
        symbol.name = append_name(&mut names, &klp_name);
    }

    // Symbol offsets point into the new buffer, so the buffer must be in
    // place before the flush.
    let strtab = table.strtab;
    object.store_symbol_table(&table)?;
    object.set_section_data(strtab, names)?;
    object.flush()
}

fn create_klp_rela(object: &mut ElfObject, quiet: bool) -> Result<()> {
    let mut table = object.symbol_table()?;
    let rela_sections = object.rela_sections();
    if rela_sections.is_empty() {
        bail!(ErrorKind::NoRelaSection);
    }

    // Kept entries per target section; seeded so a fully-livepatch
    // section still gets rebuilt (empty) rather than keeping stale
    // duplicates of the moved entries.
    let mut kept: HashMap<u32, Vec<Rela>> = HashMap::new();
    // Moved entries, bucketed by (object name, target section).
    let mut moved: BTreeMap<(String, u32), Vec<Rela>> = BTreeMap::new();
    let mut symtab_for: HashMap<u32, u32> = HashMap::new();
    let mut livepatch_symbols = Vec::new();

    for &section in &rela_sections {
        let header = &object.section(section)?.header;
        let target = header.info;
        let symtab = header.link;
        kept.entry(target).or_default();

        for rela in object.read_relas(section)? {
            let symbol = table
                .symbols
                .get(rela.sym_index())
                .ok_or(ErrorKind::InvalidElfSymbol)
                .with_context(|| format!("relocation references symbol {}", rela.sym_index()))?;
            let name = object.symbol_name(&table, symbol)?;
            if !name.starts_with(KLP_SYM_PREFIX) {
                kept.get_mut(&target).unwrap().push(rela);
                continue;
            }

            // .klp.rela.objname.section_name: objname sits between the
            // prefix and the next dot of the symbol name.
            let rest = &name[KLP_SYM_PREFIX.len()..];
            let klp_object = rest.split('.').next().unwrap_or("").to_string();
            if !quiet {
                println!("klp symbol[{klp_object}] :: section {target}, symbol {name}");
            }

            livepatch_symbols.push(rela.sym_index());
            moved.entry((klp_object, target)).or_default().push(rela);
            symtab_for.insert(target, symtab);
        }
    }

    for index in livepatch_symbols {
        table.symbols[index].shndx = SHN_LIVEPATCH;
    }
    object.store_symbol_table(&table)?;

    for (target, relas) in &kept {
        object.update_rela_section(*target, relas)?;
    }

    // The rebuilt sections must hit the file before new ones are added;
    // a dirty header would collide with the fresh section indices.
    object.flush()?;

    let shstrndx = object.shstrndx();
    let mut section_names = object.section(shstrndx)?.data.clone();
    for ((klp_object, target), relas) in &moved {
        let target_name = object.section_name(*target as usize)?;
        let rela_name = if target_name.starts_with('.') {
            format!("{KLP_RELA_PREFIX}{klp_object}{target_name}")
        } else {
            format!("{KLP_RELA_PREFIX}{klp_object}.{target_name}")
        };
        println!("klp rela section: {rela_name}");

        let name_offset = append_name(&mut section_names, &rela_name);
        object.add_klp_rela_section(name_offset, *target, symtab_for[target], relas);
    }
    object.set_section_data(shstrndx, section_names)?;
    object.flush()
}
