//! Generates the livepatch packaging around a compiled patch object:
//! the C wrapper that registers every changed function with the kernel
//! livepatch subsystem, a linker script binding the wrapper's
//! declarations to the prefixed implementations, and a kbuild makefile.
//!
//! Afterwards the `:source-file` suffixes that the diff stage attached
//! to symbol names are stripped from the object, leaving plain names
//! for the final link.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::elf::ElfObject;
use crate::error::ErrorKind;
use crate::thin_archive::ThinArchive;
use crate::{create_file, open_file, source_object_file, LIVEPATCH_FUNC_PREFIX};

/// Prefix used for the wrapper-side function names; the linker script
/// maps them onto the `__livepatch_` implementations.
const WRAPPER_PREFIX: &str = "livepatch_";

const FUNC_LIST_MARKER: &str = "{{LIST_OF_LIVEPATCH_FUNCTIONS}}";
const FUNC_STRUCT_MARKER: &str = "{{LIST_FOR_KLP_FUNC_STRUCT}}";
const OBJECT_NAME_MARKER: &str = "{{NAME_OF_OBJECT}}";
const KERNEL_PATH_MARKER: &str = "{{PATH_TO_LINUX_KERNEL_SOURCE_TREE}}";
const KLP_NAME_MARKER: &str = "{{NAME_OF_LIVEPATCH}}";

pub struct GenOptions<'a> {
    pub patch_object: &'a Path,
    pub output_dir: &'a Path,
    pub kernel_dir: &'a str,
    /// Name of the livepatch kernel module being generated.
    pub klp_name: &'a str,
    /// Patched kernel module; absent means the patch targets vmlinux.
    pub module: Option<&'a Path>,
    pub thin_archive: Option<&'a Path>,
}

/// A livepatched function: its original name and the source file the
/// change came from.
#[derive(Debug)]
struct KlpFunc {
    name: String,
    source: String,
}

pub fn run(opts: &GenOptions) -> Result<()> {
    let mut object = ElfObject::open(opts.patch_object)?;
    let functions = collect_klp_functions(&object)?;
    if functions.is_empty() {
        eprintln!("there are no livepatched functions");
        bail!(ErrorKind::NothingToPatch);
    }

    let mod_name = match opts.module {
        Some(path) => ElfObject::open(path)?.mod_name()?,
        None => String::new(),
    };
    let archive = ThinArchive::load_optional(opts.thin_archive)?;

    let template_dir = executable_directory()?.join("templates");
    generate_wrapper(opts, &template_dir, &functions, &mod_name, archive.as_ref())?;
    generate_ld_script(opts, &template_dir, &functions)?;
    generate_makefile(opts, &template_dir)?;

    strip_symbol_suffixes(&mut object)
}

/// Directory holding this executable; the templates ship next to it.
fn executable_directory() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("failed to locate the running executable")?;
    Ok(exe
        .parent()
        .context("executable has no parent directory")?
        .to_path_buf())
}

/// Scans the object's symbol table for `__livepatch_<func>:<source>`
/// names left behind by the diff stage.
fn collect_klp_functions(object: &ElfObject) -> Result<Vec<KlpFunc>> {
    let table = object.symbol_table()?;
    let mut functions = Vec::new();
    for symbol in table.symbols.iter().skip(1) {
        let name = object.symbol_name(&table, symbol)?;
        if name.is_empty() || !name.starts_with(LIVEPATCH_FUNC_PREFIX) {
            continue;
        }
        if name[1..].contains(LIVEPATCH_FUNC_PREFIX) {
            // The prefix re-appearing inside the name means something
            // else generated it; refuse to guess.
            eprintln!("symbol name: {name}");
            bail!(ErrorKind::InvalidKlpPrefix);
        }
        let rest = &name[LIVEPATCH_FUNC_PREFIX.len()..];
        let (func, source) = rest.split_once(':').unwrap_or((rest, ""));
        functions.push(KlpFunc {
            name: func.to_string(),
            source: source.to_string(),
        });
    }
    Ok(functions)
}

/// Symbol position for one livepatched function: 0 without an archive
/// index, otherwise the archive decides; a missing entry means the
/// function cannot be addressed unambiguously.
fn sympos(archive: Option<&ThinArchive>, func: &KlpFunc) -> Result<u32> {
    let archive = match archive {
        Some(archive) => archive,
        None => return Ok(0),
    };
    let object_file = source_object_file(&func.source);
    archive
        .query(&func.name, &object_file)
        .ok_or_else(|| anyhow::Error::from(ErrorKind::SymFindFailed))
        .with_context(|| {
            format!(
                "symbol: {}, filename: {}: not found in thin archive",
                func.name, object_file
            )
        })
}

/// Copies template lines to the output until one contains `marker`,
/// returning that line; `None` marker copies everything left.
fn copy_to_marker<'a>(
    lines: &mut impl Iterator<Item = &'a str>,
    out: &mut impl Write,
    marker: Option<&str>,
) -> Result<Option<String>> {
    for line in lines {
        if let Some(marker) = marker {
            if line.contains(marker) {
                return Ok(Some(line.to_string()));
            }
        }
        writeln!(out, "{line}")?;
    }
    Ok(None)
}

fn read_template(template_dir: &Path, name: &str) -> Result<String> {
    let path = template_dir.join(format!("{name}.tmpl"));
    let mut text = String::new();
    use std::io::Read;
    open_file(&path)?
        .read_to_string(&mut text)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(text)
}

fn generate_wrapper(
    opts: &GenOptions,
    template_dir: &Path,
    functions: &[KlpFunc],
    mod_name: &str,
    archive: Option<&ThinArchive>,
) -> Result<()> {
    let template = read_template(template_dir, "livepatch.c")?;
    let out_path = opts.output_dir.join("livepatch.c");
    let mut out = BufWriter::new(create_file(&out_path)?);
    let mut lines = template.lines();

    copy_to_marker(&mut lines, &mut out, Some(FUNC_LIST_MARKER))?;
    for func in functions {
        writeln!(out, "void {WRAPPER_PREFIX}{}(void);", func.name)?;
    }

    copy_to_marker(&mut lines, &mut out, Some(FUNC_STRUCT_MARKER))?;
    for func in functions {
        let pos = sympos(archive, func)?;
        writeln!(out, "\t{{")?;
        writeln!(out, "\t\t.old_name = \"{}\",", func.name)?;
        writeln!(out, "\t\t.new_func = {WRAPPER_PREFIX}{},", func.name)?;
        writeln!(out, "\t\t.old_sympos = {pos},")?;
        writeln!(out, "\t}},")?;
    }

    copy_to_marker(&mut lines, &mut out, Some(OBJECT_NAME_MARKER))?;
    // NULL targets vmlinux; a kernel module is named explicitly.
    if mod_name.is_empty() {
        writeln!(out, "\t\t.name = NULL,")?;
    } else {
        writeln!(out, "\t\t.name = \"{mod_name}\",")?;
    }

    copy_to_marker(&mut lines, &mut out, None)?;
    out.flush()
        .with_context(|| format!("failed to write {}", out_path.display()))
}

fn generate_ld_script(
    opts: &GenOptions,
    template_dir: &Path,
    functions: &[KlpFunc],
) -> Result<()> {
    let template = read_template(template_dir, "livepatch.lds")?;
    let out_path = opts.output_dir.join("livepatch.lds");
    let mut out = BufWriter::new(create_file(&out_path)?);
    let mut lines = template.lines();

    copy_to_marker(&mut lines, &mut out, None)?;
    for func in functions {
        writeln!(
            out,
            "{WRAPPER_PREFIX}{} = {LIVEPATCH_FUNC_PREFIX}{};",
            func.name, func.name
        )?;
    }

    out.flush()
        .with_context(|| format!("failed to write {}", out_path.display()))
}

fn generate_makefile(opts: &GenOptions, template_dir: &Path) -> Result<()> {
    let template = read_template(template_dir, "Makefile")?;
    let out_path = opts.output_dir.join("Makefile");
    let mut out = BufWriter::new(create_file(&out_path)?);
    let mut lines = template.lines();

    // The marker lines keep their prefix: `KDIR = {{...}}` becomes
    // `KDIR = /path/to/kernel`.
    if let Some(line) = copy_to_marker(&mut lines, &mut out, Some(KERNEL_PATH_MARKER))? {
        let prefix = &line[..line.find(KERNEL_PATH_MARKER).unwrap()];
        writeln!(out, "{prefix}{}", opts.kernel_dir)?;
    }
    if let Some(line) = copy_to_marker(&mut lines, &mut out, Some(KLP_NAME_MARKER))? {
        let prefix = &line[..line.find(KLP_NAME_MARKER).unwrap()];
        writeln!(out, "{prefix}{}", opts.klp_name)?;
    }
    copy_to_marker(&mut lines, &mut out, None)?;

    out.flush()
        .with_context(|| format!("failed to write {}", out_path.display()))
}

/// Truncates every symbol name at its first `:`, dropping the
/// source-file suffix the diff stage attached, and rebuilds the string
/// table around the shortened names.
fn strip_symbol_suffixes(object: &mut ElfObject) -> Result<()> {
    let mut table = object.symbol_table()?;
    let old_names = table
        .symbols
        .iter()
        .skip(1)
        .map(|symbol| object.symbol_name(&table, symbol).map(str::to_string))
        .collect::<Result<Vec<_>>>()?;

    let mut names = vec![0u8];
    for (symbol, name) in table.symbols.iter_mut().skip(1).zip(&old_names) {
        let stripped = name.split(':').next().unwrap_or("");
        let offset = names.len() as u32;
        names.extend_from_slice(stripped.as_bytes());
        names.push(0);
        symbol.name = offset;
    }
    let strtab = table.strtab;
    object.store_symbol_table(&table)?;
    object.set_section_data(strtab, names)?;
    object.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::testutil::ObjectBuilder;
    use crate::elf::SHN_UNDEF;
    use std::io::Write as _;

    struct TempDir {
        path: PathBuf,
    }

    impl TempDir {
        fn new(name: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "klpgen-gen-{}-{}",
                std::process::id(),
                name
            ));
            std::fs::create_dir_all(&path).unwrap();
            TempDir { path }
        }

        fn file(&self, name: &str, contents: &str) -> PathBuf {
            let path = self.path.join(name);
            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(contents.as_bytes()).unwrap();
            path
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    fn func_sym(name: &str) -> (String, u8, u16) {
        (name.to_string(), (1 << 4) | 2, 1)
    }

    #[test]
    fn collect_klp_functions_splits_name_and_source() {
        let path = ObjectBuilder {
            symbols: vec![
                func_sym("__livepatch_frob:drivers/x.c"),
                func_sym("other"),
                ("undef".to_string(), 0x10, SHN_UNDEF),
            ],
            relas: vec![],
            extra: vec![],
        }
        .write("gen-collect");

        let object = ElfObject::open(&path).unwrap();
        let functions = collect_klp_functions(&object).unwrap();
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].name, "frob");
        assert_eq!(functions[0].source, "drivers/x.c");

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn repeated_prefix_is_rejected() {
        let path = ObjectBuilder {
            symbols: vec![func_sym("__livepatch___livepatch_frob:x.c")],
            relas: vec![],
            extra: vec![],
        }
        .write("gen-badprefix");

        let object = ElfObject::open(&path).unwrap();
        let err = collect_klp_functions(&object).unwrap_err();
        assert_eq!(crate::error::exit_code(&err), 13);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn wrapper_expansion_fills_markers() {
        let tmp = TempDir::new("wrapper");
        let template_dir = tmp.path.join("templates");
        std::fs::create_dir_all(&template_dir).unwrap();
        tmp.file(
            "templates/livepatch.c.tmpl",
            "#include <linux/livepatch.h>\n\
             {{LIST_OF_LIVEPATCH_FUNCTIONS}}\n\
             static struct klp_func funcs[] = {\n\
             {{LIST_FOR_KLP_FUNC_STRUCT}}\n\
             \t{ }\n\
             };\n\
             static struct klp_object objs[] = {\n\
             \t{\n\
             {{NAME_OF_OBJECT}}\n\
             \t\t.funcs = funcs,\n\
             \t},\n\
             };\n",
        );
        let functions = vec![
            KlpFunc {
                name: "frob".to_string(),
                source: "drivers/x.c".to_string(),
            },
            KlpFunc {
                name: "tweak".to_string(),
                source: "drivers/x.c".to_string(),
            },
        ];
        let opts = GenOptions {
            patch_object: Path::new("unused.o"),
            output_dir: &tmp.path,
            kernel_dir: "/usr/src/linux",
            klp_name: "my_patch",
            module: None,
            thin_archive: None,
        };
        generate_wrapper(&opts, &template_dir, &functions, "", None).unwrap();

        let wrapper = std::fs::read_to_string(tmp.path.join("livepatch.c")).unwrap();
        assert!(wrapper.contains("void livepatch_frob(void);"));
        assert!(wrapper.contains("void livepatch_tweak(void);"));
        assert!(wrapper.contains("\t\t.old_name = \"frob\","));
        assert!(wrapper.contains("\t\t.new_func = livepatch_frob,"));
        assert!(wrapper.contains("\t\t.old_sympos = 0,"));
        assert!(wrapper.contains("\t\t.name = NULL,"));
        assert!(!wrapper.contains("{{"));
    }

    #[test]
    fn wrapper_names_kernel_module() {
        let tmp = TempDir::new("wrapper-mod");
        let template_dir = tmp.path.join("templates");
        std::fs::create_dir_all(&template_dir).unwrap();
        tmp.file(
            "templates/livepatch.c.tmpl",
            "{{LIST_OF_LIVEPATCH_FUNCTIONS}}\n{{LIST_FOR_KLP_FUNC_STRUCT}}\n{{NAME_OF_OBJECT}}\n",
        );
        let functions = vec![KlpFunc {
            name: "frob".to_string(),
            source: "x.c".to_string(),
        }];
        let opts = GenOptions {
            patch_object: Path::new("unused.o"),
            output_dir: &tmp.path,
            kernel_dir: "/usr/src/linux",
            klp_name: "my_patch",
            module: None,
            thin_archive: None,
        };
        generate_wrapper(&opts, &template_dir, &functions, "test_mod", None).unwrap();
        let wrapper = std::fs::read_to_string(tmp.path.join("livepatch.c")).unwrap();
        assert!(wrapper.contains("\t\t.name = \"test_mod\","));
    }

    #[test]
    fn ld_script_appends_function_bindings() {
        let tmp = TempDir::new("lds");
        let template_dir = tmp.path.join("templates");
        std::fs::create_dir_all(&template_dir).unwrap();
        tmp.file(
            "templates/livepatch.lds.tmpl",
            "/* bind wrapper declarations to implementations */\n",
        );
        let functions = vec![KlpFunc {
            name: "frob".to_string(),
            source: "x.c".to_string(),
        }];
        let opts = GenOptions {
            patch_object: Path::new("unused.o"),
            output_dir: &tmp.path,
            kernel_dir: "/usr/src/linux",
            klp_name: "my_patch",
            module: None,
            thin_archive: None,
        };
        generate_ld_script(&opts, &template_dir, &functions).unwrap();
        let lds = std::fs::read_to_string(tmp.path.join("livepatch.lds")).unwrap();
        assert!(lds.ends_with("livepatch_frob = __livepatch_frob;\n"));
    }

    #[test]
    fn makefile_markers_keep_line_prefixes() {
        let tmp = TempDir::new("makefile");
        let template_dir = tmp.path.join("templates");
        std::fs::create_dir_all(&template_dir).unwrap();
        tmp.file(
            "templates/Makefile.tmpl",
            "KDIR = {{PATH_TO_LINUX_KERNEL_SOURCE_TREE}}\n\
             KLP_NAME = {{NAME_OF_LIVEPATCH}}\n\
             obj-m += $(KLP_NAME).o\n",
        );
        let opts = GenOptions {
            patch_object: Path::new("unused.o"),
            output_dir: &tmp.path,
            kernel_dir: "/usr/src/linux",
            klp_name: "my_patch",
            module: None,
            thin_archive: None,
        };
        generate_makefile(&opts, &template_dir).unwrap();
        let makefile = std::fs::read_to_string(tmp.path.join("Makefile")).unwrap();
        assert!(makefile.contains("KDIR = /usr/src/linux\n"));
        assert!(makefile.contains("KLP_NAME = my_patch\n"));
        assert!(makefile.contains("obj-m += $(KLP_NAME).o\n"));
    }

    #[test]
    fn sympos_prefers_archive_and_fails_on_miss() {
        let tmp = TempDir::new("sympos");
        let dump = tmp.file(
            "nm.txt",
            "built-in.a[drivers/x.o]:\n\
             frob T 100 10\n\
             built-in.a[drivers/y.o]:\n\
             frob T 200 10\n",
        );
        let archive = ThinArchive::load(&dump).unwrap();
        let func = |name: &str, source: &str| KlpFunc {
            name: name.to_string(),
            source: source.to_string(),
        };

        assert_eq!(sympos(None, &func("frob", "drivers/x.c")).unwrap(), 0);
        assert_eq!(sympos(Some(&archive), &func("frob", "drivers/y.c")).unwrap(), 2);
        let err = sympos(Some(&archive), &func("missing", "drivers/x.c")).unwrap_err();
        assert_eq!(crate::error::exit_code(&err), 8);
    }

    #[test]
    fn strip_symbol_suffixes_truncates_at_colon() {
        let path = ObjectBuilder {
            symbols: vec![
                func_sym("__livepatch_frob:drivers/x.c"),
                func_sym("plain"),
            ],
            relas: vec![],
            extra: vec![],
        }
        .write("gen-strip");

        let mut object = ElfObject::open(&path).unwrap();
        strip_symbol_suffixes(&mut object).unwrap();

        let object = ElfObject::open(&path).unwrap();
        let table = object.symbol_table().unwrap();
        assert_eq!(
            object.symbol_name(&table, &table.symbols[1]).unwrap(),
            "__livepatch_frob"
        );
        assert_eq!(object.symbol_name(&table, &table.symbols[2]).unwrap(), "plain");

        std::fs::remove_file(path).unwrap();
    }
}
