pub mod align;
pub mod diff;
pub mod elf;
pub mod error;
pub mod fixup;
pub mod gen;
pub mod ir;
pub mod symbol_map;
pub mod thin_archive;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

use crate::error::ErrorKind;

/// Prefix given to changed functions in the diffed IR. The full form is
/// `__livepatch_<func>:<source-file>`; the suffix is stripped again once
/// the wrapper has been generated.
pub const LIVEPATCH_FUNC_PREFIX: &str = "__livepatch_";

/// Prefix given to DSO-local globals that must be resolved through the
/// livepatch relocation machinery: `klp.local.sym:<name>:<source-file>`.
pub const KLP_LOCAL_SYM_PREFIX: &str = "klp.local.sym:";

/// Final symbol form understood by the kernel loader:
/// `.klp.sym.<object>.<name>,<sympos>`.
pub const KLP_SYM_PREFIX: &str = ".klp.sym.";

/// Prefix for the relocation sections resolved at patch-apply time.
pub const KLP_RELA_PREFIX: &str = ".klp.rela.";

/// Prefix for symbol aliases declared in a livepatch wrapper via the
/// symbol-map mechanism.
pub const LLPATCH_SYMBOL_PREFIX: &str = "__llpatch_symbol_";

/// Opens a file for reading, tagging failures with `FILE_OPEN_FAILED`.
pub fn open_file(path: &Path) -> Result<File> {
    File::open(path)
        .context(ErrorKind::FileOpenFailed)
        .with_context(|| format!("failed to open {}", path.display()))
}

/// Creates (truncating) a file for writing, tagging failures with
/// `FILE_OPEN_FAILED`.
pub fn create_file(path: &Path) -> Result<File> {
    File::create(path)
        .context(ErrorKind::FileOpenFailed)
        .with_context(|| format!("failed to create {}", path.display()))
}

/// Reads a text file into a vector of lines.
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let reader = BufReader::new(open_file(path)?);
    let mut lines = Vec::new();
    for line in reader.lines() {
        lines.push(line.with_context(|| format!("failed to read {}", path.display()))?);
    }
    Ok(lines)
}

/// Strips a base directory from a source-file path so that identical
/// sources produce identical livepatch names regardless of the build
/// directory. The base matches anywhere in the path; everything up to and
/// including it is dropped, along with any leading `./` characters.
pub fn strip_base_path<'a>(path: &'a str, base: &str) -> &'a str {
    let rest = match path.split_once(base) {
        Some((_, rest)) => rest,
        None => "",
    };
    rest.trim_start_matches(['.', '/'])
}

/// Maps a source-file path to the object-file path used for symbol
/// position lookups in a thin archive: the extension is replaced with
/// `.o` (`drivers/net/foo.c` becomes `drivers/net/foo.o`).
pub fn source_object_file(source: &str) -> String {
    let stem = match source.rsplit_once('.') {
        Some((stem, _)) => stem,
        None => source,
    };
    format!("{stem}.o")
}
