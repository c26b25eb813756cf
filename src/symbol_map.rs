//! Alias map for symbols referenced from a hand-written livepatch
//! wrapper.
//!
//! A wrapper can declare access to a global defined in the kernel with
//! `extern <type> __llpatch_symbol_<alias>;`. The build driver resolves
//! each alias to its defining module, source file and real symbol name,
//! and emits one line per alias:
//!
//! ```text
//! <mod_name> <path_to_c_file> <symbol> <alias>
//! test_klp kernel/livepatch/test/test-attr-apple.c fruit apple_fruit
//! ```
//!
//! The fixup stage uses this map to turn `__llpatch_symbol_*` references
//! into kernel livepatch symbols.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

use crate::error::ErrorKind;
use crate::read_lines;

#[derive(Debug)]
pub struct SymbolEntry {
    pub mod_name: String,
    pub path: String,
    pub symbol: String,
}

#[derive(Debug)]
pub struct SymbolMap {
    // key: alias name
    entries: HashMap<String, SymbolEntry>,
}

impl SymbolMap {
    pub fn load(path: &Path) -> Result<SymbolMap> {
        let mut entries = HashMap::new();
        for line in read_lines(path)? {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }
            if tokens.len() != 4 {
                return Err(anyhow::Error::from(ErrorKind::InvalidSymMap))
                    .with_context(|| format!("malformed symbol map line: {line:?}"));
            }
            entries.insert(
                tokens[3].to_string(),
                SymbolEntry {
                    mod_name: tokens[0].to_string(),
                    path: tokens[1].to_string(),
                    symbol: tokens[2].to_string(),
                },
            );
        }
        Ok(SymbolMap { entries })
    }

    pub fn load_optional(path: Option<&Path>) -> Result<Option<SymbolMap>> {
        match path {
            Some(path) => Ok(Some(Self::load(path).with_context(|| {
                format!("failed to load symbol map {}", path.display())
            })?)),
            None => Ok(None),
        }
    }

    /// Looks up the entry for an alias; an unknown alias means the map
    /// and the wrapper disagree, which cannot be patched over.
    pub fn query(&self, alias: &str) -> Result<&SymbolEntry> {
        self.entries
            .get(alias)
            .ok_or_else(|| anyhow::Error::from(ErrorKind::InvalidSymMap))
            .with_context(|| format!("alias {alias:?} not present in symbol map"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_map(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("klpgen-map-{}-{}", std::process::id(), name));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn query_returns_entry_fields() {
        let path = write_map(
            "ok",
            "test_klp kernel/livepatch/test/test-attr-apple.c fruit apple_fruit\n",
        );
        let map = SymbolMap::load(&path).unwrap();
        let entry = map.query("apple_fruit").unwrap();
        assert_eq!(entry.mod_name, "test_klp");
        assert_eq!(entry.path, "kernel/livepatch/test/test-attr-apple.c");
        assert_eq!(entry.symbol, "fruit");
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn malformed_line_is_rejected() {
        let path = write_map("bad", "only three tokens\n");
        let err = SymbolMap::load(&path).unwrap_err();
        assert_eq!(crate::error::exit_code(&err), 9);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn unknown_alias_is_rejected() {
        let path = write_map("miss", "m path.c sym alias\n");
        let map = SymbolMap::load(&path).unwrap();
        let err = map.query("other").unwrap_err();
        assert_eq!(crate::error::exit_code(&err), 9);
        std::fs::remove_file(path).unwrap();
    }
}
