//! Symbol-position index over the textual output of `nm -f posix` on a
//! thin archive.
//!
//! The kernel build produces thin archives (`built-in.a`) whose member
//! object files can define symbols with identical names. The kernel
//! livepatch loader disambiguates them with a *symbol position*: 0 for a
//! unique name, otherwise the 1-based rank of the defining object file.
//! This index answers `(symbol, object-file) -> position` from a dump of
//! the form:
//!
//! ```text
//! built-in.a[arch/x86/events/intel/core.o]:
//! allow_tsx_force_abort d 2b8 1
//! any_show t 38f0 24
//! ```
//!
//! generated with `nm -f posix --defined-only built-in.a`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::error::ErrorKind;
use crate::read_lines;

#[derive(Debug)]
pub struct ThinArchive {
    unique_symbols: std::collections::HashSet<String>,
    // key: symbol name, value: defining object files in input order
    duplicated_symbols: std::collections::HashMap<String, Vec<String>>,
}

/// Splits a posix-format nm line into symbol name and type letter. Weak
/// objects (`V`) are folded into plain weak symbols (`W`); only weakness
/// matters here, not the flavor.
fn parse_symbol_line(line: &str) -> (&str, char) {
    let mut fields = line.split_whitespace();
    let name = fields.next().unwrap_or("");
    let kind = fields
        .next()
        .and_then(|f| f.chars().next())
        .map(|c| c.to_ascii_uppercase())
        .unwrap_or('?');
    let kind = if kind == 'V' { 'W' } else { kind };
    (name, kind)
}

impl ThinArchive {
    /// Loads and indexes an nm dump. Fails with `SAME_SYMBOL_FILENAME` if
    /// one object file defines the same non-weak symbol twice; positions
    /// would be ambiguous and no livepatch can be built from that input.
    pub fn load(path: &Path) -> Result<ThinArchive> {
        let lines = read_lines(path)?;
        // matching format example: built-in.a[arch/x86/kernel/head_64.o]:
        let file_marker = Regex::new(r"^.+\.a\[.+\.o\]:$").unwrap();

        // Pass 1: find names defined more than once, weak entries aside.
        let mut unique_symbols = std::collections::HashSet::new();
        let mut non_weak_symbols = std::collections::HashSet::new();
        let mut dup_symbols = std::collections::HashSet::new();
        for line in &lines {
            if line.is_empty() || file_marker.is_match(line) {
                continue;
            }
            let (name, kind) = parse_symbol_line(line);
            if !unique_symbols.contains(name) {
                unique_symbols.insert(name.to_string());
                if kind != 'W' {
                    non_weak_symbols.insert(name.to_string());
                }
                continue;
            }
            if kind == 'W' {
                continue;
            }
            // A second non-weak definition makes the name a duplicate.
            if non_weak_symbols.contains(name) {
                dup_symbols.insert(name.to_string());
            }
            non_weak_symbols.insert(name.to_string());
        }
        for name in &dup_symbols {
            unique_symbols.remove(name);
        }

        // Pass 2: record the defining file order for every duplicate.
        let mut duplicated_symbols: std::collections::HashMap<String, Vec<String>> =
            std::collections::HashMap::new();
        let mut seen_sym_file = std::collections::HashSet::new();
        let mut current_file = String::new();
        for line in &lines {
            if line.is_empty() {
                continue;
            }
            if file_marker.is_match(line) {
                let start = line.find('[').unwrap() + 1;
                let end = line.find(']').unwrap();
                current_file = line[start..end].to_string();
                continue;
            }
            let (name, kind) = parse_symbol_line(line);
            if kind == 'W' || unique_symbols.contains(name) {
                continue;
            }
            if !seen_sym_file.insert(format!("{name}{current_file}")) {
                bail!(ErrorKind::SameSymbolFilename);
            }
            duplicated_symbols
                .entry(name.to_string())
                .or_default()
                .push(current_file.clone());
        }

        Ok(ThinArchive {
            unique_symbols,
            duplicated_symbols,
        })
    }

    /// Loads the index when a dump path was given on the command line.
    pub fn load_optional(path: Option<&Path>) -> Result<Option<ThinArchive>> {
        match path {
            Some(path) => Ok(Some(Self::load(path).with_context(|| {
                format!("failed to index thin archive {}", path.display())
            })?)),
            None => Ok(None),
        }
    }

    /// Returns the symbol position for `(symbol, filename)`: 0 for a
    /// unique symbol (the filename is ignored), the 1-based rank of
    /// `filename` among the definers of a duplicated symbol, or `None`
    /// when nothing matches.
    pub fn query(&self, symbol: &str, filename: &str) -> Option<u32> {
        if self.unique_symbols.contains(symbol) {
            return Some(0);
        }
        let files = self.duplicated_symbols.get(symbol)?;
        files
            .iter()
            .position(|f| f == filename)
            .map(|idx| idx as u32 + 1)
    }
}
