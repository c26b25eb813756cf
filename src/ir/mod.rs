//! In-memory model of a textual LLVM IR module.
//!
//! The parser keeps every top-level entity as an item in input order:
//! globals and functions are decomposed far enough to support the diff
//! stage (classification, renaming, body deletion, externalization),
//! everything else survives as verbatim text. Serializing a freshly
//! parsed module reproduces its entities unchanged.

mod parse;

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};

use crate::create_file;
use crate::error::ErrorKind;

#[derive(Debug)]
pub struct Module {
    /// Value of the `source_filename = "..."` header.
    pub source_filename: String,
    /// Module-level inline assembly, unescaped and newline-joined, with
    /// a trailing newline when non-empty.
    pub module_asm: String,
    pub items: Vec<Item>,
}

#[derive(Debug)]
pub enum Item {
    /// A verbatim line outside any modeled entity: headers, struct type
    /// definitions, comments, attribute groups, metadata, blank lines.
    Raw(String),
    /// Marks where the module-level asm block sits in the input.
    AsmBlock,
    Global(Global),
    Alias(Alias),
    Function(Function),
}

#[derive(Debug)]
pub struct Alias {
    pub name: String,
    pub text: String,
}

#[derive(Debug)]
pub struct Global {
    pub name: String,
    /// Keywords between `=` and `global`/`constant`: linkage,
    /// `dso_local`, `unnamed_addr` and friends, space-joined.
    pub prefix: String,
    pub is_constant: bool,
    pub ty: String,
    pub init: Option<String>,
    /// Trailing comma-separated segments: `section "..."`, `align N`,
    /// `comdat`, `!dbg !N`.
    pub suffix: Vec<String>,
}

#[derive(Debug)]
pub struct Function {
    pub name: String,
    /// The full `define`/`declare` line, minus the opening brace.
    pub signature: String,
    pub body: Vec<String>,
    pub is_declaration: bool,
}

const LINKAGE_KEYWORDS: [&str; 11] = [
    "private",
    "internal",
    "available_externally",
    "linkonce",
    "weak",
    "common",
    "appending",
    "extern_weak",
    "linkonce_odr",
    "weak_odr",
    "external",
];

/// True for names LLVM can print without quoting.
fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || "$._".contains(c) => {}
        _ => return false,
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || "$._".contains(c))
}

fn is_identifier_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"$._".contains(&byte)
}

/// Renders a `@`-reference, quoting the name when required.
pub fn value_ref(name: &str) -> String {
    if is_plain_identifier(name) {
        format!("@{name}")
    } else {
        format!("@\"{}\"", parse::escape(name))
    }
}

/// Replaces every reference to the value `old` in a fragment of IR text.
fn replace_value_refs(text: &str, old: &str, replacement: &str) -> String {
    let plain = format!("@{old}");
    let quoted = format!("@\"{}\"", parse::escape(old));
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'@' {
            let rest = &text[i..];
            if rest.starts_with(&quoted) {
                out.extend_from_slice(replacement.as_bytes());
                i += quoted.len();
                continue;
            }
            if rest.starts_with(&plain)
                && bytes
                    .get(i + plain.len())
                    .map_or(true, |&b| !is_identifier_byte(b))
            {
                out.extend_from_slice(replacement.as_bytes());
                i += plain.len();
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).expect("splices happen at ASCII boundaries")
}

impl Global {
    pub fn is_dso_local(&self) -> bool {
        self.prefix.split_whitespace().any(|t| t == "dso_local")
    }

    pub fn section(&self) -> Option<&str> {
        self.suffix.iter().find_map(|seg| {
            seg.strip_prefix("section \"")
                .and_then(|rest| rest.strip_suffix('"'))
        })
    }

    pub fn align(&self) -> Option<&str> {
        self.suffix
            .iter()
            .find_map(|seg| seg.strip_prefix("align "))
    }

    /// Turns the definition into an external declaration: the
    /// initializer goes away, the linkage becomes external, and
    /// definition-only attributes (section, comdat, debug info) are
    /// dropped. DSO locality and alignment survive.
    pub fn externalize(&mut self) {
        self.init = None;
        self.prefix = if self.is_dso_local() {
            "external dso_local".to_string()
        } else {
            "external".to_string()
        };
        self.suffix.retain(|seg| seg.starts_with("align "));
    }

    fn render(&self) -> String {
        let mut line = format!("{} =", value_ref(&self.name));
        if !self.prefix.is_empty() {
            line.push(' ');
            line.push_str(&self.prefix);
        }
        line.push(' ');
        line.push_str(if self.is_constant { "constant" } else { "global" });
        line.push(' ');
        line.push_str(&self.ty);
        if let Some(init) = &self.init {
            line.push(' ');
            line.push_str(init);
        }
        for seg in &self.suffix {
            line.push_str(", ");
            line.push_str(seg);
        }
        line
    }
}

impl Function {
    /// Section attribute from the signature, if any.
    pub fn section(&self) -> Option<&str> {
        let at = self.signature.find(" section \"")? + " section \"".len();
        let rest = &self.signature[at..];
        rest.find('"').map(|end| &rest[..end])
    }

    /// A function printed as `@0`, `@1`, ... has no real name.
    pub fn is_anonymous(&self) -> bool {
        self.name.chars().all(|c| c.is_ascii_digit())
    }

    /// Drops the linkage keyword from the signature; a definition with
    /// no linkage keyword has external linkage.
    pub fn set_external_linkage(&mut self) {
        let rest = match self.signature.strip_prefix("define ") {
            Some(rest) => rest,
            None => return,
        };
        let first = rest.split_whitespace().next().unwrap_or("");
        if !LINKAGE_KEYWORDS.contains(&first) {
            return;
        }
        let stripped = format!("define {}", rest[first.len()..].trim_start());
        self.signature = stripped;
    }

    /// Converts the definition into a plain declaration, keeping the
    /// prototype and attribute-group references.
    pub fn delete_body(&mut self) {
        if self.is_declaration {
            return;
        }
        self.body.clear();
        self.is_declaration = true;
        self.signature = parse::declaration_of(&self.signature);
    }

    fn render(&self, out: &mut String) {
        if self.is_declaration {
            out.push_str(&self.signature);
            out.push('\n');
            return;
        }
        out.push_str(&self.signature);
        out.push_str(" {\n");
        for line in &self.body {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("}\n");
    }
}

impl Module {
    pub fn parse_file(path: &Path) -> Result<Module> {
        let text = std::fs::read_to_string(path)
            .context(ErrorKind::InvalidLlvmFile)
            .with_context(|| format!("failed to read IR file {}", path.display()))?;
        Self::parse(&text)
            .context(ErrorKind::InvalidLlvmFile)
            .with_context(|| format!("invalid IR in {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Module> {
        parse::parse(text)
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        use std::io::Write;
        let mut file = create_file(path)?;
        file.write_all(self.render().as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for item in &self.items {
            match item {
                Item::Raw(line) => {
                    out.push_str(line);
                    out.push('\n');
                }
                Item::AsmBlock => {
                    for line in self.module_asm.lines() {
                        out.push_str("module asm \"");
                        out.push_str(&parse::escape(line));
                        out.push_str("\"\n");
                    }
                }
                Item::Global(global) => {
                    out.push_str(&global.render());
                    out.push('\n');
                }
                Item::Alias(alias) => {
                    out.push_str(&alias.text);
                    out.push('\n');
                }
                Item::Function(function) => function.render(&mut out),
            }
        }
        out
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.items.iter().filter_map(|item| match item {
            Item::Function(f) => Some(f),
            _ => None,
        })
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.items.iter_mut().find_map(|item| match item {
            Item::Function(f) if f.name == name => Some(f),
            _ => None,
        })
    }

    pub fn function_names(&self) -> Vec<String> {
        self.functions().map(|f| f.name.clone()).collect()
    }

    pub fn remove_functions(&mut self, names: &HashSet<String>) {
        self.items.retain(|item| match item {
            Item::Function(f) => !names.contains(&f.name),
            _ => true,
        });
    }

    pub fn globals(&self) -> impl Iterator<Item = &Global> {
        self.items.iter().filter_map(|item| match item {
            Item::Global(g) => Some(g),
            _ => None,
        })
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals().find(|g| g.name == name)
    }

    pub fn global_mut(&mut self, name: &str) -> Option<&mut Global> {
        self.items.iter_mut().find_map(|item| match item {
            Item::Global(g) if g.name == name => Some(g),
            _ => None,
        })
    }

    pub fn global_names(&self) -> Vec<String> {
        self.globals().map(|g| g.name.clone()).collect()
    }

    pub fn remove_globals_with_prefixes(&mut self, prefixes: &[&str]) {
        self.items.retain(|item| match item {
            Item::Global(g) => !prefixes.iter().any(|p| g.name.starts_with(p)),
            _ => true,
        });
    }

    pub fn remove_aliases_where(&mut self, mut predicate: impl FnMut(&str) -> bool) {
        self.items.retain(|item| match item {
            Item::Alias(a) => !predicate(&a.name),
            _ => true,
        });
    }

    /// Renames a global value and rewrites every reference to it across
    /// function bodies, signatures, global initializers and aliases.
    pub fn rename_value(&mut self, old: &str, new: &str) {
        let replacement = value_ref(new);
        for item in self.items.iter_mut() {
            match item {
                Item::Global(g) => {
                    if g.name == old {
                        g.name = new.to_string();
                    }
                    if g.init.as_deref().map_or(false, |init| init.contains('@')) {
                        let init = g.init.take().unwrap();
                        g.init = Some(replace_value_refs(&init, old, &replacement));
                    }
                }
                Item::Alias(a) => {
                    if a.name == old {
                        a.name = new.to_string();
                    }
                    a.text = replace_value_refs(&a.text, old, &replacement);
                }
                Item::Function(f) => {
                    if f.name == old {
                        f.name = new.to_string();
                    }
                    f.signature = replace_value_refs(&f.signature, old, &replacement);
                    for line in f.body.iter_mut() {
                        if line.contains('@') {
                            *line = replace_value_refs(line, old, &replacement);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Adds values to `@llvm.used` so later optimization passes cannot
    /// discard them, creating the array if the module has none.
    pub fn append_to_used(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        let mut entries: Vec<String> = Vec::new();
        if let Some(used) = self.global("llvm.used") {
            if let Some(init) = &used.init {
                let inner = init.trim().trim_start_matches('[').trim_end_matches(']');
                entries.extend(
                    parse::split_top_level(inner)
                        .into_iter()
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty()),
                );
            }
        }
        entries.extend(names.iter().map(|n| format!("ptr {}", value_ref(n))));

        let ty = format!("[{} x ptr]", entries.len());
        let init = format!("[{}]", entries.join(", "));
        if let Some(used) = self.global_mut("llvm.used") {
            used.ty = ty;
            used.init = Some(init);
            return;
        }

        let used = Global {
            name: "llvm.used".to_string(),
            prefix: "appending".to_string(),
            is_constant: false,
            ty,
            init: Some(init),
            suffix: vec!["section \"llvm.metadata\"".to_string()],
        };
        let at = self
            .items
            .iter()
            .position(|item| matches!(item, Item::Function(_)))
            .unwrap_or(self.items.len());
        self.items.insert(at, Item::Global(used));
    }
}
