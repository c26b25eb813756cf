//! Line-structured parser for textual LLVM IR.
//!
//! Top-level entities in a printed module always start at column zero
//! and (bodies aside) occupy a single line, so the parser classifies
//! lines and only descends into the ones the pipeline manipulates.

use anyhow::{bail, Result};

use super::{Alias, Function, Global, Item, Module};

/// Decodes an LLVM quoted-string payload: `\\` and `\xx` hex escapes.
pub(crate) fn unescape(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            if bytes[i + 1] == b'\\' {
                out.push(b'\\');
                i += 2;
                continue;
            }
            if i + 2 < bytes.len() {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    out.push(value);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Encodes a string for an LLVM quoted context.
pub(crate) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for &byte in text.as_bytes() {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\22"),
            0x20..=0x7e => out.push(byte as char),
            _ => out.push_str(&format!("\\{byte:02X}")),
        }
    }
    out
}

/// Parses a value name starting right after `@` or `%`; returns the name
/// and the byte length consumed (quotes included).
fn parse_name(text: &str) -> (String, usize) {
    if let Some(rest) = text.strip_prefix('"') {
        if let Some(end) = rest.find('"') {
            return (unescape(&rest[..end]), end + 2);
        }
    }
    let end = text
        .find(|c: char| !(c.is_ascii_alphanumeric() || "$._".contains(c)))
        .unwrap_or(text.len());
    (text[..end].to_string(), end)
}

/// Splits on commas that sit outside brackets, braces, vectors and
/// quoted strings.
pub(crate) fn split_top_level(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'(' | b'[' | b'{' | b'<' => depth += 1,
            b')' | b']' | b'}' | b'>' => depth = depth.saturating_sub(1),
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b',' if depth == 0 => {
                parts.push(text[start..i].to_string());
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(text[start..].to_string());
    parts
}

/// Reads one whitespace-delimited token, treating bracketed groups and
/// quoted strings as part of the token. `[4 x i8]`, `addrspace(1)` and
/// `c"ab cd"` each come back whole.
fn next_token(text: &str, from: usize) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut i = from;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if i == bytes.len() {
        return None;
    }
    let start = i;
    let mut depth = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'(' | b'[' | b'{' | b'<' => depth += 1,
            b')' | b']' | b'}' | b'>' => depth = depth.saturating_sub(1),
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b if b.is_ascii_whitespace() && depth == 0 => break,
            _ => {}
        }
        i += 1;
    }
    Some((start, i))
}

fn tokens_of(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut at = 0;
    while let Some((start, end)) = next_token(text, at) {
        tokens.push(&text[start..end]);
        at = end;
    }
    tokens
}

const GLOBAL_PREFIX_KEYWORD_STARTS: [&str; 16] = [
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
    "dso_local",
    "dso_preemptable",
    "hidden",
    "protected",
    "default",
];

fn is_global_prefix_keyword(token: &str) -> bool {
    GLOBAL_PREFIX_KEYWORD_STARTS.contains(&token)
        || token == "unnamed_addr"
        || token == "local_unnamed_addr"
        || token == "externally_initialized"
        || token.starts_with("thread_local")
        || token.starts_with("addrspace(")
}

/// Parses a `@name = ... global|constant ...` line.
fn parse_global(name: String, after_equals: &str) -> Result<Global> {
    let segments = split_top_level(after_equals);
    let head = segments[0].trim();
    let suffix: Vec<String> = segments[1..]
        .iter()
        .map(|s| s.trim().to_string())
        .collect();

    let tokens = tokens_of(head);
    let mut idx = 0;
    let mut prefix_tokens = Vec::new();
    while idx < tokens.len() && is_global_prefix_keyword(tokens[idx]) {
        prefix_tokens.push(tokens[idx]);
        idx += 1;
    }
    let is_constant = match tokens.get(idx) {
        Some(&"global") => false,
        Some(&"constant") => true,
        _ => bail!("global @{name} has no global/constant keyword"),
    };
    idx += 1;

    let mut ty = match tokens.get(idx) {
        Some(token) => token.to_string(),
        None => bail!("global @{name} has no type"),
    };
    idx += 1;
    // Function types keep their parameter list as a separate token.
    if let Some(token) = tokens.get(idx) {
        if token.starts_with('(') {
            ty.push_str(" ");
            ty.push_str(token);
            idx += 1;
        }
    }

    let init = if idx < tokens.len() {
        Some(tokens[idx..].join(" "))
    } else {
        None
    };

    Ok(Global {
        name,
        prefix: prefix_tokens.join(" "),
        is_constant,
        ty,
        init,
        suffix,
    })
}

/// Extracts the function name from a `define`/`declare` line. The first
/// `@` on the line introduces it; nothing in a return type or its
/// attributes contains one.
fn function_name(line: &str) -> Result<String> {
    match line.find('@') {
        Some(at) => Ok(parse_name(&line[at + 1..]).0),
        None => bail!("function line without a name: {line}"),
    }
}

/// Rewrites a `define` signature into the matching `declare` line:
/// prototype kept, linkage and parameter names dropped, attribute-group
/// references preserved.
pub(crate) fn declaration_of(signature: &str) -> String {
    let rest = signature.strip_prefix("define").unwrap_or(signature);
    let rest = rest.trim_start();
    let first = rest.split_whitespace().next().unwrap_or("");
    let rest = if super::LINKAGE_KEYWORDS.contains(&first) {
        rest[first.len()..].trim_start()
    } else {
        rest
    };

    // Cut after the parameter list's closing parenthesis.
    let open = match rest.find('(') {
        Some(open) => open,
        None => return format!("declare {rest}"),
    };
    let bytes = rest.as_bytes();
    let mut depth = 0usize;
    let mut close = rest.len();
    for i in open..bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    close = i + 1;
                    break;
                }
            }
            _ => {}
        }
    }
    let head = &rest[..close];
    let tail = &rest[close..];

    // Parameter names are only legal on definitions. A name is the `%`
    // token sitting directly in the parameter list (depth 1); `%` at
    // deeper nesting is a type, as in `byval(%struct.s)`.
    let mut prototype = String::with_capacity(head.len());
    let head_bytes = head.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i < head_bytes.len() {
        match head_bytes[i] {
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b'%' if depth == 1 => {
                let (_, consumed) = parse_name(&head[i + 1..]);
                // A name ends its parameter; a `%` token followed by
                // more type syntax is a struct type, not a name.
                let ends_param = head_bytes
                    .get(i + 1 + consumed)
                    .map_or(true, |&b| b == b',' || b == b')');
                if ends_param {
                    if prototype.ends_with(' ') {
                        prototype.pop();
                    }
                    i += 1 + consumed;
                    continue;
                }
            }
            _ => {}
        }
        prototype.push(head_bytes[i] as char);
        i += 1;
    }

    // Keep attribute-group references from the trailer.
    let mut decl = format!("declare {prototype}");
    for token in tail.split_whitespace() {
        if token.starts_with('#') && token[1..].chars().all(|c| c.is_ascii_digit()) {
            decl.push(' ');
            decl.push_str(token);
        }
    }
    decl
}

pub(crate) fn parse(text: &str) -> Result<Module> {
    let mut module = Module {
        source_filename: String::new(),
        module_asm: String::new(),
        items: Vec::new(),
    };
    let mut asm_placed = false;

    let lines: Vec<&str> = text.lines().collect();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];

        if let Some(rest) = line.strip_prefix("source_filename = \"") {
            if let Some(end) = rest.rfind('"') {
                module.source_filename = unescape(&rest[..end]);
            }
            module.items.push(Item::Raw(line.to_string()));
            i += 1;
            continue;
        }

        if let Some(rest) = line.strip_prefix("module asm \"") {
            if let Some(end) = rest.rfind('"') {
                module.module_asm.push_str(&unescape(&rest[..end]));
                module.module_asm.push('\n');
            }
            if !asm_placed {
                module.items.push(Item::AsmBlock);
                asm_placed = true;
            }
            i += 1;
            continue;
        }

        if let Some(rest) = line.strip_prefix('@') {
            let (name, consumed) = parse_name(rest);
            let after = rest[consumed..].trim_start();
            let after = match after.strip_prefix('=') {
                Some(after) => after.trim_start(),
                None => bail!("malformed global line: {line}"),
            };
            // `alias`/`ifunc` come after the same leading keywords a
            // global would have.
            let mut probe = tokens_of(after).into_iter();
            let is_alias = loop {
                match probe.next() {
                    Some("alias") | Some("ifunc") => break true,
                    Some("global") | Some("constant") => break false,
                    Some(token) if is_global_prefix_keyword(token) => continue,
                    _ => break false,
                }
            };
            if is_alias {
                module.items.push(Item::Alias(Alias {
                    name,
                    text: line.to_string(),
                }));
            } else {
                module.items.push(Item::Global(parse_global(name, after)?));
            }
            i += 1;
            continue;
        }

        if line.starts_with("define ") {
            let name = function_name(line)?;
            let signature = match line.strip_suffix('{') {
                Some(head) => head.trim_end().to_string(),
                None => bail!("define line without a body: {line}"),
            };
            let mut body = Vec::new();
            i += 1;
            while i < lines.len() && lines[i] != "}" {
                body.push(lines[i].to_string());
                i += 1;
            }
            if i == lines.len() {
                bail!("unterminated body for @{name}");
            }
            i += 1; // closing brace
            module.items.push(Item::Function(Function {
                name,
                signature,
                body,
                is_declaration: false,
            }));
            continue;
        }

        if line.starts_with("declare ") {
            module.items.push(Item::Function(Function {
                name: function_name(line)?,
                signature: line.to_string(),
                body: Vec::new(),
                is_declaration: true,
            }));
            i += 1;
            continue;
        }

        module.items.push(Item::Raw(line.to_string()));
        i += 1;
    }

    Ok(module)
}
