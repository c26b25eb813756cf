//! `__LINE__` alignment between an original and a patched C file.
//!
//! A patch that adds or removes lines shifts the `__LINE__` macro for all
//! code after the change, which in turn shows up as spurious differences
//! between the two compiled IR modules. This stage pads both files with
//! empty lines so that, after every hunk, any surviving source line sits
//! on the same line number in both outputs.

use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;

use crate::error::ErrorKind;
use crate::{create_file, read_lines};

pub struct AlignOptions<'a> {
    /// Name of the diffed file, as it appears in the patch headers.
    pub diffed_file: &'a str,
    pub patch_file: &'a Path,
    pub original: &'a Path,
    pub patched: &'a Path,
    /// Appended to the input file names to form the output names.
    pub suffix: &'a str,
}

/// One side of a hunk: the line offset (relative to the previous hunk on
/// the same side) and the number of changed lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HunkSide {
    offset: usize,
    lines: usize,
}

struct PatchHunks {
    original: Vec<HunkSide>,
    patched: Vec<HunkSide>,
    // unchanged context lines between each hunk header and its first change
    context: Vec<usize>,
}

pub fn run(opts: &AlignOptions) -> Result<()> {
    let hunks = parse_patch_file(opts.patch_file, opts.diffed_file)?;

    align_file(opts.original, &hunks.original, &hunks.patched, &hunks.context, opts.suffix)?;
    align_file(opts.patched, &hunks.patched, &hunks.original, &hunks.context, opts.suffix)?;

    Ok(())
}

/// Parses `-O,L` / `+O,L` with the length defaulting to 1 when omitted.
fn parse_offset_lines(capture: Option<regex::Match>, lines: Option<regex::Match>) -> Option<HunkSide> {
    let offset = capture?.as_str().parse().ok()?;
    let lines = match lines {
        Some(m) => m.as_str().parse().ok()?,
        None => 1,
    };
    Some(HunkSide { offset, lines })
}

/// Converts absolute hunk offsets into offsets relative to the previous
/// hunk on the same side. Padding shifts everything after a hunk, so
/// absolute offsets stop being meaningful once the first hunk is written.
fn to_relative_offsets(hunks: &mut [HunkSide]) {
    let mut last_offset = 0;
    for hunk in hunks.iter_mut() {
        let absolute = hunk.offset;
        hunk.offset = absolute.saturating_sub(last_offset);
        last_offset = absolute;
    }
}

/// True when a `diff -...` header line is for the diffed file: the
/// right-hand path (the line's last token) must end with its name.
/// Containment anywhere in the line is not enough; `b/foo.c.orig` does
/// not name `foo.c`.
fn diff_header_names(line: &str, diffed_file: &str) -> bool {
    if !line.starts_with("diff -") {
        return false;
    }
    line.split_whitespace()
        .last()
        .map_or(false, |path| path.ends_with(diffed_file))
}

fn parse_patch_file(patch: &Path, diffed_file: &str) -> Result<PatchHunks> {
    let lines = read_lines(patch)?;
    let hunk_header = Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").unwrap();

    let mut hunks = PatchHunks {
        original: Vec::new(),
        patched: Vec::new(),
        context: Vec::new(),
    };

    // Find the section of the patch that concerns the diffed file. A C
    // file can also pick up changes through an #include, in which case
    // the file itself never appears in the patch and there is nothing to
    // align: the outputs become plain copies.
    let mut cursor = match lines
        .iter()
        .position(|l| diff_header_names(l, diffed_file))
    {
        Some(pos) => pos + 1,
        None => lines.len(),
    };

    'hunks: while cursor < lines.len() {
        // Skip to the next hunk header, stopping at the next file section.
        while !lines[cursor].starts_with("@@") {
            if lines[cursor].starts_with("diff -") {
                break 'hunks;
            }
            cursor += 1;
            if cursor == lines.len() {
                break 'hunks;
            }
        }

        // format: @@ -${line#},${lines_changed} +${line#},${lines_changed} @@ ...
        // e.g.,: @@ -37,16 +37,17 @@ ...
        let caps = hunk_header
            .captures(&lines[cursor])
            .ok_or_else(|| anyhow::Error::from(ErrorKind::InvalidPatchFile))
            .with_context(|| format!("malformed hunk header: {}", lines[cursor]))?;
        let original = parse_offset_lines(caps.get(1), caps.get(2))
            .ok_or_else(|| anyhow::Error::from(ErrorKind::InvalidPatchFile))?;
        let patched = parse_offset_lines(caps.get(3), caps.get(4))
            .ok_or_else(|| anyhow::Error::from(ErrorKind::InvalidPatchFile))?;
        hunks.original.push(original);
        hunks.patched.push(patched);
        cursor += 1;

        // Count the context lines between the header and the first
        // change. The header offset already points at the first context
        // line, hence the -1.
        let mut read = 0;
        while cursor < lines.len() {
            let line = &lines[cursor];
            cursor += 1;
            if line.starts_with('-') || line.starts_with('+') {
                break;
            }
            read += 1;
        }
        hunks.context.push(read.max(1) - 1);
    }

    to_relative_offsets(&mut hunks.original);
    to_relative_offsets(&mut hunks.patched);

    Ok(hunks)
}

fn copy_lines<'a>(
    input: &mut impl Iterator<Item = &'a String>,
    out: &mut impl Write,
    count: usize,
) -> Result<()> {
    for _ in 0..count {
        match input.next() {
            Some(line) => writeln!(out, "{line}")?,
            None => break,
        }
    }
    Ok(())
}

/// Writes the padded copy of one input file. `from` describes the hunks
/// on this file's side, `to` the opposite side; whenever the other side
/// grew more than this one, the gap is filled with empty lines right
/// after this hunk's leading context.
fn align_file(
    path: &Path,
    from: &[HunkSide],
    to: &[HunkSide],
    context: &[usize],
    suffix: &str,
) -> Result<()> {
    let lines = read_lines(path)?;
    let mut input = lines.iter();

    let mut out_path = path.as_os_str().to_os_string();
    out_path.push(suffix);
    let out_path = std::path::PathBuf::from(out_path);
    let mut out = BufWriter::new(create_file(&out_path)?);

    for i in 0..from.len() {
        copy_lines(&mut input, &mut out, from[i].offset)?;
        if from[i].lines < to[i].lines {
            copy_lines(&mut input, &mut out, context[i])?;
            for _ in 0..to[i].lines - from[i].lines {
                out.write_all(b"\n")?;
            }
        }
    }

    copy_lines(&mut input, &mut out, usize::MAX)?;
    out.flush()
        .with_context(|| format!("failed to write {}", out_path.display()))?;

    Ok(())
}
