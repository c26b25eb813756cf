//! Distills the difference between the original and patched IR modules
//! into a module that only defines what the livepatch must carry.
//!
//! Changed functions are renamed with the livepatch prefix and pinned
//! via `llvm.used`; unchanged functions shrink to declarations; globals
//! that stay resolvable at run time are externalized, with DSO-local
//! ones rerouted through `klp.local.sym:` names so the fixup stage can
//! emit livepatch relocations for them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::error::ErrorKind;
use crate::ir::{Function, Global, Module};
use crate::{strip_base_path, KLP_LOCAL_SYM_PREFIX, LIVEPATCH_FUNC_PREFIX};

pub struct DiffOptions<'a> {
    pub original: &'a Path,
    pub patched: &'a Path,
    /// Stripped from source-file paths when forming livepatch names.
    pub base_dir: &'a str,
    pub quiet: bool,
}

pub fn run(opts: &DiffOptions) -> Result<()> {
    let original = Module::parse_file(opts.original)?;
    let mut patched = Module::parse_file(opts.patched)?;

    distill_functions(&original, &mut patched, opts)?;
    distill_globals(&original, &mut patched, opts.base_dir);

    let out_path = PathBuf::from(format!("{}__klp_diff.ll", patched.source_filename));
    patched
        .write_file(&out_path)
        .with_context(|| format!("failed to emit {}", out_path.display()))
}

/// Structural comparison of two functions. Metadata ids and
/// attribute-group ids are renumbered wholesale whenever a module gains
/// or loses entities, so they are masked; everything else must match
/// line for line.
struct FunctionComparator {
    metadata_id: Regex,
    attribute_id: Regex,
}

impl FunctionComparator {
    fn new() -> FunctionComparator {
        FunctionComparator {
            metadata_id: Regex::new(r"!\d+").unwrap(),
            attribute_id: Regex::new(r"#\d+").unwrap(),
        }
    }

    fn mask(&self, line: &str) -> String {
        let masked = self.metadata_id.replace_all(line, "!_");
        self.attribute_id.replace_all(&masked, "#_").into_owned()
    }

    fn differs(&self, original: &Function, patched: &Function) -> bool {
        if original.is_declaration != patched.is_declaration {
            return true;
        }
        if self.mask(&original.signature) != self.mask(&patched.signature) {
            return true;
        }
        if original.body.len() != patched.body.len() {
            return true;
        }
        original
            .body
            .iter()
            .zip(&patched.body)
            .any(|(a, b)| self.mask(a) != self.mask(b))
    }
}

fn in_dropped_section(function: &Function) -> bool {
    function
        .section()
        .map_or(false, |s| s.starts_with(".init") || s.starts_with(".exit"))
}

fn distill_functions(original: &Module, patched: &mut Module, opts: &DiffOptions) -> Result<()> {
    let comparator = FunctionComparator::new();
    let mut livepatched = HashSet::new();
    let mut new_funcs = HashSet::new();
    let mut dropped = HashSet::new();

    for function in patched.functions() {
        if function.is_anonymous() {
            continue;
        }
        if in_dropped_section(function) {
            dropped.insert(function.name.clone());
            continue;
        }
        match original.function(&function.name) {
            None => {
                new_funcs.insert(function.name.clone());
            }
            Some(counterpart) => {
                if comparator.differs(counterpart, function) {
                    if !opts.quiet {
                        println!("function @{} changed", function.name);
                    }
                    livepatched.insert(function.name.clone());
                }
            }
        }
    }

    if livepatched.is_empty() && new_funcs.is_empty() {
        println!("All functions are identical and there are no new functions. Nothing to patch.");
        bail!(ErrorKind::NothingToPatch);
    }

    // Functions in .init*/.exit* sections cannot be livepatched.
    patched.remove_functions(&dropped);

    // Aliases to externalized bodies make the downstream compiler crash:
    // direct-call thunks and the sys_* syscall aliases both point at
    // functions that are about to lose their definitions.
    patched.remove_aliases_where(|name| {
        name.starts_with("__direct_call") || name.starts_with("sys_")
    });

    let source = strip_base_path(&patched.source_filename, opts.base_dir).to_string();
    let mut used = Vec::new();
    for name in patched.function_names() {
        let function = patched.function(&name).unwrap();
        if function.is_anonymous() || new_funcs.contains(&name) {
            continue;
        }
        if livepatched.contains(&name) {
            // The suffix records which source file the change came from;
            // the wrapper generator consumes and strips it later.
            let new_name = format!("{LIVEPATCH_FUNC_PREFIX}{name}:{source}");
            patched.rename_value(&name, &new_name);
            // The optimizer must not drop the function, and the wrapper
            // links against it by name.
            patched.function_mut(&new_name).unwrap().set_external_linkage();
            used.push(new_name);
        } else {
            patched.function_mut(&name).unwrap().delete_body();
        }
    }
    patched.append_to_used(&used);

    Ok(())
}

/// Classifies an initializer for the mismatch warning.
fn init_kind(init: Option<&str>) -> &'static str {
    let init = match init {
        Some(init) => init.trim(),
        None => return "none",
    };
    if init == "zeroinitializer" {
        "zero"
    } else if init == "null" {
        "null"
    } else if init == "undef" || init == "poison" {
        "undef"
    } else if init.starts_with("c\"") {
        "string"
    } else if init.starts_with('[') {
        "array"
    } else if init.starts_with('{') || init.starts_with("<{") {
        "struct"
    } else if init.starts_with('@') || init.contains('@') {
        "reference"
    } else {
        "scalar"
    }
}

/// A global is constant data when both the variable and its initializer
/// are immutable: plain literals, strings and zero fills qualify,
/// aggregates and anything referencing another global do not.
fn is_constant_data(init: &str) -> bool {
    let init = init.trim();
    matches!(init, "zeroinitializer" | "null" | "undef" | "poison" | "true" | "false")
        || init.starts_with("c\"")
        || init.starts_with(|c: char| c.is_ascii_digit())
        || (init.len() > 1 && init.starts_with('-') && init.as_bytes()[1].is_ascii_digit())
}

fn keep_in_patched(global: &Global) -> bool {
    // Intrinsic lists (llvm.used, llvm.compiler.used) are module
    // bookkeeping, not patchable data.
    if global.name.starts_with("llvm.") {
        return true;
    }
    // Compiler-materialized constants for initialized aggregates.
    if global.name.starts_with("__const") {
        return true;
    }
    if global
        .section()
        .map_or(false, |s| s.starts_with(".discard.func_stack_frame_non_standard"))
    {
        return true;
    }
    if global.is_constant && global.init.as_deref().map_or(false, is_constant_data) {
        return true;
    }
    // Jump labels must stay with the code that carries their entries.
    if global.ty.contains("struct.jump_entry") {
        return true;
    }
    false
}

fn warn_on_mismatch(name: &str, original: &Global, patched: &Global) {
    if original.ty != patched.ty {
        eprintln!(
            "WARN: type of global variable {name} changed\n  type in original: {}\n  type in patched: {}",
            original.ty, patched.ty
        );
    }
    if original.align() != patched.align() || original.section() != patched.section() {
        eprintln!("WARN: attributes of global variable {name} changed");
    }
    if init_kind(original.init.as_deref()) != init_kind(patched.init.as_deref()) {
        eprintln!("WARN: initializer mismatch for global variable {name}");
    }
}

fn distill_globals(original: &Module, patched: &mut Module, base_dir: &str) {
    // Variables backing init/exit sections and export tables have no
    // place in a livepatch.
    patched.remove_globals_with_prefixes(&["__init", "__exit", "__kstrtab", "__ksymtab"]);
    prune_module_asm(patched);

    let source = strip_base_path(&original.source_filename, base_dir).to_string();
    for name in patched.global_names() {
        let global = patched.global(&name).unwrap();
        if keep_in_patched(global) {
            continue;
        }
        let counterpart = match original.global(&name) {
            // Only the patched module defines it; leave it alone.
            None => continue,
            Some(counterpart) => counterpart,
        };
        warn_on_mismatch(&name, counterpart, global);

        patched.global_mut(&name).unwrap().externalize();
        let global = patched.global(&name).unwrap();
        if global.is_dso_local() && name != "__fentry__" {
            let new_name = format!("{KLP_LOCAL_SYM_PREFIX}{name}:{source}");
            patched.rename_value(&name, &new_name);
        }
    }
}

/// Strips the inline-assembly blocks that register exported-symbol CRCs
/// and initcalls; both reference sections the diffed module no longer
/// provides.
fn prune_module_asm(patched: &mut Module) {
    if patched.module_asm.is_empty() {
        return;
    }
    // .section "___kcrctab_gpl+sym", "a"
    // .weak   __crc_sym
    // .long   __crc_sym
    // .previous
    let kcrctab =
        Regex::new(r"(?m)^[ \t]*\.section.*kcrctab.*\n.*__crc.*\n.*__crc.*\n[ \t]*\.previous.*\n")
            .unwrap();
    // .section ".initcall4.init", "a"
    // __initcall_sym4:
    // .long   sym - .
    // .previous
    let initcall =
        Regex::new(r"(?m)^[ \t]*\.section.*initcall.*\n.*__initcall.*\n.*long.*\n[ \t]*\.previous.*\n")
            .unwrap();

    let pruned = kcrctab.replace_all(&patched.module_asm, "");
    patched.module_asm = initcall.replace_all(&pruned, "").into_owned();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::path::PathBuf;

    struct TempDir {
        path: PathBuf,
    }

    impl TempDir {
        fn new(name: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "klpgen-diff-{}-{}",
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

    impl TempDir {
        /// Source-file name baked into the test modules; absolute so the
        /// diff output lands inside the temp dir, stripped back to `a.c`
        /// by passing the temp dir as the base directory.
        fn source(&self) -> String {
            format!("{}/a.c", self.path.display())
        }
    }

    fn module_text(source_filename: &str, foo_body: &str) -> String {
        format!(
            "source_filename = \"{source_filename}\"\n\
             \n\
             @counter = dso_local global i32 0, align 4\n\
             \n\
             define dso_local i32 @foo(i32 noundef %x) #0 {{\n\
             entry:\n\
             {foo_body}\n\
             }}\n\
             \n\
             define dso_local i32 @bar(i32 noundef %x) #0 {{\n\
             entry:\n\
               ret i32 %x\n\
             }}\n\
             \n\
             attributes #0 = {{ noinline }}\n"
        )
    }

    fn run_diff(tmp: &TempDir, original: &str, patched: &str) -> Result<Module> {
        let orig = tmp.file("orig.ll", original);
        let patc = tmp.file("patched.ll", patched);
        let base_dir = tmp.path.display().to_string();
        run(&DiffOptions {
            original: &orig,
            patched: &patc,
            base_dir: &base_dir,
            quiet: true,
        })?;
        let patched_module = Module::parse(patched).unwrap();
        let out = PathBuf::from(format!("{}__klp_diff.ll", patched_module.source_filename));
        Module::parse_file(&out)
    }

    #[test]
    fn changed_function_is_renamed_and_pinned() {
        let tmp = TempDir::new("changed");
        let original = module_text(&tmp.source(), "  ret i32 %x");
        let patched = module_text(&tmp.source(), "  %add = add nsw i32 %x, 1\n  ret i32 %add");
        let out = run_diff(&tmp, &original, &patched).unwrap();

        let renamed = out.function("__livepatch_foo:a.c").unwrap();
        assert!(!renamed.is_declaration);
        assert!(renamed.signature.starts_with("define dso_local i32 @\"__livepatch_foo:a.c\""));

        // The unchanged function lost its body.
        let bar = out.function("bar").unwrap();
        assert!(bar.is_declaration);

        let used = out.global("llvm.used").unwrap();
        assert!(used.init.as_deref().unwrap().contains("__livepatch_foo:a.c"));
    }

    #[test]
    fn identical_modules_mean_nothing_to_patch() {
        let tmp = TempDir::new("same");
        let text = module_text(&tmp.source(), "  ret i32 %x");
        let err = run_diff(&tmp, &text, &text).unwrap_err();
        assert_eq!(crate::error::exit_code(&err), 7);
    }

    #[test]
    fn metadata_renumbering_is_not_a_change() {
        let tmp = TempDir::new("meta");
        let original = module_text(&tmp.source(), "  ret i32 %x, !dbg !12");
        let patched = module_text(&tmp.source(), "  ret i32 %x, !dbg !47");
        let err = run_diff(&tmp, &original, &patched).unwrap_err();
        assert_eq!(crate::error::exit_code(&err), 7);
    }

    #[test]
    fn init_section_functions_are_dropped() {
        let tmp = TempDir::new("init");
        let make = |probe_ret: &str, foo_ret: &str| {
            format!(
                "source_filename = \"{}\"\n\n\
                 define dso_local i32 @probe() section \".init.text\" {{\n\
                 entry:\n\
                   ret i32 {probe_ret}\n\
                 }}\n\n\
                 define dso_local i32 @foo() {{\n\
                 entry:\n\
                   ret i32 {foo_ret}\n\
                 }}\n",
                tmp.source()
            )
        };
        let out = run_diff(&tmp, &make("0", "0"), &make("1", "1")).unwrap();
        assert!(out.function("probe").is_none());
        assert!(out.function("__livepatch_foo:a.c").is_some());
    }

    #[test]
    fn shared_global_is_externalized_and_renamed() {
        let tmp = TempDir::new("globals");
        let original = module_text(&tmp.source(), "  ret i32 %x");
        let patched = module_text(&tmp.source(), "  ret i32 0");
        let out = run_diff(&tmp, &original, &patched).unwrap();

        let renamed = out.global("klp.local.sym:counter:a.c").unwrap();
        assert_eq!(renamed.init, None);
        assert_eq!(renamed.prefix, "external dso_local");
    }

    #[test]
    fn patched_only_global_is_left_alone() {
        let tmp = TempDir::new("newglobal");
        let original = module_text(&tmp.source(), "  ret i32 %x");
        let patched = format!(
            "@fresh = dso_local global i32 7, align 4\n{}",
            module_text(&tmp.source(), "  ret i32 0")
        );
        let out = run_diff(&tmp, &original, &patched).unwrap();
        let fresh = out.global("fresh").unwrap();
        assert_eq!(fresh.init.as_deref(), Some("7"));
    }

    #[test]
    fn special_globals_are_removed() {
        let tmp = TempDir::new("special");
        let original = module_text(&tmp.source(), "  ret i32 %x");
        let patched = format!(
            "@__ksymtab_foo = global i32 0\n@__kstrtab_foo = global [4 x i8] c\"foo\\00\"\n{}",
            module_text(&tmp.source(), "  ret i32 0")
        );
        let out = run_diff(&tmp, &original, &patched).unwrap();
        assert!(out.global("__ksymtab_foo").is_none());
        assert!(out.global("__kstrtab_foo").is_none());
    }

    #[test]
    fn pure_constants_keep_their_bodies() {
        let tmp = TempDir::new("pureconst");
        let extra = "@message = dso_local constant [6 x i8] c\"hello\\00\", align 1\n";
        let original = format!("{extra}{}", module_text(&tmp.source(), "  ret i32 %x"));
        let patched = format!("{extra}{}", module_text(&tmp.source(), "  ret i32 0"));
        let out = run_diff(&tmp, &original, &patched).unwrap();
        let message = out.global("message").unwrap();
        assert!(message.init.is_some());
        assert_eq!(message.name, "message");
    }

    #[test]
    fn sys_aliases_are_removed() {
        let tmp = TempDir::new("alias");
        let original = module_text(&tmp.source(), "  ret i32 %x");
        let patched = format!(
            "{}@sys_frob = alias i32 (i32), ptr @foo\n",
            module_text(&tmp.source(), "  ret i32 0")
        );
        let out = run_diff(&tmp, &original, &patched).unwrap();
        assert!(!out.render().contains("sys_frob"));
    }

    #[test]
    fn inline_asm_export_blocks_are_pruned() {
        let mut module = Module::parse(
            "module asm \"nop\"\nsource_filename = \"a.c\"\n",
        )
        .unwrap();
        module.module_asm = "\t.section \"___kcrctab_gpl+frob\", \"a\"\n\
                             \t.weak __crc_frob\n\
                             \t.long __crc_frob\n\
                             \t.previous\n\
                             \t.section \".initcall4.init\", \"a\"\n\
                             __initcall_frob4:\n\
                             \t.long frob - .\n\
                             \t.previous\n\
                             nop\n"
            .to_string();
        prune_module_asm(&mut module);
        assert_eq!(module.module_asm, "nop\n");
    }

    #[test]
    fn comparator_masks_metadata_but_not_code() {
        let comparator = FunctionComparator::new();
        let make = |line: &str| Function {
            name: "f".into(),
            signature: "define i32 @f(i32 %x) #0".into(),
            body: vec![line.to_string()],
            is_declaration: false,
        };
        assert!(!comparator.differs(
            &make("  ret i32 %x, !dbg !10"),
            &make("  ret i32 %x, !dbg !99")
        ));
        assert!(comparator.differs(
            &make("  ret i32 %x"),
            &make("  ret i32 0")
        ));
    }
}
