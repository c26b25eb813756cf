use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use klpgen::align::{self, AlignOptions};
use klpgen::diff::{self, DiffOptions};
use klpgen::error::{self, ErrorKind};
use klpgen::fixup::{self, FixupOptions};
use klpgen::gen::{self, GenOptions};

#[derive(Parser)]
#[command(
    name = "klpgen",
    about = "Utility for kernel livepatch generation",
    disable_version_flag = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Align __LINE__ for original.c and patched.c for a given patch by
    /// adding empty lines
    Align {
        /// Filename of the diffed file, as it appears in the patch
        #[arg(short, long)]
        diffed_file: String,

        /// Patch file relating the two sources
        #[arg(short, long)]
        patch: PathBuf,

        /// Suffix for the output files
        #[arg(short, long, default_value = "__aligned")]
        suffix: String,

        original: PathBuf,
        patched: PathBuf,
    },

    /// Diff two LLVM IR files and output a new IR file that distills
    /// changed/new functions and global variables
    Diff {
        /// Don't report changed functions
        #[arg(short, long)]
        quiet: bool,

        /// Base directory stripped from the diffed files' source paths
        #[arg(short, long, default_value = "")]
        base_dir: String,

        original: PathBuf,
        patched: PathBuf,
    },

    /// Generate the livepatch wrapper, makefile and linker script
    Gen {
        /// Path to the output directory
        #[arg(short, long)]
        odir: PathBuf,

        /// Path to the kernel source directory
        #[arg(short, long)]
        kdir: String,

        /// Name of the livepatch module
        #[arg(short, long)]
        name: String,

        /// Path to the patched kernel module; omit for vmlinux
        #[arg(short, long)]
        module: Option<PathBuf>,

        /// nm dump of the thin archive for the kernel module or vmlinux
        #[arg(short, long)]
        thin_archive: Option<PathBuf>,

        patch_object: PathBuf,
    },

    /// Rename undefined symbols and create the livepatch relocation
    /// sections
    Fixup {
        /// Path to the patched kernel module; omit for vmlinux
        #[arg(short, long)]
        module: Option<PathBuf>,

        /// Symbol map for aliases declared in the livepatch wrapper
        #[arg(short, long)]
        symbol_map: Option<PathBuf>,

        /// nm dump of the thin archive for the kernel module or vmlinux
        #[arg(short, long)]
        thin_archive: Option<PathBuf>,

        /// Create the livepatch relocation sections
        #[arg(short, long)]
        rela: bool,

        /// Don't report renamed symbols
        #[arg(short, long)]
        quiet: bool,

        patch_object: PathBuf,
    },

    /// Print shell completions
    #[command(hide = true)]
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Align {
            diffed_file,
            patch,
            suffix,
            original,
            patched,
        } => align::run(&AlignOptions {
            diffed_file: &diffed_file,
            patch_file: &patch,
            original: &original,
            patched: &patched,
            suffix: &suffix,
        }),
        Command::Diff {
            quiet,
            base_dir,
            original,
            patched,
        } => diff::run(&DiffOptions {
            original: &original,
            patched: &patched,
            base_dir: &base_dir,
            quiet,
        }),
        Command::Gen {
            odir,
            kdir,
            name,
            module,
            thin_archive,
            patch_object,
        } => gen::run(&GenOptions {
            patch_object: &patch_object,
            output_dir: &odir,
            kernel_dir: &kdir,
            klp_name: &name,
            module: module.as_deref(),
            thin_archive: thin_archive.as_deref(),
        }),
        Command::Fixup {
            module,
            symbol_map,
            thin_archive,
            rela,
            quiet,
            patch_object,
        } => fixup::run(&FixupOptions {
            patch_object: &patch_object,
            module: module.as_deref(),
            symbol_map: symbol_map.as_deref(),
            thin_archive: thin_archive.as_deref(),
            create_rela: rela,
            quiet,
        }),
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "klpgen", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            use clap::error::ErrorKind as ParseError;
            let code = match err.kind() {
                // `klpgen help` and bare `klpgen` print usage and succeed.
                ParseError::DisplayHelp
                | ParseError::DisplayVersion
                | ParseError::DisplayHelpOnMissingArgumentOrSubcommand => 0,
                ParseError::InvalidSubcommand => ErrorKind::InvalidCommand.exit_code(),
                _ => ErrorKind::NotEnoughArgs.exit_code(),
            };
            let _ = err.print();
            process::exit(code);
        }
    };

    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        process::exit(error::exit_code(&err));
    }
}
