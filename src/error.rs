//! Error taxonomy shared by all pipeline stages.
//!
//! Every failure class has a stable numeric value which doubles as the
//! process exit code. Stage code attaches an `ErrorKind` to its `anyhow`
//! context chain; `exit_code()` recovers it at the top level.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("invalid command")]
    InvalidCommand = 1,
    #[error("not enough arguments")]
    NotEnoughArgs = 2,
    #[error("invalid LLVM IR file")]
    InvalidLlvmFile = 3,
    #[error("diff failed")]
    DiffFailed = 4,
    #[error("failed to open file")]
    FileOpenFailed = 5,
    #[error("invalid patch file")]
    InvalidPatchFile = 6,
    #[error("nothing to patch")]
    NothingToPatch = 7,
    #[error("symbol not found in thin archive")]
    SymFindFailed = 8,
    #[error("invalid symbol map file")]
    InvalidSymMap = 9,
    #[error("no symbol table found")]
    NoSymtab = 10,
    #[error("no rela section in ELF file")]
    NoRelaSection = 11,
    #[error("rela section not found")]
    RelaSectionNotFound = 12,
    #[error("invalid livepatch prefix")]
    InvalidKlpPrefix = 13,
    #[error("invalid ELF symbol")]
    InvalidElfSymbol = 14,
    #[error("same symbol and filename combination")]
    SameSymbolFilename = 15,
}

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        self as i32
    }
}

/// Walk an error chain and return the exit code of the first `ErrorKind`
/// found, or 1 for unclassified failures.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ErrorKind>())
        .map(|kind| kind.exit_code())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn exit_code_matches_enum_value() {
        assert_eq!(ErrorKind::InvalidCommand.exit_code(), 1);
        assert_eq!(ErrorKind::NothingToPatch.exit_code(), 7);
        assert_eq!(ErrorKind::SameSymbolFilename.exit_code(), 15);
    }

    #[test]
    fn exit_code_found_through_context_chain() {
        let err = anyhow::Error::from(ErrorKind::NothingToPatch)
            .context("while diffing modules");
        assert_eq!(exit_code(&err), 7);

        let err: anyhow::Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        let err = err
            .context(ErrorKind::FileOpenFailed)
            .context("failed to open vmlinux.a.syms");
        assert_eq!(exit_code(&err), 5);
    }

    #[test]
    fn unclassified_error_exits_one() {
        let err = anyhow::anyhow!("something else went wrong");
        assert_eq!(exit_code(&err), 1);
    }
}
