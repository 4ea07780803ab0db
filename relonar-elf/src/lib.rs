// SPDX-License-Identifier: MIT

//! ELF rewriting for relocated dynamic linkers and library search paths.
//!
//! [`ElfPatcher`] opens an ELF image from a byte slice, exposes the
//! current `PT_INTERP` string and `DT_RPATH`/`DT_RUNPATH` value, accepts
//! replacements for either, and produces a new image on
//! [`ElfPatcher::finalize`]. When the replacement strings fit into the
//! space already present they are rewritten in place; otherwise the
//! program-header table, `.interp`, `.dynstr` and `.dynamic` move into a
//! fresh page-aligned `PT_LOAD` segment appended at the end of the file.
//!
//! 32- and 64-bit images are both handled; the container layout is
//! derived from `EI_CLASS`/`EI_DATA` at parse time.

mod patcher;

#[cfg(feature = "fixtures")]
pub mod fixture;

pub use patcher::ElfPatcher;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ElfPatchError {
    /// The input does not carry the ELF magic; callers should pass the
    /// bytes through untouched.
    #[error("not an ELF image")]
    NotElf,

    /// The magic matched but the image cannot be parsed or is missing a
    /// structure the rewrite depends on.
    #[error("malformed ELF image: {0}")]
    Malformed(String),

    /// The rewrite itself failed; the original bytes remain valid.
    #[error("ELF rewrite failed: {0}")]
    RewriteFailed(String),
}

impl From<goblin::error::Error> for ElfPatchError {
    fn from(err: goblin::error::Error) -> Self {
        ElfPatchError::Malformed(err.to_string())
    }
}
