// SPDX-License-Identifier: MIT

//! The path-rewriting kernel.
//!
//! Everything that turns one file, symlink target or ELF metadata field
//! into its relocated form lives here: the mapping table of equal-length
//! basename substitutions, the language classifier, the tokenizer
//! adapter that yields string/comment spans, and the dispatching
//! [`Patcher`] applied to every leaf of the archive.
//!
//! Three rewrites compose in a fixed order everywhere: substitute the
//! old glibc store path with the new one, apply the mapping table, then
//! prepend the installation prefix to store paths that are still
//! absolute. The glibc step must run first because the mapping table
//! would otherwise rewrite the path out from under it, and prefixing
//! last keeps the whole composition idempotent.

pub mod classify;
mod highlight;
mod mappings;
mod patcher;
mod settings;

pub use classify::Language;
pub use highlight::{Highlighter, Span, SpanKind, TokenizeError};
pub use mappings::MappingTable;
pub use patcher::{Patcher, Stats};
pub use settings::{RewriteSettings, STORE_PREFIX};
