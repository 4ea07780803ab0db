use bstr::ByteSlice;

use crate::MappingTable;

/// The store-path marker every absolute content-addressed path starts
/// with.
pub const STORE_PREFIX: &[u8] = b"/nix/store/";

/// Immutable rewrite configuration, fixed for the whole run.
///
/// `old_glibc`/`new_glibc` are either both empty or both non-empty;
/// the binary validates that before constructing one of these.
#[derive(Debug, Clone, Default)]
pub struct RewriteSettings {
    /// Installation prefix prepended to absolute store paths, e.g.
    /// `/data/data/com.example/files/usr`.
    pub prefix: Vec<u8>,
    /// Store path of the glibc being replaced.
    pub old_glibc: Vec<u8>,
    /// Store path of the glibc replacing it.
    pub new_glibc: Vec<u8>,
    /// Patterns prefixed only inside tokenized string literals, e.g.
    /// `/nix/var/`.
    pub extra_prefix_patterns: Vec<Vec<u8>>,
    pub mappings: MappingTable,
}

impl RewriteSettings {
    pub fn glibc_enabled(&self) -> bool {
        !self.old_glibc.is_empty()
    }

    /// The three-step composition applied to one whole path: glibc
    /// substitution, mapping table, then the installation prefix for
    /// paths still starting at the store root.
    pub fn transform_path(&self, path: &[u8]) -> Vec<u8> {
        let mut out = path.to_vec();
        if self.glibc_enabled() {
            replace_all(&mut out, &self.old_glibc, &self.new_glibc);
        }
        self.mappings.apply(&mut out);
        if !self.prefix.is_empty() && out.starts_with(STORE_PREFIX) {
            let mut prefixed = Vec::with_capacity(self.prefix.len() + out.len());
            prefixed.extend_from_slice(&self.prefix);
            prefixed.extend_from_slice(&out);
            out = prefixed;
        }
        out
    }
}

/// Replace every non-overlapping occurrence, left to right. Unlike the
/// mapping table this allows unequal lengths.
pub(crate) fn replace_all(buf: &mut Vec<u8>, old: &[u8], new: &[u8]) {
    if old.is_empty() {
        return;
    }
    let mut from = 0;
    while let Some(pos) = buf[from..].find(old) {
        let at = from + pos;
        buf.splice(at..at + old.len(), new.iter().copied());
        from = at + new.len();
    }
}
