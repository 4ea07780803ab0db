use bstr::{BStr, ByteSlice};
use tracing::{debug, warn};

/// Everything after the last `/`, or the whole input.
pub(crate) fn basename(path: &[u8]) -> &[u8] {
    match path.rfind_byte(b'/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Basename substitutions applied wholesale to every byte buffer.
///
/// Pairs are keyed by the basename of the supplied store paths. The
/// equal-length invariant is enforced on insert, which makes every
/// application length-preserving: positions in the buffer never shift.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    pairs: Vec<(Vec<u8>, Vec<u8>)>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one mapping from full store paths. Pairs whose basenames
    /// differ in length are rejected with a warning and `false`.
    pub fn insert(&mut self, old_path: &[u8], new_path: &[u8]) -> bool {
        let old = basename(old_path);
        let new = basename(new_path);

        if old.is_empty() || old.len() != new.len() {
            warn!(
                old = %BStr::new(old),
                new = %BStr::new(new),
                old_len = old.len(),
                new_len = new.len(),
                "skipping mapping with mismatched basenames"
            );
            return false;
        }

        debug!(old = %BStr::new(old), new = %BStr::new(new), "mapping");
        // The mapping is a set: a repeated old basename replaces the
        // earlier pair.
        if let Some(pair) = self.pairs.iter_mut().find(|(o, _)| o.as_slice() == old) {
            pair.1 = new.to_vec();
        } else {
            self.pairs.push((old.to_vec(), new.to_vec()));
        }
        true
    }

    /// Parse a mappings file: one `<old-path> <new-path>` pair per line.
    /// Blank lines and lines without a space are ignored.
    pub fn parse(text: &str) -> Self {
        let mut table = Self::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let Some((old, new)) = line.split_once(' ') else {
                continue;
            };
            table.insert(old.as_bytes(), new.as_bytes());
        }
        debug!(mappings = table.len(), "loaded mapping table");
        table
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Replace every non-overlapping occurrence of each old basename,
    /// left to right. Length-preserving by construction.
    pub fn apply(&self, buf: &mut Vec<u8>) {
        for (old, new) in &self.pairs {
            let mut from = 0;
            while let Some(pos) = buf[from..].find(old) {
                let at = from + pos;
                buf[at..at + new.len()].copy_from_slice(new);
                from = at + new.len();
            }
        }
    }

    /// The replacement for the pair whose old basename starts at `pos`,
    /// if any.
    pub(crate) fn match_at(&self, buf: &[u8], pos: usize) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|(old, _)| buf[pos..].starts_with(old))
            .map(|(_, new)| new.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_extracts_basenames() {
        let mut table = MappingTable::new();
        assert!(table.insert(b"/nix/store/aaa-foo-1.0", b"/nix/store/bbb-foo-1.0"));
        assert_eq!(table.len(), 1);

        let mut buf = b"ref to aaa-foo-1.0 here".to_vec();
        table.apply(&mut buf);
        assert_eq!(buf, b"ref to bbb-foo-1.0 here");
    }

    #[test]
    fn unequal_lengths_are_rejected() {
        let mut table = MappingTable::new();
        assert!(!table.insert(b"/nix/store/aaa-foo", b"/nix/store/bbbb-foo"));
        assert!(table.is_empty());
    }

    #[test]
    fn apply_preserves_length() {
        let mut table = MappingTable::new();
        table.insert(b"/nix/store/aaa-foo-1.0", b"/nix/store/bbb-foo-1.0");
        table.insert(b"/nix/store/ccc-bar-2.1", b"/nix/store/ddd-bar-2.1");

        let original = b"aaa-foo-1.0 and ccc-bar-2.1 and aaa-foo-1.0".to_vec();
        let mut buf = original.clone();
        table.apply(&mut buf);
        assert_eq!(buf.len(), original.len());
        assert_eq!(buf, b"bbb-foo-1.0 and ddd-bar-2.1 and bbb-foo-1.0");
    }

    #[test]
    fn parse_skips_blank_and_malformed_lines() {
        let table = MappingTable::parse(
            "/nix/store/aaa-foo /nix/store/bbb-foo\n\
             \n\
             no-space-on-this-line\n\
             /nix/store/ccc-bar /nix/store/dddd-bar\n",
        );
        // The length-mismatched ccc/dddd pair is dropped too.
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn repeated_old_basename_replaces() {
        let mut table = MappingTable::new();
        table.insert(b"/nix/store/aaa-foo", b"/nix/store/bbb-foo");
        table.insert(b"/nix/store/aaa-foo", b"/nix/store/ccc-foo");
        assert_eq!(table.len(), 1);

        let mut buf = b"aaa-foo".to_vec();
        table.apply(&mut buf);
        assert_eq!(buf, b"ccc-foo");
    }
}
