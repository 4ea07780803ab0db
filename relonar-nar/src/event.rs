use bytes::Bytes;

/// One step of a NAR tree walk, in document order.
///
/// `name` is the entry name within the enclosing directory; the root
/// node carries an empty name. File contents travel inline: by the time
/// a [`NarEvent::File`] is yielded the whole blob has been read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NarEvent {
    File {
        name: Bytes,
        executable: bool,
        contents: Bytes,
    },
    Symlink {
        name: Bytes,
        target: Bytes,
    },
    StartDirectory {
        name: Bytes,
    },
    EndDirectory,
}

impl NarEvent {
    /// True for the leaf events a rewriting pipeline dispatches to
    /// workers (files and symlinks).
    pub fn is_leaf(&self) -> bool {
        matches!(self, NarEvent::File { .. } | NarEvent::Symlink { .. })
    }
}
