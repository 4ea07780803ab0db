use bstr::{BString, ByteSlice};
use bytes::Bytes;
use relonar_io::FramingError;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::trace;

use crate::{NarEvent, NAR_MAGIC};

/// Upper bound on grammar keyword tokens (`nix-archive-1`, `(`, `type`,
/// `entry`, …). Entry names, symlink targets and file contents are
/// data, not keywords, and are read without a cap.
const MAX_TOKEN_SIZE: u64 = 64 * 1024;

/// Errors produced while reading a NAR.
///
/// `Framing` covers truncated or unreadable input; every other variant
/// is a grammar violation in an input that framed correctly.
#[derive(Error, Debug)]
pub enum NarError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("bad archive magic: expected `nix-archive-1`, got `{got}`")]
    BadMagic { got: BString },

    #[error("unexpected token `{got}` (expected `{expected}`)")]
    UnexpectedToken {
        expected: &'static str,
        got: BString,
    },

    #[error("unknown node kind `{kind}`")]
    UnknownNodeKind { kind: BString },

    #[error("token of {len} bytes exceeds the {max}-byte limit")]
    TokenTooLong { len: u64, max: u64 },

    #[error("invalid entry name `{name}`")]
    InvalidEntryName { name: BString },

    #[error("entry `{name}` not sorted after `{prev}`")]
    UnsortedEntry { prev: BString, name: BString },

    #[error("empty symlink target")]
    EmptySymlinkTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Walking,
    Done,
}

#[derive(Default)]
struct DirFrame {
    last_name: Option<Bytes>,
}

/// Streaming pull parser for the NAR grammar.
///
/// `next_event` yields events in document order and returns `None` once
/// the root node has closed. Directory entries are checked to be
/// non-empty, free of `/`, not `.` or `..`, and strictly increasing in
/// byte-lexicographic order (which also rules out duplicates).
pub struct NarParser<R> {
    reader: R,
    state: State,
    dirs: Vec<DirFrame>,
}

impl<R> NarParser<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            state: State::Start,
            dirs: Vec::new(),
        }
    }

    /// Yield the next tree event, or `None` after the root node closed.
    pub async fn next_event(&mut self) -> Result<Option<NarEvent>, NarError> {
        match self.state {
            State::Start => {
                let magic = self.read_token().await?;
                if &magic[..] != NAR_MAGIC {
                    return Err(NarError::BadMagic {
                        got: magic.as_ref().into(),
                    });
                }
                self.state = State::Walking;
                let event = self.parse_node(Bytes::new()).await?;
                if self.dirs.is_empty() {
                    // The root was a leaf; the archive is complete.
                    self.state = State::Done;
                }
                Ok(Some(event))
            }
            State::Walking => self.walk().await.map(Some),
            State::Done => Ok(None),
        }
    }

    /// Consume one directory-body step: either the next entry or the
    /// close of the innermost open directory.
    async fn walk(&mut self) -> Result<NarEvent, NarError> {
        debug_assert!(!self.dirs.is_empty());

        let token = self.read_token().await?;
        match &token[..] {
            b")" => {
                self.dirs.pop();
                if self.dirs.is_empty() {
                    self.state = State::Done;
                } else {
                    // Close the `entry` bracket wrapping this directory.
                    self.expect(b")", ")").await?;
                }
                Ok(NarEvent::EndDirectory)
            }
            b"entry" => {
                self.expect(b"(", "(").await?;
                self.expect(b"name", "name").await?;
                let name = relonar_io::read_bytes(&mut self.reader).await?;
                self.check_entry_name(&name)?;
                self.expect(b"node", "node").await?;

                let event = self.parse_node(name).await?;
                if !matches!(event, NarEvent::StartDirectory { .. }) {
                    // Leaf nodes complete inline; their entry closes here.
                    // A directory's entry closes at its EndDirectory.
                    self.expect(b")", ")").await?;
                }
                Ok(event)
            }
            _ => Err(NarError::UnexpectedToken {
                expected: "entry or )",
                got: token.as_ref().into(),
            }),
        }
    }

    /// Parse one `( type … )` node. For regular files and symlinks the
    /// whole node is consumed; for directories only the header is, and a
    /// frame is pushed for the body.
    async fn parse_node(&mut self, name: Bytes) -> Result<NarEvent, NarError> {
        self.expect(b"(", "(").await?;
        self.expect(b"type", "type").await?;

        let kind = self.read_token().await?;
        match &kind[..] {
            b"regular" => {
                let mut token = self.read_token().await?;
                let mut executable = false;
                if &token[..] == b"executable" {
                    executable = true;
                    self.expect(b"", "empty marker").await?;
                    token = self.read_token().await?;
                }
                if &token[..] != b"contents" {
                    return Err(NarError::UnexpectedToken {
                        expected: "contents",
                        got: token.as_ref().into(),
                    });
                }

                // File contents are the one token without a size cap.
                let contents = relonar_io::read_bytes(&mut self.reader).await?;
                self.expect(b")", ")").await?;

                trace!(name = %name.as_bstr(), size = contents.len(), executable, "file");
                Ok(NarEvent::File {
                    name,
                    executable,
                    contents,
                })
            }
            b"symlink" => {
                self.expect(b"target", "target").await?;
                let target = relonar_io::read_bytes(&mut self.reader).await?;
                if target.is_empty() {
                    return Err(NarError::EmptySymlinkTarget);
                }
                self.expect(b")", ")").await?;

                trace!(name = %name.as_bstr(), target = %target.as_bstr(), "symlink");
                Ok(NarEvent::Symlink { name, target })
            }
            b"directory" => {
                self.dirs.push(DirFrame::default());
                trace!(name = %name.as_bstr(), depth = self.dirs.len(), "directory");
                Ok(NarEvent::StartDirectory { name })
            }
            _ => Err(NarError::UnknownNodeKind {
                kind: kind.as_ref().into(),
            }),
        }
    }

    fn check_entry_name(&mut self, name: &Bytes) -> Result<(), NarError> {
        if name.is_empty()
            || name.contains(&b'/')
            || &name[..] == b"."
            || &name[..] == b".."
        {
            return Err(NarError::InvalidEntryName {
                name: name.as_ref().into(),
            });
        }

        let frame = self.dirs.last_mut().expect("inside a directory");
        if let Some(prev) = &frame.last_name {
            if &name[..] <= &prev[..] {
                return Err(NarError::UnsortedEntry {
                    prev: prev.as_ref().into(),
                    name: name.as_ref().into(),
                });
            }
        }
        frame.last_name = Some(name.clone());
        Ok(())
    }

    async fn read_token(&mut self) -> Result<Bytes, NarError> {
        let len = relonar_io::read_u64(&mut self.reader).await?;
        if len > MAX_TOKEN_SIZE {
            return Err(NarError::TokenTooLong {
                len,
                max: MAX_TOKEN_SIZE,
            });
        }
        Ok(relonar_io::read_payload(&mut self.reader, len).await?)
    }

    async fn expect(&mut self, token: &'static [u8], what: &'static str) -> Result<(), NarError> {
        let got = self.read_token().await?;
        if &got[..] != token {
            return Err(NarError::UnexpectedToken {
                expected: what,
                got: got.as_ref().into(),
            });
        }
        Ok(())
    }
}
