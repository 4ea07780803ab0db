use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{NarEvent, NAR_MAGIC};

/// Streaming NAR writer.
///
/// Consumes the same events the parser produces and emits byte-exact
/// wire framing. The writer is a strict sink: once an event has been
/// written it cannot be retracted. Feeding it the event sequence of a
/// valid parse reproduces the archive byte for byte.
pub struct NarWriter<W> {
    writer: W,
    started: bool,
    depth: usize,
}

impl<W> NarWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            started: false,
            depth: 0,
        }
    }

    pub async fn write_event(&mut self, event: &NarEvent) -> io::Result<()> {
        if !self.started {
            relonar_io::write_bytes(&mut self.writer, NAR_MAGIC).await?;
            self.started = true;
        }

        match event {
            NarEvent::File {
                name,
                executable,
                contents,
            } => {
                self.open_entry(name).await?;
                self.tokens(&[b"(", b"type", b"regular"]).await?;
                if *executable {
                    self.tokens(&[b"executable", b""]).await?;
                }
                self.tokens(&[b"contents"]).await?;
                relonar_io::write_bytes(&mut self.writer, contents).await?;
                self.tokens(&[b")"]).await?;
                self.close_entry().await?;
            }
            NarEvent::Symlink { name, target } => {
                self.open_entry(name).await?;
                self.tokens(&[b"(", b"type", b"symlink", b"target"]).await?;
                relonar_io::write_bytes(&mut self.writer, target).await?;
                self.tokens(&[b")"]).await?;
                self.close_entry().await?;
            }
            NarEvent::StartDirectory { name } => {
                self.open_entry(name).await?;
                self.tokens(&[b"(", b"type", b"directory"]).await?;
                self.depth += 1;
            }
            NarEvent::EndDirectory => {
                if self.depth == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "EndDirectory without an open directory",
                    ));
                }
                self.tokens(&[b")"]).await?;
                self.depth -= 1;
                self.close_entry().await?;
            }
        }
        Ok(())
    }

    /// Flush and hand back the underlying writer.
    pub async fn close(mut self) -> io::Result<W> {
        self.writer.flush().await?;
        Ok(self.writer)
    }

    /// Inside a directory every node is wrapped in an entry bracket.
    async fn open_entry(&mut self, name: &[u8]) -> io::Result<()> {
        if self.depth > 0 {
            self.tokens(&[b"entry", b"(", b"name"]).await?;
            relonar_io::write_bytes(&mut self.writer, name).await?;
            self.tokens(&[b"node"]).await?;
        }
        Ok(())
    }

    async fn close_entry(&mut self) -> io::Result<()> {
        if self.depth > 0 {
            self.tokens(&[b")"]).await?;
        }
        Ok(())
    }

    async fn tokens(&mut self, tokens: &[&[u8]]) -> io::Result<()> {
        for token in tokens {
            relonar_io::write_bytes(&mut self.writer, token).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_data;
    use crate::NarParser;
    use rstest::rstest;
    use std::io::Cursor;

    async fn write_all(events: &[NarEvent]) -> Vec<u8> {
        let mut writer = NarWriter::new(Vec::new());
        for event in events {
            writer.write_event(event).await.unwrap();
        }
        writer.close().await.unwrap()
    }

    #[test_log::test(tokio::test)]
    #[rstest]
    #[case::text_file(test_data::text_file())]
    #[case::exec_file(test_data::exec_file())]
    #[case::empty_file(test_data::empty_file())]
    #[case::symlink(test_data::symlink())]
    #[case::empty_dir(test_data::empty_dir())]
    #[case::dir_example(test_data::dir_example())]
    async fn writes_canonical_wire(#[case] fixture: test_data::Fixture) {
        assert_eq!(write_all(&fixture.events).await, fixture.wire);
    }

    #[tokio::test]
    async fn parse_then_write_is_identity() {
        let fixture = test_data::dir_example();
        let mut parser = NarParser::new(Cursor::new(fixture.wire.clone()));
        let mut writer = NarWriter::new(Vec::new());
        while let Some(event) = parser.next_event().await.unwrap() {
            writer.write_event(&event).await.unwrap();
        }
        assert_eq!(writer.close().await.unwrap(), fixture.wire);
    }

    #[tokio::test]
    async fn stray_end_directory_is_rejected() {
        let mut writer = NarWriter::new(Vec::new());
        let err = writer.write_event(&NarEvent::EndDirectory).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
