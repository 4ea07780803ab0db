//! The bounded ordered-sink pipeline.
//!
//! The parser task reads events in document order. Directory brackets
//! pass straight through; each leaf is handed to a blocking worker and
//! its completion token enqueued in the same order. The sink dequeues
//! tokens strictly FIFO, so the writer sees the exact event sequence
//! the parser produced no matter how workers interleave, and the
//! bounded channel caps both in-flight leaves and memory.

use std::sync::Arc;

use bytes::Bytes;
use relonar_nar::{NarEvent, NarParser, NarWriter};
use relonar_rewrite::Patcher;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::PatchNarError;

enum Token {
    Ready(NarEvent),
    Pending(oneshot::Receiver<NarEvent>),
}

pub struct Pipeline {
    patcher: Arc<Patcher>,
    window: usize,
}

impl Pipeline {
    /// `window` is the number of in-flight leaves; memory is bounded by
    /// `window` times the largest file in the archive.
    pub fn new(patcher: Arc<Patcher>, window: usize) -> Self {
        Self {
            patcher,
            window: window.max(1),
        }
    }

    pub async fn run<R, W>(&self, reader: R, writer: W) -> Result<(), PatchNarError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let (tx, mut rx) = mpsc::channel::<Token>(self.window);

        let patcher = Arc::clone(&self.patcher);
        let producer: JoinHandle<Result<(), PatchNarError>> = tokio::spawn(async move {
            let mut parser = NarParser::new(reader);
            let mut dirs: Vec<Bytes> = Vec::new();

            while let Some(event) = parser.next_event().await? {
                let token = match event {
                    NarEvent::File {
                        name,
                        executable,
                        contents,
                    } => {
                        let path = leaf_path(&dirs, &name);
                        let patcher = Arc::clone(&patcher);
                        let (done_tx, done_rx) = oneshot::channel();
                        tokio::task::spawn_blocking(move || {
                            let patched = patcher.patch_file(&contents, executable, &path);
                            let _ = done_tx.send(NarEvent::File {
                                name,
                                executable,
                                contents: patched.into(),
                            });
                        });
                        Token::Pending(done_rx)
                    }
                    NarEvent::Symlink { name, target } => {
                        let path = leaf_path(&dirs, &name);
                        let patcher = Arc::clone(&patcher);
                        let (done_tx, done_rx) = oneshot::channel();
                        tokio::task::spawn_blocking(move || {
                            let patched = patcher.patch_symlink(&target, &path);
                            let _ = done_tx.send(NarEvent::Symlink {
                                name,
                                target: patched.into(),
                            });
                        });
                        Token::Pending(done_rx)
                    }
                    NarEvent::StartDirectory { name } => {
                        patcher.note_directory();
                        dirs.push(name.clone());
                        Token::Ready(NarEvent::StartDirectory { name })
                    }
                    NarEvent::EndDirectory => {
                        dirs.pop();
                        Token::Ready(NarEvent::EndDirectory)
                    }
                };

                // A closed channel means the sink stopped; its error is
                // what the caller will see.
                if tx.send(token).await.is_err() {
                    break;
                }
            }
            Ok(())
        });

        let mut nar_writer = NarWriter::new(writer);
        let mut sink_result: Result<(), PatchNarError> = Ok(());
        while let Some(token) = rx.recv().await {
            let event = match token {
                Token::Ready(event) => event,
                Token::Pending(done) => match done.await {
                    Ok(event) => event,
                    Err(_) => {
                        sink_result =
                            Err(PatchNarError::Worker("patch worker dropped its result".into()));
                        break;
                    }
                },
            };
            if let Err(err) = nar_writer.write_event(&event).await {
                sink_result = Err(PatchNarError::io("failed to write output archive", err));
                break;
            }
        }
        drop(rx);

        producer
            .await
            .map_err(|err| PatchNarError::Worker(err.to_string()))??;
        sink_result?;

        nar_writer
            .close()
            .await
            .map_err(|err| PatchNarError::io("failed to flush output archive", err))?;
        Ok(())
    }
}

/// Slash-joined path from the root to a leaf, for classification and
/// diagnostics only; it is never written back into the archive.
fn leaf_path(dirs: &[Bytes], name: &[u8]) -> String {
    let mut parts: Vec<&[u8]> = dirs
        .iter()
        .map(|d| &d[..])
        .filter(|d| !d.is_empty())
        .collect();
    if !name.is_empty() {
        parts.push(name);
    }
    String::from_utf8_lossy(&parts.join(&b"/"[..])).into_owned()
}
