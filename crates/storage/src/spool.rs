//! Bounded-memory spooling for uploads.
//!
//! An upload is hashed while it is buffered here; small payloads stay in
//! memory, anything above the threshold spills to an anonymous temp file.
//! The finished [`Spool`] can be read any number of times, which is what
//! lets the orchestrator replay the same bytes to several endpoints without
//! holding the whole payload in memory.

use crate::error::{StorageError, StorageResult};
use crate::traits::ByteStream;
use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Chunk size for spool file reads (64 KiB).
const SPOOL_READ_CHUNK_SIZE: usize = 64 * 1024;

enum WriterState {
    Memory(Vec<u8>),
    File {
        file: tokio::fs::File,
        handle: NamedTempFile,
    },
}

/// Accumulates upload bytes, spilling to disk above `threshold`.
pub struct SpoolWriter {
    threshold: u64,
    written: u64,
    state: WriterState,
}

impl SpoolWriter {
    /// Create a writer that spills to the system temp directory once more
    /// than `threshold` bytes have been written.
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            written: 0,
            state: WriterState::Memory(Vec::new()),
        }
    }

    /// Append a chunk.
    pub async fn write(&mut self, chunk: &[u8]) -> StorageResult<()> {
        if let WriterState::Memory(buf) = &mut self.state {
            if self.written + chunk.len() as u64 > self.threshold {
                // Spill: move what we have plus this chunk to a temp file.
                let handle = tokio::task::spawn_blocking(NamedTempFile::new)
                    .await
                    .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;
                let std_file = handle.as_file().try_clone()?;
                let mut file = tokio::fs::File::from_std(std_file);
                file.write_all(buf).await?;
                file.write_all(chunk).await?;
                self.written += chunk.len() as u64;
                self.state = WriterState::File { file, handle };
                return Ok(());
            }
            buf.extend_from_slice(chunk);
            self.written += chunk.len() as u64;
            return Ok(());
        }

        if let WriterState::File { file, .. } = &mut self.state {
            file.write_all(chunk).await?;
            self.written += chunk.len() as u64;
        }
        Ok(())
    }

    /// Finish writing and return the readable spool.
    pub async fn finish(self) -> StorageResult<Spool> {
        let inner = match self.state {
            WriterState::Memory(buf) => SpoolInner::Memory(Bytes::from(buf)),
            WriterState::File { mut file, handle } => {
                file.flush().await?;
                SpoolInner::File(handle)
            }
        };
        Ok(Spool {
            len: self.written,
            inner,
        })
    }
}

enum SpoolInner {
    Memory(Bytes),
    File(NamedTempFile),
}

/// Finished, re-readable upload payload. The backing temp file (if any) is
/// removed when the spool is dropped.
pub struct Spool {
    len: u64,
    inner: SpoolInner,
}

impl Spool {
    /// Total payload size in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the payload spilled to disk.
    pub fn is_spilled(&self) -> bool {
        matches!(self.inner, SpoolInner::File(_))
    }

    /// Open an independent reader over the full payload. Each call starts
    /// from the beginning.
    pub async fn reader(&self) -> StorageResult<ByteStream> {
        match &self.inner {
            SpoolInner::Memory(bytes) => {
                let bytes = bytes.clone();
                Ok(Box::pin(futures::stream::once(async move { Ok(bytes) })))
            }
            SpoolInner::File(handle) => {
                // reopen() yields a fresh descriptor with its own cursor.
                let std_file = handle.reopen()?;
                let file = tokio::fs::File::from_std(std_file);
                let stream = ReaderStream::with_capacity(file, SPOOL_READ_CHUNK_SIZE);
                Ok(Box::pin(futures::StreamExt::map(stream, |r| {
                    r.map_err(StorageError::Io)
                })))
            }
        }
    }
}
