use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::EngineError;

/// A pre-sized destination written by byte offset.
///
/// Writes may arrive in any order; each lands at its own offset and never
/// touches bytes outside `offset..offset + data.len()`.
#[async_trait]
pub trait OffsetSink: Send + Sync {
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), EngineError>;

    /// Total size the sink was created with.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn out_of_bounds(offset: u64, len: usize, size: u64) -> EngineError {
    EngineError::InvalidInput(format!(
        "write of {len} bytes at offset {offset} exceeds sink size {size}"
    ))
}

/// Sink backed by a zero-filled buffer.
#[derive(Debug)]
pub struct MemorySink {
    buf: Mutex<Vec<u8>>,
    size: u64,
}

impl MemorySink {
    pub fn with_len(size: u64) -> Result<Self, EngineError> {
        let len = usize::try_from(size)
            .map_err(|_| EngineError::InvalidInput(format!("{size} bytes do not fit in memory")))?;
        Ok(Self {
            buf: Mutex::new(vec![0; len]),
            size,
        })
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf.into_inner()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }

    /// Copy `len` bytes starting at `offset`.
    pub fn read_at(&self, offset: u64, len: u64) -> Result<Bytes, EngineError> {
        let buf = self.buf.lock();
        let range = usize::try_from(offset).ok().zip(usize::try_from(len).ok());
        match range {
            Some((start, len)) if start.checked_add(len).is_some_and(|end| end <= buf.len()) => {
                Ok(Bytes::copy_from_slice(&buf[start..start + len]))
            }
            _ => Err(out_of_bounds(offset, usize::try_from(len).unwrap_or(usize::MAX), self.size)),
        }
    }
}

#[async_trait]
impl OffsetSink for MemorySink {
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), EngineError> {
        let mut buf = self.buf.lock();
        let start = usize::try_from(offset).map_err(|_| out_of_bounds(offset, data.len(), self.size))?;
        let end = start
            .checked_add(data.len())
            .filter(|&end| end <= buf.len())
            .ok_or_else(|| out_of_bounds(offset, data.len(), self.size))?;
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.size
    }
}

/// Sink backed by a file pre-extended to its final size.
#[derive(Debug)]
pub struct FileSink {
    file: tokio::sync::Mutex<File>,
    size: u64,
}

impl FileSink {
    /// Create (or truncate) `path` and extend it to `size` bytes.
    pub async fn create(path: impl AsRef<Path>, size: u64) -> Result<Self, EngineError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        Self::presized(file, size).await
    }

    /// An anonymous temporary file, removed by the OS once dropped.
    pub async fn temporary(size: u64) -> Result<Self, EngineError> {
        let file = tokio::task::spawn_blocking(tempfile::tempfile)
            .await
            .map_err(std::io::Error::other)??;
        Self::presized(File::from_std(file), size).await
    }

    async fn presized(file: File, size: u64) -> Result<Self, EngineError> {
        file.set_len(size).await?;
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
            size,
        })
    }

    /// Read `len` bytes starting at `offset`.
    pub async fn read_at(&self, offset: u64, len: u64) -> Result<Bytes, EngineError> {
        let end = offset.checked_add(len);
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if end.is_none_or(|end| end > self.size) {
            return Err(out_of_bounds(offset, len, self.size));
        }
        let mut buf = vec![0; len];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl OffsetSink for FileSink {
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), EngineError> {
        let end = offset.checked_add(data.len() as u64);
        if end.is_none_or(|end| end > self.size) {
            return Err(out_of_bounds(offset, data.len(), self.size));
        }
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.size
    }
}

/// Reassembly buffer for one download. Objects up to the configured
/// memory limit stay in memory; larger ones go to a temporary file.
#[derive(Debug)]
pub(crate) enum Spool {
    Memory(MemorySink),
    File(FileSink),
}

impl Spool {
    pub(crate) async fn new(size: u64, memory_limit: u64) -> Result<Self, EngineError> {
        if size <= memory_limit {
            Ok(Self::Memory(MemorySink::with_len(size)?))
        } else {
            Ok(Self::File(FileSink::temporary(size).await?))
        }
    }

    pub(crate) fn sink(&self) -> &dyn OffsetSink {
        match self {
            Self::Memory(sink) => sink,
            Self::File(sink) => sink,
        }
    }

    pub(crate) fn is_file(&self) -> bool {
        matches!(self, Self::File(_))
    }

    pub(crate) async fn read_at(&self, offset: u64, len: u64) -> Result<Bytes, EngineError> {
        match self {
            Self::Memory(sink) => sink.read_at(offset, len),
            Self::File(sink) => sink.read_at(offset, len).await,
        }
    }
}
