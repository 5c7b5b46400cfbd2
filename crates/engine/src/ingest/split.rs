use bytes::{Bytes, BytesMut};
use chatvault_crypto::TAG_LEN;
use chatvault_platform::MAX_ATTACHMENT_BYTES;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Bytes the codec adds to every chunk.
pub const CODEC_OVERHEAD: u64 = TAG_LEN as u64;

/// One plaintext slice of an object, numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainChunk {
    pub sequence: u32,
    pub data: Bytes,
}

impl PlainChunk {
    pub fn new(sequence: u32, data: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            data: data.into(),
        }
    }
}

/// Clamp a requested chunk size so the encrypted chunk fits in one attachment.
pub fn effective_chunk_size(requested: u64) -> u64 {
    requested.clamp(1, MAX_ATTACHMENT_BYTES - CODEC_OVERHEAD)
}

/// Split an in-memory object into chunks of `chunk_size`.
///
/// An empty object still yields one (empty) chunk.
pub fn split_bytes(data: &Bytes, chunk_size: u64) -> Vec<PlainChunk> {
    let step = usize::try_from(chunk_size.max(1)).unwrap_or(usize::MAX);
    if data.is_empty() {
        return vec![PlainChunk::new(1, Bytes::new())];
    }
    (0..data.len())
        .step_by(step)
        .zip(1u32..)
        .map(|(start, sequence)| {
            let end = (start + step).min(data.len());
            PlainChunk::new(sequence, data.slice(start..end))
        })
        .collect()
}

/// Reads fixed-size chunks from an async byte source.
#[derive(Debug)]
pub struct ChunkReader<R> {
    reader: R,
    chunk_size: usize,
    next_sequence: u32,
    done: bool,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub fn new(reader: R, chunk_size: u64) -> Self {
        Self {
            reader,
            chunk_size: usize::try_from(chunk_size.max(1)).unwrap_or(usize::MAX),
            next_sequence: 1,
            done: false,
        }
    }

    /// Sequence number the next chunk will carry.
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    /// Read the next chunk, filling it completely unless the source ends.
    ///
    /// Returns `None` once the source is exhausted. An empty source yields a
    /// single empty chunk first.
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<PlainChunk>> {
        if self.done {
            return Ok(None);
        }
        let mut buf = BytesMut::with_capacity(self.chunk_size);
        while buf.len() < self.chunk_size {
            let n = (&mut self.reader)
                .take((self.chunk_size - buf.len()) as u64)
                .read_buf(&mut buf)
                .await?;
            if n == 0 {
                self.done = true;
                break;
            }
        }
        if buf.is_empty() && self.next_sequence > 1 {
            return Ok(None);
        }
        let chunk = PlainChunk::new(self.next_sequence, buf.freeze());
        self.next_sequence += 1;
        Ok(Some(chunk))
    }
}
