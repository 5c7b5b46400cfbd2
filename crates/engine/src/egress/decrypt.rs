use std::vec;

use bytes::Bytes;
use chatvault_core::{ChunkRecord, chunk_offsets};
use chatvault_crypto::{
    ChunkCodec, ChunkedHeader, DecryptedChunks, DerivedKey, SealedPart, decode_stored_bytes,
};

use crate::error::EngineError;

/// Where one chunk's ciphertext sits in the reassembled stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub sequence: u32,
    pub offset: u64,
    pub len: u64,
    /// IV decoded from the chunk row; empty for plaintext chunks.
    pub iv: Vec<u8>,
}

/// Lay `chunks` out in sequence order over a stream of `total` bytes.
pub fn chunk_spans(chunks: &[ChunkRecord], total: u64) -> Result<Vec<ChunkSpan>, EngineError> {
    let mut ordered = chunks.to_vec();
    ordered.sort_by_key(|c| c.sequence);
    let offsets = chunk_offsets(&ordered);

    ordered
        .iter()
        .zip(offsets)
        .map(|(chunk, offset)| match offset.checked_add(chunk.size) {
            Some(end) if end <= total => Ok(ChunkSpan {
                sequence: chunk.sequence,
                offset,
                len: chunk.size,
                iv: decode_stored_bytes(chunk.iv.as_ref()),
            }),
            _ => Err(EngineError::InvalidInput(format!(
                "chunk {} extends past the {total} downloaded bytes",
                chunk.sequence
            ))),
        })
        .collect()
}

/// Cut reassembled ciphertext back into per-chunk sealed parts, in sequence order.
pub fn sealed_parts(ciphertext: &Bytes, chunks: &[ChunkRecord]) -> Result<Vec<SealedPart>, EngineError> {
    let spans = chunk_spans(chunks, ciphertext.len() as u64)?;
    spans
        .into_iter()
        .map(|span| {
            let range = usize::try_from(span.offset)
                .ok()
                .zip(usize::try_from(span.offset + span.len).ok());
            match range {
                Some((start, end)) => Ok(SealedPart {
                    sequence: span.sequence,
                    iv: span.iv,
                    data: ciphertext.slice(start..end),
                }),
                None => Err(EngineError::InvalidInput(format!(
                    "chunk {} does not fit in memory",
                    span.sequence
                ))),
            }
        })
        .collect()
}

/// Lazily decrypt a reassembled chunked object.
///
/// Yields `(sequence, plaintext)` in sequence order. The first chunk that
/// fails authentication ends the sequence with an error. Each step runs
/// AES-GCM on the calling thread; async callers that cannot block should
/// decrypt part by part with [`ChunkCodec::decrypt_one`] instead.
pub fn decrypt(
    codec: &ChunkCodec,
    ciphertext: &Bytes,
    chunks: &[ChunkRecord],
    header: &ChunkedHeader,
    key: DerivedKey,
) -> Result<DecryptedChunks<vec::IntoIter<SealedPart>>, EngineError> {
    let parts = sealed_parts(ciphertext, chunks)?;
    Ok(codec.decrypt_chunks(key, header, parts))
}
