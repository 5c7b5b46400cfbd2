use std::fmt;

use bytes::Bytes;
use chatvault_core::{ChunkRecord, EgressProgress, ProgressSender, chunk_offsets};
use chatvault_executor::{Classify, RetryClass, RetryExecutor, RetryPolicy, RetryStrategy};
use chatvault_platform::{CdnClient, PlatformError};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::sink::OffsetSink;
use crate::config::EgressConfig;
use crate::error::EngineError;

/// Outcome of [`fetch_to_offset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FetchReport {
    pub bytes_written: u64,
    pub chunks: usize,
}

/// A failed download attempt. Every failure is worth another try here,
/// including not-found answers and short bodies.
#[derive(Debug)]
struct AttemptFailed(PlatformError);

impl fmt::Display for AttemptFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Classify for AttemptFailed {
    fn classify(&self) -> RetryClass {
        match self.0.classify() {
            RetryClass::Fatal => RetryClass::Transient,
            class => class,
        }
    }
}

/// Download `chunks` into `sink`, each at its byte offset.
///
/// At most `config.concurrency` downloads run at once; the next chunk starts
/// as soon as any finishes. Each chunk gets `1 + config.max_retries`
/// attempts with linear backoff. A chunk that exhausts them fails the whole
/// transfer with [`EngineError::ChunkFailed`]. Cancelling `cancel` stops
/// new downloads, abandons those in flight and returns
/// [`EngineError::DownloadCancelled`]; regions already written stay intact.
#[instrument(skip_all, fields(chunks = chunks.len()))]
pub async fn fetch_to_offset(
    cdn: &dyn CdnClient,
    chunks: &[ChunkRecord],
    sink: &dyn OffsetSink,
    config: &EgressConfig,
    cancel: &CancellationToken,
    progress: &ProgressSender<EgressProgress>,
) -> Result<FetchReport, EngineError> {
    let mut ordered = chunks.to_vec();
    ordered.sort_by_key(|c| c.sequence);
    let offsets = chunk_offsets(&ordered);
    let bytes_total: u64 = ordered.iter().map(|c| c.size).sum();
    if bytes_total > sink.len() {
        return Err(EngineError::InvalidInput(format!(
            "{bytes_total} bytes of chunks do not fit a {} byte sink",
            sink.len()
        )));
    }

    let attempts = config.max_retries.saturating_add(1);
    let retry = RetryExecutor::new(
        RetryPolicy::default()
            .with_max_attempts(attempts)
            .with_strategy(RetryStrategy::Linear {
                delay: config.retry_backoff,
                max: config.retry_backoff.saturating_mul(attempts),
            }),
    );
    let window = config.concurrency.max(1);
    let chunks_total = ordered.len();
    let mut queue = ordered.iter().zip(offsets);
    let mut in_flight = FuturesUnordered::new();
    let mut report = FetchReport {
        bytes_written: 0,
        chunks: 0,
    };

    loop {
        while in_flight.len() < window && !cancel.is_cancelled() {
            let Some((chunk, offset)) = queue.next() else {
                break;
            };
            in_flight.push(fetch_one(cdn, &retry, attempts, chunk, offset, sink));
        }
        if in_flight.is_empty() {
            break;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(in_flight = in_flight.len(), "download cancelled");
                return Err(EngineError::DownloadCancelled);
            }
            Some(done) = in_flight.next() => {
                let written = done?;
                report.bytes_written += written;
                report.chunks += 1;
                progress.emit(EgressProgress {
                    chunks_done: report.chunks,
                    chunks_total,
                    bytes_written: report.bytes_written,
                    bytes_total,
                });
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(EngineError::DownloadCancelled);
    }
    Ok(report)
}

async fn fetch_one(
    cdn: &dyn CdnClient,
    retry: &RetryExecutor,
    attempts: u32,
    chunk: &ChunkRecord,
    offset: u64,
    sink: &dyn OffsetSink,
) -> Result<u64, EngineError> {
    let data: Bytes = retry
        .run("download_chunk", |attempt| async move {
            if attempt > 1 {
                debug!(sequence = chunk.sequence, attempt, "retrying chunk download");
            }
            let body = cdn.download(&chunk.url).await.map_err(AttemptFailed)?;
            if body.len() as u64 != chunk.size {
                return Err(AttemptFailed(PlatformError::InvalidResponse(format!(
                    "chunk {} is {} bytes, expected {}",
                    chunk.sequence,
                    body.len(),
                    chunk.size
                ))));
            }
            Ok(body)
        })
        .await
        .map_err(|AttemptFailed(source)| {
            warn!(sequence = chunk.sequence, attempts, error = %source, "chunk download failed");
            EngineError::ChunkFailed {
                sequence: chunk.sequence,
                attempts,
                source,
            }
        })?;
    sink.write_at(offset, &data).await?;
    Ok(data.len() as u64)
}
