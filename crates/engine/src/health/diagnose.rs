//! Root-cause diagnosis for unreachable chunks.
//!
//! A handful of chunks are walked through four independent checks: fetch
//! the origin message, find the chunk's attachment on it, probe the fresh
//! URL, probe the cached URL. Each check records its own outcome instead of
//! aborting the walk, and the per-chunk verdicts reduce to one category.

use std::collections::HashMap;
use std::time::Duration;

use chatvault_core::{ChunkRecord, ObjectId, ProbeOutcome, ScanScope};
use chatvault_platform::CdnClient;
use chatvault_pool::PoolError;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{info, instrument};

use super::probe::{classify_status, probe_status};
use super::scanner::HealthScanner;
use crate::egress::match_attachment;
use crate::error::EngineError;

/// Outcome of one diagnostic layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum Check {
    Passed,
    Failed(String),
    /// Not run because an earlier layer produced nothing to check.
    Skipped,
}

impl Check {
    fn passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    fn failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Categorical cause of chunk unavailability.
///
/// Variants are ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Diagnosis {
    /// The origin message no longer exists.
    MessageMissing,
    /// The message exists but its attachments are gone.
    AttachmentsStripped,
    /// The attachment exists but its fresh URL does not answer.
    ResolutionFailure,
    /// The cached URL fails while the fresh one works: a stale URL, not lost data.
    FalseNegativeCachedUrl,
    /// The layers disagree in a way no category explains.
    Inconclusive,
    Healthy,
}

/// Per-layer results for one sampled chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkDiagnostic {
    pub object_id: ObjectId,
    pub sequence: u32,
    pub message_fetch: Check,
    pub attachment_match: Check,
    pub fresh_probe: Check,
    pub cached_probe: Check,
    pub diagnosis: Diagnosis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticReport {
    pub samples: Vec<ChunkDiagnostic>,
    /// The most frequent problem among the samples, or `Healthy`.
    pub diagnosis: Diagnosis,
}

impl HealthScanner {
    /// Sample up to `diagnose_samples` chunks of `object_id` (or of every
    /// complete object) and diagnose each. Read-only: nothing is written to
    /// the store.
    #[instrument(skip_all, fields(object_id = ?object_id))]
    pub async fn diagnose(&self, object_id: Option<&ObjectId>) -> Result<DiagnosticReport, EngineError> {
        let scope = match object_id {
            Some(id) => ScanScope::Object { object_id: id.clone() },
            None => ScanScope::All,
        };
        let chunks = self.inner.select_targets(&scope).await?;
        let picked: Vec<ChunkRecord> = chunks
            .choose_multiple(&mut rand::thread_rng(), self.inner.config.diagnose_samples)
            .cloned()
            .collect();

        let mut samples = Vec::with_capacity(picked.len());
        for chunk in &picked {
            samples.push(self.diagnose_chunk(chunk).await);
        }
        let diagnosis = overall(&samples);
        info!(samples = samples.len(), ?diagnosis, "diagnosis complete");
        Ok(DiagnosticReport { samples, diagnosis })
    }

    async fn diagnose_chunk(&self, chunk: &ChunkRecord) -> ChunkDiagnostic {
        let inner = &self.inner;
        let timeout = inner.config.probe_timeout;

        let fetched = inner
            .pool
            .fetch_message(&chunk.message_id, Some(&chunk.channel_id))
            .await;
        let (message_fetch, message_missing) = match &fetched {
            Ok(_) => (Check::Passed, false),
            Err(e) => (Check::Failed(e.to_string()), is_missing(e)),
        };

        let (attachment_match, fresh_url) = match &fetched {
            Ok(message) if message.attachments.is_empty() => {
                (Check::Failed("message has no attachments".to_owned()), None)
            }
            Ok(message) => match match_attachment(message, chunk) {
                Some(attachment) => (Check::Passed, Some(attachment.url.clone())),
                None => (
                    Check::Failed(format!("no attachment for {}", chunk.file_name())),
                    None,
                ),
            },
            Err(_) => (Check::Skipped, None),
        };

        let fresh_probe = match &fresh_url {
            Some(url) => probe_check(inner.cdn.as_ref(), url, timeout).await,
            None => Check::Skipped,
        };
        let cached_probe = probe_check(inner.cdn.as_ref(), &chunk.url, timeout).await;

        let diagnosis = if message_missing {
            Diagnosis::MessageMissing
        } else if message_fetch.failed() {
            Diagnosis::ResolutionFailure
        } else if attachment_match.failed() {
            Diagnosis::AttachmentsStripped
        } else if fresh_probe.failed() {
            Diagnosis::ResolutionFailure
        } else if fresh_probe.passed() && cached_probe.failed() {
            Diagnosis::FalseNegativeCachedUrl
        } else if fresh_probe.passed() && cached_probe.passed() {
            Diagnosis::Healthy
        } else {
            Diagnosis::Inconclusive
        };

        ChunkDiagnostic {
            object_id: chunk.object_id.clone(),
            sequence: chunk.sequence,
            message_fetch,
            attachment_match,
            fresh_probe,
            cached_probe,
            diagnosis,
        }
    }
}

async fn probe_check(cdn: &dyn CdnClient, url: &str, timeout: Duration) -> Check {
    match probe_status(cdn, url, timeout).await {
        Ok(status) if classify_status(status) == ProbeOutcome::Healthy => Check::Passed,
        Ok(status) => Check::Failed(format!("status {status}")),
        Err(e) => Check::Failed(e),
    }
}

fn is_missing(e: &PoolError) -> bool {
    match e {
        PoolError::MessageNotFound(_) => true,
        PoolError::Platform(p) => p.is_not_found(),
        _ => false,
    }
}

/// Most frequent non-healthy verdict; ties go to the more severe one.
fn overall(samples: &[ChunkDiagnostic]) -> Diagnosis {
    if samples.is_empty() {
        return Diagnosis::Inconclusive;
    }
    let mut counts: HashMap<Diagnosis, usize> = HashMap::new();
    for sample in samples.iter().filter(|s| s.diagnosis != Diagnosis::Healthy) {
        *counts.entry(sample.diagnosis).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|(a, na), (b, nb)| na.cmp(nb).then(b.cmp(a)))
        .map_or(Diagnosis::Healthy, |(d, _)| d)
}
