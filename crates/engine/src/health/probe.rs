use std::time::Duration;

use chatvault_core::{ChunkProbeResult, ChunkRecord, ProbeOutcome};
use chatvault_platform::CdnClient;
use chrono::Utc;
use tokio::time::Instant;

/// How a probe's HTTP status reads.
pub fn classify_status(status: u16) -> ProbeOutcome {
    match status {
        200..=299 => ProbeOutcome::Healthy,
        403 | 404 | 410 => ProbeOutcome::Unhealthy,
        _ => ProbeOutcome::Error,
    }
}

/// Existence check of `url` bounded by `timeout`. Returns the status or a
/// description of why no status arrived.
pub(crate) async fn probe_status(cdn: &dyn CdnClient, url: &str, timeout: Duration) -> Result<u16, String> {
    match tokio::time::timeout(timeout, cdn.probe(url, timeout)).await {
        Ok(Ok(status)) => Ok(status),
        Ok(Err(e)) if e.is_not_found() => Ok(404),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("probe timed out after {}ms", timeout.as_millis())),
    }
}

/// Probe one chunk's URL and classify the answer.
pub(crate) async fn probe_chunk(
    cdn: &dyn CdnClient,
    chunk: &ChunkRecord,
    stale_url: bool,
    timeout: Duration,
) -> ChunkProbeResult {
    let started = Instant::now();
    let answer = probe_status(cdn, &chunk.url, timeout).await;
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let (outcome, status_code, error) = match answer {
        Ok(status) => {
            let outcome = classify_status(status);
            let error = (outcome == ProbeOutcome::Error).then(|| format!("unexpected status {status}"));
            (outcome, Some(status), error)
        }
        Err(e) => (ProbeOutcome::Error, None, Some(e)),
    };
    ChunkProbeResult {
        object_id: chunk.object_id.clone(),
        sequence: chunk.sequence,
        outcome,
        latency_ms,
        status_code,
        stale_url,
        error,
        checked_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_outcomes() {
        assert_eq!(classify_status(200), ProbeOutcome::Healthy);
        assert_eq!(classify_status(206), ProbeOutcome::Healthy);
        assert_eq!(classify_status(404), ProbeOutcome::Unhealthy);
        assert_eq!(classify_status(410), ProbeOutcome::Unhealthy);
        assert_eq!(classify_status(403), ProbeOutcome::Unhealthy);
        assert_eq!(classify_status(500), ProbeOutcome::Error);
        assert_eq!(classify_status(429), ProbeOutcome::Error);
    }
}
