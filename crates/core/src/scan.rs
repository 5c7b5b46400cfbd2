use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ObjectId, ScanId};

/// Which chunks a health scan covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanScope {
    /// Every chunk of every object.
    All,
    /// The chunks of a single object.
    Object {
        /// Target object.
        object_id: ObjectId,
    },
    /// The chunks of every object filed under a folder.
    Folder {
        /// Folder name.
        folder: String,
    },
    /// A uniformly random sample of all chunks.
    Sample {
        /// Percentage of chunks to probe, `0 < percent <= 100`.
        percent: f64,
    },
}

impl ScanScope {
    /// Number of chunks a sample of `percent` picks out of `total`.
    ///
    /// Non-sample scopes return `total`.
    pub fn sample_size(&self, total: usize) -> usize {
        match self {
            Self::Sample { percent } => {
                if total == 0 || *percent <= 0.0 {
                    return 0;
                }
                let pct = percent.min(100.0);
                #[allow(
                    clippy::cast_precision_loss,
                    clippy::cast_possible_truncation,
                    clippy::cast_sign_loss
                )]
                let picked = ((total as f64) * pct / 100.0).round() as usize;
                picked.clamp(1, total)
            }
            _ => total,
        }
    }
}

/// Terminal or running state of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// Still probing.
    Running,
    /// Every selected chunk was probed.
    Completed,
    /// Stopped on request; gathered results are kept.
    Cancelled,
    /// Stopped by an unexpected failure.
    Error,
}

/// Classification of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// The attachment answered with a success status.
    Healthy,
    /// The attachment answered with a not-found class status.
    Unhealthy,
    /// The probe itself failed (network, timeout, unexpected status).
    Error,
}

/// Result of probing one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkProbeResult {
    /// Owning object.
    pub object_id: ObjectId,
    /// Chunk sequence.
    pub sequence: u32,
    /// Classification.
    pub outcome: ProbeOutcome,
    /// Wall time of the probe in milliseconds.
    pub latency_ms: u64,
    /// HTTP status, when a response arrived.
    pub status_code: Option<u16>,
    /// Whether the probe fell back to the cached URL.
    #[serde(default)]
    pub stale_url: bool,
    /// Failure detail for `Error` outcomes.
    #[serde(default)]
    pub error: Option<String>,
    /// When the probe finished.
    pub checked_at: DateTime<Utc>,
}

/// Persistent record of an audit pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthScanRecord {
    /// Scan identifier.
    pub id: ScanId,
    /// What the scan covers.
    pub scope: ScanScope,
    /// Current state.
    pub status: ScanStatus,
    /// Number of chunks selected for probing.
    pub total: u64,
    /// Number of chunks probed so far.
    pub checked: u64,
    /// Healthy probes.
    pub healthy: u64,
    /// Unhealthy probes.
    pub unhealthy: u64,
    /// Probes that errored.
    pub errors: u64,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time, once terminal.
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure message for `Error` scans.
    pub error: Option<String>,
}

impl HealthScanRecord {
    /// Open a new running scan.
    pub fn start(id: ScanId, scope: ScanScope) -> Self {
        Self {
            id,
            scope,
            status: ScanStatus::Running,
            total: 0,
            checked: 0,
            healthy: 0,
            unhealthy: 0,
            errors: 0,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    /// Fold a probe result into the counters.
    pub fn record(&mut self, result: &ChunkProbeResult) {
        self.checked += 1;
        match result.outcome {
            ProbeOutcome::Healthy => self.healthy += 1,
            ProbeOutcome::Unhealthy => self.unhealthy += 1,
            ProbeOutcome::Error => self.errors += 1,
        }
    }

    /// Move to a terminal state.
    pub fn finish(&mut self, status: ScanStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    /// Whether the scan is still running.
    pub fn is_running(&self) -> bool {
        self.status == ScanStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(outcome: ProbeOutcome) -> ChunkProbeResult {
        ChunkProbeResult {
            object_id: ObjectId::new("o"),
            sequence: 1,
            outcome,
            latency_ms: 5,
            status_code: Some(200),
            stale_url: false,
            error: None,
            checked_at: Utc::now(),
        }
    }

    #[test]
    fn five_percent_of_a_thousand_is_fifty() {
        let scope = ScanScope::Sample { percent: 5.0 };
        assert_eq!(scope.sample_size(1000), 50);
    }

    #[test]
    fn tiny_samples_pick_at_least_one() {
        let scope = ScanScope::Sample { percent: 1.0 };
        assert_eq!(scope.sample_size(10), 1);
        assert_eq!(scope.sample_size(0), 0);
        assert_eq!(ScanScope::All.sample_size(7), 7);
    }

    #[test]
    fn oversized_percent_is_capped() {
        let scope = ScanScope::Sample { percent: 250.0 };
        assert_eq!(scope.sample_size(40), 40);
    }

    #[test]
    fn record_counts_outcomes() {
        let mut scan = HealthScanRecord::start(ScanId::new("s"), ScanScope::All);
        scan.record(&result(ProbeOutcome::Healthy));
        scan.record(&result(ProbeOutcome::Unhealthy));
        scan.record(&result(ProbeOutcome::Error));
        scan.record(&result(ProbeOutcome::Healthy));
        assert_eq!(scan.checked, 4);
        assert_eq!(scan.healthy, 2);
        assert_eq!(scan.unhealthy, 1);
        assert_eq!(scan.errors, 1);
        assert!(scan.is_running());

        scan.finish(ScanStatus::Cancelled, None);
        assert!(!scan.is_running());
        assert!(scan.finished_at.is_some());
    }

    #[test]
    fn scope_serde_is_tagged() {
        let scope = ScanScope::Folder {
            folder: "docs".into(),
        };
        let json = serde_json::to_value(&scope).unwrap();
        assert_eq!(json["type"], "folder");
        assert_eq!(json["folder"], "docs");
    }
}
