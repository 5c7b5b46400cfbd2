//! Chunk reachability: batched probe scans and root-cause diagnosis.

mod diagnose;
mod probe;
mod scanner;

pub use diagnose::{Check, ChunkDiagnostic, Diagnosis, DiagnosticReport};
pub use probe::classify_status;
pub use scanner::HealthScanner;
